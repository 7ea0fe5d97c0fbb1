//! Temporary downgrade from premium models while the provider is overloaded.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::{info, warn};

const OVERLOAD_THRESHOLD: usize = 3;
const OVERLOAD_WINDOW_SECS: i64 = 3 * 60;
const FALLBACK_SECS: i64 = 5 * 60;

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Default)]
struct FallbackState {
    overloads: VecDeque<DateTime<Utc>>,
    fallback_until: Option<DateTime<Utc>>,
}

pub struct ModelFallbackPolicy {
    premium_marker: String,
    fallback_model: String,
    clock: Clock,
    state: Mutex<FallbackState>,
}

impl ModelFallbackPolicy {
    pub fn new(premium_marker: &str, fallback_model: &str) -> Self {
        Self::with_clock(premium_marker, fallback_model, Box::new(Utc::now))
    }

    pub fn with_clock(premium_marker: &str, fallback_model: &str, clock: Clock) -> Self {
        Self {
            premium_marker: premium_marker.to_lowercase(),
            fallback_model: fallback_model.to_string(),
            clock,
            state: Mutex::new(FallbackState::default()),
        }
    }

    pub fn is_premium(&self, model: &str) -> bool {
        model.to_lowercase().contains(&self.premium_marker)
    }

    /// Notes one overload. Three within three minutes switch premium models
    /// to the fallback for five minutes.
    pub fn record_overload(&self) {
        let now = (self.clock)();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());

        let cutoff = now - Duration::seconds(OVERLOAD_WINDOW_SECS);
        while state.overloads.front().is_some_and(|t| *t < cutoff) {
            state.overloads.pop_front();
        }
        state.overloads.push_back(now);

        if state.overloads.len() >= OVERLOAD_THRESHOLD {
            let until = now + Duration::seconds(FALLBACK_SECS);
            state.fallback_until = Some(until);
            state.overloads.clear();
            warn!(
                "Model overload threshold reached, using {} until {}",
                self.fallback_model, until
            );
        }
    }

    /// Model to actually call for `requested`.
    pub fn resolve_model(&self, requested: &str) -> String {
        if !self.is_premium(requested) {
            return requested.to_string();
        }

        let now = (self.clock)();
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        match state.fallback_until {
            Some(until) if now < until => self.fallback_model.clone(),
            Some(_) => {
                state.fallback_until = None;
                info!("Model fallback expired, returning to {}", requested);
                requested.to_string()
            }
            None => requested.to_string(),
        }
    }

    pub fn is_fallback_active(&self) -> bool {
        let now = (self.clock)();
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.fallback_until.is_some_and(|until| now < until)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn policy_at(start: DateTime<Utc>) -> (ModelFallbackPolicy, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let clock_now = now.clone();
        let policy = ModelFallbackPolicy::with_clock(
            "opus",
            "claude-sonnet-4-5",
            Box::new(move || *clock_now.lock().unwrap()),
        );
        (policy, now)
    }

    fn advance(now: &Arc<Mutex<DateTime<Utc>>>, secs: i64) {
        let mut t = now.lock().unwrap();
        *t = *t + Duration::seconds(secs);
    }

    #[test]
    fn three_overloads_in_window_trigger_fallback() {
        let (policy, now) = policy_at(Utc::now());
        policy.record_overload();
        advance(&now, 30);
        policy.record_overload();
        assert_eq!(policy.resolve_model("claude-opus-4-1"), "claude-opus-4-1");

        advance(&now, 30);
        policy.record_overload();
        assert!(policy.is_fallback_active());
        assert_eq!(policy.resolve_model("Claude-OPUS-4-1"), "claude-sonnet-4-5");
    }

    #[test]
    fn non_premium_models_are_never_downgraded() {
        let (policy, _) = policy_at(Utc::now());
        for _ in 0..3 {
            policy.record_overload();
        }
        assert_eq!(policy.resolve_model("claude-haiku-4-5"), "claude-haiku-4-5");
    }

    #[test]
    fn spread_out_overloads_do_not_trigger() {
        let (policy, now) = policy_at(Utc::now());
        policy.record_overload();
        advance(&now, 100);
        policy.record_overload();
        advance(&now, 100);
        policy.record_overload();
        assert!(!policy.is_fallback_active());
    }

    #[test]
    fn fallback_expires_after_five_minutes() {
        let (policy, now) = policy_at(Utc::now());
        for _ in 0..3 {
            policy.record_overload();
        }
        advance(&now, 299);
        assert_eq!(policy.resolve_model("claude-opus-4-1"), "claude-sonnet-4-5");

        advance(&now, 2);
        assert_eq!(policy.resolve_model("claude-opus-4-1"), "claude-opus-4-1");
        assert!(!policy.is_fallback_active());
    }
}
