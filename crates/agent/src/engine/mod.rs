use crate::pipeline::{Outbox, PreparedTurn, ToolUseLoop, TurnContext};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use postmate_core::config::SchedulerConfig;
use postmate_core::error::{PostmateError, Result};
use postmate_core::types::{Account, InboundMessage, MessageSummary, ReplyPayload, ToolDefinition, Turn};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use storage::sqlite::SqliteStorage;
use tokio::time::{sleep, timeout, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use transport::{Transport, TransportResolver};

#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub lease_cooldown: Duration,
    pub turn_timeout: Duration,
    /// Delays between send attempts; one attempt more than entries.
    pub send_backoff: Vec<Duration>,
    pub max_concurrent_accounts: usize,
}

impl From<&SchedulerConfig> for OrchestratorSettings {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            lease_cooldown: config.lease_cooldown(),
            turn_timeout: config.turn_timeout(),
            send_backoff: config.send_backoff(),
            max_concurrent_accounts: config.max_concurrent_accounts.max(1),
        }
    }
}

/// When poll cycles run.
pub enum Trigger {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl Trigger {
    pub fn from_config(config: &SchedulerConfig) -> Result<Self> {
        match config.cron.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(expr) => cron::Schedule::from_str(expr)
                .map(|s| Trigger::Cron(Box::new(s)))
                .map_err(|e| PostmateError::Config(format!("invalid cron '{}': {}", expr, e))),
            None => Ok(Trigger::Every(config.interval())),
        }
    }

    /// Time until the next cycle is due.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Duration {
        match self {
            Trigger::Every(period) => *period,
            Trigger::Cron(schedule) => schedule
                .after(&now)
                .next()
                .and_then(|next| (next - now).to_std().ok())
                .unwrap_or(Duration::from_secs(60)),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Every(period) => write!(f, "every {}s", period.as_secs()),
            Trigger::Cron(schedule) => write!(f, "cron {}", schedule),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Replied,
    /// The model produced neither text nor HTML.
    NoReply,
    /// A turn for this message already exists.
    Duplicate,
    /// A mail tool already wrote to the sender during the turn.
    AlreadyAddressed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub accounts_polled: usize,
    pub accounts_skipped: usize,
    pub replied: usize,
    pub not_replied: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl CycleReport {
    fn merge(&mut self, other: CycleReport) {
        self.accounts_polled += other.accounts_polled;
        self.accounts_skipped += other.accounts_skipped;
        self.replied += other.replied;
        self.not_replied += other.not_replied;
        self.duplicates += other.duplicates;
        self.failed += other.failed;
    }

    fn count(&mut self, outcome: MessageOutcome) {
        match outcome {
            MessageOutcome::Replied => self.replied += 1,
            MessageOutcome::NoReply | MessageOutcome::AlreadyAddressed => self.not_replied += 1,
            MessageOutcome::Duplicate => self.duplicates += 1,
        }
    }
}

/// Polls every active account and answers its unread mail.
pub struct ConversationOrchestrator {
    storage: Arc<SqliteStorage>,
    transports: Arc<dyn TransportResolver>,
    tool_loop: Arc<ToolUseLoop>,
    settings: OrchestratorSettings,
}

impl ConversationOrchestrator {
    pub fn new(
        storage: Arc<SqliteStorage>,
        transports: Arc<dyn TransportResolver>,
        tool_loop: Arc<ToolUseLoop>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            storage,
            transports,
            tool_loop,
            settings,
        }
    }

    /// Runs cycles until the task is dropped.
    pub async fn start_background_sync(self: Arc<Self>, trigger: Trigger) {
        info!("Starting conversation scheduler ({})", trigger);

        match &trigger {
            Trigger::Every(period) => {
                let mut ticker = tokio::time::interval(*period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    self.run_logged_cycle().await;
                }
            }
            Trigger::Cron(_) => loop {
                let delay = trigger.next_delay(Utc::now());
                debug!("Next cycle in {}s", delay.as_secs());
                sleep(delay).await;
                self.run_logged_cycle().await;
            },
        }
    }

    async fn run_logged_cycle(&self) {
        match self.run_cycle().await {
            Ok(report) => info!(
                "Cycle done: {} accounts polled, {} replies, {} without reply, {} failed",
                report.accounts_polled, report.replied, report.not_replied, report.failed
            ),
            Err(e) => error!("Cycle failed: {}", e),
        }
    }

    /// One pass over all active accounts.
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let accounts = self.storage.list_active_accounts().await?;
        debug!("Polling {} active accounts", accounts.len());

        let reports: Vec<CycleReport> = stream::iter(accounts)
            .map(|account| self.process_account(account))
            .buffer_unordered(self.settings.max_concurrent_accounts.max(1))
            .collect()
            .await;

        let mut total = CycleReport::default();
        for report in reports {
            total.merge(report);
        }
        Ok(total)
    }

    async fn process_account(&self, account: Account) -> CycleReport {
        let mut report = CycleReport::default();

        match self
            .storage
            .try_acquire_lease(account.id, Utc::now(), self.settings.lease_cooldown)
            .await
        {
            Ok(true) => report.accounts_polled = 1,
            Ok(false) => {
                debug!(account_id = account.id, "Polled recently, skipping");
                report.accounts_skipped = 1;
                return report;
            }
            Err(e) => {
                error!(account_id = account.id, "Lease failed: {}", e);
                report.accounts_skipped = 1;
                return report;
            }
        }

        if let Err(e) = self.poll_account(&account, &mut report).await {
            error!(
                account_id = account.id,
                "Polling {} failed: {}", account.email_address, e
            );
        }
        report
    }

    async fn poll_account(&self, account: &Account, report: &mut CycleReport) -> Result<()> {
        let transport = self.transports.resolve(account.transport)?;
        let tools = self.storage.list_tool_definitions(account.id).await?;
        let unread = transport.list_unread(account).await?;
        if !unread.is_empty() {
            info!(
                account_id = account.id,
                "{} unread messages for {}",
                unread.len(),
                account.email_address
            );
        }

        for summary in &unread {
            match self
                .process_message(account, transport.as_ref(), &tools, summary)
                .await
            {
                Ok(outcome) => report.count(outcome),
                Err(e) => {
                    error!(
                        account_id = account.id,
                        "Message {} failed: {}", summary.id, e
                    );
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    async fn process_message(
        &self,
        account: &Account,
        transport: &dyn Transport,
        tools: &[ToolDefinition],
        summary: &MessageSummary,
    ) -> Result<MessageOutcome> {
        let message = match transport.fetch(account, summary).await {
            Ok(message) => message,
            Err(e) => {
                restore_unread(transport, account, summary).await;
                return Err(e);
            }
        };

        if self.storage.turn_exists(account.id, &message.id).await? {
            debug!(account_id = account.id, "Message {} already handled", message.id);
            return Ok(MessageOutcome::Duplicate);
        }

        let prepared = match self.tool_loop.prepare(account, &message, tools, transport) {
            Ok(prepared) => prepared,
            Err(e) => {
                restore_unread(transport, account, summary).await;
                return Err(e);
            }
        };
        let mut turn = Turn::from_message(account.id, &message);
        turn.prompt = prepared.prompt();
        let turn_id = match self.storage.create_turn(&turn).await? {
            Some(id) => id,
            None => return Ok(MessageOutcome::Duplicate),
        };

        let ctx = TurnContext {
            account,
            message: &message,
            turn_id,
            tools,
            transport,
        };
        let outbox = Outbox::default();
        match self.handle_turn(&ctx, prepared, &outbox).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if !outbox.is_empty() => {
                // Mail already left; answering again would repeat it.
                warn!(
                    turn_id,
                    "Keeping turn after failure, mail already sent to {}",
                    outbox.recipients().join(", ")
                );
                Err(e)
            }
            Err(e) => {
                restore_unread(transport, account, summary).await;
                if let Err(del) = self.storage.delete_turn(turn_id).await {
                    error!(turn_id, "Failed to delete turn: {}", del);
                }
                Err(e)
            }
        }
    }

    async fn handle_turn(
        &self,
        ctx: &TurnContext<'_>,
        prepared: PreparedTurn,
        outbox: &Outbox,
    ) -> Result<MessageOutcome> {
        let (account, message, turn_id) = (ctx.account, ctx.message, ctx.turn_id);
        info!(
            account_id = account.id,
            turn_id,
            "Answering '{}' from {}",
            message.subject,
            message.from
        );

        let run = self.tool_loop.run_prepared(ctx, prepared, outbox);
        let outcome = timeout(self.settings.turn_timeout, run)
            .await
            .map_err(|_| {
                PostmateError::Timeout(format!(
                    "turn {} exceeded {}s",
                    turn_id,
                    self.settings.turn_timeout.as_secs()
                ))
            })??;

        let payload = outcome.payload;
        self.storage
            .update_turn_reply(turn_id, &outcome.prompt, &payload)
            .await?;
        for attachment in &payload.attachments {
            if let Err(e) = self.storage.save_attachment(turn_id, attachment).await {
                warn!(turn_id, "Attachment {} not stored: {}", attachment.filename, e);
            }
        }

        if payload.is_empty() {
            info!(turn_id, "No reply produced: {}", payload.explanation.as_deref().unwrap_or("-"));
            return Ok(MessageOutcome::NoReply);
        }
        if payload.was_sent_to(&message.from) {
            info!(turn_id, "{} was already written to by a tool, skipping reply", message.from);
            return Ok(MessageOutcome::AlreadyAddressed);
        }

        self.send_with_retry(ctx.transport, account, &payload, message, turn_id)
            .await?;
        outbox.record(&message.from);
        info!(turn_id, "Reply sent to {}", message.from);

        if let Err(e) = self
            .storage
            .record_sent_mail(turn_id, &message.from, &payload.subject, &payload.text)
            .await
        {
            error!(turn_id, "Reply sent but not recorded: {}", e);
        }
        Ok(MessageOutcome::Replied)
    }

    async fn send_with_retry(
        &self,
        transport: &dyn Transport,
        account: &Account,
        payload: &ReplyPayload,
        message: &InboundMessage,
        turn_id: i64,
    ) -> Result<()> {
        let mut attempt = 0;
        loop {
            match transport.send_reply(account, payload, message, turn_id).await {
                Ok(()) => return Ok(()),
                Err(e) => match self.settings.send_backoff.get(attempt) {
                    Some(delay) => {
                        warn!(
                            turn_id,
                            "Send attempt {} failed, retrying in {}s: {}",
                            attempt + 1,
                            delay.as_secs(),
                            e
                        );
                        sleep(*delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

async fn restore_unread(transport: &dyn Transport, account: &Account, summary: &MessageSummary) {
    if let Err(e) = transport.mark_unread(account, summary).await {
        warn!(account_id = account.id, "Could not mark {} unread: {}", summary.id, e);
    }
}
