//! `postmate` daemon: polls mailboxes and answers them with a tool-using model.

mod seed;

use agent::engine::{ConversationOrchestrator, OrchestratorSettings, Trigger};
use agent::pipeline::{LoopSettings, ToolUseLoop};
use agent::tools::http::HttpToolDispatcher;
use ai::fallback::ModelFallbackPolicy;
use ai::provider::AnthropicProvider;
use anyhow::Context;
use clap::{Parser, Subcommand};
use postmate_core::config::{Settings, ANTHROPIC_KEY_ENV};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::sqlite::SqliteStorage;
use tracing::info;
use transport::TransportRegistry;

const TOOL_HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "postmate", about = "Answers inbound mail with a tool-using model", version)]
struct Cli {
    /// Settings file.
    #[arg(short, long, global = true, default_value = "postmate.toml")]
    config: PathBuf,

    /// Default log filter when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll on the configured schedule until interrupted.
    Run,
    /// Run a single poll cycle and exit.
    Once,
    /// Validate the settings file and exit.
    CheckConfig,
}

fn init_tracing(log_level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},sqlx=warn", log_level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let settings = Settings::load(&cli.config)
        .with_context(|| format!("loading settings from {}", cli.config.display()))?;
    let trigger = Trigger::from_config(&settings.scheduler)?;

    match cli.command {
        Command::CheckConfig => {
            println!("{} is valid", cli.config.display());
            println!("  database:  {}", settings.database.path);
            println!("  schedule:  {}", trigger);
            println!("  accounts:  {}", settings.accounts.len());
            for account in &settings.accounts {
                println!(
                    "    {} ({}, {}, {} tools)",
                    account.email_address,
                    account.state,
                    account.model,
                    account.tools.len()
                );
            }
        }
        Command::Once => {
            let orchestrator = build(&settings).await?;
            let report = orchestrator.run_cycle().await?;
            println!(
                "polled {} accounts ({} skipped): {} replied, {} without reply, {} duplicates, {} failed",
                report.accounts_polled,
                report.accounts_skipped,
                report.replied,
                report.not_replied,
                report.duplicates,
                report.failed
            );
        }
        Command::Run => {
            let orchestrator = Arc::new(build(&settings).await?);
            tokio::select! {
                _ = orchestrator.start_background_sync(trigger) => {}
                signal = tokio::signal::ctrl_c() => {
                    signal.context("waiting for Ctrl-C")?;
                    info!("Shutting down");
                }
            }
        }
    }

    Ok(())
}

async fn build(settings: &Settings) -> anyhow::Result<ConversationOrchestrator> {
    let storage = Arc::new(
        SqliteStorage::new(&settings.database.path)
            .await
            .with_context(|| format!("opening database {}", settings.database.path))?,
    );
    let seeded = seed::seed_accounts(&storage, &settings.accounts).await?;
    info!("Database ready, {} accounts from settings", seeded);

    let api_key = settings
        .anthropic
        .api_key
        .clone()
        .filter(|k| !k.trim().is_empty())
        .with_context(|| format!("anthropic.api_key or {} must be set", ANTHROPIC_KEY_ENV))?;
    let provider = Arc::new(AnthropicProvider::new(
        api_key,
        settings.anthropic.base_url.clone(),
        settings.anthropic.request_timeout(),
    )?);
    let fallback = Arc::new(ModelFallbackPolicy::new(
        &settings.anthropic.premium_marker,
        &settings.anthropic.fallback_model,
    ));

    let http = reqwest::Client::builder()
        .timeout(TOOL_HTTP_TIMEOUT)
        .build()
        .context("building HTTP client")?;
    let dispatcher = Arc::new(HttpToolDispatcher::new(
        http.clone(),
        storage.clone(),
        settings.agent.tool_output_limit_bytes,
    ));

    let tool_loop = Arc::new(ToolUseLoop::new(
        provider,
        fallback,
        dispatcher,
        LoopSettings {
            max_iterations: settings.agent.max_iterations,
            max_tokens: settings.anthropic.max_tokens,
            default_language: settings.agent.default_language.clone(),
            scratch_dir: settings.agent.scratch_dir.clone(),
            document_model: settings.anthropic.document_model.clone(),
        },
    )?);
    let transports = Arc::new(TransportRegistry::from_config(&settings.inbound, http));

    Ok(ConversationOrchestrator::new(
        storage,
        transports,
        tool_loop,
        OrchestratorSettings::from(&settings.scheduler),
    ))
}
