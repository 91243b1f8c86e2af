//! Dialectic CLI - run and inspect multi-stage AI generation
//!
//! Usage:
//!   dialectic stages                          List the stage registry
//!   dialectic resolve <status>                Map a session status to a stage
//!   dialectic init [path]                     Write a default config
//!   dialectic models                          List provider models
//!   dialectic generate --stage thesis --prompt "..." --model <id>

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use dialectic_agent::{AiProviderAdapter, AnthropicAdapter};
use dialectic_core::{ApiKey, DialecticConfig, StageRegistry, StageSlug};
use dialectic_orchestrator::{
    GenerationJob, InMemoryStore, Notification, NotificationDispatcher, NotificationSink,
    ProjectRecord, ProviderRecord, SeedPrompt, SessionRecord, StageOrchestrator,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const CLI_SESSION: &str = "cli-session";
const CLI_PROJECT: &str = "cli-project";
const CLI_USER: &str = "cli-user";

#[derive(Parser)]
#[command(name = "dialectic")]
#[command(author, version, about = "Multi-stage dialectic contribution engine")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory holding `.dialectic/config.toml`
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the stage registry
    Stages,

    /// Resolve a session status string to its stage
    Resolve {
        /// Session status, e.g. `pending_antithesis`
        status: String,
    },

    /// Write the default configuration file
    Init {
        /// Directory to initialise (defaults to current directory)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// List models offered by the provider
    Models,

    /// Run one stage against one or more models
    Generate {
        /// Stage slug
        #[arg(long, default_value = "thesis")]
        stage: StageSlug,

        /// Seed prompt sent as the user turn
        #[arg(long)]
        prompt: String,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Provider model identifier; repeat for several models
        #[arg(long = "model")]
        models: Vec<String>,

        /// Return truncated answers after a single call
        #[arg(long)]
        no_continue: bool,

        /// Full attempts per model
        #[arg(long)]
        max_retries: Option<u32>,
    },
}

/// Prints every notification as one JSON line on stdout
struct JsonLinesSink;

#[async_trait]
impl NotificationSink for JsonLinesSink {
    async fn deliver(&self, notification: &Notification) -> dialectic_core::Result<()> {
        let record = notification.to_record()?;
        let line = serde_json::to_string(&record)?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", line)?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Stages => cmd_stages(),
        Commands::Resolve { status } => cmd_resolve(&status),
        Commands::Init { path } => cmd_init(&path),
        Commands::Models => cmd_models(&cli.root).await,
        Commands::Generate {
            stage,
            prompt,
            system,
            models,
            no_continue,
            max_retries,
        } => cmd_generate(&cli.root, stage, prompt, system, models, no_continue, max_retries).await,
    }
}

fn cmd_stages() -> Result<()> {
    for stage in StageRegistry::standard().iter() {
        println!("{}. {} ({})", stage.ordinal, stage.display_name, stage.slug);
    }
    Ok(())
}

fn cmd_resolve(status: &str) -> Result<()> {
    match StageRegistry::standard().resolve_detailed(Some(status)) {
        Some(resolution) => println!("{} ({})", resolution.slug, resolution.rule),
        None => println!("none (empty status)"),
    }
    Ok(())
}

fn cmd_init(path: &Path) -> Result<()> {
    let config_path = path.join(".dialectic/config.toml");
    if config_path.exists() {
        warn!("Config already exists at {:?}, leaving it alone", config_path);
        return Ok(());
    }
    DialecticConfig::write_default(path)
        .with_context(|| format!("Failed to write config under {:?}", path))?;
    info!("Wrote default config to {:?}", config_path);
    Ok(())
}

fn load(root: &Path) -> Result<(DialecticConfig, ApiKey)> {
    let config = DialecticConfig::load_or_default(root)
        .with_context(|| format!("Failed to load config from {:?}", root))?;
    let api_key = ApiKey::from_env(&config.provider.api_key_env)
        .with_context(|| format!("{} is not set", config.provider.api_key_env))?;
    Ok((config, api_key))
}

async fn cmd_models(root: &Path) -> Result<()> {
    let (config, api_key) = load(root)?;
    let adapter = AnthropicAdapter::new(&config.provider)?;
    let models = adapter
        .list_models(&api_key)
        .await
        .context("Failed to list models")?;

    for model in models {
        println!("{}\t{}", model.id, model.display_name);
    }
    Ok(())
}

async fn cmd_generate(
    root: &Path,
    stage: StageSlug,
    prompt: String,
    system: Option<String>,
    mut models: Vec<String>,
    no_continue: bool,
    max_retries: Option<u32>,
) -> Result<()> {
    let (config, api_key) = load(root)?;
    if models.is_empty() {
        models.push(config.provider.default_model.clone());
    }

    // One throwaway session holding only this stage's seed prompt
    let mut store = InMemoryStore::new()
        .with_session(SessionRecord::new(CLI_SESSION, CLI_PROJECT).with_status(stage.generating_status()))
        .with_project(ProjectRecord {
            id: CLI_PROJECT.to_string(),
            name: "cli".to_string(),
            owner_user_id: CLI_USER.to_string(),
        })
        .with_seed_prompt(
            CLI_SESSION,
            stage,
            1,
            SeedPrompt {
                content: prompt,
                system_prompt: system,
            },
        );
    for model in &models {
        store = store.with_provider(ProviderRecord::new(model.as_str(), model.as_str(), model.as_str()));
    }

    let adapter = AnthropicAdapter::new(&config.provider)?;
    let dispatcher = NotificationDispatcher::spawn(JsonLinesSink);
    let cancel = CancellationToken::new();

    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling after in-flight calls");
                cancel.cancel();
            }
        })
    };

    let max_retries = max_retries.unwrap_or(config.retry.max_retries);
    let job = GenerationJob::new(CLI_SESSION, CLI_PROJECT, stage, models)
        .with_owner(CLI_USER)
        .with_max_retries(max_retries)
        .with_continuation(!no_continue);

    let outcome = {
        let orchestrator = StageOrchestrator::new(
            Arc::new(store),
            Arc::new(adapter),
            api_key,
            dispatcher.emitter(),
            config,
        )
        .with_cancellation(cancel);
        orchestrator.run(job).await
    };
    ctrl_c.abort();

    let delivered = dispatcher.finish().await;
    info!(
        status = %outcome.status,
        contributions = outcome.contributions.len(),
        notifications = delivered,
        "Generation finished"
    );

    if let Some(error) = outcome.error {
        bail!("{}: {}", error.code, error.message);
    }
    Ok(())
}
