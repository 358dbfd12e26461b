//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use listingflow_core::Pipeline;
use listingflow_shared::{
    AppConfig, Stage, expand_home, init_config, load_config, load_config_from, render_config,
};
use listingflow_storage::ListingStore;
use tracing::info;

/// How long `run` waits for workers to finish their current message.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// ListingFlow: ingest real-estate listings through a staged pipeline.
#[derive(Parser)]
#[command(
    name = "listingflow",
    version,
    about = "Extract, enrich, store, score and report real-estate listings.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Config file (defaults to ~/.listingflow/listingflow.toml).
    #[arg(long, global = true, env = "LISTINGFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Publish a listing URL to a running pipeline.
    Submit {
        /// Listing page URL.
        url: String,

        /// Session to notify when the listing has been scored.
        #[arg(short, long)]
        session: Option<String>,
    },

    /// Run stage workers until interrupted.
    Run {
        /// Stages to run (repeatable). Defaults to every stage.
        #[arg(long = "stage", value_name = "STAGE")]
        stages: Vec<Stage>,

        /// Listing URLs to submit once the workers are up (repeatable).
        #[arg(long = "url", value_name = "URL")]
        urls: Vec<String>,

        /// Session to notify for the submitted URLs.
        #[arg(short, long)]
        session: Option<String>,

        /// Do not run the dead-letter sink in this process.
        #[arg(long)]
        no_dead_letters: bool,
    },

    /// Show stored dead letters, newest first.
    DeadLetters {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },

    /// Print a stored listing as JSON.
    Listing {
        /// Subject id, as printed by `submit`.
        subject_id: String,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "listingflow=info",
        1 => "listingflow=debug",
        _ => "listingflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt().with_env_filter(env_filter).with_target(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(env_filter).init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    if let Command::Config { action } = &cli.command {
        return match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(cli.config.as_deref()),
        };
    }

    let config = resolve_config(cli.config.as_deref())?;
    match cli.command {
        Command::Submit { url, session } => cmd_submit(&config, &url, session).await,
        Command::Run {
            stages,
            urls,
            session,
            no_dead_letters,
        } => cmd_run(&config, stages, &urls, session, !no_dead_letters).await,
        Command::DeadLetters { limit } => cmd_dead_letters(&config, limit).await,
        Command::Listing { subject_id } => cmd_listing(&config, &subject_id).await,
        Command::Config { .. } => Ok(()),
    }
}

fn resolve_config(path: Option<&Path>) -> Result<AppConfig> {
    Ok(match path {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    })
}

fn store_path(config: &AppConfig) -> Result<PathBuf> {
    Ok(expand_home(&config.store.path)?)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_submit(config: &AppConfig, url: &str, session: Option<String>) -> Result<()> {
    if config.bus.is_memory() {
        return Err(eyre!(
            "the in-memory bus only lives inside one process; set bus.address to a file \
             or use `listingflow run --url {url}`"
        ));
    }

    let store = Arc::new(ListingStore::open(&store_path(config)?).await?);
    let pipeline = Pipeline::from_config(config, store)?;
    let ingestor = pipeline.ingestor().await?;
    let submission = ingestor.submit(url, session).await?;
    ingestor.close().await?;

    println!("Submitted {url}");
    println!("  Subject: {}", submission.subject_id);
    println!("  Trace:   {}", submission.trace_id);
    Ok(())
}

async fn cmd_run(
    config: &AppConfig,
    stages: Vec<Stage>,
    urls: &[String],
    session: Option<String>,
    dead_letters: bool,
) -> Result<()> {
    let stages = if stages.is_empty() {
        Stage::ALL.to_vec()
    } else {
        stages
    };
    if config.bus.is_memory() && stages.len() < Stage::ALL.len() {
        return Err(eyre!(
            "running a subset of stages needs a shared bus; set bus.address to a file"
        ));
    }

    let store = Arc::new(ListingStore::open(&store_path(config)?).await?);
    let pipeline = Pipeline::from_config(config, store)?;
    pipeline.recover().await?;
    let running = pipeline.spawn(&stages, dead_letters).await?;

    if !urls.is_empty() {
        let ingestor = pipeline.ingestor().await?;
        for url in urls {
            let submission = ingestor.submit(url, session.clone()).await?;
            println!("Submitted {url} as {}", submission.subject_id);
        }
        ingestor.close().await?;
    }

    info!("workers running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("failed to listen for Ctrl-C: {e}"))?;
    info!("shutting down");

    let stats = running.shutdown(SHUTDOWN_GRACE).await;
    println!();
    println!("  {:<22} {:>9} {:>8} {:>12} {:>8}", "stage", "published", "retried", "dead-letter", "dropped");
    for (stage, s) in stats {
        println!(
            "  {:<22} {:>9} {:>8} {:>12} {:>8}",
            stage.as_str(),
            s.published,
            s.retried,
            s.dead_lettered,
            s.dropped
        );
    }
    println!();
    Ok(())
}

async fn cmd_dead_letters(config: &AppConfig, limit: u32) -> Result<()> {
    let store = ListingStore::open_readonly(&store_path(config)?).await?;
    let total = store.dead_letter_count().await?;
    let letters = store.list_dead_letters(limit).await?;

    println!("{total} dead letter(s)");
    for letter in letters {
        let record = &letter.record;
        println!();
        println!("  Subject: {}", record.subject_id().unwrap_or("-"));
        println!("  Trace:   {}", record.trace_id().unwrap_or("-"));
        println!("  Stage:   {}", record.stage);
        println!("  Reason:  {}", record.reason);
        println!("  Error:   {}", record.error);
        println!("  Retries: {}", record.retry_count());
        println!("  Failed:  {}", record.failed_at.to_rfc3339());
    }
    Ok(())
}

async fn cmd_listing(config: &AppConfig, subject_id: &str) -> Result<()> {
    let store = ListingStore::open_readonly(&store_path(config)?).await?;
    let record = store
        .get(subject_id)
        .await?
        .ok_or_else(|| eyre!("no listing stored for subject '{subject_id}'"))?;

    let doc = serde_json::json!({
        "storageId": record.storage_id,
        "subjectId": record.subject_id,
        "createdAt": record.created_at.to_rfc3339(),
        "updatedAt": record.updated_at.to_rfc3339(),
        "fields": record.fields,
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show(path: Option<&Path>) -> Result<()> {
    let config = resolve_config(path)?;
    println!("{}", render_config(&config)?);
    Ok(())
}
