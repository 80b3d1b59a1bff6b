//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use autonews_core::pipeline::needs_external_connector;
use autonews_core::{
    Collaborators, ConnectorRegistry, OpenAiGenerator, Pipeline, PipelineStage, ProgressReporter,
    SourceReport, Throttled, digest,
};
use autonews_extract::Extractor;
use autonews_shared::{
    AppConfig, DigestConfig, ExtractionConfig, Fingerprint, PipelineConfig, expand_home,
    init_config, load_config,
};
use autonews_storage::{Sink, Storage};
use chrono::Utc;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// AutoNews: a personal news pipeline.
#[derive(Parser)]
#[command(
    name = "autonews",
    version,
    about = "Pull news from feeds and web pages, drop what you have seen, summarize and rank the rest.",
    long_about = None,
)]
pub(crate) struct Cli {
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
    /// Run the pipeline once over the configured sources.
    Run {
        /// Only run the source with this name.
        #[arg(short, long)]
        source: Option<String>,
    },

    /// Build a digest of recent highly rated or annotated items.
    Digest {
        /// Window size in hours (defaults to `digest.hours_back`).
        #[arg(long)]
        hours_back: Option<u32>,

        /// Minimum rating to include (defaults to `digest.min_rating`).
        #[arg(long)]
        min_rating: Option<f32>,

        /// Write Markdown here instead of stdout.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List configured sources.
    Sources,

    /// Record a rating or notes for a pushed item.
    Feedback {
        /// Item fingerprint (32 hex characters).
        fingerprint: String,

        #[arg(long)]
        rating: Option<f32>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// Start a fresh sink collection.
    Rotate,

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
        0 => "autonews=info",
        1 => "autonews=debug",
        _ => "autonews=trace",
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
    match cli.command {
        Command::Run { source } => cmd_run(source.as_deref()).await,
        Command::Digest {
            hours_back,
            min_rating,
            out,
        } => cmd_digest(hours_back, min_rating, out).await,
        Command::Sources => cmd_sources(),
        Command::Feedback {
            fingerprint,
            rating,
            notes,
        } => cmd_feedback(&fingerprint, rating, notes.as_deref()).await,
        Command::Rotate => cmd_rotate().await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = expand_home(&config.defaults.database_path)?;
    Ok(Storage::open(&path).await?)
}

fn extractor(config: &AppConfig) -> Result<Extractor> {
    let extraction = ExtractionConfig::from(config);
    #[cfg(feature = "browser")]
    let renderer = autonews_extract::ChromiumRenderer::new(extraction.timeout);
    let extractor = Extractor::new(extraction)?;
    #[cfg(feature = "browser")]
    let extractor = extractor.with_renderer(Arc::new(renderer));
    Ok(extractor)
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_run(only: Option<&str>) -> Result<()> {
    let config = load_config()?;

    let sources: Vec<_> = match only {
        Some(name) => config.sources.iter().filter(|s| s.name == name).cloned().collect(),
        None => config.sources.clone(),
    };
    if sources.is_empty() {
        return Err(match only {
            Some(name) => eyre!("no source named '{name}' in the config"),
            None => eyre!("no sources configured. Add [[sources]] entries to the config file."),
        });
    }

    let generator = OpenAiGenerator::from_config(&config)?;
    let generator = Throttled::new(Arc::new(generator), &config.generation);

    let storage = open_storage(&config).await?;
    let purged = storage.purge_expired().await?;
    let index = storage.index(config.pipeline.distance_metric)?;
    let sink = storage.sink(config.sink.clone())?;
    let extractor = extractor(&config)?;

    let pipeline = Pipeline::new(
        PipelineConfig::from(&config),
        Collaborators {
            connectors: ConnectorRegistry::with_defaults(extractor.clone()),
            generator: Arc::new(generator),
            cache: Arc::new(storage),
            index: Arc::new(index),
            sink: Arc::new(sink),
            extractor,
        },
    );

    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current item");
            cancel.cancel();
        }
    });

    info!(sources = sources.len(), purged, "running pipeline");
    let reporter = CliProgress::new();
    let summary = pipeline.run(&sources, &reporter).await?;
    reporter.spinner.finish_and_clear();

    println!();
    for report in &summary.sources {
        match &report.error {
            Some(error) => println!("  {:<24} failed: {error}", report.source),
            None if report.not_modified => println!("  {:<24} not modified", report.source),
            None => println!(
                "  {:<24} pulled {:>3}  seen {:>3}  pushed {:>3}  dropped {:>3}",
                report.source,
                report.pulled,
                report.already_seen,
                report.pushed,
                report.summarize_failed + report.rank_failed + report.below_threshold + report.push_failed,
            ),
        }
    }
    println!();
    println!(
        "  Pushed {} item(s) in {:.1}s{}",
        summary.pushed(),
        summary.elapsed.as_secs_f64(),
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    println!();
    Ok(())
}

async fn cmd_digest(hours_back: Option<u32>, min_rating: Option<f32>, out: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let mut digest_config = DigestConfig::from(&config);
    if let Some(hours) = hours_back {
        digest_config.hours_back = hours;
    }
    if let Some(min) = min_rating {
        digest_config.min_rating = min;
    }

    let storage = open_storage(&config).await?;
    let sink = storage.sink(config.sink.clone())?;
    let selected = digest::build_digest(&sink, &digest_config, Utc::now()).await?;
    let markdown = digest::render(&selected, &digest_config);

    match out {
        Some(path) => {
            std::fs::write(&path, &markdown).map_err(|e| eyre!("cannot write {}: {e}", path.display()))?;
            println!("Digest with {} item(s) written to {}", selected.total(), path.display());
        }
        None => print!("{markdown}"),
    }
    Ok(())
}

fn cmd_sources() -> Result<()> {
    let config = load_config()?;
    if config.sources.is_empty() {
        println!("No sources configured.");
        return Ok(());
    }

    for source in &config.sources {
        let mut flags = Vec::new();
        if !source.enabled {
            flags.push("disabled".to_string());
        }
        if source.digest {
            flags.push("digest".to_string());
        }
        if source.browser_mode {
            flags.push("browser".to_string());
        }
        if needs_external_connector(source.source_type) {
            flags.push("needs connector".to_string());
        }
        if let Err(e) = source.validate() {
            flags.push(format!("invalid: {e}"));
        }

        let flags = if flags.is_empty() {
            String::new()
        } else {
            format!("  [{}]", flags.join(", "))
        };
        println!("  {:<24} {:<15} {}{flags}", source.name, source.source_type, source.url);
    }
    Ok(())
}

async fn cmd_feedback(fingerprint: &str, rating: Option<f32>, notes: Option<&str>) -> Result<()> {
    if rating.is_none() && notes.is_none() {
        return Err(eyre!("nothing to record: pass --rating and/or --notes"));
    }
    let fingerprint: Fingerprint = fingerprint.parse()?;

    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let sink = storage.sink(config.sink.clone())?;

    if sink.record_feedback(&fingerprint, rating, notes).await? {
        println!("Feedback recorded for {fingerprint}");
        Ok(())
    } else {
        Err(eyre!("no pushed item with fingerprint {fingerprint}"))
    }
}

async fn cmd_rotate() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let sink = storage.sink(config.sink.clone())?;
    let handle = sink.rotate().await?;
    println!("Now writing to collection: {handle}");
    Ok(())
}

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
        );
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn source_started(&self, name: &str, current: usize, total: usize) {
        self.spinner.set_message(format!("[{current}/{total}] {name}"));
    }

    fn stage(&self, source: &str, stage: PipelineStage, items: usize) {
        match stage {
            PipelineStage::Pull => self.spinner.set_message(format!("{source}: pulling")),
            _ => self.spinner.set_message(format!("{source}: {stage} ({items} items)")),
        }
    }

    fn item_pushed(&self, title: &str) {
        self.spinner.println(format!("  + {title}"));
    }

    fn source_finished(&self, report: &SourceReport) {
        if let Some(error) = &report.error {
            self.spinner.println(format!("  ! {}: {error}", report.source));
        }
    }
}
