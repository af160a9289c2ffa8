use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use callkpi::models::parse_timestamp;
use callkpi::rules::RuleSet;
use callkpi::stages::{estimate_duration_seconds, normalize};
use callkpi::store::WatermarkStore;
use callkpi::{
    BatchController, DirectorySource, FileBackend, HttpSource, IngestionSource, PerformanceReport,
    PipelineConfig, RuleConfig, RunOutcome, Stage,
};

#[derive(Parser)]
#[command(name = "callkpi")]
#[command(author, version, about = "Call-center transcript KPI pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
#[group(required = true, multiple = false)]
struct SourceArgs {
    /// Directory of <call_id>.json call files
    #[arg(long)]
    source_dir: Option<PathBuf>,

    /// Base URL of the data-acquisition service
    #[arg(long)]
    source_url: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Promote every call that has not reached the metrics stage
    Run {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory holding the stage stores
        #[arg(long)]
        store_dir: PathBuf,

        /// Records per batch (defaults to BATCH_SIZE or 100)
        #[arg(long)]
        batch_size: Option<usize>,

        /// Rule table (JSON) replacing the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Promote calls newer than the stored watermark
    Incremental {
        #[command(flatten)]
        source: SourceArgs,

        /// Directory holding the stage stores
        #[arg(long)]
        store_dir: PathBuf,

        /// Process calls after this timestamp instead of the stored watermark
        #[arg(long)]
        since: Option<String>,

        /// Rule table (JSON) replacing the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Re-run promotion for specific calls
    Reprocess {
        /// Call ids to reprocess
        #[arg(required = true)]
        call_ids: Vec<String>,

        #[command(flatten)]
        source: SourceArgs,

        /// Directory holding the stage stores
        #[arg(long)]
        store_dir: PathBuf,

        /// Rule table (JSON) replacing the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Normalize and extract one transcript without touching any store
    Analyze {
        /// Transcript text
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        text: Option<String>,

        /// File containing the transcript text
        #[arg(long)]
        file: Option<PathBuf>,

        /// Rule table (JSON) replacing the built-in rules
        #[arg(long)]
        rules: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Summarize KPIs from the metrics store
    Report {
        /// Directory holding the stage stores
        #[arg(long)]
        store_dir: PathBuf,

        /// Also write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Also write the report as text
        #[arg(long)]
        text_output: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Show per-stage record counts and the watermark
    Status {
        /// Directory holding the stage stores
        #[arg(long)]
        store_dir: PathBuf,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            source,
            store_dir,
            batch_size,
            rules,
            verbose,
        } => {
            setup_logging(verbose);
            let config = PipelineConfig::from_env()?;
            let batch_size = batch_size.unwrap_or(config.batch_size);
            let controller = build_controller(&source, &store_dir, rules.as_deref(), config).await?;
            let outcome = controller.run_full(batch_size).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Incremental {
            source,
            store_dir,
            since,
            rules,
            verbose,
        } => {
            setup_logging(verbose);
            let since = since
                .map(|s| parse_timestamp(&s).with_context(|| format!("Invalid --since timestamp: {s}")))
                .transpose()?;
            let config = PipelineConfig::from_env()?;
            let controller = build_controller(&source, &store_dir, rules.as_deref(), config).await?;
            let outcome = controller.run_incremental(since).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Reprocess {
            call_ids,
            source,
            store_dir,
            rules,
            verbose,
        } => {
            setup_logging(verbose);
            let config = PipelineConfig::from_env()?;
            let controller = build_controller(&source, &store_dir, rules.as_deref(), config).await?;
            let outcome = controller.reprocess(&call_ids).await?;
            print_outcome(&outcome);
            Ok(())
        }
        Commands::Analyze {
            text,
            file,
            rules,
            verbose,
        } => {
            setup_logging(verbose);
            analyze_transcript(text, file, rules.as_deref())
        }
        Commands::Report {
            store_dir,
            output,
            text_output,
            verbose,
        } => {
            setup_logging(verbose);
            write_report(&store_dir, output.as_deref(), text_output.as_deref()).await
        }
        Commands::Status { store_dir, verbose } => {
            setup_logging(verbose);
            show_status(&store_dir).await
        }
    }
}

fn setup_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber).ok();
}

fn load_rules(path: Option<&Path>) -> Result<Arc<RuleSet>> {
    let config = match path {
        Some(path) => {
            info!("Loading rules from {:?}", path);
            RuleConfig::from_json_file(path)?
        }
        None => RuleConfig::default(),
    };
    let rules = RuleSet::compile(&config).context("Invalid rule table")?;
    Ok(Arc::new(rules))
}

async fn build_controller(
    source: &SourceArgs,
    store_dir: &Path,
    rules: Option<&Path>,
    config: PipelineConfig,
) -> Result<BatchController> {
    let rules = load_rules(rules)?;

    let source: Arc<dyn IngestionSource> = match (&source.source_dir, &source.source_url) {
        (Some(dir), _) => {
            info!("Reading calls from {:?}", dir);
            Arc::new(DirectorySource::new(dir))
        }
        (None, Some(url)) => {
            info!("Reading calls from {}", url);
            Arc::new(HttpSource::new(url, config.store_timeout)?)
        }
        (None, None) => anyhow::bail!("Either --source-dir or --source-url is required"),
    };

    let backend = FileBackend::open(store_dir)
        .await
        .with_context(|| format!("Failed to open stage stores in {:?}", store_dir))?;

    let controller = BatchController::new(source, backend.stores(), rules, config);

    let token = controller.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; finishing in-flight records");
            token.cancel();
        }
    });

    Ok(controller)
}

fn print_outcome(outcome: &RunOutcome) {
    println!("Run {}", outcome.run_id);
    println!("==================");
    println!("Batches: {}", outcome.batches);
    println!("Records attempted: {}", outcome.records_attempted);
    println!("Records succeeded: {}", outcome.records_succeeded);
    println!("Records failed: {}", outcome.records_failed);
    if outcome.cancelled {
        println!("Run was cancelled before all records were attempted");
    }
    println!();

    println!("Stages");
    println!("------");
    for stage in Stage::ALL {
        let counts = outcome.stage(stage);
        println!(
            "{:<8} attempted {:>5}  succeeded {:>5}  unchanged {:>5}  failed {:>5}",
            stage.to_string(),
            counts.attempted,
            counts.succeeded,
            counts.skipped,
            counts.failed
        );
    }

    if !outcome.failures.is_empty() {
        println!();
        println!("Failures");
        println!("--------");
        for failure in &outcome.failures {
            println!("{} at {}: {}", failure.call_id, failure.stage, failure.error);
        }
    }
}

fn analyze_transcript(text: Option<String>, file: Option<PathBuf>, rules: Option<&Path>) -> Result<()> {
    let raw_text = match (text, file) {
        (Some(text), _) => text,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read file: {:?}", path))?,
        (None, None) => anyhow::bail!("Either --text or --file is required"),
    };

    let rules = load_rules(rules)?;
    let cleaned = normalize(&raw_text).context("Failed to normalize transcript")?;
    let extraction = rules.extract(&cleaned);

    println!("Transcript Analysis");
    println!("==================");
    println!("Cleaned: {}", cleaned);
    println!(
        "Conversion: {}",
        match &extraction.conversion_phrase {
            Some(phrase) => format!("yes ({:?})", phrase),
            None => "no".to_string(),
        }
    );
    match &extraction.upsell_product {
        Some(product) => println!("Upsell: ${} ({})", extraction.upsell_amount, product),
        None => println!("Upsell: ${}", extraction.upsell_amount),
    }
    println!(
        "Sentiment: {} (+{} / -{}, confidence {:.2})",
        extraction.sentiment_label,
        extraction.positive_hits,
        extraction.negative_hits,
        extraction.sentiment_confidence
    );
    println!("Estimated duration: {}s", estimate_duration_seconds(&cleaned));

    Ok(())
}

async fn write_report(store_dir: &Path, output: Option<&Path>, text_output: Option<&Path>) -> Result<()> {
    let backend = FileBackend::open_existing(store_dir)
        .await
        .with_context(|| format!("Failed to open stage stores in {:?}", store_dir))?;
    let metrics = backend
        .metrics
        .records()
        .await
        .context("Failed to read metrics store")?;

    let report = PerformanceReport::from_metrics(&metrics, Utc::now());
    print!("{}", report.format());

    if let Some(path) = output {
        report.write_json(path)?;
        info!("Report written to {:?}", path);
    }
    if let Some(path) = text_output {
        report.write_file(path)?;
        info!("Text report written to {:?}", path);
    }
    Ok(())
}

async fn show_status(store_dir: &Path) -> Result<()> {
    let backend = FileBackend::open_existing(store_dir)
        .await
        .with_context(|| format!("Failed to open stage stores in {:?}", store_dir))?;

    println!("Pipeline Status");
    println!("==================");
    println!("Raw records: {}", backend.raw.count().await?);
    println!("Cleaned records: {}", backend.cleaned.count().await?);
    println!("Metrics records: {}", backend.metrics.count().await?);
    match backend.watermark.read_watermark().await? {
        Some(watermark) => println!("Watermark: {}", watermark.to_rfc3339()),
        None => println!("Watermark: not set"),
    }
    Ok(())
}
