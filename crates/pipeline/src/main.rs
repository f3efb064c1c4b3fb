use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use index::{EmbeddingClient, Metric, progress_channel};
use pipeline::{AppConfig, LoggingConfig, Pipeline, RunReport};

#[derive(Debug, Parser)]
#[command(name = "review-rag")]
#[command(about = "Chunk, index, retrieve and summarize restaurant reviews by topic")]
struct Cli {
    /// JSON config file; unset keys keep their defaults.
    #[arg(long, global = true, env = "REVIEW_RAG_CONFIG")]
    config: Option<PathBuf>,

    /// Review rows (JSONL file or directory).
    #[arg(long, global = true)]
    reviews: Option<PathBuf>,

    #[arg(long, global = true)]
    index_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    metric: Option<MetricArg>,

    /// Log level used when RUST_LOG is not set.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Clean and chunk review rows into the chunk corpus.
    Chunk,
    /// Build one vector index per entity from the chunk corpus.
    Build,
    /// Retrieve topic evidence from the entity indexes.
    Retrieve,
    /// Summarize retrieved evidence with the LLM.
    Summarize,
    /// Run chunk, build, retrieve and summarize.
    Run,
    /// Delete index, metadata and manifest files from the index directory.
    Clean,
}

impl Commands {
    fn name(&self) -> &'static str {
        match self {
            Commands::Chunk => "chunk",
            Commands::Build => "build",
            Commands::Retrieve => "retrieve",
            Commands::Summarize => "summarize",
            Commands::Run => "run",
            Commands::Clean => "clean",
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MetricArg {
    Cosine,
    L2,
}

impl From<MetricArg> for Metric {
    fn from(arg: MetricArg) -> Self {
        match arg {
            MetricArg::Cosine => Metric::Cosine,
            MetricArg::L2 => Metric::L2,
        }
    }
}

impl Cli {
    fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(reviews) = &self.reviews {
            config.paths.reviews = reviews.clone();
        }
        if let Some(index_dir) = &self.index_dir {
            config.paths.index_dir = index_dir.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.paths.output_dir = output_dir.clone();
        }
        if let Some(metric) = self.metric {
            config.index.metric = metric.into();
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
    }
}

fn init_logging(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .with_context(|| format!("invalid log level {}", logging.level))?;

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    init_logging(&config.logging)?;
    config.validate().context("invalid configuration")?;

    let embedder = EmbeddingClient::new(&config.embedding)?;

    let (progress_tx, mut progress_rx) = progress_channel();
    let progress_logger = tokio::spawn(async move {
        while let Some(event) = progress_rx.recv().await {
            tracing::info!(
                stage = event.stage,
                entity = event.entity_index,
                total = event.total,
                "{}",
                event.message
            );
        }
    });

    let pipeline = Pipeline::new(&config, &embedder, Some(progress_tx));
    let mut report = RunReport::new(cli.command.name());

    let result = match cli.command {
        Commands::Chunk => pipeline.chunk(&mut report).await.map(|_| ()),
        Commands::Build => pipeline.build(None, &mut report).await,
        Commands::Retrieve => pipeline.retrieve(&mut report).await.map(|_| ()),
        Commands::Summarize => pipeline.summarize(None, &mut report).await,
        Commands::Run => pipeline.run(&mut report).await,
        Commands::Clean => pipeline.clean(&mut report).await,
    };

    let report_path = pipeline.report_path();
    drop(pipeline);
    let _ = progress_logger.await;

    report.log_summary();
    report.write(&report_path)?;
    result
}
