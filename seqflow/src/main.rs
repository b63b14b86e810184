use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use seqflow::config::PipelineConfig;
use seqflow::demux::{demux, open_reads, SampleMap};
use seqflow::events::LoggingProgressSink;
use seqflow::jobs::SlurmScheduler;
use seqflow::ledger::{write_report_tsv, FailureLedger};
use seqflow::orchestrator::Orchestrator;
use seqflow::planner::plan;
use seqflow::reorganize::reorganize;

#[derive(Parser)]
#[command(name = "seqflow")]
#[command(about = "Resumable orchestration of cluster-executed sequence-processing runs", long_about = None)]
#[command(version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every unfinished stage of a run
    Run {
        /// Run configuration (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Resume a previous invocation, skipping finished stages
        #[arg(long)]
        restart: bool,
    },

    /// Pack read pairs into size-balanced bucket manifests
    Plan {
        /// Directory searched for paired read files
        #[arg(short, long, value_name = "DIR")]
        input: PathBuf,

        /// Requested number of buckets
        #[arg(short, long, value_name = "INT")]
        buckets: usize,

        /// Manifest path prefix; bucket N is written to PREFIX-N
        #[arg(short, long, value_name = "PREFIX")]
        output_prefix: PathBuf,
    },

    /// Split a tagged interleaved read stream into per-sample files
    Demux {
        /// Tag-to-sample map (TSV)
        #[arg(long, value_name = "FILE")]
        sample_map: PathBuf,

        /// Input stream; stdin when omitted or '-'
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Output root; files land under <OUTPUT>/<project>/
        #[arg(long, value_name = "DIR")]
        output: PathBuf,

        /// This shard's index, 0-based
        #[arg(long, value_name = "INT")]
        task_index: usize,

        /// Number of shards
        #[arg(long, value_name = "INT")]
        total_tasks: usize,
    },

    /// Move a stage's read files into the per-project layout
    Reorganize {
        /// Run configuration (JSON)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,

        /// Stage output directory
        #[arg(long, value_name = "DIR")]
        stage_dir: PathBuf,

        /// Quarantine threshold in bytes; defaults to filter.min_bytes
        #[arg(long, value_name = "INT")]
        min_bytes: Option<u64>,
    },

    /// Print the failure report of a run
    Report {
        /// Failure ledger file
        #[arg(short, long, value_name = "FILE")]
        ledger: PathBuf,

        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_config(path: &Path) -> Result<PipelineConfig> {
    PipelineConfig::load(path).with_context(|| format!("Failed to load configuration {}", path.display()))
}

async fn run(config_path: &Path, restart: bool) -> Result<()> {
    let config = load_config(config_path)?;
    #[cfg(feature = "http")]
    let lims_url = config.lims.as_ref().map(|l| l.base_url.clone());
    #[cfg(not(feature = "http"))]
    if config.lims.is_some() {
        tracing::warn!("Built without the http feature; LIMS lookups and registration are disabled");
    }

    let orchestrator = Orchestrator::new(config, Arc::new(SlurmScheduler::new()))
        .with_sink(Arc::new(LoggingProgressSink::default()));
    #[cfg(feature = "http")]
    let orchestrator = match lims_url {
        Some(url) => orchestrator.with_lims(Arc::new(seqflow::lims::HttpLimsClient::new(url))),
        None => orchestrator,
    };

    let result = orchestrator.run(restart).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

fn run_demux(
    sample_map: &Path,
    input: Option<&Path>,
    output: &Path,
    task_index: usize,
    total_tasks: usize,
) -> Result<()> {
    let map = SampleMap::load(sample_map)
        .with_context(|| format!("Failed to load sample map {}", sample_map.display()))?;
    let input = input.filter(|p| p.as_os_str() != "-");
    let reads = open_reads(input)?;
    let summary = demux(&map, reads, output, task_index, total_tasks)?;
    info!(
        task_index,
        total_tasks,
        seen = summary.pairs_seen,
        emitted = summary.pairs_emitted,
        unknown = summary.pairs_unknown,
        samples = summary.per_sample.len(),
        "Demultiplexing finished"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Run { config, restart } => run(&config, restart).await?,
        Commands::Plan {
            input,
            buckets,
            output_prefix,
        } => {
            let plan = plan(&input, buckets, &output_prefix)?;
            if plan.is_empty() {
                bail!("No paired read files found under {}", input.display());
            }
            println!("{}\t{}", plan.bucket_count(), plan.max_bucket_bytes());
        }
        Commands::Demux {
            sample_map,
            input,
            output,
            task_index,
            total_tasks,
        } => run_demux(&sample_map, input.as_deref(), &output, task_index, total_tasks)?,
        Commands::Reorganize {
            config,
            stage_dir,
            min_bytes,
        } => {
            let config = load_config(&config)?;
            let min_bytes = match min_bytes {
                Some(bytes) => bytes,
                None => config.filter()?.min_bytes,
            };
            let summary = reorganize(&stage_dir, &config.projects, min_bytes)?;
            for sample in summary.quarantined_samples() {
                println!("{sample}");
            }
        }
        Commands::Report { ledger, output } => {
            let ledger = FailureLedger::open(&ledger)
                .with_context(|| format!("Failed to open ledger {}", ledger.display()))?;
            let rows = ledger.report();
            match output {
                Some(path) => write_report_tsv(&rows, BufWriter::new(fs::File::create(path)?))?,
                None => write_report_tsv(&rows, io::stdout().lock())?,
            }
        }
    }
    Ok(())
}
