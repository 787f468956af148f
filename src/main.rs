// ========================================================================================
//
//                      THE STRATEGIC ORCHESTRATOR: KINSHIP
//
// ========================================================================================
//
// This module is the entry point of the application. It parses the command line,
// layers flags over an optional configuration file, hands the run to the library's
// pipeline and turns any failure into a diagnostic and a non-zero exit status.
//
// ### The Orchestration Mandate ###
//
// 1.  **Minimal Configuration:** Only the run's real inputs are exposed as flags. Pool
//     sizing defaults to the machine's core count and the threshold to the KING
//     third-degree cutoff.
//
// 2.  **Fail Fast, Fail Loud:** Every error kind is fatal. The diagnostic goes to
//     stderr and the exit status identifies the kind of failure.

use clap::{Args, Parser, Subcommand};
use kinship::config::RunConfig;
use kinship::pack;
use kinship::pipeline::{self, PipelineError};
use kinship::shared::files::{BlobStore, RoutingBlobStore};
use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Instant;

// ========================================================================================
//                         COMMAND-LINE INTERFACE DEFINITION
// ========================================================================================

#[derive(Parser, Debug)]
#[clap(
    name = "kinship",
    version,
    about = "A high-performance engine for pairwise KING relatedness estimation."
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Estimate pairwise relatedness for every sample in a sample map.
    Compute(ComputeArgs),
    /// Convert a genotype table into per-sample containers and a sample map.
    Pack(PackArgs),
}

#[derive(Args, Debug)]
struct ComputeArgs {
    /// Optional TOML file with run settings. Flags override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON sample map (sample id → container path). Local paths, `file://`, `gs://`
    /// and `http(s)://` locations are accepted.
    #[arg(long)]
    sample_map: Option<String>,

    /// Where to write the relatedness JSON document.
    #[arg(long)]
    output: Option<String>,

    /// Capacity of the result reservoir.
    #[arg(long)]
    max_results: Option<usize>,

    /// Number of reader threads.
    #[arg(long)]
    num_threads: Option<usize>,

    /// Report pairs whose coefficient is strictly above this value.
    #[arg(long)]
    kin_threshold: Option<f32>,

    /// First sample index (inclusive) of the row range for sharded runs.
    #[arg(long, requires = "range_end")]
    range_begin: Option<usize>,

    /// Last sample index (exclusive) of the row range for sharded runs.
    #[arg(long, requires = "range_begin")]
    range_end: Option<usize>,
}

#[derive(Args, Debug)]
struct PackArgs {
    /// Genotype table: one `sample_id<TAB>calls` line per sample.
    #[arg(long)]
    input: PathBuf,

    /// Directory (or object prefix) receiving the containers and sample map.
    #[arg(long)]
    output_dir: String,
}

// ========================================================================================
//                           THE MAIN ORCHESTRATION LOGIC
// ========================================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let start_time = Instant::now();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Command::Compute(args) => run_compute(args),
        Command::Pack(args) => run_pack(args),
    };

    match outcome {
        Ok(()) => eprintln!(
            "\nSuccess! Total execution time: {:.2?}",
            start_time.elapsed()
        ),
        Err(e) => {
            eprintln!("Fatal error: {e}");
            process::exit(e.exit_code());
        }
    }
}

fn run_compute(args: ComputeArgs) -> Result<(), PipelineError> {
    // --- Phase 1: Configuration ---
    let mut config = match &args.config {
        Some(path) => {
            eprintln!("> Loading configuration from {}", path.display());
            RunConfig::from_toml_file(path)?
        }
        None => RunConfig::default(),
    };
    apply_overrides(&mut config, &args);
    let config = config.validate()?;
    eprintln!(
        "> Threshold {} | reservoir capacity {} | {} reader threads",
        config.kin_threshold, config.max_results, config.num_threads
    );

    // --- Phase 2: The run ---
    let store: Arc<dyn BlobStore> = Arc::new(RoutingBlobStore::new());
    let summary = pipeline::run(&config, store)?;

    // --- Phase 3: Report ---
    eprintln!(
        "> Compared rows {}..{} of {} samples over {} words per bit-vector.",
        summary.rows.start, summary.rows.end, summary.num_samples, summary.entries_count
    );
    eprintln!(
        "> Found {} related pairs involving {} samples. Results written to {}",
        summary.num_pairs, summary.num_related_samples, config.output
    );
    Ok(())
}

fn apply_overrides(config: &mut RunConfig, args: &ComputeArgs) {
    if let Some(sample_map) = &args.sample_map {
        config.sample_map = Some(sample_map.clone());
    }
    if let Some(output) = &args.output {
        config.output = Some(output.clone());
    }
    if let Some(max_results) = args.max_results {
        config.max_results = max_results;
    }
    if let Some(num_threads) = args.num_threads {
        config.num_threads = num_threads;
    }
    if let Some(kin_threshold) = args.kin_threshold {
        config.kin_threshold = kin_threshold;
    }
    if let (Some(begin), Some(end)) = (args.range_begin, args.range_end) {
        config.sample_range = Some([begin, end]);
    }
}

fn run_pack(args: PackArgs) -> Result<(), PipelineError> {
    eprintln!("> Reading genotype table {}", args.input.display());
    let text = fs::read_to_string(&args.input).map_err(|e| {
        PipelineError::Io(format!("Failed to read '{}': {e}", args.input.display()))
    })?;
    let rows = pack::parse_genotype_table(&text)?;
    let summary = pack::pack_samples(&rows, &RoutingBlobStore::new(), &args.output_dir)?;
    eprintln!(
        "> Packed {} samples with {} markers each. Sample map: {}",
        summary.num_samples, summary.num_markers, summary.sample_map_path
    );
    Ok(())
}
