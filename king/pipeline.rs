// ========================================================================================
//
//                          THE RUN ORCHESTRATOR AND ITS ERRORS
//
// ========================================================================================
//
// A run moves through a fixed sequence of states:
//
//   Idle → LoadingSampleMap → ReadingSamples → ComputingKernel → Synchronizing
//        → CollectingResults → Writing → Done
//
// Any state may move to `Failed`. `Done` and `Failed` are terminal: there is no retry
// and no backward transition.

use crate::assemble::{self, AssembledResults};
use crate::config::ValidatedConfig;
use crate::io::SampleReader;
use crate::kernel::{self, Reservoir};
use crate::pool::WorkerPool;
use crate::shared::files::BlobStore;
use crate::types::SampleLocator;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::{debug, info};
use serde::de::{self, Deserialize, Deserializer, MapAccess, Visitor};
use std::collections::BTreeMap;
use std::fmt;
use std::io::IsTerminal;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

// ========================================================================================
//                          Public API, context & error handling
// ========================================================================================

/// A specialized error type for the engine, allowing for robust, clonable error
/// propagation from any concurrent stage. Every kind is fatal for the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("Format error: {0}")]
    Format(String),
    #[error(
        "Result reservoir overflow: {found} pairs passed the threshold but only {capacity} fit. Raise --max-results to at least {found} and rerun."
    )]
    Capacity { found: usize, capacity: usize },
    #[error("Allocation error: {0}")]
    Allocation(String),
}

impl PipelineError {
    /// Prefixes the message with where the error happened, keeping its kind.
    pub fn with_context(self, context: &str) -> Self {
        match self {
            PipelineError::Config(msg) => PipelineError::Config(format!("{context}: {msg}")),
            PipelineError::Io(msg) => PipelineError::Io(format!("{context}: {msg}")),
            PipelineError::Format(msg) => PipelineError::Format(format!("{context}: {msg}")),
            PipelineError::Allocation(msg) => {
                PipelineError::Allocation(format!("{context}: {msg}"))
            }
            capacity @ PipelineError::Capacity { .. } => capacity,
        }
    }

    /// The process exit status for this kind of failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_) => 2,
            PipelineError::Io(_) => 3,
            PipelineError::Format(_) => 4,
            PipelineError::Capacity { .. } => 5,
            PipelineError::Allocation(_) => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    LoadingSampleMap,
    ReadingSamples,
    ComputingKernel,
    Synchronizing,
    CollectingResults,
    Writing,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Done | Failed, _) => false,
            (_, Failed) => true,
            (Idle, LoadingSampleMap)
            | (LoadingSampleMap, ReadingSamples)
            | (ReadingSamples, ComputingKernel)
            | (ComputingKernel, Synchronizing)
            | (Synchronizing, CollectingResults)
            | (CollectingResults, Writing)
            | (Writing, Done) => true,
            _ => false,
        }
    }
}

/// Tracks a run's position in the state machine and refuses illegal transitions.
#[derive(Debug)]
pub struct RunTracker {
    state: RunState,
    started: Instant,
}

impl Default for RunTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunTracker {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), PipelineError> {
        if !self.state.can_transition_to(next) {
            return Err(PipelineError::Config(format!(
                "Illegal run transition {:?} -> {next:?}",
                self.state
            )));
        }
        debug!(
            "Run state {:?} -> {next:?} after {:.2?}",
            self.state,
            self.started.elapsed()
        );
        self.state = next;
        Ok(())
    }

    /// Marks the run failed, unless it already reached a terminal state.
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            debug!("Run state {:?} -> Failed", self.state);
            self.state = RunState::Failed;
        }
    }
}

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub num_samples: usize,
    pub entries_count: usize,
    pub rows: std::ops::Range<usize>,
    pub num_pairs: usize,
    pub num_related_samples: usize,
}

pub(crate) fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    let style = ProgressStyle::with_template(
        "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("█▉▊▋▌▍▎▏  ");
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb
}

/// A sample map whose ids are unique. A JSON object that repeats a key would otherwise
/// keep only the last entry and silently drop a sample.
struct SampleMapDocument(BTreeMap<String, String>);

impl<'de> Deserialize<'de> for SampleMapDocument {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UniqueIds;

        impl<'de> Visitor<'de> for UniqueIds {
            type Value = SampleMapDocument;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping sample ids to container paths")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut map = BTreeMap::new();
                while let Some((id, path)) = access.next_entry::<String, String>()? {
                    if map.contains_key(&id) {
                        return Err(de::Error::custom(format!("duplicate sample id '{id}'")));
                    }
                    map.insert(id, path);
                }
                Ok(SampleMapDocument(map))
            }
        }

        deserializer.deserialize_map(UniqueIds)
    }
}

/// Parses a sample map document (a flat JSON object of id → path) into locators
/// ordered by sample id. The position in the returned list is the sample index.
pub fn parse_sample_map(document: &[u8]) -> Result<Vec<SampleLocator>, PipelineError> {
    let SampleMapDocument(map) = serde_json::from_slice(document)
        .map_err(|e| PipelineError::Format(format!("Invalid sample map: {e}")))?;
    map.into_iter()
        .map(|(id, path)| {
            if id.is_empty() || path.trim().is_empty() {
                return Err(PipelineError::Format(format!(
                    "Sample map entry '{id}' -> '{path}' has an empty id or path"
                )));
            }
            Ok(SampleLocator { id, path })
        })
        .collect()
}

pub fn load_sample_map(
    store: &dyn BlobStore,
    location: &str,
) -> Result<Vec<SampleLocator>, PipelineError> {
    let document = store
        .read(location)
        .map_err(|e| e.with_context("loading the sample map"))?;
    parse_sample_map(&document).map_err(|e| e.with_context(location))
}

/// Executes a whole run: sample map → reader → kernel → assembler → output.
pub fn run(config: &ValidatedConfig, store: Arc<dyn BlobStore>) -> Result<RunSummary, PipelineError> {
    let mut tracker = RunTracker::new();
    let outcome = run_tracked(config, store, &mut tracker);
    if outcome.is_err() {
        tracker.fail();
    }
    outcome
}

fn run_tracked(
    config: &ValidatedConfig,
    store: Arc<dyn BlobStore>,
    tracker: &mut RunTracker,
) -> Result<RunSummary, PipelineError> {
    // --- Stage 1: The sample map ---
    tracker.advance(RunState::LoadingSampleMap)?;
    let samples = load_sample_map(store.as_ref(), &config.sample_map)?;
    let rows = config.rows(samples.len())?;
    info!(
        "Loaded sample map with {} samples from {}",
        samples.len(),
        config.sample_map
    );

    // --- Stage 2: Concurrent ingestion ---
    tracker.advance(RunState::ReadingSamples)?;
    let num_threads = NonZeroUsize::new(config.num_threads)
        .ok_or_else(|| PipelineError::Config("num_threads must be at least 1".to_string()))?;
    let matrix = {
        let pool = WorkerPool::new(num_threads).map_err(|e| {
            PipelineError::Allocation(format!("Failed to start {num_threads} reader threads: {e}"))
        })?;
        let pb = create_progress_bar(samples.len() as u64, "Reading samples...");
        let reader = SampleReader::new(Arc::clone(&store), &pool).with_progress(pb.clone());
        let matrix = reader.read_all(&samples);
        pb.finish_and_clear();
        matrix?
    };
    info!(
        "Matrix ready: {} samples x {} entries ({:.2} MiB)",
        matrix.num_samples(),
        matrix.entries_count(),
        (matrix.words().len() * size_of::<u64>()) as f64 / (1024.0 * 1024.0)
    );

    // --- Stage 3: The kernel ---
    tracker.advance(RunState::ComputingKernel)?;
    let reservoir = Reservoir::with_capacity(config.max_results)?;
    let rows_done = Arc::new(AtomicU64::new(0));
    let kernel_done = Arc::new(AtomicBool::new(false));
    let total_rows = rows.len() as u64;
    let pb = create_progress_bar(total_rows, "Comparing sample pairs...");
    let kernel_outcome = thread::scope(|s| {
        // This thread polls the shared counter so the kernel never touches the bar.
        let updater_rows = Arc::clone(&rows_done);
        let updater_done = Arc::clone(&kernel_done);
        let updater_pb = pb.clone();
        s.spawn(move || {
            while !updater_done.load(Ordering::Relaxed) {
                updater_pb.set_position(updater_rows.load(Ordering::Relaxed));
                thread::sleep(Duration::from_millis(200));
            }
            updater_pb.set_position(updater_rows.load(Ordering::Relaxed));
        });

        let outcome = kernel::compute_relatedness(
            &matrix,
            rows.clone(),
            config.kin_threshold,
            &reservoir,
            &rows_done,
        );
        kernel_done.store(true, Ordering::Relaxed);
        outcome
    });
    pb.finish_and_clear();
    kernel_outcome?;

    // --- Stage 4: Barrier, then release the matrix ---
    // `compute_relatedness` joins every pair task before returning, and the scope
    // above joined the progress thread, so nothing references the matrix any more.
    tracker.advance(RunState::Synchronizing)?;
    let num_samples = matrix.num_samples();
    let entries_count = matrix.entries_count();
    drop(matrix);

    // --- Stage 5: Collect, checking for overflow ---
    tracker.advance(RunState::CollectingResults)?;
    let found = reservoir.cursor();
    let results = reservoir.into_results()?;
    debug!("Kernel offered {found} pairs above the threshold");
    let AssembledResults {
        map,
        related,
        num_pairs,
    } = assemble::assemble(&results, &samples)?;

    // --- Stage 6: Persist ---
    tracker.advance(RunState::Writing)?;
    assemble::write_results(&map, store.as_ref(), &config.output)?;
    tracker.advance(RunState::Done)?;

    Ok(RunSummary {
        num_samples,
        entries_count,
        rows,
        num_pairs,
        num_related_samples: related.iter().filter(|&&flag| flag).count(),
    })
}
