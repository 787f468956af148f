// ========================================================================================
//
//                          THE CONCURRENT SAMPLE READER
//
// ========================================================================================
//
// ### Purpose ###
//
// This module fetches every sample's container from the blob store, validates and
// expands it, and writes the two bit-vectors into the sample's pre-assigned region of
// one shared matrix. One unit of work per sample is scheduled on the worker pool.
//
// ### Shape establishment ###
//
// The matrix does not exist until the first task to finish decoding learns
// `entries_count`. That task allocates it under the shared lock. Every later task must
// observe the same `entries_count`; a mismatch fails the whole read.
//
// ### Drain before fail ###
//
// A failing task records its error and returns. Nothing is cancelled: the reader waits
// for every scheduled task before it reports, so no task outlives this call and the
// buffer state at return is deterministic.

use crate::container;
use crate::matrix::{GenotypeMatrix, PendingMatrix};
use crate::pipeline::PipelineError;
use crate::pool::{WaitGroup, WorkerPool};
use crate::shared::files::{BlobStore, ReadMetrics};
use crate::types::{SampleIndex, SampleLocator};
use indicatif::ProgressBar;
use log::{debug, info, warn};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct ReadState {
    matrix: Option<Arc<PendingMatrix>>,
    failures: Vec<(SampleIndex, PipelineError)>,
}

struct ReadContext {
    store: Arc<dyn BlobStore>,
    metrics: Arc<ReadMetrics>,
    progress: Option<ProgressBar>,
    num_samples: usize,
    state: Mutex<ReadState>,
}

impl ReadContext {
    fn lock(&self) -> MutexGuard<'_, ReadState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the shared matrix, allocating it if this is the first sample to finish
    /// decoding.
    fn matrix_for(&self, entries_count: usize) -> Result<Arc<PendingMatrix>, PipelineError> {
        let mut state = self.lock();
        match &state.matrix {
            Some(matrix) if matrix.entries_count() == entries_count => Ok(Arc::clone(matrix)),
            Some(matrix) => Err(PipelineError::Format(format!(
                "Sample has {entries_count} entries but the run established {}",
                matrix.entries_count()
            ))),
            None => {
                debug!(
                    "Establishing matrix shape: {} samples x {entries_count} entries",
                    self.num_samples
                );
                let matrix = Arc::new(PendingMatrix::allocate(self.num_samples, entries_count)?);
                state.matrix = Some(Arc::clone(&matrix));
                Ok(matrix)
            }
        }
    }

    fn read_one(&self, sample: SampleIndex, path: &str) -> Result<(), PipelineError> {
        let raw = self.store.read(path)?;
        self.metrics.record(raw.len());
        let payload = container::decode_sample(&raw)?;
        let matrix = self.matrix_for(payload.entries_count())?;
        matrix.write_sample(sample, &payload)
    }

    fn record(&self, sample: SampleIndex, locator: &SampleLocator, outcome: Result<(), PipelineError>) {
        if let Err(e) = outcome {
            let e = e.with_context(&format!("sample '{}' ({})", locator.id, locator.path));
            warn!("{e}");
            self.lock().failures.push((sample, e));
        }
        if let Some(pb) = &self.progress {
            pb.inc(1);
        }
    }
}

/// Reads a run's samples into one matrix using a shared worker pool.
pub struct SampleReader<'a> {
    store: Arc<dyn BlobStore>,
    pool: &'a WorkerPool,
    metrics: Arc<ReadMetrics>,
    progress: Option<ProgressBar>,
}

impl<'a> SampleReader<'a> {
    pub fn new(store: Arc<dyn BlobStore>, pool: &'a WorkerPool) -> Self {
        Self {
            store,
            pool,
            metrics: Arc::new(ReadMetrics::new()),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn metrics(&self) -> Arc<ReadMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Reads every locator, in parallel, into a matrix whose sample `i` is
    /// `locators[i]`. Returns the lowest-indexed failure if any task failed; a partial
    /// matrix is never returned.
    pub fn read_all(&self, locators: &[SampleLocator]) -> Result<GenotypeMatrix, PipelineError> {
        if locators.is_empty() {
            return Err(PipelineError::Config("The sample map contains no samples".to_string()));
        }
        if u32::try_from(locators.len()).is_err() {
            return Err(PipelineError::Config(format!(
                "{} samples exceed the supported maximum of {}",
                locators.len(),
                u32::MAX
            )));
        }

        let ctx = Arc::new(ReadContext {
            store: Arc::clone(&self.store),
            metrics: Arc::clone(&self.metrics),
            progress: self.progress.clone(),
            num_samples: locators.len(),
            state: Mutex::new(ReadState::default()),
        });
        let wg = Arc::new(WaitGroup::new(locators.len()));

        for (idx, locator) in locators.iter().enumerate() {
            let ctx = Arc::clone(&ctx);
            let wg = Arc::clone(&wg);
            let locator = locator.clone();
            let sample = SampleIndex(idx as u32);
            self.pool.schedule(move || {
                // The pool also catches panics, but only this catch still reaches `done`.
                let outcome =
                    panic::catch_unwind(AssertUnwindSafe(|| ctx.read_one(sample, &locator.path)))
                        .unwrap_or_else(|_| {
                            Err(PipelineError::Io("The reader task panicked".to_string()))
                        });
                ctx.record(sample, &locator, outcome);
                wg.done();
            });
        }
        wg.wait();

        let (objects, bytes) = self.metrics.snapshot();
        let mut state = ctx.lock();
        if !state.failures.is_empty() {
            state.failures.sort_by_key(|(sample, _)| *sample);
            let failed = state.failures.len();
            warn!("{failed} of {} samples failed to load", locators.len());
            let (_, first) = state.failures.swap_remove(0);
            return Err(first);
        }
        info!(
            "Read {} samples ({objects} objects, {:.2} MiB compressed)",
            locators.len(),
            bytes as f64 / (1024.0 * 1024.0)
        );

        let pending = state.matrix.take().ok_or_else(|| {
            PipelineError::Format("No sample established the matrix shape".to_string())
        })?;
        // Every task dropped its handle before signalling the wait group.
        let pending = Arc::into_inner(pending).ok_or_else(|| {
            PipelineError::Allocation("The matrix is still shared after ingestion".to_string())
        })?;
        Ok(pending.into_matrix())
    }
}
