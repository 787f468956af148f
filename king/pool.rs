// ========================================================================================
//
//                      THE WORK DISPATCHER: A FIXED WORKER POOL
//
// ========================================================================================
//
// A fixed number of named worker threads drain one FIFO queue guarded by a single
// mutex/condvar pair. There is no work stealing, no cancellation and no error channel:
// callers that need to know about failures record them in their own shared state.
// Dropping the pool pushes one shutdown sentinel per worker and joins every thread.
//
// Panicking jobs are caught so a worker keeps serving the queue. Catching requires
// unwinding: under the release profile's `panic = "abort"` a panic ends the process.

use log::{debug, error};
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

struct Queue {
    messages: Mutex<VecDeque<Message>>,
    available: Condvar,
}

impl Queue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // Jobs run outside the lock, so a poisoned queue still holds consistent data.
        self.messages
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, message: Message) {
        self.lock().push_back(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Message {
        let mut messages = self.lock();
        loop {
            if let Some(message) = messages.pop_front() {
                return message;
            }
            messages = self
                .available
                .wait(messages)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

pub struct WorkerPool {
    queue: Arc<Queue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `num_threads` workers. Fails only if the OS refuses to create a thread;
    /// any workers already started are shut down and joined before returning.
    pub fn new(num_threads: NonZeroUsize) -> std::io::Result<Self> {
        let queue = Arc::new(Queue {
            messages: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
        });
        let mut pool = Self {
            queue,
            workers: Vec::with_capacity(num_threads.get()),
        };
        for worker_idx in 0..num_threads.get() {
            let queue = Arc::clone(&pool.queue);
            let handle = thread::Builder::new()
                .name(format!("kinship-worker-{worker_idx}"))
                .spawn(move || worker_loop(&queue))?;
            pool.workers.push(handle);
        }
        debug!("Started worker pool with {} threads", pool.workers.len());
        Ok(pool)
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Enqueues one unit of work. Units run in submission order as workers free up.
    pub fn schedule<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue.push(Message::Run(Box::new(job)));
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for _ in 0..self.workers.len() {
            self.queue.push(Message::Shutdown);
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("A worker thread exited abnormally");
            }
        }
    }
}

fn worker_loop(queue: &Queue) {
    loop {
        match queue.pop() {
            Message::Run(job) => {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("A scheduled job panicked; the worker keeps serving the queue");
                }
            }
            Message::Shutdown => return,
        }
    }
}

/// A rendezvous for a known, fixed number of tasks, each of which calls `done` exactly
/// once. `wait` blocks until the count reaches zero.
pub struct WaitGroup {
    remaining: Mutex<usize>,
    finished: Condvar,
}

impl WaitGroup {
    pub fn new(count: usize) -> Self {
        Self {
            remaining: Mutex::new(count),
            finished: Condvar::new(),
        }
    }

    pub fn done(&self) {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug_assert!(*remaining > 0, "WaitGroup::done called too many times");
        *remaining = remaining.saturating_sub(1);
        if *remaining == 0 {
            self.finished.notify_all();
        }
    }

    pub fn wait(&self) {
        let mut remaining = self
            .remaining
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        while *remaining > 0 {
            remaining = self
                .finished
                .wait(remaining)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}
