//! Explicitly owned worker pool that executes chunk tasks.
//!
//! With the `threading` feature a dedicated rayon pool is built per handle;
//! without it chunks run one after another on the calling thread. Either way
//! results come back in chunk order.
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::debug;

use crate::error::{ChunkFailure, PoolError};

pub struct WorkerPool {
    workers: usize,
    #[cfg(feature = "threading")]
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Build a pool with `workers` threads; `0` lets rayon pick.
    #[cfg(feature = "threading")]
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("atlxi-worker-{i}"))
            .build()
            .map_err(|e| PoolError::Build {
                workers,
                reason: e.to_string(),
            })?;
        let workers = pool.current_num_threads();
        debug!(workers, "worker pool started");
        Ok(Self { workers, pool })
    }

    #[cfg(not(feature = "threading"))]
    pub fn new(workers: usize) -> Result<Self, PoolError> {
        debug!(requested = workers, "threading disabled; running chunks inline");
        Ok(Self { workers: 1 })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `task(0..n)` and return the results in chunk order.
    ///
    /// Execution order across chunks is unspecified. A panicking task yields
    /// [`ChunkFailure::WorkerPanicked`] for its own chunk only.
    pub fn run_chunks<T, F>(&self, n: usize, task: F) -> Vec<Result<T, ChunkFailure>>
    where
        T: Send,
        F: Fn(usize) -> Result<T, ChunkFailure> + Sync + Send,
    {
        let guarded = |i: usize| {
            panic::catch_unwind(AssertUnwindSafe(|| task(i)))
                .unwrap_or_else(|payload| Err(ChunkFailure::WorkerPanicked(panic_message(payload))))
        };

        #[cfg(feature = "threading")]
        {
            use rayon::prelude::*;
            self.pool.install(|| (0..n).into_par_iter().map(guarded).collect())
        }

        #[cfg(not(feature = "threading"))]
        {
            (0..n).map(guarded).collect()
        }
    }

    /// Release the pool. Every `run_chunks` call has returned by now, so no
    /// task is pending; the threads exit in the background and the caller
    /// does not wait for them.
    pub fn shutdown(self) {
        debug!(workers = self.workers, "worker pool shut down");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
