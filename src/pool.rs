use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder, prelude::*};

/// Fork-join pool for independent tasks.
///
/// A pool of one thread runs tasks in order on the calling thread.
pub struct TaskPool {
    pool: Option<ThreadPool>,
}

impl TaskPool {
    pub fn new(n_threads: usize) -> Result<Self> {
        if n_threads <= 1 {
            return Ok(Self { pool: None });
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(n_threads)
            .build()
            .context("failed to build thread pool")?;
        Ok(Self { pool: Some(pool) })
    }

    pub fn n_threads(&self) -> usize {
        self.pool.as_ref().map_or(1, ThreadPool::current_num_threads)
    }

    /// Run `f` on every task and block until all are done.
    ///
    /// Results come back in task order. The first error aborts the batch.
    pub fn run<T, R, F>(&self, tasks: Vec<T>, f: F) -> Result<Vec<R>>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> Result<R> + Sync + Send,
    {
        match &self.pool {
            None => tasks.into_iter().map(f).collect(),
            Some(pool) => pool.install(|| tasks.into_par_iter().map(f).collect()),
        }
    }
}
