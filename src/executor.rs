// Executor: where continuations and spawned operands run
//
// A thin handle over rayon. `Global` uses rayon's global pool, `Pool` a
// dedicated pool sized from EngineConfig, and `Inline` runs everything on the
// calling thread (deterministic, used by tests and single-threaded embedding).
//
// `submit` is the only way evaluation leaves the current thread: it returns
// a Future that the spawned job fulfils.

use std::fmt;
use std::sync::Arc;

use rayon::ThreadPool;
use tracing::debug;

use crate::future::{channel, Future};

#[derive(Clone, Default)]
pub enum Executor {
    #[default]
    Global,
    Pool(Arc<ThreadPool>),
    Inline,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Executor::Global => f.write_str("Executor::Global"),
            Executor::Pool(pool) => write!(f, "Executor::Pool({} threads)", pool.current_num_threads()),
            Executor::Inline => f.write_str("Executor::Inline"),
        }
    }
}

impl Executor {
    /// A dedicated pool with `threads` workers.
    pub fn with_threads(threads: usize) -> Result<Self, rayon::ThreadPoolBuildError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("physl-worker-{i}"))
            .build()?;
        debug!(threads, "built worker pool");
        Ok(Executor::Pool(Arc::new(pool)))
    }

    /// Number of threads work can spread over.
    pub fn concurrency(&self) -> usize {
        match self {
            Executor::Global => rayon::current_num_threads(),
            Executor::Pool(pool) => pool.current_num_threads(),
            Executor::Inline => 1,
        }
    }

    /// Fire and forget.
    pub fn spawn(&self, job: impl FnOnce() + Send + 'static) {
        match self {
            Executor::Global => rayon::spawn(job),
            Executor::Pool(pool) => pool.spawn(job),
            Executor::Inline => job(),
        }
    }

    /// Run `job` on the pool and forward the future it produces.
    pub fn submit<T, F>(&self, job: F) -> Future<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce() -> Future<T> + Send + 'static,
    {
        if let Executor::Inline = self {
            return job();
        }
        let (promise, future) = channel();
        self.spawn(move || job().forward(promise));
        future
    }
}
