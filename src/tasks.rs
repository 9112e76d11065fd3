//! Bounded fan-out/fan-in execution of work units on rayon pools.
//!
//! Two batch shapes are supported:
//!
//! * [`TaskRunner::each`]: one function applied to many parameters, keyed by
//!   parameter, on a pool of `min(len(params), worker_limit)` threads.
//! * [`TaskRunner::all`]: many labelled functions applied to one shared
//!   parameter, keyed by label, on a pool of `len(funcs)` threads.
//!
//! Results are collected in completion order on the calling thread. Each
//! key is written at most once per batch; nothing else about ordering is
//! promised.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::unbounded;
use log::debug;
use rayon::{ThreadPool, ThreadPoolBuilder};
use thiserror::Error;

static NEXT_BATCH: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("worker limit must be at least 1")]
    InvalidConfig,

    #[error("batch `{batch}` has no work units")]
    EmptyBatch { batch: String },

    #[error("task {key} in batch `{batch}` failed: {source}")]
    Failed {
        batch: String,
        key: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("task {key} in batch `{batch}` panicked: {message}")]
    Panicked {
        batch: String,
        key: String,
        message: String,
    },

    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

impl TaskError {
    /// Key of the unit that failed, if the error came from a unit.
    pub fn key(&self) -> Option<&str> {
        match self {
            TaskError::Failed { key, .. } | TaskError::Panicked { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Per-task trace handle passed explicitly into every work unit.
///
/// Carries the identity of the batch and the task so log lines emitted from
/// worker threads can be attributed without any thread-keyed global state.
#[derive(Debug, Clone)]
pub struct TaskTrace {
    batch_id: u64,
    batch: String,
    index: usize,
    key: String,
}

impl TaskTrace {
    pub fn batch_id(&self) -> u64 {
        self.batch_id
    }

    pub fn batch(&self) -> &str {
        &self.batch
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        debug!(
            "[{}#{}:{}] {} {}",
            self.batch,
            self.batch_id,
            self.index,
            self.key,
            message.as_ref()
        );
    }

    /// Run `f` and log how long it took under this task's identity.
    pub fn timed<R>(&self, label: &str, f: impl FnOnce() -> R) -> R {
        let start = std::time::Instant::now();
        let result = f();
        self.debug(format!("{label} took {:.2?}", start.elapsed()));
        result
    }
}

type Unit<'a, T> = Box<dyn FnOnce(&TaskTrace) -> anyhow::Result<T> + Send + 'a>;
type ResultHook<'a, K, T> = Box<dyn FnMut(&K, T) -> T + 'a>;
type DoneHook<'a, K> = Box<dyn FnMut(&K) + 'a>;

/// Factory for batches with a fixed worker ceiling.
#[derive(Debug, Clone, Copy)]
pub struct TaskRunner {
    worker_limit: usize,
}

impl Default for TaskRunner {
    fn default() -> Self {
        Self {
            worker_limit: num_cpus::get().max(1),
        }
    }
}

impl TaskRunner {
    pub fn new(worker_limit: usize) -> Result<Self, TaskError> {
        if worker_limit == 0 {
            return Err(TaskError::InvalidConfig);
        }
        Ok(Self { worker_limit })
    }

    pub fn worker_limit(&self) -> usize {
        self.worker_limit
    }

    /// Build a pool that can be handed to several batches via
    /// [`Batch::shared_pool`].
    pub fn build_pool(&self, threads: usize, name: &str) -> Result<ThreadPool, TaskError> {
        let prefix = name.to_string();
        Ok(ThreadPoolBuilder::new()
            .num_threads(threads.clamp(1, self.worker_limit))
            .thread_name(move |i| format!("{prefix}-{i}"))
            .build()?)
    }

    /// One function over many parameters, keyed by parameter.
    pub fn each<'a, P, T, F>(&self, name: &str, func: &'a F, params: &'a [P]) -> Batch<'a, P, T>
    where
        P: Clone + Debug + Eq + Hash + Send + Sync,
        T: Send + 'a,
        F: Fn(&P, &TaskTrace) -> anyhow::Result<T> + Sync,
    {
        let units = params
            .iter()
            .map(|param| {
                let unit: Unit<'a, T> = Box::new(move |trace| func(param, trace));
                (param.clone(), unit)
            })
            .collect::<Vec<_>>();
        let pool_size = params.len().min(self.worker_limit);
        Batch::new(name, units, pool_size)
    }

    /// Many labelled functions over one shared parameter, keyed by label.
    pub fn all<'a, K, P, T>(
        &self,
        name: &str,
        funcs: Vec<(K, &'a (dyn Fn(&P, &TaskTrace) -> anyhow::Result<T> + Sync))>,
        param: &'a P,
    ) -> Batch<'a, K, T>
    where
        K: Clone + Debug + Eq + Hash + Send,
        P: Sync,
        T: Send + 'a,
    {
        let pool_size = funcs.len();
        let units = funcs
            .into_iter()
            .map(|(key, func)| {
                let unit: Unit<'a, T> = Box::new(move |trace| func(param, trace));
                (key, unit)
            })
            .collect();
        Batch::new(name, units, pool_size)
    }
}

/// A prepared set of work units plus collection hooks.
pub struct Batch<'a, K, T> {
    name: String,
    units: Vec<(K, Unit<'a, T>)>,
    pool_size: usize,
    on_each_result: Option<ResultHook<'a, K, T>>,
    on_each_done: Option<DoneHook<'a, K>>,
    shared_pool: Option<&'a ThreadPool>,
}

impl<'a, K, T> Batch<'a, K, T>
where
    K: Clone + Debug + Eq + Hash + Send,
    T: Send + 'a,
{
    fn new(name: &str, units: Vec<(K, Unit<'a, T>)>, pool_size: usize) -> Self {
        Self {
            name: name.to_string(),
            units,
            pool_size,
            on_each_result: None,
            on_each_done: None,
            shared_pool: None,
        }
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Transform each raw result before it is stored.
    pub fn on_each_result(mut self, hook: impl FnMut(&K, T) -> T + 'a) -> Self {
        self.on_each_result = Some(Box::new(hook));
        self
    }

    /// Called once per completed unit, stored or not. Runs on the collecting
    /// thread, so it must return quickly or it throttles the whole batch.
    pub fn on_each_done(mut self, hook: impl FnMut(&K) + 'a) -> Self {
        self.on_each_done = Some(Box::new(hook));
        self
    }

    /// Reuse `pool` instead of building one for this batch. The pool is left
    /// running afterwards.
    pub fn shared_pool(mut self, pool: &'a ThreadPool) -> Self {
        self.shared_pool = Some(pool);
        self
    }

    /// Execute every unit and collect results into `results` if given.
    ///
    /// Returns the number of units collected. The first failing unit stops
    /// collection; units already running finish but their results are
    /// discarded.
    pub fn run(self, results: Option<&mut HashMap<K, T>>) -> Result<usize, TaskError> {
        let Batch {
            name,
            units,
            pool_size,
            mut on_each_result,
            mut on_each_done,
            shared_pool,
        } = self;

        if units.is_empty() {
            return Err(TaskError::EmptyBatch { batch: name });
        }

        let owned_pool;
        let pool = match shared_pool {
            Some(pool) => pool,
            None => {
                owned_pool = ThreadPoolBuilder::new()
                    .num_threads(pool_size.max(1))
                    .thread_name({
                        let name = name.clone();
                        move |i| format!("{name}-{i}")
                    })
                    .build()?;
                &owned_pool
            }
        };

        let batch_id = NEXT_BATCH.fetch_add(1, Ordering::Relaxed);
        let total = units.len();
        debug!(
            "batch `{name}`#{batch_id}: {total} unit(s) on {} thread(s)",
            pool.current_num_threads()
        );

        let mut results = results;
        let (tx, rx) = unbounded::<(K, std::thread::Result<anyhow::Result<T>>)>();

        let collected = pool.in_place_scope(|scope| {
            for (index, (key, unit)) in units.into_iter().enumerate() {
                let tx = tx.clone();
                let trace = TaskTrace {
                    batch_id,
                    batch: name.clone(),
                    index,
                    key: format!("{key:?}"),
                };
                scope.spawn(move |_| {
                    let outcome = catch_unwind(AssertUnwindSafe(|| unit(&trace)));
                    // The receiver is gone once collection has been aborted.
                    let _ = tx.send((key, outcome));
                });
            }
            drop(tx);

            let mut collected = 0;
            for (key, outcome) in rx.iter().take(total) {
                let value = match outcome {
                    Ok(Ok(value)) => value,
                    Ok(Err(source)) => {
                        return Err(TaskError::Failed {
                            batch: name.clone(),
                            key: format!("{key:?}"),
                            source,
                        });
                    }
                    Err(panic) => {
                        return Err(TaskError::Panicked {
                            batch: name.clone(),
                            key: format!("{key:?}"),
                            message: panic_message(panic.as_ref()),
                        });
                    }
                };

                let value = match on_each_result.as_mut() {
                    Some(hook) => hook(&key, value),
                    None => value,
                };
                if let Some(done) = on_each_done.as_mut() {
                    done(&key);
                }
                if let Some(map) = results.as_deref_mut() {
                    map.insert(key, value);
                }
                collected += 1;
            }
            Ok(collected)
        })?;

        debug!("batch `{name}`#{batch_id}: collected {collected}/{total}");
        Ok(collected)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
