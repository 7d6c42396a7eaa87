//! Process-wide tunables for readers and writers.
//!
//! The configuration is initialised with defaults at first use and mutated
//! only through [`configure`], which shallow-merges a [`ConfigPatch`].
//! Readers and writers snapshot the configuration when they are
//! constructed; later `configure` calls do not affect live instances.

use std::sync::Arc;
use std::thread;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::result::{ZipError, ZipResult};
use crate::workers::WorkerPool;

/// Default read window: 512 KiB.
pub const DEFAULT_CHUNK_SIZE: usize = 512 * 1024;

/// Windows smaller than this are rounded up by the data mover.
pub const MIN_CHUNK_SIZE: usize = 64;

static GLOBAL: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::default()));

/// A snapshot of the process-wide configuration.
#[derive(Clone)]
pub struct Config {
    /// Read window used by the chunked data mover.
    pub chunk_size: usize,
    /// Ceiling for the codec worker pool.
    pub max_workers: usize,
    /// Master switch for off-thread codec workers.
    pub use_workers: bool,
    /// Caller-supplied shared worker pool. When `None` the crate builds
    /// one sized by `max_workers` on first use.
    pub worker_pool: Option<Arc<WorkerPool>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_workers: default_max_workers(),
            use_workers: true,
            worker_pool: None,
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("chunk_size", &self.chunk_size)
            .field("max_workers", &self.max_workers)
            .field("use_workers", &self.use_workers)
            .field("worker_pool", &self.worker_pool.is_some())
            .finish()
    }
}

impl Config {
    /// The current process-wide configuration.
    pub fn snapshot() -> Config {
        GLOBAL.read().clone()
    }

    /// Effective read window, clamped to the format minimum.
    pub(crate) fn effective_chunk_size(&self) -> usize {
        self.chunk_size.max(MIN_CHUNK_SIZE)
    }

    /// The pool codec sessions should be dispatched to, or `None` when
    /// workers are disabled.
    pub(crate) fn effective_pool(&self) -> Option<Arc<WorkerPool>> {
        if !self.use_workers {
            return None;
        }
        match &self.worker_pool {
            Some(pool) => Some(Arc::clone(pool)),
            None => Some(shared_pool(self.max_workers)),
        }
    }
}

fn default_max_workers() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

/// The lazily-built process-wide pool. Sized by the `max_workers` value in
/// effect when it is first needed.
fn shared_pool(max_workers: usize) -> Arc<WorkerPool> {
    static POOL: Lazy<RwLock<Option<Arc<WorkerPool>>>> = Lazy::new(|| RwLock::new(None));
    if let Some(pool) = POOL.read().as_ref() {
        return Arc::clone(pool);
    }
    let mut slot = POOL.write();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(WorkerPool::new(max_workers))))
}

/// A partial configuration, shallow-merged into the process-wide state by
/// [`configure`]. Unset fields keep their current values.
#[derive(Default)]
pub struct ConfigPatch {
    pub chunk_size: Option<usize>,
    pub max_workers: Option<usize>,
    pub use_workers: Option<bool>,
    pub worker_pool: Option<Arc<WorkerPool>>,
}

impl std::fmt::Debug for ConfigPatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigPatch")
            .field("chunk_size", &self.chunk_size)
            .field("max_workers", &self.max_workers)
            .field("use_workers", &self.use_workers)
            .field("worker_pool", &self.worker_pool.is_some())
            .finish()
    }
}

/// Shallow-merge `patch` into the process-wide configuration.
///
/// `max_workers` and `worker_pool` are mutually exclusive ways of
/// provisioning codec workers; setting both in one patch is a
/// configuration error and leaves the state unchanged.
pub fn configure(patch: ConfigPatch) -> ZipResult<()> {
    if patch.max_workers.is_some() && patch.worker_pool.is_some() {
        return Err(ZipError::Configuration(
            "max_workers and worker_pool are mutually exclusive",
        ));
    }
    let mut config = GLOBAL.write();
    if let Some(chunk_size) = patch.chunk_size {
        config.chunk_size = chunk_size;
    }
    if let Some(max_workers) = patch.max_workers {
        config.max_workers = max_workers;
    }
    if let Some(use_workers) = patch.use_workers {
        config.use_workers = use_workers;
    }
    if let Some(pool) = patch.worker_pool {
        config.worker_pool = Some(pool);
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn exclusive_worker_options_are_rejected() {
        let patch = ConfigPatch {
            max_workers: Some(4),
            worker_pool: Some(Arc::new(WorkerPool::new(1))),
            ..Default::default()
        };
        assert!(matches!(
            configure(patch),
            Err(ZipError::Configuration(_))
        ));
    }

    #[test]
    fn chunk_size_is_clamped() {
        let config = Config {
            chunk_size: 1,
            ..Config::default()
        };
        assert_eq!(config.effective_chunk_size(), MIN_CHUNK_SIZE);
    }
}
