//! The shared compute pool and the context threaded through operations.
//!
//! Dataset payload work (map/flatMap/sketch on local leaves) runs on a
//! dedicated multi-thread runtime so it never occupies the caller's task,
//! which may be serving RPC or UI traffic. The context is built at the
//! server entry point and passed down explicitly; there are no process-wide
//! scheduler singletons.

use std::sync::Arc;

use pdq_common::{PdqError, Result, RuntimeConfig};

/// A bounded-parallelism worker pool for compute-bound payloads.
#[derive(Debug)]
pub struct ComputePool {
    runtime: Option<tokio::runtime::Runtime>,
    handle: tokio::runtime::Handle,
}

impl ComputePool {
    /// Builds a pool with the given number of worker threads (min 1).
    pub fn new(threads: usize) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("pdq-compute")
            .enable_all()
            .build()
            .map_err(|e| PdqError::InvalidConfig(format!("compute pool: {e}")))?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    /// A handle for spawning work onto the pool.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.handle.clone()
    }
}

impl Drop for ComputePool {
    fn drop(&mut self) {
        // Non-blocking teardown; callers may drop the pool from async code.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// Execution context passed through every dataset operation.
#[derive(Debug, Clone)]
pub struct OpContext {
    pool: Arc<ComputePool>,
}

impl OpContext {
    /// Builds a context from runtime configuration.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        Ok(Self {
            pool: Arc::new(ComputePool::new(config.compute_pool_size)?),
        })
    }

    /// Wraps an existing pool.
    pub fn with_pool(pool: Arc<ComputePool>) -> Self {
        Self { pool }
    }

    /// The shared compute pool.
    pub fn pool(&self) -> &ComputePool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pool_runs_spawned_work() {
        let pool = ComputePool::new(1).expect("pool");
        let joined = pool.handle().spawn(async { 21 * 2 }).await.expect("join");
        assert_eq!(joined, 42);
    }

    #[test]
    fn context_respects_configured_size() {
        let config = RuntimeConfig {
            compute_pool_size: 2,
            ..RuntimeConfig::default()
        };
        let ctx = OpContext::new(&config).expect("context");
        let _ = ctx.pool().handle();
    }
}
