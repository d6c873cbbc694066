//! Process-wide runtime shared by blocking callers.

use crate::error::Result;
use std::future::Future;
use std::sync::OnceLock;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

const WORKER_THREADS: usize = 2;

static GLOBAL: OnceLock<Context> = OnceLock::new();

/// Owns the runtime that drives sockets opened outside of async code.
///
/// Created lazily, at most once per process; every blocking client shares it.
pub struct Context {
    runtime: Runtime,
}

impl Context {
    /// The shared context, created on first use.
    ///
    /// Must be called from synchronous code, not from inside a runtime.
    pub fn global() -> Result<&'static Context> {
        if let Some(context) = GLOBAL.get() {
            return Ok(context);
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(WORKER_THREADS)
            .thread_name("ada-rpc")
            .enable_all()
            .build()?;
        debug!("Created shared RPC runtime");
        // A racing caller may have won; its runtime is kept and ours dropped.
        Ok(GLOBAL.get_or_init(|| Context { runtime }))
    }

    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }

    pub fn handle(&self) -> &tokio::runtime::Handle {
        self.runtime.handle()
    }
}
