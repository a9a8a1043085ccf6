// src/chain/backend.rs

//! Pluggable chain dispatch.
//!
//! The runtime hands bindings to a `ChainBackend` instead of awaiting chains
//! itself, so a slow chain never delays the next scheduler tick. Tests swap
//! in a backend that reports canned results.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::RuntimeEvent;
use crate::errors::Result;
use crate::model::ProfileBinding;
use crate::types::BindingId;

use super::TaskChainExecutor;

pub type BackendFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// How the runtime starts and cancels task chains.
///
/// Implementations report every started chain back as
/// [`RuntimeEvent::ChainFinished`], including cancelled ones.
pub trait ChainBackend: Send {
    fn run_chain(&mut self, binding: ProfileBinding) -> BackendFuture<'_>;

    fn cancel_chain(&mut self, binding: BindingId) -> BackendFuture<'_>;
}

type Running = Arc<Mutex<HashMap<BindingId, CancellationToken>>>;

/// Runs each chain as its own tokio task on a shared [`TaskChainExecutor`].
pub struct RealChainBackend {
    executor: Arc<TaskChainExecutor>,
    runtime_tx: mpsc::Sender<RuntimeEvent>,
    running: Running,
}

impl RealChainBackend {
    pub fn new(executor: TaskChainExecutor, runtime_tx: mpsc::Sender<RuntimeEvent>) -> Self {
        Self {
            executor: Arc::new(executor),
            runtime_tx,
            running: Arc::default(),
        }
    }

    /// Chains started and not yet finished.
    pub fn running(&self) -> usize {
        lock(&self.running).len()
    }
}

fn lock(running: &Running) -> MutexGuard<'_, HashMap<BindingId, CancellationToken>> {
    running.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChainBackend for RealChainBackend {
    fn run_chain(&mut self, binding: ProfileBinding) -> BackendFuture<'_> {
        let executor = Arc::clone(&self.executor);
        let tx = self.runtime_tx.clone();
        let running = Arc::clone(&self.running);

        Box::pin(async move {
            let token = CancellationToken::new();
            lock(&running).insert(binding.id, token.clone());
            debug!(binding = %binding.id, device = %binding.device, "dispatching task chain");

            tokio::spawn(async move {
                let report = executor.execute(&binding, token).await;
                lock(&running).remove(&binding.id);
                if let Err(e) = tx.send(RuntimeEvent::ChainFinished(report)).await {
                    warn!(binding = %binding.id, error = %e, "runtime gone; dropping chain report");
                }
            });
            Ok(())
        })
    }

    fn cancel_chain(&mut self, binding: BindingId) -> BackendFuture<'_> {
        let token = lock(&self.running).get(&binding).cloned();

        Box::pin(async move {
            match token {
                Some(token) => {
                    info!(%binding, "cancelling task chain");
                    token.cancel();
                    Ok(())
                }
                None => {
                    debug!(%binding, "cancel requested for a chain that already finished");
                    Ok(())
                }
            }
        })
    }
}
