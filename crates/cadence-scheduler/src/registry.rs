//! Job handler registry.
//!
//! The engine never knows what a job does. Collaborators register handlers
//! under a target string; a job's `job_target` selects one at run time.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::types::TriggerType;

/// Everything a handler gets to know about the attempt it is serving.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: String,
    pub slug: String,
    pub run_id: String,
    /// 1-based attempt number within the run.
    pub attempt: u32,
    pub trigger_type: TriggerType,
    /// The job's `job_params`, verbatim.
    pub params: serde_json::Value,
    /// Cancelled when the attempt exceeds its deadline. Long-running handlers
    /// should watch it; the task is aborted regardless.
    pub cancel: CancellationToken,
}

/// A unit of job logic supplied by the embedding application.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Execute one attempt. The returned value is stored as the run's output;
    /// `Value::Null` stores nothing.
    async fn run(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value>;
}

/// Adapter so plain async closures can be registered as handlers.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn run(&self, ctx: JobContext) -> anyhow::Result<serde_json::Value> {
        (self.0)(ctx).await
    }
}

/// Concurrent map from job target to handler.
///
/// Shared as `Arc<HandlerRegistry>`; handlers can be (re)registered while
/// the engine runs.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `target`, replacing any previous one.
    pub fn register(&self, target: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let target = target.into();
        debug!(%target, "job handler registered");
        self.handlers.insert(target, handler);
    }

    pub fn register_fn<F, Fut>(&self, target: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        self.register(target, Arc::new(FnHandler(f)));
    }

    /// Remove a handler. Silent no-op if the target is unknown.
    pub fn unregister(&self, target: &str) {
        if self.handlers.remove(target).is_some() {
            debug!(target, "job handler unregistered");
        }
    }

    pub fn get(&self, target: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(target).map(|h| Arc::clone(h.value()))
    }

    /// Registered targets, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("targets", &self.targets())
            .finish()
    }
}
