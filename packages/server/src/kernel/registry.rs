//! Tool handler registry.
//!
//! Handlers are registered once at startup and the list is immutable
//! afterwards. The runner picks the first handler whose `matches` predicate
//! accepts the step's tool selector; no match is a fatal step error.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::Step;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Whether this handler serves the given tool selector.
    fn matches(&self, tool: &str) -> bool;

    /// Execute the step. The returned value becomes the step's outputs.
    ///
    /// `cancel` fires when the worker's timeout race has already decided the
    /// step's fate; cooperative handlers return promptly so the execution
    /// lease frees up for the retry. Handlers that ignore it are still
    /// accounted for by the race.
    async fn execute(&self, run_id: Uuid, step: &Step, cancel: CancellationToken)
        -> Result<Value>;
}

pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn ToolHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn ToolHandler>>) -> Self {
        Self { handlers }
    }

    /// Registry preloaded with the built-in `test:*` handlers.
    pub fn with_builtins() -> Self {
        Self::new(vec![
            Arc::new(EchoHandler),
            Arc::new(FailHandler),
            Arc::new(SleepHandler),
        ])
    }

    /// First handler whose predicate accepts the tool.
    pub fn find(&self, tool: &str) -> Option<Arc<dyn ToolHandler>> {
        self.handlers.iter().find(|h| h.matches(tool)).cloned()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Echoes the step inputs back as outputs.
pub struct EchoHandler;

#[async_trait]
impl ToolHandler for EchoHandler {
    fn matches(&self, tool: &str) -> bool {
        tool == "test:echo"
    }

    async fn execute(
        &self,
        _run_id: Uuid,
        step: &Step,
        _cancel: CancellationToken,
    ) -> Result<Value> {
        Ok(json!({ "echo": step.inputs }))
    }
}

/// Always fails; exercises the retry and DLQ paths.
pub struct FailHandler;

#[async_trait]
impl ToolHandler for FailHandler {
    fn matches(&self, tool: &str) -> bool {
        tool == "test:fail"
    }

    async fn execute(
        &self,
        _run_id: Uuid,
        _step: &Step,
        _cancel: CancellationToken,
    ) -> Result<Value> {
        anyhow::bail!("simulated failure")
    }
}

/// Sleeps for `inputs.ms` milliseconds; exercises the timeout race.
pub struct SleepHandler;

#[async_trait]
impl ToolHandler for SleepHandler {
    fn matches(&self, tool: &str) -> bool {
        tool == "test:sleep"
    }

    async fn execute(
        &self,
        _run_id: Uuid,
        step: &Step,
        cancel: CancellationToken,
    ) -> Result<Value> {
        let ms = step.inputs.get("ms").and_then(Value::as_u64).unwrap_or(50);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(json!({ "sleptMs": ms })),
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
        }
    }
}
