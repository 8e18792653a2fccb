//! Parallel Executor
//!
//! Fans a batch of calls out through the router. A shared semaphore bounds the
//! number of calls running at once across all batches; results are placed by
//! each call's original index, so output order always matches input order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::client::BackendError;
use crate::error::OrchestratorError;
use crate::router::ToolRouter;
use crate::types::{ToolCall, ToolResult};

/// How a batch reacts to a failed call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BatchMode {
    /// Record the failure and keep going (graceful degradation)
    #[default]
    Continue,
    /// Stop admitting queued calls after the first failure. Calls already
    /// running finish with their real outcome; queued ones are cancelled.
    AbortOnFailure,
}

/// Progress notification sent after each result becomes available
#[derive(Debug, Clone, Copy)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    /// Input index of the call that just finished
    pub index: usize,
    pub success: bool,
}

pub type ProgressCallback = Arc<dyn Fn(BatchProgress) + Send + Sync>;

/// Per-batch options
#[derive(Clone, Default)]
pub struct BatchOptions {
    pub mode: BatchMode,
    pub progress: Option<ProgressCallback>,
}

impl BatchOptions {
    pub fn abort_on_failure(mut self) -> Self {
        self.mode = BatchMode::AbortOnFailure;
        self
    }

    pub fn with_progress(mut self, callback: impl Fn(BatchProgress) + Send + Sync + 'static) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptions")
            .field("mode", &self.mode)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Runs batches of tool calls concurrently
pub struct ParallelExecutor {
    router: ToolRouter,
    slots: Arc<Semaphore>,
}

impl ParallelExecutor {
    pub fn new(router: ToolRouter, max_concurrency: usize) -> Self {
        Self {
            router,
            slots: Arc::new(Semaphore::new(max_concurrency)),
        }
    }

    /// Free call slots right now
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Execute `calls` concurrently and return one result per call, in input order
    pub async fn execute(&self, calls: Vec<ToolCall>, options: BatchOptions) -> Vec<ToolResult> {
        if calls.is_empty() {
            return Vec::new();
        }

        let total = calls.len();
        let started = Instant::now();
        let abort = CancellationToken::new();
        let mut tasks = JoinSet::new();

        let abort_on_failure = options.mode == BatchMode::AbortOnFailure;
        tracing::info!(calls = total, mode = ?options.mode, "Executing batch");

        for (index, call) in calls.iter().cloned().enumerate() {
            let router = self.router.clone();
            let slots = Arc::clone(&self.slots);
            let abort = abort.clone();

            tasks.spawn(async move {
                let queued_at = Instant::now();
                let permit = tokio::select! {
                    biased;
                    _ = abort.cancelled() => None,
                    permit = slots.acquire_owned() => permit.ok(),
                };

                let permit = match permit {
                    Some(permit) if !abort.is_cancelled() => permit,
                    _ => {
                        let error = OrchestratorError::cancelled(&call.backend, &call.tool);
                        return (index, ToolResult::failed(call, error, queued_at.elapsed()));
                    }
                };

                let fallback = call.clone();
                let result = match AssertUnwindSafe(router.dispatch(call)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!(backend = %fallback.backend, tool = %fallback.tool, "Tool call panicked");
                        let error = OrchestratorError::ToolExecution {
                            backend: fallback.backend.clone(),
                            tool: fallback.tool.clone(),
                            elapsed: queued_at.elapsed(),
                            source: BackendError::Other(anyhow::anyhow!("backend client panicked")),
                        };
                        ToolResult::failed(fallback, error, queued_at.elapsed())
                    }
                };

                // Cancel before the slot is handed to a queued call
                if abort_on_failure && !result.is_success() && !abort.is_cancelled() {
                    tracing::warn!(
                        index,
                        backend = %result.call.backend,
                        tool = %result.call.tool,
                        "Aborting batch after failure"
                    );
                    abort.cancel();
                }
                drop(permit);

                (index, result)
            });
        }

        let mut results: Vec<Option<ToolResult>> = (0..total).map(|_| None).collect();
        let mut completed = 0;

        while let Some(joined) = tasks.join_next().await {
            let (index, result) = match joined {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::error!("Batch task failed: {}", e);
                    continue;
                }
            };

            completed += 1;
            let success = result.is_success();

            if let Some(progress) = &options.progress {
                progress(BatchProgress {
                    completed,
                    total,
                    index,
                    success,
                });
            }

            results[index] = Some(result);
        }

        let results: Vec<ToolResult> = results
            .into_iter()
            .zip(calls)
            .map(|(result, call)| {
                result.unwrap_or_else(|| {
                    let error = OrchestratorError::cancelled(&call.backend, &call.tool);
                    ToolResult::failed(call, error, started.elapsed())
                })
            })
            .collect();

        let failed = results.iter().filter(|r| !r.is_success()).count();
        tracing::info!(
            calls = total,
            failed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch finished"
        );
        results
    }
}
