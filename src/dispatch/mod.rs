//! Concurrent fan-out of implement chunks.
//!
//! Chunks run through a worker pool bounded by `min(max_workers, chunks)`.
//! A chunk starts only after the chunks it depends on have succeeded; chunks
//! behind a failure are skipped. Any failed or skipped chunk fails the whole
//! dispatch: partial success of the implement stage is not stage success.

mod graph;

pub use graph::{ChunkGraph, ChunkState};

use anyhow::Result;
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Semaphore, mpsc};
use tracing::{debug, info, warn};

use crate::pipeline::PipelineEvent;
use crate::report::StageExit;
use crate::splitter::DispatchEntry;

/// Runs one dispatched chunk to completion.
#[async_trait]
pub trait ChunkRunner: Send + Sync {
    async fn run_chunk(&self, entry: &DispatchEntry) -> Result<StageExit>;
}

/// Result of one chunk as reported back to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkOutcome {
    pub chunk_id: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Aggregate outcome of a dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<ChunkOutcome>,
    pub skipped: Vec<String>,
}

impl DispatchSummary {
    /// Chunks that did not succeed, counting skipped ones.
    pub fn failure_count(&self) -> usize {
        self.failed.len() + self.skipped.len()
    }

    pub fn exit(&self) -> StageExit {
        if self.failure_count() == 0 {
            StageExit::Success
        } else {
            StageExit::Fatal
        }
    }
}

/// Bounded, dependency-aware chunk dispatcher.
pub struct Dispatcher {
    max_workers: usize,
    event_tx: Option<mpsc::Sender<PipelineEvent>>,
}

impl Dispatcher {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            event_tx: None,
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Worker pool size for `chunk_count` chunks.
    pub fn pool_size(&self, chunk_count: usize) -> usize {
        self.max_workers.max(1).min(chunk_count)
    }

    pub async fn dispatch(
        &self,
        entries: &[DispatchEntry],
        runner: Arc<dyn ChunkRunner>,
    ) -> Result<DispatchSummary> {
        let mut summary = DispatchSummary {
            total: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(summary);
        }

        let pool = self.pool_size(entries.len());
        info!(chunks = entries.len(), workers = pool, "Dispatching chunks");

        let by_id: HashMap<&str, &DispatchEntry> =
            entries.iter().map(|e| (e.subtask_id.as_str(), e)).collect();
        let mut graph = ChunkGraph::new(entries);
        let semaphore = Arc::new(Semaphore::new(pool));
        let (result_tx, mut result_rx) = mpsc::channel::<ChunkOutcome>(entries.len());
        let mut active = 0usize;

        loop {
            for chunk_id in graph.ready() {
                let Some(entry) = by_id.get(chunk_id.as_str()) else {
                    continue;
                };
                graph.mark_running(&chunk_id);
                let permit = semaphore.clone().acquire_owned().await?;
                self.emit(PipelineEvent::ChunkStarted {
                    chunk_id: chunk_id.clone(),
                    role: entry.role,
                })
                .await;

                let entry = (*entry).clone();
                let runner = Arc::clone(&runner);
                let result_tx = result_tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = AssertUnwindSafe(runner.run_chunk(&entry))
                        .catch_unwind()
                        .await;
                    let (exit_code, error) = match result {
                        Ok(Ok(exit)) => (exit.code(), None),
                        Ok(Err(e)) => (StageExit::Fatal.code(), Some(format!("{:#}", e))),
                        Err(_) => (StageExit::Fatal.code(), Some("chunk runner panicked".to_string())),
                    };
                    result_tx
                        .send(ChunkOutcome {
                            chunk_id: entry.subtask_id.clone(),
                            exit_code,
                            error,
                        })
                        .await
                        .ok();
                });
                active += 1;
            }

            if active == 0 {
                if !graph.all_terminal() {
                    for chunk_id in graph.skip_unreachable() {
                        warn!(chunk_id = %chunk_id, "Chunk dependencies can never be satisfied");
                        self.emit(PipelineEvent::ChunkSkipped {
                            chunk_id: chunk_id.clone(),
                            reason: graph.skip_reason(&chunk_id).unwrap_or("skipped").to_string(),
                        })
                        .await;
                        summary.skipped.push(chunk_id);
                    }
                }
                break;
            }

            let Some(outcome) = result_rx.recv().await else {
                break;
            };
            active -= 1;
            debug!(chunk_id = %outcome.chunk_id, exit_code = outcome.exit_code, "Chunk finished");
            self.emit(PipelineEvent::ChunkFinished {
                chunk_id: outcome.chunk_id.clone(),
                exit_code: outcome.exit_code,
            })
            .await;

            if outcome.exit_code == 0 {
                graph.mark_succeeded(&outcome.chunk_id);
                summary.succeeded.push(outcome.chunk_id);
            } else {
                if let Some(error) = &outcome.error {
                    warn!(chunk_id = %outcome.chunk_id, error = %error, "Chunk errored");
                }
                for skipped in graph.mark_failed(&outcome.chunk_id) {
                    self.emit(PipelineEvent::ChunkSkipped {
                        chunk_id: skipped.clone(),
                        reason: graph.skip_reason(&skipped).unwrap_or("skipped").to_string(),
                    })
                    .await;
                    summary.skipped.push(skipped);
                }
                summary.failed.push(outcome);
            }
        }

        if summary.failure_count() > 0 {
            warn!(
                failed = summary.failed.len(),
                skipped = summary.skipped.len(),
                "Implementation job(s) failed"
            );
        }
        Ok(summary)
    }

    async fn emit(&self, event: PipelineEvent) {
        if let Some(ref tx) = self.event_tx {
            tx.send(event).await.ok();
        }
    }
}
