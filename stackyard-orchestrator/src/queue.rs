//! Explicit task queue between the fast path and the lifecycle runner.
//!
//! The fast path pushes [`LifecycleTask`]s without waiting; [`TaskRunner`]
//! pulls them and runs up to `max_in_flight` concurrently. Tests call
//! [`TaskRunner::drain`] instead of running the loop.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Semaphore};

use stackyard_core::UnitId;

use crate::error::RequestError;
use crate::lifecycle::{Operation, Orchestrator, TaskReport};

const RECENT_REPORTS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "task", rename_all = "snake_case")]
pub enum LifecycleTask {
    CreateStack { stack_id: UnitId },
    CreateAgent { agent_id: UnitId, upload: PathBuf },
    DeleteStack { stack_id: UnitId },
    DeleteAgent { agent_id: UnitId },
}

impl LifecycleTask {
    pub fn unit_id(&self) -> UnitId {
        match self {
            LifecycleTask::CreateStack { stack_id } | LifecycleTask::DeleteStack { stack_id } => {
                *stack_id
            }
            LifecycleTask::CreateAgent { agent_id, .. } | LifecycleTask::DeleteAgent { agent_id } => {
                *agent_id
            }
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            LifecycleTask::CreateStack { .. } => Operation::CreateStack,
            LifecycleTask::CreateAgent { .. } => Operation::CreateAgent,
            LifecycleTask::DeleteStack { .. } => Operation::DeleteStack,
            LifecycleTask::DeleteAgent { .. } => Operation::DeleteAgent,
        }
    }
}

impl Orchestrator {
    pub async fn execute(&self, task: LifecycleTask) -> TaskReport {
        match task {
            LifecycleTask::CreateStack { stack_id } => self.create_stack(stack_id).await,
            LifecycleTask::CreateAgent { agent_id, upload } => {
                self.create_agent(agent_id, upload).await
            }
            LifecycleTask::DeleteStack { stack_id } => self.delete_stack(stack_id).await,
            LifecycleTask::DeleteAgent { agent_id } => self.delete_agent(agent_id).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Sending half, cloned into every request handler.
#[derive(Debug, Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<LifecycleTask>,
}

impl TaskQueue {
    /// New queue and the receiving half for a [`TaskRunner`].
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LifecycleTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting for room.
    pub fn dispatch(&self, task: LifecycleTask) -> Result<(), RequestError> {
        let unit_id = task.unit_id();
        let operation = task.operation();
        self.tx.try_send(task).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => RequestError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => RequestError::QueueClosed,
        })?;
        tracing::debug!(%unit_id, %operation, "lifecycle task dispatched");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Counters and recent reports exposed through daemon status.
#[derive(Debug, Default)]
pub struct RunnerStats {
    started: AtomicU64,
    finished: AtomicU64,
    failed: AtomicU64,
    recent: Mutex<VecDeque<TaskReport>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunnerSnapshot {
    pub started: u64,
    pub finished: u64,
    pub failed: u64,
    pub in_flight: u64,
    pub recent: Vec<TaskReport>,
}

impl RunnerStats {
    fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    fn record(&self, report: &TaskReport) {
        self.finished.fetch_add(1, Ordering::Relaxed);
        if report.failure.is_some() {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        let mut recent = self.recent.lock();
        if recent.len() == RECENT_REPORTS {
            recent.pop_front();
        }
        recent.push_back(report.clone());
    }

    pub fn snapshot(&self) -> RunnerSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let finished = self.finished.load(Ordering::Relaxed);
        RunnerSnapshot {
            started,
            finished,
            failed: self.failed.load(Ordering::Relaxed),
            in_flight: started.saturating_sub(finished),
            recent: self.recent.lock().iter().cloned().collect(),
        }
    }
}

pub struct TaskRunner {
    rx: mpsc::Receiver<LifecycleTask>,
    orchestrator: Arc<Orchestrator>,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    stats: Arc<RunnerStats>,
}

impl TaskRunner {
    pub fn new(
        rx: mpsc::Receiver<LifecycleTask>,
        orchestrator: Arc<Orchestrator>,
        max_in_flight: usize,
    ) -> Self {
        let max_in_flight = max_in_flight.max(1);
        Self {
            rx,
            orchestrator,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            stats: Arc::new(RunnerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RunnerStats> {
        self.stats.clone()
    }

    /// Run queued tasks until shutdown or until every sender is gone, then
    /// wait for in-flight tasks to finish.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let permit = tokio::select! {
                _ = shutdown.recv() => break,
                permit = self.in_flight.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = shutdown.recv() => break,
                task = self.rx.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let orchestrator = self.orchestrator.clone();
            let stats = self.stats.clone();
            stats.record_start();
            tokio::spawn(async move {
                let report = orchestrator.execute(task).await;
                stats.record(&report);
                drop(permit);
            });
        }

        let pending = u32::try_from(self.max_in_flight).unwrap_or(u32::MAX);
        if self.in_flight.acquire_many(pending).await.is_ok() {
            tracing::info!("lifecycle runner drained");
        }
    }

    /// Run every task already queued, one after another, and return their
    /// reports in queue order. Tasks dispatched while draining are included.
    pub async fn drain(&mut self) -> Vec<TaskReport> {
        let mut reports = Vec::new();
        while let Ok(task) = self.rx.try_recv() {
            self.stats.record_start();
            let report = self.orchestrator.execute(task).await;
            self.stats.record(&report);
            reports.push(report);
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_is_reported() {
        let (queue, _rx) = TaskQueue::channel(1);
        let stack_id = UnitId::new();
        queue
            .dispatch(LifecycleTask::CreateStack { stack_id })
            .expect("first fits");
        let err = queue
            .dispatch(LifecycleTask::DeleteStack { stack_id })
            .unwrap_err();
        assert!(matches!(err, RequestError::QueueFull), "got: {err}");
    }

    #[test]
    fn closed_queue_is_reported() {
        let (queue, rx) = TaskQueue::channel(4);
        drop(rx);
        let err = queue
            .dispatch(LifecycleTask::DeleteAgent { agent_id: UnitId::new() })
            .unwrap_err();
        assert!(matches!(err, RequestError::QueueClosed), "got: {err}");
    }

    #[test]
    fn task_accessors() {
        let agent_id = UnitId::new();
        let task = LifecycleTask::CreateAgent {
            agent_id,
            upload: PathBuf::from("/tmp/upload.zip"),
        };
        assert_eq!(task.unit_id(), agent_id);
        assert_eq!(task.operation(), Operation::CreateAgent);
    }
}
