//! Background task executor for fire-and-forget side effects.
//!
//! Request handlers hand slow, failure-prone work (object uploads,
//! spreadsheet appends) to a [`TaskExecutor`] and get a task id back
//! immediately. Bodies run on the Tokio runtime, at most `max_workers` at a
//! time, and their outcome is only observable through
//! [`TaskExecutor::status`] and [`TaskExecutor::stats`]: a failing body
//! never reaches the submitter.
//!
//! # Lifecycle
//!
//! ```text
//! submit ──▶ pending ──(worker permit)──▶ running ──▶ completed
//!                                                 └──▶ failed
//! ```
//!
//! Terminal records move into a bounded history. When the history exceeds
//! its limit the records created earliest are evicted first.
//!
//! Tasks cannot be cancelled and have no timeout; a stuck body holds its
//! worker permit until it returns.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info};

use crate::config::TasksConfig;

/// What a task body returns on success.
pub type TaskOutput = Result<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Lifecycle record of one submitted task.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub name: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub result: Option<Value>,
    pub error: Option<String>,
    /// Full error chain (or panic payload) of a failed body.
    pub traceback: Option<String>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorStatus {
    Active,
    Shutdown,
}

/// Aggregate counters across history and in-flight tasks.
#[derive(Debug, Clone, Serialize)]
pub struct TaskStats {
    /// Terminal tasks still in history.
    pub total_tasks: usize,
    pub pending_tasks: usize,
    pub running_tasks: usize,
    /// Tasks submitted but not yet terminal.
    pub active_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    /// Percentage of history that completed; `None` with an empty history.
    pub success_rate: Option<f64>,
    pub average_duration_ms: u64,
    pub max_workers: usize,
    pub executor_status: ExecutorStatus,
}

struct Pool {
    handle: Handle,
    permits: Arc<Semaphore>,
    max_workers: usize,
}

#[derive(Default)]
struct Inner {
    pool: Option<Pool>,
    shut_down: bool,
    /// Records of tasks that are pending or running.
    live: HashMap<String, TaskRecord>,
    handles: HashMap<String, JoinHandle<()>>,
    history: HashMap<String, TaskRecord>,
    /// History ids keyed by creation order, oldest first.
    history_order: BTreeMap<(DateTime<Utc>, u64), String>,
}

impl Inner {
    fn record_terminal(&mut self, record: TaskRecord, history_limit: usize) {
        self.history_order
            .insert((record.created_at, record.seq), record.task_id.clone());
        self.history.insert(record.task_id.clone(), record);

        while self.history.len() > history_limit {
            let Some((_, evicted)) = self.history_order.pop_first() else {
                break;
            };
            self.history.remove(&evicted);
            debug!(task_id = %evicted, "evicted task from history");
        }
    }
}

/// Bounded worker pool running submitted task bodies.
///
/// One instance per process, shared behind an `Arc`.
pub struct TaskExecutor {
    inner: Arc<Mutex<Inner>>,
    default_workers: usize,
    history_limit: usize,
    next_seq: AtomicU64,
}

impl TaskExecutor {
    /// Create an executor that is not yet running. `default_workers` is used
    /// when [`submit`](Self::submit) runs before [`initialize`](Self::initialize).
    pub fn new(default_workers: usize, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            default_workers,
            history_limit: history_limit.max(1),
            next_seq: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &TasksConfig) -> Self {
        Self::new(config.max_workers, config.history_limit)
    }

    /// Start the worker pool on the current Tokio runtime.
    ///
    /// Idempotent: while a pool exists, later calls are no-ops and the first
    /// worker count sticks. Fails when `max_workers` is zero or when called
    /// outside a Tokio runtime.
    ///
    /// No exit hook is installed here. `server::serve` drains the executor
    /// with `shutdown(true)` on Ctrl-C or SIGTERM; any other owner must call
    /// `shutdown(true)` itself before exiting or in-flight tasks are dropped.
    pub fn initialize(&self, max_workers: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::initialize_locked(&mut inner, max_workers)
    }

    fn initialize_locked(inner: &mut Inner, max_workers: usize) -> Result<()> {
        if inner.pool.is_some() {
            return Ok(());
        }
        if max_workers == 0 {
            bail!("task executor needs at least one worker");
        }
        let handle =
            Handle::try_current().context("task executor must be started inside a Tokio runtime")?;

        inner.pool = Some(Pool {
            handle,
            permits: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        });
        inner.shut_down = false;
        info!(max_workers, "task executor started");
        Ok(())
    }

    /// Schedule `body` and return its task id without waiting for it.
    ///
    /// Starts the pool with the default worker count if needed. Fails only
    /// when the executor has been shut down (or cannot start).
    pub fn submit<F, Fut>(&self, name: &str, body: F) -> Result<String>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = TaskOutput> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        if inner.shut_down {
            bail!("task executor is shut down; rejected task '{}'", name);
        }
        Self::initialize_locked(&mut inner, self.default_workers)?;

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let created_at = Utc::now();
        let task_id = format!(
            "{}_{}_{:04}",
            name,
            created_at.format("%Y%m%d_%H%M%S_%6f"),
            seq
        );

        inner.live.insert(
            task_id.clone(),
            TaskRecord {
                task_id: task_id.clone(),
                name: name.to_string(),
                status: TaskStatus::Pending,
                created_at,
                started_at: None,
                completed_at: None,
                duration_ms: None,
                result: None,
                error: None,
                traceback: None,
                seq,
            },
        );

        let (handle, permits) = match inner.pool.as_ref() {
            Some(pool) => (pool.handle.clone(), pool.permits.clone()),
            None => bail!("task executor is not running"),
        };

        // The lock is held across spawn so the handle is registered before
        // the task can finish and deregister itself.
        let join = handle.spawn(run_task(
            self.inner.clone(),
            permits,
            task_id.clone(),
            self.history_limit,
            body,
        ));
        inner.handles.insert(task_id.clone(), join);

        debug!(%task_id, "task submitted");
        Ok(task_id)
    }

    /// Current record for `task_id`: the live record while the task is in
    /// flight, the history record once it is terminal, `None` if the id is
    /// unknown or has been evicted.
    pub fn status(&self, task_id: &str) -> Option<TaskRecord> {
        let inner = self.inner.lock();
        inner
            .live
            .get(task_id)
            .or_else(|| inner.history.get(task_id))
            .cloned()
    }

    pub fn stats(&self) -> TaskStats {
        let inner = self.inner.lock();

        let pending = inner
            .live
            .values()
            .filter(|r| r.status == TaskStatus::Pending)
            .count();
        let running = inner
            .live
            .values()
            .filter(|r| r.status == TaskStatus::Running)
            .count();

        let total = inner.history.len();
        let completed = inner
            .history
            .values()
            .filter(|r| r.status == TaskStatus::Completed)
            .count();
        let failed = total - completed;

        let duration_sum: u64 = inner
            .history
            .values()
            .filter_map(|r| r.duration_ms)
            .sum();
        let average_duration_ms = if total > 0 {
            duration_sum / total as u64
        } else {
            0
        };

        let (max_workers, executor_status) = match (&inner.pool, inner.shut_down) {
            (Some(pool), false) => (pool.max_workers, ExecutorStatus::Active),
            _ => (self.default_workers, ExecutorStatus::Shutdown),
        };

        TaskStats {
            total_tasks: total,
            pending_tasks: pending,
            running_tasks: running,
            active_tasks: inner.live.len(),
            completed_tasks: completed,
            failed_tasks: failed,
            success_rate: (total > 0).then(|| completed as f64 / total as f64 * 100.0),
            average_duration_ms,
            max_workers,
            executor_status,
        }
    }

    /// Stop accepting work. With `wait`, resolve only after every task that
    /// was already submitted has finished.
    pub async fn shutdown(&self, wait: bool) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.pool = None;
            inner.handles.drain().collect()
        };

        info!(in_flight = handles.len(), wait, "task executor shutting down");
        if !wait {
            return;
        }
        for (task_id, handle) in handles {
            if let Err(e) = handle.await {
                error!(%task_id, error = %e, "task runner aborted during shutdown");
            }
        }
    }
}

/// Worker side of one task: wait for a permit, run the body in its own
/// Tokio task so panics are contained, then file the terminal record.
async fn run_task<F, Fut>(
    inner: Arc<Mutex<Inner>>,
    permits: Arc<Semaphore>,
    task_id: String,
    history_limit: usize,
    body: F,
) where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = TaskOutput> + Send + 'static,
{
    // The semaphore is never closed, so acquisition only fails if that changes.
    let _permit = permits.acquire_owned().await.ok();

    let started_at = Utc::now();
    let clock = Instant::now();
    if let Some(record) = inner.lock().live.get_mut(&task_id) {
        record.status = TaskStatus::Running;
        record.started_at = Some(started_at);
    }
    debug!(%task_id, "task running");

    let outcome = tokio::spawn(body()).await;
    let duration_ms = clock.elapsed().as_millis() as u64;

    let mut inner = inner.lock();
    inner.handles.remove(&task_id);
    let Some(mut record) = inner.live.remove(&task_id) else {
        return;
    };

    record.completed_at = Some(Utc::now());
    record.duration_ms = Some(duration_ms);
    match outcome {
        Ok(Ok(value)) => {
            record.status = TaskStatus::Completed;
            record.result = Some(value);
            info!(%task_id, duration_ms, "task completed");
        }
        Ok(Err(e)) => {
            record.status = TaskStatus::Failed;
            record.error = Some(e.to_string());
            record.traceback = Some(format!("{:?}", e));
            error!(%task_id, duration_ms, error = %e, "task failed");
        }
        Err(join_err) => {
            let message = panic_message(join_err);
            record.status = TaskStatus::Failed;
            record.traceback = Some(format!("task body panicked: {}", message));
            record.error = Some(message);
            error!(%task_id, duration_ms, "task panicked");
        }
    }

    inner.record_terminal(record, history_limit);
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task body panicked".to_string()
    }
}
