//! Off-path task dispatcher: a bounded queue feeding a fixed worker pool.
//!
//! Every remote-facing operation runs as a [`TaskUnit`] with two limits:
//!
//! - **soft**: the unit's own future is wrapped in `tokio::time::timeout`, so
//!   it is cancelled at its next await point and reports
//!   `RemoteTimeout(Soft)`.
//! - **hard**: the worker supervising the unit waits on its `JoinHandle`
//!   with a second timeout and aborts the task when it expires. This also
//!   catches units that block without ever yielding.
//!
//! Callers get control back as soon as a unit is queued. There is no retry;
//! polling work is repeated by the caller-driven reconciliation loop in
//! [`crate::fleet`]. Finished units publish a [`TaskReport`] on a broadcast
//! channel.

use crate::config::{DispatcherConfig, TimeoutConfig};
use crate::error::{AppResult, DaqError, TimeoutKind};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Kinds of work the dispatcher runs, each with its own limits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Device state transition
    Transition,
    /// Device state reconciliation
    RefreshState,
    /// Device controller liveness check
    CheckOnline,
    /// Router liveness and staging check
    CheckRouter,
    /// Config list refresh
    RefreshConfigs,
    /// Post-run data file organization
    OrganizeFiles,
    /// Post-run config backup
    BackupConfig,
}

impl TaskKind {
    /// Every kind.
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Transition,
        TaskKind::RefreshState,
        TaskKind::CheckOnline,
        TaskKind::CheckRouter,
        TaskKind::RefreshConfigs,
        TaskKind::OrganizeFiles,
        TaskKind::BackupConfig,
    ];

    /// Name matching the settings key.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::Transition => "transition",
            TaskKind::RefreshState => "refresh_state",
            TaskKind::CheckOnline => "check_online",
            TaskKind::CheckRouter => "check_router",
            TaskKind::RefreshConfigs => "refresh_configs",
            TaskKind::OrganizeFiles => "organize_files",
            TaskKind::BackupConfig => "backup_config",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

type UnitFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send + 'static>>;

/// One independent unit of work.
pub struct TaskUnit {
    kind: TaskKind,
    label: String,
    job: UnitFuture,
}

impl TaskUnit {
    /// Wrap a future as a unit of `kind`, labelled for logs and reports.
    pub fn new<F>(kind: TaskKind, label: impl Into<String>, job: F) -> Self
    where
        F: Future<Output = AppResult<()>> + Send + 'static,
    {
        Self {
            kind,
            label: label.into(),
            job: Box::pin(job),
        }
    }

    /// Kind of the unit
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// Label of the unit
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl fmt::Debug for TaskUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskUnit")
            .field("kind", &self.kind)
            .field("label", &self.label)
            .finish_non_exhaustive()
    }
}

/// How a unit ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskOutcome {
    /// The unit returned `Ok`.
    Completed,
    /// The unit returned an error or panicked.
    Failed(String),
    /// A time limit expired.
    TimedOut(TimeoutKind),
}

/// Published when a unit finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReport {
    /// Id returned by `submit`
    pub id: Uuid,
    /// Kind of the unit
    pub kind: TaskKind,
    /// Label of the unit
    pub label: String,
    /// Result
    pub outcome: TaskOutcome,
    /// When the worker finished with the unit
    pub finished_at: DateTime<Utc>,
}

struct Queued {
    id: Uuid,
    unit: TaskUnit,
}

struct Pending {
    count: AtomicUsize,
    idle: Notify,
}

impl Pending {
    fn finish(&self) {
        // Saturates: a worker racing a forced shutdown may finish after `reset`.
        let previous = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            self.idle.notify_waiters();
        }
    }

    /// Forget every queued or running unit after a forced shutdown.
    fn reset(&self) {
        self.count.store(0, Ordering::Release);
        self.idle.notify_waiters();
    }
}

/// Abort handles of the units currently running, by task id.
type InFlight = Arc<Mutex<HashMap<Uuid, AbortHandle>>>;

/// Bounded queue plus worker pool.
pub struct TaskDispatcher {
    queue: Mutex<Option<mpsc::Sender<Queued>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    in_flight: InFlight,
    reports: broadcast::Sender<TaskReport>,
    pending: Arc<Pending>,
}

impl TaskDispatcher {
    /// Start `config.workers` workers reading from a queue of
    /// `config.queue_capacity` units. Must be called inside a Tokio runtime.
    pub fn start(config: &DispatcherConfig, limits: TimeoutConfig) -> Self {
        let (tx, rx) = mpsc::channel::<Queued>(config.queue_capacity.max(1));
        let (reports, _) = broadcast::channel(1024);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let limits = Arc::new(limits);
        let pending = Arc::new(Pending {
            count: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

        let workers = (0..config.workers.max(1))
            .map(|index| {
                tokio::spawn(worker_loop(
                    index,
                    rx.clone(),
                    limits.clone(),
                    reports.clone(),
                    pending.clone(),
                    in_flight.clone(),
                ))
            })
            .collect();

        info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Task dispatcher started"
        );

        Self {
            queue: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            in_flight,
            reports,
            pending,
        }
    }

    /// Enqueue one unit; waits only for queue space.
    pub async fn submit(&self, unit: TaskUnit) -> AppResult<Uuid> {
        let tx = self
            .queue
            .lock()
            .clone()
            .ok_or(DaqError::DispatcherClosed)?;
        let id = Uuid::new_v4();
        debug!(%id, kind = %unit.kind, label = %unit.label, "Queued task");

        self.pending.count.fetch_add(1, Ordering::AcqRel);
        if tx.send(Queued { id, unit }).await.is_err() {
            self.pending.finish();
            return Err(DaqError::DispatcherClosed);
        }
        Ok(id)
    }

    /// Enqueue every unit and return once all are queued.
    pub async fn fan_out(&self, units: Vec<TaskUnit>) -> AppResult<Vec<Uuid>> {
        let mut ids = Vec::with_capacity(units.len());
        for unit in units {
            ids.push(self.submit(unit).await?);
        }
        Ok(ids)
    }

    /// Receive a report for every unit finishing from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskReport> {
        self.reports.subscribe()
    }

    /// Units queued or running.
    pub fn pending(&self) -> usize {
        self.pending.count.load(Ordering::Acquire)
    }

    /// Wait until no unit is queued or running; false if `limit` expired first.
    pub async fn wait_idle(&self, limit: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.pending.idle.notified();
                if self.pending() == 0 {
                    return;
                }
                notified.await;
            }
        };
        timeout(limit, wait).await.is_ok()
    }

    /// Close the queue and wait up to `grace` for workers to drain it.
    ///
    /// When the grace period expires the workers and every unit still running
    /// are aborted, and queued units are dropped without a report.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.queue.lock().take());
        let mut workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());

        let drained = timeout(grace, join_all(workers.iter_mut())).await;
        match drained {
            Ok(results) => {
                for e in results.into_iter().filter_map(Result::err) {
                    warn!("Dispatcher worker ended abnormally: {}", e);
                }
            }
            Err(_) => {
                for handle in &workers {
                    handle.abort();
                }
                let units: Vec<AbortHandle> =
                    self.in_flight.lock().drain().map(|(_, unit)| unit).collect();
                for unit in &units {
                    unit.abort();
                }
                self.pending.reset();
                warn!(
                    running_units = units.len(),
                    "Dispatcher workers did not stop within {:?}, aborted", grace
                );
            }
        }
        info!("Task dispatcher stopped");
    }
}

async fn worker_loop(
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Queued>>>,
    limits: Arc<TimeoutConfig>,
    reports: broadcast::Sender<TaskReport>,
    pending: Arc<Pending>,
    in_flight: InFlight,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(Queued { id, unit }) = next else {
            debug!(worker = index, "Queue closed, worker exiting");
            break;
        };

        let TaskUnit { kind, label, job } = unit;
        let task_limits = limits.limits(kind);
        let soft = task_limits.soft();
        let span = info_span!("task", %id, %kind, label = %label);

        let mut handle = tokio::spawn(
            async move {
                match timeout(soft, job).await {
                    Ok(result) => result,
                    Err(_) => Err(DaqError::RemoteTimeout(TimeoutKind::Soft)),
                }
            }
            .instrument(span),
        );
        in_flight.lock().insert(id, handle.abort_handle());

        let outcome = match timeout(task_limits.hard(), &mut handle).await {
            Ok(Ok(Ok(()))) => TaskOutcome::Completed,
            Ok(Ok(Err(DaqError::RemoteTimeout(limit)))) => TaskOutcome::TimedOut(limit),
            Ok(Ok(Err(e))) => TaskOutcome::Failed(e.to_string()),
            Ok(Err(e)) => TaskOutcome::Failed(format!("task panicked or was cancelled: {e}")),
            Err(_) => {
                handle.abort();
                TaskOutcome::TimedOut(TimeoutKind::Hard)
            }
        };
        in_flight.lock().remove(&id);

        match &outcome {
            TaskOutcome::Completed => debug!(%id, %kind, %label, "Task completed"),
            TaskOutcome::Failed(message) => warn!(%id, %kind, %label, error = %message, "Task failed"),
            TaskOutcome::TimedOut(TimeoutKind::Soft) => {
                warn!(%id, %kind, %label, limit = ?soft, "Task exceeded its soft time limit")
            }
            TaskOutcome::TimedOut(TimeoutKind::Hard) => error!(
                %id, %kind, %label,
                limit = ?task_limits.hard(),
                "Task exceeded its hard time limit and was aborted"
            ),
        }

        // No subscribers is fine.
        let _ = reports.send(TaskReport {
            id,
            kind,
            label,
            outcome,
            finished_at: Utc::now(),
        });
        pending.finish();
    }
}
