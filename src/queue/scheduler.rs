use super::events::{EventDispatcher, SubscriptionId};
use super::task::{TaskKind, TaskOptions, TaskRecord, TaskStatus};
use crate::config::QueueConfig;
use crate::encoder::command_builder::{CommandPlanner, FfmpegPlanner};
use crate::encoder::parser::ParsedEvent;
use crate::encoder::runner::{self, ExitOutcome, RunnerEvent, RunnerHandle, RunnerUpdate};
use crate::error::{QueueError, QueueResult};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-status task counts for a quick queue overview
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub queued: usize,
    pub running: usize,
    pub paused: usize,
    pub cancelling: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, TaskRecord>,
    pending: VecDeque<Uuid>,
    runners: HashMap<Uuid, RunnerHandle>,
    shutting_down: bool,
}

struct QueueInner {
    config: QueueConfig,
    planner: Arc<dyn CommandPlanner>,
    state: Mutex<State>,
    dispatcher: EventDispatcher,
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
}

/// The scheduler: owns every task record, bounds concurrency, and routes
/// control commands to the right subprocess.
///
/// All record mutation and admission happens under one internal lock;
/// subprocess readers report back over a channel drained by a background
/// loop, so they never touch records directly. Handles are cheap clones of
/// the same queue. Construction and every command require a running tokio
/// runtime; call [`TaskQueue::shutdown`] for an orderly teardown.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        let planner = Arc::new(FfmpegPlanner::new(config.ffmpeg_path.clone()));
        Self::with_planner(config, planner)
    }

    /// Build a queue with a custom command planner. Tests use this to run
    /// small scripts instead of a real encoder.
    pub fn with_planner(config: QueueConfig, planner: Arc<dyn CommandPlanner>) -> Self {
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(QueueInner {
            config,
            planner,
            state: Mutex::new(State::default()),
            dispatcher: EventDispatcher::new(),
            runner_tx,
        });
        tokio::spawn(scheduler_loop(Arc::downgrade(&inner), runner_rx));
        Self { inner }
    }

    /// Queue a conversion. Validates options, returns the new task id
    /// without waiting for the encode to start or finish.
    pub fn add_convert(&self, options: TaskOptions) -> QueueResult<Uuid> {
        self.add_task(TaskKind::Convert, options)
    }

    /// Queue a compression. Same contract as [`TaskQueue::add_convert`].
    pub fn add_compress(&self, options: TaskOptions) -> QueueResult<Uuid> {
        self.add_task(TaskKind::Compress, options)
    }

    fn add_task(&self, kind: TaskKind, mut options: TaskOptions) -> QueueResult<Uuid> {
        options.validate()?;
        let record = TaskRecord::new(kind, options);
        let id = record.id;
        {
            let mut guard = self.inner.state.lock().unwrap();
            if guard.shutting_down {
                return Err(QueueError::ShuttingDown);
            }
            info!(task = %id, ?kind, file = %record.filename(), "task queued");
            self.inner.dispatcher.emit(&record);
            guard.tasks.insert(id, record);
            guard.pending.push_back(id);
        }
        admit_pending(&self.inner);
        Ok(id)
    }

    /// Cancel a task. Queued tasks are removed without ever spawning a
    /// process; live ones go through Cancelling while termination is in
    /// flight. Calling this on an already-terminal task succeeds and
    /// changes nothing.
    pub fn cancel(&self, id: Uuid) -> QueueResult<()> {
        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let record = st.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        match record.status {
            TaskStatus::Queued => {
                st.pending.retain(|p| *p != id);
                record.mark_cancelled(None);
                info!(task = %id, "cancelled before start");
                self.inner.dispatcher.emit(record);
            }
            TaskStatus::Running | TaskStatus::Paused => {
                record.mark_cancelling();
                info!(task = %id, "cancelling");
                self.inner.dispatcher.emit(record);
                if let Some(handle) = st.runners.get(&id) {
                    handle.request_cancel();
                }
            }
            // already on its way out, or already settled
            TaskStatus::Cancelling
            | TaskStatus::Completed
            | TaskStatus::Failed
            | TaskStatus::Cancelled => {}
        }
        Ok(())
    }

    /// Suspend a running task's subprocess
    pub fn pause(&self, id: Uuid) -> QueueResult<()> {
        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let record = st.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if record.status != TaskStatus::Running {
            return Err(QueueError::InvalidState {
                id,
                status: record.status,
                command: "pause",
            });
        }
        let handle = st
            .runners
            .get(&id)
            .ok_or_else(|| QueueError::Signal("no live process for task".into()))?;
        handle.pause()?;
        record.mark_paused();
        info!(task = %id, "paused");
        self.inner.dispatcher.emit(record);
        Ok(())
    }

    /// Resume a paused task's subprocess
    pub fn resume(&self, id: Uuid) -> QueueResult<()> {
        let mut guard = self.inner.state.lock().unwrap();
        let st = &mut *guard;
        let record = st.tasks.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        if record.status != TaskStatus::Paused {
            return Err(QueueError::InvalidState {
                id,
                status: record.status,
                command: "resume",
            });
        }
        let handle = st
            .runners
            .get(&id)
            .ok_or_else(|| QueueError::Signal("no live process for task".into()))?;
        handle.resume()?;
        record.mark_resumed();
        info!(task = %id, "resumed");
        self.inner.dispatcher.emit(record);
        Ok(())
    }

    /// Snapshot of one task
    pub fn get(&self, id: Uuid) -> QueueResult<TaskRecord> {
        self.inner
            .state
            .lock()
            .unwrap()
            .tasks
            .get(&id)
            .cloned()
            .ok_or(QueueError::NotFound(id))
    }

    /// Consistent point-in-time snapshot of every task, in insertion order
    pub fn get_all(&self) -> Vec<TaskRecord> {
        let guard = self.inner.state.lock().unwrap();
        let mut tasks: Vec<TaskRecord> = guard.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    /// Per-status counts
    pub fn summary(&self) -> QueueSummary {
        let guard = self.inner.state.lock().unwrap();
        let mut summary = QueueSummary::default();
        for task in guard.tasks.values() {
            match task.status {
                TaskStatus::Queued => summary.queued += 1,
                TaskStatus::Running => summary.running += 1,
                TaskStatus::Paused => summary.paused += 1,
                TaskStatus::Cancelling => summary.cancelling += 1,
                TaskStatus::Completed => summary.completed += 1,
                TaskStatus::Failed => summary.failed += 1,
                TaskStatus::Cancelled => summary.cancelled += 1,
            }
        }
        summary
    }

    /// True once every known task is in a terminal state
    pub fn all_settled(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .tasks
            .values()
            .all(|t| t.status.is_terminal())
    }

    /// Evict terminal records; returns how many were removed
    pub fn clear_finished(&self) -> usize {
        let mut guard = self.inner.state.lock().unwrap();
        let before = guard.tasks.len();
        guard.tasks.retain(|_, t| !t.status.is_terminal());
        before - guard.tasks.len()
    }

    /// Register an observer. Every state or progress change delivers a
    /// fresh task snapshot to the returned receiver.
    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TaskRecord>) {
        self.inner.dispatcher.subscribe()
    }

    /// Remove an observer; safe to call more than once
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.inner.dispatcher.unsubscribe(id);
    }

    /// Stop accepting work, cancel everything live, and wait (bounded by
    /// the grace period) for the subprocesses to go away.
    pub async fn shutdown(&self) {
        {
            let mut guard = self.inner.state.lock().unwrap();
            let st = &mut *guard;
            if !st.shutting_down {
                st.shutting_down = true;
                info!("queue shutting down");
                for id in st.pending.drain(..) {
                    if let Some(record) = st.tasks.get_mut(&id)
                        && record.status == TaskStatus::Queued
                    {
                        record.mark_cancelled(None);
                        self.inner.dispatcher.emit(record);
                    }
                }
                for (id, handle) in st.runners.iter() {
                    if let Some(record) = st.tasks.get_mut(id)
                        && matches!(record.status, TaskStatus::Running | TaskStatus::Paused)
                    {
                        record.mark_cancelling();
                        self.inner.dispatcher.emit(record);
                        handle.request_cancel();
                    }
                }
            }
        }

        let deadline =
            tokio::time::Instant::now() + self.inner.config.grace_period() + Duration::from_secs(2);
        loop {
            if self.inner.state.lock().unwrap().runners.is_empty() {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("shutdown timed out waiting for encoder processes");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.dispatcher.close();
    }
}

/// Drains runner events for the queue's lifetime. Holds only a weak
/// reference so dropping the last handle lets everything unwind.
async fn scheduler_loop(weak: Weak<QueueInner>, mut rx: mpsc::UnboundedReceiver<RunnerEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match event.update {
            RunnerUpdate::Parsed(parsed) => handle_parsed(&inner, event.id, parsed),
            RunnerUpdate::Exited(outcome) => {
                handle_exit(&inner, event.id, outcome);
                admit_pending(&inner);
            }
        }
    }
}

fn handle_parsed(inner: &Arc<QueueInner>, id: Uuid, event: ParsedEvent) {
    let mut guard = inner.state.lock().unwrap();
    let Some(record) = guard.tasks.get_mut(&id) else {
        return;
    };
    // lines can trail in after a task was finalized; they no longer matter
    if !record.status.has_process() {
        return;
    }
    match event {
        ParsedEvent::Progress(update) => {
            record.apply_progress(&update);
            inner.dispatcher.emit(record);
        }
        ParsedEvent::Error { message } => {
            debug!(task = %id, %message, "error line from encoder");
            record.note_error_line(message);
        }
        ParsedEvent::DurationDiscovered { total_seconds } => {
            debug!(task = %id, total_seconds, "stream duration discovered");
        }
        ParsedEvent::VersionInfo { .. } => {}
    }
}

fn handle_exit(inner: &Arc<QueueInner>, id: Uuid, outcome: ExitOutcome) {
    let mut guard = inner.state.lock().unwrap();
    let st = &mut *guard;
    st.runners.remove(&id);
    let Some(record) = st.tasks.get_mut(&id) else {
        return;
    };
    match record.status {
        TaskStatus::Cancelling => {
            record.mark_cancelled(outcome.code);
            info!(task = %id, "cancelled");
        }
        TaskStatus::Running | TaskStatus::Paused => {
            if outcome.success() {
                record.mark_completed(outcome.code);
                info!(task = %id, file = %record.filename(), "completed");
            } else {
                let message = record
                    .last_error_line
                    .clone()
                    .unwrap_or_else(|| outcome.describe());
                warn!(task = %id, %message, "failed");
                record.mark_failed(message, outcome.code);
            }
        }
        status => {
            warn!(task = %id, %status, "exit event for task in unexpected state");
            return;
        }
    }
    inner.dispatcher.emit(record);
}

/// Admit queued tasks while execution slots are free. FIFO over insertion
/// order; a task that fails to spawn is finalized on the spot and the next
/// candidate is tried, so a bad binary cannot wedge the queue.
fn admit_pending(inner: &Arc<QueueInner>) {
    let mut guard = inner.state.lock().unwrap();
    let st = &mut *guard;
    if st.shutting_down {
        return;
    }
    while st.runners.len() < inner.config.max_concurrent {
        let Some(id) = st.pending.pop_front() else {
            break;
        };
        let Some(record) = st.tasks.get_mut(&id) else {
            continue;
        };
        if record.status != TaskStatus::Queued {
            continue;
        }
        let plan = inner.planner.plan(record);
        match runner::spawn(&plan, id, inner.runner_tx.clone(), inner.config.grace_period()) {
            Ok(handle) => {
                st.runners.insert(id, handle);
                record.mark_started();
                info!(task = %id, file = %record.filename(), "admitted");
                inner.dispatcher.emit(record);
            }
            Err(e) => {
                let message = format!("{} ({})", QueueError::Spawn(e), plan.program);
                warn!(task = %id, %message, "spawn failure");
                record.mark_failed(message, None);
                inner.dispatcher.emit(record);
            }
        }
    }
}
