//! End-to-end scheduler tests.
//!
//! Real subprocesses are spawned, but through a planner that runs small
//! shell scripts instead of an encoder, so the suite needs `sh` and nothing
//! else.

#![cfg(unix)]

use ffqueue::{
    CommandPlan, CommandPlanner, QueueConfig, QueueError, TaskOptions, TaskQueue, TaskRecord,
    TaskStatus,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct ScriptPlanner {
    script: String,
}

impl ScriptPlanner {
    fn new(script: &str) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_string(),
        })
    }
}

impl CommandPlanner for ScriptPlanner {
    fn plan(&self, _task: &TaskRecord) -> CommandPlan {
        CommandPlan {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), self.script.clone()],
        }
    }
}

/// Planner whose program does not exist, to exercise spawn failures
struct BrokenPlanner;

impl CommandPlanner for BrokenPlanner {
    fn plan(&self, _task: &TaskRecord) -> CommandPlan {
        CommandPlan {
            program: "/nonexistent/ffqueue-test-encoder".to_string(),
            args: vec![],
        }
    }
}

fn test_config(max_concurrent: usize) -> QueueConfig {
    let mut config = QueueConfig::default();
    config.max_concurrent = max_concurrent;
    config.grace_period_secs = 1;
    config
}

fn script_queue(max_concurrent: usize, script: &str) -> TaskQueue {
    TaskQueue::with_planner(test_config(max_concurrent), ScriptPlanner::new(script))
}

fn options(dir: &Path, n: usize) -> TaskOptions {
    TaskOptions::new(dir.join(format!("in_{n}.mkv")), dir.join(format!("out_{n}.mkv")))
}

async fn wait_for<F>(queue: &TaskQueue, id: Uuid, what: &str, pred: F) -> TaskRecord
where
    F: Fn(&TaskRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let task = queue.get(id).expect("task should exist");
        if pred(&task) {
            return task;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}; task is {} ({:?})",
            task.status,
            task.error
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn wait_terminal(queue: &TaskQueue, id: Uuid) -> TaskRecord {
    wait_for(queue, id, "terminal state", |t| t.status.is_terminal()).await
}

#[tokio::test]
async fn add_returns_id_and_snapshot_synchronously() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 5");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let snapshot = queue.get(a).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Running);
    assert!(snapshot.progress.is_none());
    assert!(snapshot.started_at.is_some());

    let b = queue.add_convert(options(dir.path(), 1)).unwrap();
    let snapshot = queue.get(b).unwrap();
    assert_eq!(snapshot.status, TaskStatus::Queued);
    assert!(snapshot.started_at.is_none());
    assert!(snapshot.progress.is_none());

    queue.shutdown().await;
}

#[tokio::test]
async fn concurrency_limit_is_never_exceeded() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(2, "sleep 0.3");

    let ids: Vec<Uuid> = (0..5)
        .map(|n| queue.add_convert(options(dir.path(), n)).unwrap())
        .collect();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let tasks = queue.get_all();
        let running = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Running)
            .count();
        assert!(running <= 2, "{running} tasks running at once");
        if tasks.iter().all(|t| t.status.is_terminal()) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue never drained"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // everything completed, admitted in insertion order
    let tasks = queue.get_all();
    for id in &ids {
        let task = tasks.iter().find(|t| t.id == *id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
    }
    for pair in tasks.windows(2) {
        assert!(pair[0].started_at.unwrap() <= pair[1].started_at.unwrap());
    }
}

#[tokio::test]
async fn cancelling_running_task_admits_next() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 30");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let b = queue.add_convert(options(dir.path(), 1)).unwrap();
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Running);
    assert_eq!(queue.get(b).unwrap().status, TaskStatus::Queued);

    queue.cancel(a).unwrap();
    let a_task = wait_terminal(&queue, a).await;
    assert_eq!(a_task.status, TaskStatus::Cancelled);

    // the freed slot must go to B
    wait_for(&queue, b, "admission of the next task", |t| {
        t.status == TaskStatus::Running
    })
    .await;

    // cancel is idempotent on a terminal task
    queue.cancel(a).unwrap();
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Cancelled);

    queue.shutdown().await;
}

#[tokio::test]
async fn cancelling_queued_task_never_spawns() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 30");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let b = queue.add_convert(options(dir.path(), 1)).unwrap();

    queue.cancel(b).unwrap();
    let b_task = queue.get(b).unwrap();
    assert_eq!(b_task.status, TaskStatus::Cancelled);
    assert!(b_task.started_at.is_none());
    assert_eq!(b_task.exit_code, None);

    // A is unaffected
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Running);

    queue.shutdown().await;
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 2");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    queue.pause(a).unwrap();
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Paused);

    // pausing twice is not legal
    let err = queue.pause(a).unwrap_err();
    assert!(matches!(err, QueueError::InvalidState { .. }));

    queue.resume(a).unwrap();
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Running);

    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Completed);
}

#[tokio::test]
async fn cancel_works_on_paused_task() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 30");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    queue.pause(a).unwrap();
    queue.cancel(a).unwrap();

    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn command_validation_errors() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "sleep 30");

    // unknown id
    let err = queue.pause(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));
    let err = queue.cancel(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, QueueError::NotFound(_)));

    // pause/resume on a queued task
    let _a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let b = queue.add_convert(options(dir.path(), 1)).unwrap();
    assert!(matches!(
        queue.pause(b).unwrap_err(),
        QueueError::InvalidState { .. }
    ));
    assert!(matches!(
        queue.resume(b).unwrap_err(),
        QueueError::InvalidState { .. }
    ));

    // bad options never create a record
    let err = queue
        .add_convert(TaskOptions::new("", dir.path().join("out.mkv")))
        .unwrap_err();
    assert!(matches!(err, QueueError::Validation(_)));
    assert_eq!(queue.get_all().len(), 2);

    queue.shutdown().await;
}

#[tokio::test]
async fn resume_on_completed_task_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "exit 0");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.exit_code, Some(0));

    assert!(matches!(
        queue.resume(a).unwrap_err(),
        QueueError::InvalidState { .. }
    ));
    assert!(matches!(
        queue.pause(a).unwrap_err(),
        QueueError::InvalidState { .. }
    ));
}

#[tokio::test]
async fn nonzero_exit_fails_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "exit 3");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.exit_code, Some(3));
    assert!(task.error.as_deref().unwrap_or("").contains("3"));
}

#[tokio::test]
async fn error_line_becomes_failure_message() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(
        1,
        "echo 'Error while opening encoder for output stream' >&2; exit 1",
    );

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(
        task.error
            .as_deref()
            .unwrap()
            .contains("opening encoder"),
        "error was {:?}",
        task.error
    );
}

#[tokio::test]
async fn error_line_alone_does_not_fail_a_run() {
    let dir = tempfile::tempdir().unwrap();
    // the exit code is authoritative: an error-looking line on a run that
    // exits 0 must not mark the task failed
    let queue = script_queue(1, "echo 'Error: harmless grumble' >&2; exit 0");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let task = wait_terminal(&queue, a).await;
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.error.is_none());
}

#[tokio::test]
async fn spawn_failure_fails_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let queue = TaskQueue::with_planner(test_config(1), Arc::new(BrokenPlanner));

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let task = queue.get(a).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(task.error.as_deref().unwrap().contains("failed to spawn"));
    assert_eq!(task.exit_code, None);
}

#[tokio::test]
async fn spawn_failure_does_not_wedge_admission() {
    let dir = tempfile::tempdir().unwrap();
    let queue = TaskQueue::with_planner(test_config(1), Arc::new(BrokenPlanner));

    // both fail to spawn; the second must still be attempted
    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    let b = queue.add_convert(options(dir.path(), 1)).unwrap();
    assert_eq!(queue.get(a).unwrap().status, TaskStatus::Failed);
    assert_eq!(queue.get(b).unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn progress_events_reach_subscribers_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let script = "\
echo 'Duration: 00:00:10.00, start: 0.000000, bitrate: 1000 kb/s' >&2; \
echo 'frame=  125 fps= 25 q=28.0 size=     256kB time=00:00:05.00 bitrate= 419.4kbits/s speed=1.0x' >&2; \
sleep 0.2; \
exit 0";
    let queue = script_queue(1, script);
    let (subscription, mut events) = queue.subscribe();

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();

    let mut statuses = Vec::new();
    let mut progress_seen = None;
    loop {
        let snapshot = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("no event within timeout")
            .expect("event channel closed early");
        assert_eq!(snapshot.id, a);
        statuses.push(snapshot.status);
        if let Some(progress) = &snapshot.progress {
            progress_seen = Some(progress.clone());
        }
        if snapshot.status.is_terminal() {
            break;
        }
    }

    assert_eq!(statuses.first(), Some(&TaskStatus::Queued));
    assert!(statuses.contains(&TaskStatus::Running));
    assert_eq!(statuses.last(), Some(&TaskStatus::Completed));

    let progress = progress_seen.expect("no progress tick observed");
    assert_eq!(progress.frame, Some(125));
    assert_eq!(progress.time_seconds, Some(5.0));
    let percent = progress.percent.expect("percent requires known duration");
    assert!((percent - 50.0).abs() < 0.5, "got {percent}");

    queue.unsubscribe(subscription);
}

#[tokio::test]
async fn unsubscribed_observer_receives_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "exit 0");

    let (subscription, mut events) = queue.subscribe();
    queue.unsubscribe(subscription);
    // unsubscribing twice is fine
    queue.unsubscribe(subscription);

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    wait_terminal(&queue, a).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn shutdown_cancels_and_drains_everything() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(2, "sleep 30");

    let ids: Vec<Uuid> = (0..3)
        .map(|n| queue.add_convert(options(dir.path(), n)).unwrap())
        .collect();

    queue.shutdown().await;

    for id in ids {
        let task = queue.get(id).unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled, "task {id}");
    }

    let err = queue.add_convert(options(dir.path(), 9)).unwrap_err();
    assert!(matches!(err, QueueError::ShuttingDown));
}

#[tokio::test]
async fn clear_finished_evicts_only_terminal_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let queue = script_queue(1, "exit 0");

    let a = queue.add_convert(options(dir.path(), 0)).unwrap();
    wait_terminal(&queue, a).await;

    // a live task survives clearing
    let long = script_queue(1, "sleep 30");
    let b = long.add_convert(options(dir.path(), 1)).unwrap();
    assert_eq!(long.clear_finished(), 0);
    assert_eq!(long.get(b).unwrap().status, TaskStatus::Running);
    long.shutdown().await;

    assert_eq!(queue.clear_finished(), 1);
    assert!(matches!(queue.get(a), Err(QueueError::NotFound(_))));
}
