use crate::queue::TaskStatus;
use uuid::Uuid;

/// Errors surfaced by the queue command interface.
///
/// Runtime failures of an admitted task (non-zero exit, killed by signal)
/// are not errors of the command that observed them; they are recorded on
/// the task itself and delivered through the event channel.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Task options rejected before a record was created
    #[error("invalid task options: {0}")]
    Validation(String),

    /// Unknown task id on cancel/pause/resume
    #[error("no task with id {0}")]
    NotFound(Uuid),

    /// Command not legal for the task's current status
    #[error("cannot {command} task {id} while it is {status}")]
    InvalidState {
        id: Uuid,
        status: TaskStatus,
        command: &'static str,
    },

    /// The encoder binary could not be started
    #[error("failed to spawn encoder: {0}")]
    Spawn(#[source] std::io::Error),

    /// Delivering an OS signal to the subprocess failed
    #[error("signal delivery failed: {0}")]
    Signal(String),

    /// Configuration file problem
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation not available on this platform
    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),

    /// The queue is shutting down and no longer accepts work
    #[error("queue is shutting down")]
    ShuttingDown,
}

pub type QueueResult<T> = Result<T, QueueError>;
