//! Media conversion job queue driving an external ffmpeg binary.
//!
//! The engine accepts convert/compress tasks, bounds how many encoder
//! processes run at once, parses the encoder's stderr chatter into typed
//! progress events, and lets callers pause, resume or cancel work. A UI
//! layer consumes the queue through its command methods and a subscriber
//! channel of task snapshots; nothing here renders anything.

pub mod config;
pub mod encoder;
pub mod error;
pub mod queue;
pub mod utils;

pub use config::{OutputConfig, QueueConfig};
pub use encoder::{CommandPlan, CommandPlanner, FfmpegOutputParser, ParsedEvent, ProgressUpdate};
pub use error::{QueueError, QueueResult};
pub use queue::{
    QueueSummary, Resolution, SubscriptionId, TaskKind, TaskOptions, TaskProgress, TaskQueue,
    TaskRecord, TaskStatus, VideoCodec,
};
