pub mod events;
pub mod scheduler;
pub mod task;

pub use events::{EventDispatcher, SubscriptionId};
pub use scheduler::{QueueSummary, TaskQueue};
pub use task::{
    Resolution, TaskKind, TaskOptions, TaskProgress, TaskRecord, TaskStatus, VideoCodec,
    is_video_file,
};
