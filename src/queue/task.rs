use crate::encoder::ProgressUpdate;
use crate::error::{QueueError, QueueResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

/// Status of a task in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for an execution slot
    Queued,
    /// Encoder process is live
    Running,
    /// Encoder process is suspended
    Paused,
    /// Termination requested, waiting for the process to exit
    Cancelling,
    /// Process exited successfully
    Completed,
    /// Process exited abnormally or never started
    Failed,
    /// Terminated at the user's request
    Cancelled,
}

impl TaskStatus {
    /// Completed, Failed and Cancelled absorb all further commands
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// True while a subprocess is associated with the task
    pub fn has_process(self) -> bool {
        matches!(
            self,
            TaskStatus::Running | TaskStatus::Paused | TaskStatus::Cancelling
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Cancelling => "cancelling",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.pad(s)
    }
}

/// What kind of work the task performs; determines argument translation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Container/codec conversion, streams copied unless options force a re-encode
    Convert,
    /// Size-targeted re-encode
    Compress,
}

/// Target video codec for re-encodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl VideoCodec {
    /// The ffmpeg encoder name for this codec
    pub fn ffmpeg_name(self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::Vp9 => "libvpx-vp9",
            VideoCodec::Av1 => "libsvtav1",
        }
    }
}

impl FromStr for VideoCodec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "h264" | "x264" | "avc" => Ok(VideoCodec::H264),
            "hevc" | "h265" | "x265" => Ok(VideoCodec::Hevc),
            "vp9" => Ok(VideoCodec::Vp9),
            "av1" => Ok(VideoCodec::Av1),
            other => Err(format!("unknown codec: {other}")),
        }
    }
}

/// Output frame size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (w, h) = s
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s}"))?;
        let width = w.parse().map_err(|_| format!("bad width in {s}"))?;
        let height = h.parse().map_err(|_| format!("bad height in {s}"))?;
        Ok(Resolution { width, height })
    }
}

/// Per-task settings, validated at `add` time.
///
/// Unknown fields are rejected during deserialization rather than silently
/// dropped, so a UI layer cannot smuggle settings the engine never reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskOptions {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub codec: Option<VideoCodec>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
    /// Target video bitrate in kbit/s
    #[serde(default)]
    pub bitrate_kbps: Option<u32>,
    /// Constant rate factor, 0-51 (lower = better quality)
    #[serde(default)]
    pub crf: Option<u8>,
}

impl TaskOptions {
    pub fn new(input: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            input: input.into(),
            output: output.into(),
            codec: None,
            resolution: None,
            bitrate_kbps: None,
            crf: None,
        }
    }

    /// Check option values and resolve both paths to absolute form.
    pub fn validate(&mut self) -> QueueResult<()> {
        if self.input.as_os_str().is_empty() {
            return Err(QueueError::Validation("input path is empty".into()));
        }
        if self.output.as_os_str().is_empty() {
            return Err(QueueError::Validation("output path is empty".into()));
        }
        self.input = absolutize(&self.input)?;
        self.output = absolutize(&self.output)?;
        if self.input == self.output {
            return Err(QueueError::Validation(
                "output path would overwrite the input".into(),
            ));
        }
        if let Some(crf) = self.crf
            && crf > 51
        {
            return Err(QueueError::Validation(format!(
                "crf must be between 0 and 51, got {crf}"
            )));
        }
        if self.bitrate_kbps == Some(0) {
            return Err(QueueError::Validation("bitrate must be positive".into()));
        }
        if let Some(res) = self.resolution
            && (res.width == 0 || res.height == 0)
        {
            return Err(QueueError::Validation(format!(
                "resolution dimensions must be positive, got {res}"
            )));
        }
        Ok(())
    }
}

fn absolutize(path: &Path) -> QueueResult<PathBuf> {
    std::path::absolute(path)
        .map_err(|e| QueueError::Validation(format!("cannot resolve {}: {e}", path.display())))
}

/// Live progress of a running encode.
///
/// Fields mirror the tokens of the encoder's stats line; any of them can be
/// absent when the corresponding token has not been seen yet. `percent`
/// stays empty until the stream duration is known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskProgress {
    pub percent: Option<f32>,
    pub time_seconds: Option<f64>,
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub size_bytes: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f32>,
}

/// One unit of queued work.
///
/// Records are owned by the queue; everything handed out through `get_all`
/// or the event channel is a point-in-time clone.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub id: Uuid,
    pub kind: TaskKind,
    pub options: TaskOptions,
    pub status: TaskStatus,
    pub progress: Option<TaskProgress>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    /// Last error-classified output line, advisory until the exit code decides
    #[serde(skip)]
    pub(crate) last_error_line: Option<String>,
    /// Set on resume so the first tick of the resumed run may report a lower percent
    #[serde(skip)]
    pub(crate) allow_progress_regress: bool,
}

impl TaskRecord {
    pub(crate) fn new(kind: TaskKind, options: TaskOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            options,
            status: TaskStatus::Queued,
            progress: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
            exit_code: None,
            last_error_line: None,
            allow_progress_regress: false,
        }
    }

    pub fn filename(&self) -> String {
        self.options
            .input
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.options.input.display().to_string())
    }

    pub(crate) fn mark_started(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn mark_paused(&mut self) {
        self.status = TaskStatus::Paused;
    }

    pub(crate) fn mark_resumed(&mut self) {
        self.status = TaskStatus::Running;
        self.allow_progress_regress = true;
    }

    pub(crate) fn mark_cancelling(&mut self) {
        self.status = TaskStatus::Cancelling;
    }

    pub(crate) fn mark_completed(&mut self, exit_code: Option<i32>) {
        self.status = TaskStatus::Completed;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_failed(&mut self, message: String, exit_code: Option<i32>) {
        self.status = TaskStatus::Failed;
        self.error = Some(message);
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn mark_cancelled(&mut self, exit_code: Option<i32>) {
        self.status = TaskStatus::Cancelled;
        self.exit_code = exit_code;
        self.finished_at = Some(Utc::now());
    }

    /// Merge one parsed stats tick into the record.
    ///
    /// Tokens absent from the tick keep their previous values. The percent
    /// never moves backwards while the same run is live; only the first tick
    /// after a resume may re-baseline it.
    pub(crate) fn apply_progress(&mut self, update: &ProgressUpdate) {
        let progress = self.progress.get_or_insert_with(TaskProgress::default);

        if let Some(pct) = update.percent {
            let pct = if self.allow_progress_regress {
                pct
            } else {
                match progress.percent {
                    Some(prev) => prev.max(pct),
                    None => pct,
                }
            };
            progress.percent = Some(pct.clamp(0.0, 100.0));
        }
        if update.time_seconds.is_some() {
            progress.time_seconds = update.time_seconds;
        }
        if update.frame.is_some() {
            progress.frame = update.frame;
        }
        if update.fps.is_some() {
            progress.fps = update.fps;
        }
        if update.size_bytes.is_some() {
            progress.size_bytes = update.size_bytes;
        }
        if update.bitrate_kbps.is_some() {
            progress.bitrate_kbps = update.bitrate_kbps;
        }
        if update.speed.is_some() {
            progress.speed = update.speed;
        }
        self.allow_progress_regress = false;
    }

    pub(crate) fn note_error_line(&mut self, message: String) {
        self.last_error_line = Some(message);
    }
}

/// Check if a path looks like a video file
pub fn is_video_file(path: &Path) -> bool {
    const VIDEO_EXTENSIONS: [&str; 9] = [
        "mp4", "mkv", "avi", "mov", "webm", "m4v", "ts", "wmv", "flv",
    ];

    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}
