use crate::queue::{TaskKind, TaskRecord, VideoCodec};

/// A fully determined encoder invocation: program plus ordered argument
/// list. The scheduler treats this as opaque and never edits it after spawn.
#[derive(Debug, Clone)]
pub struct CommandPlan {
    pub program: String,
    pub args: Vec<String>,
}

/// Translation seam between task options and the encoder command line.
///
/// The queue only ever calls `plan` once, right before spawning. Tests
/// substitute a planner that produces small shell scripts instead of ffmpeg.
pub trait CommandPlanner: Send + Sync {
    fn plan(&self, task: &TaskRecord) -> CommandPlan;
}

/// Production planner: builds ffmpeg argument lists from task options
#[derive(Debug, Clone)]
pub struct FfmpegPlanner {
    ffmpeg_path: String,
}

impl FfmpegPlanner {
    pub fn new(ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl CommandPlanner for FfmpegPlanner {
    fn plan(&self, task: &TaskRecord) -> CommandPlan {
        CommandPlan {
            program: self.ffmpeg_path.clone(),
            args: build_ffmpeg_args(task),
        }
    }
}

/// Build the ffmpeg argument list for a task
pub fn build_ffmpeg_args(task: &TaskRecord) -> Vec<String> {
    let options = &task.options;
    let mut args = vec![
        "-y".to_string(),
        "-nostdin".to_string(),
        "-i".to_string(),
        options.input.to_string_lossy().to_string(),
    ];

    match task.kind {
        TaskKind::Convert => args.extend(convert_args(task)),
        TaskKind::Compress => args.extend(compress_args(task)),
    }

    // stats stay on by default; this pins the tick interval
    args.extend(["-stats_period".to_string(), "0.5".to_string()]);
    args.push(options.output.to_string_lossy().to_string());
    args
}

/// Conversion: copy streams into the new container unless an option forces
/// a re-encode of the video stream.
fn convert_args(task: &TaskRecord) -> Vec<String> {
    let options = &task.options;
    let reencode =
        options.codec.is_some() || options.resolution.is_some() || options.bitrate_kbps.is_some();

    if !reencode {
        return vec!["-c".to_string(), "copy".to_string()];
    }

    let codec = options.codec.unwrap_or(VideoCodec::H264);
    let mut args = vec!["-c:v".to_string(), codec.ffmpeg_name().to_string()];
    if let Some(res) = options.resolution {
        args.extend(["-vf".to_string(), format!("scale={}:{}", res.width, res.height)]);
    }
    if let Some(kbps) = options.bitrate_kbps {
        args.extend(["-b:v".to_string(), format!("{kbps}k")]);
    }
    if let Some(crf) = options.crf {
        args.extend(["-crf".to_string(), crf.to_string()]);
    }
    args.extend([
        "-c:a".to_string(),
        "copy".to_string(),
        "-c:s".to_string(),
        "copy".to_string(),
    ]);
    args
}

/// Compression: always a quality-targeted video re-encode
fn compress_args(task: &TaskRecord) -> Vec<String> {
    const DEFAULT_CRF: u8 = 28;

    let options = &task.options;
    let codec = options.codec.unwrap_or(VideoCodec::Hevc);
    let mut args = vec!["-c:v".to_string(), codec.ffmpeg_name().to_string()];

    if let Some(res) = options.resolution {
        args.extend(["-vf".to_string(), format!("scale={}:{}", res.width, res.height)]);
    }
    match options.bitrate_kbps {
        Some(kbps) => args.extend(["-b:v".to_string(), format!("{kbps}k")]),
        None => args.extend([
            "-crf".to_string(),
            options.crf.unwrap_or(DEFAULT_CRF).to_string(),
        ]),
    }
    args.extend([
        "-c:a".to_string(),
        "copy".to_string(),
        "-c:s".to_string(),
        "copy".to_string(),
    ]);
    args
}
