use regex::Regex;
use std::sync::LazyLock;

static DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Duration:\s*(\d{2,}):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap()
});
static TIME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\d{2,}):(\d{2}):(\d{2}(?:\.\d+)?)").unwrap());
static FRAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"frame=\s*(\d+)").unwrap());
static FPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"fps=\s*(\d+(?:\.\d+)?)").unwrap());
static SIZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"L?size=\s*(\d+)\s*kB").unwrap());
static BITRATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"bitrate=\s*(\d+(?:\.\d+)?)\s*kbits/s").unwrap());
static SPEED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"speed=\s*(\d+(?:\.\d+)?)x").unwrap());

/// Output lines that signal a failure without an "Error" prefix.
/// Deliberately short: the exit code is the authoritative failure signal and
/// a false positive here must not be able to abort a healthy run.
const ERROR_PHRASES: [&str; 5] = [
    "no such file or directory",
    "invalid argument",
    "conversion failed",
    "invalid data found",
    "permission denied",
];

/// One parsed stats tick. Every field is optional: tokens are parsed
/// independently and a line with only some of them still yields an update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressUpdate {
    pub percent: Option<f32>,
    pub time_seconds: Option<f64>,
    pub frame: Option<u64>,
    pub fps: Option<f32>,
    pub size_bytes: Option<u64>,
    pub bitrate_kbps: Option<f64>,
    pub speed: Option<f32>,
}

/// Typed event produced from one raw encoder output line
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedEvent {
    /// Total stream duration announced in the input banner
    DurationDiscovered { total_seconds: f64 },
    /// A stats tick
    Progress(ProgressUpdate),
    /// A line that looks like a failure report; advisory only
    Error { message: String },
    /// The version banner; the queue ignores it
    VersionInfo { line: String },
}

/// Parser for ffmpeg's stderr chatter.
///
/// Stateful only in that the total duration, once discovered, is retained so
/// later stats ticks can be turned into a percentage. Everything else is
/// line-at-a-time and best-effort: a line that matches nothing yields `None`,
/// never an error.
#[derive(Debug, Default)]
pub struct FfmpegOutputParser {
    total_seconds: Option<f64>,
}

impl FfmpegOutputParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total duration seen so far, if any
    pub fn total_seconds(&self) -> Option<f64> {
        self.total_seconds
    }

    /// Classify one raw line into an event
    pub fn parse_line(&mut self, line: &str) -> Option<ParsedEvent> {
        if let Some(total) = Self::parse_duration(line) {
            self.total_seconds = Some(total);
            return Some(ParsedEvent::DurationDiscovered {
                total_seconds: total,
            });
        }
        if let Some(mut update) = Self::parse_progress(line) {
            if let (Some(total), Some(time)) = (self.total_seconds, update.time_seconds)
                && total > 0.0
            {
                update.percent = Some(((time / total * 100.0) as f32).clamp(0.0, 100.0));
            }
            return Some(ParsedEvent::Progress(update));
        }
        if let Some(message) = Self::parse_error(line) {
            return Some(ParsedEvent::Error { message });
        }
        if line.trim_start().starts_with("ffmpeg version") {
            return Some(ParsedEvent::VersionInfo {
                line: line.trim().to_string(),
            });
        }
        None
    }

    /// Extract the total duration from an input banner line.
    /// `Duration: 00:05:30.25, start: 0.000000, bitrate: 1500 kb/s` -> 330.25
    pub fn parse_duration(line: &str) -> Option<f64> {
        let caps = DURATION_RE.captures(line)?;
        Some(timestamp_seconds(&caps))
    }

    /// Extract whatever stats tokens are present on the line.
    ///
    /// Only lines carrying a `frame=` or `time=` token count as stats lines;
    /// each token is parsed independently and missing ones stay `None`.
    pub fn parse_progress(line: &str) -> Option<ProgressUpdate> {
        if !line.contains("frame=") && !line.contains("time=") {
            return None;
        }

        let time_seconds = TIME_RE.captures(line).map(|caps| timestamp_seconds(&caps));
        let update = ProgressUpdate {
            percent: None,
            time_seconds,
            frame: capture_parse(&FRAME_RE, line),
            fps: capture_parse(&FPS_RE, line),
            size_bytes: capture_parse::<u64>(&SIZE_RE, line).map(|kb| kb * 1024),
            bitrate_kbps: capture_parse(&BITRATE_RE, line),
            speed: capture_parse(&SPEED_RE, line),
        };

        if update == ProgressUpdate::default() {
            return None;
        }
        Some(update)
    }

    /// Heuristic error classification: an `Error` leading token or a known
    /// failure phrase. Returns the trimmed message, else `None`.
    pub fn parse_error(line: &str) -> Option<String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }

        let lower = trimmed.to_lowercase();
        if lower.starts_with("error") {
            let rest = trimmed["error".len()..]
                .trim_start_matches([':', ' '])
                .trim();
            return Some(if rest.is_empty() {
                trimmed.to_string()
            } else {
                rest.to_string()
            });
        }
        if ERROR_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
            return Some(trimmed.to_string());
        }
        None
    }
}

fn timestamp_seconds(caps: &regex::Captures<'_>) -> f64 {
    let hours: f64 = caps[1].parse().unwrap_or(0.0);
    let minutes: f64 = caps[2].parse().unwrap_or(0.0);
    let seconds: f64 = caps[3].parse().unwrap_or(0.0);
    hours * 3600.0 + minutes * 60.0 + seconds
}

fn capture_parse<T: std::str::FromStr>(re: &Regex, line: &str) -> Option<T> {
    re.captures(line)?[1].parse().ok()
}
