use anyhow::bail;
use clap::Parser;
use ffqueue::utils::{DependencyStatus, init_logging};
use ffqueue::{
    QueueConfig, Resolution, TaskOptions, TaskQueue, TaskRecord, TaskStatus, VideoCodec,
    queue::is_video_file,
};
use humansize::{DECIMAL, format_size};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(
    name = "ffqueue",
    version,
    about = "Queue media conversions through an external ffmpeg binary"
)]
struct Cli {
    /// Files or directories to enqueue; directories are scanned recursively
    /// for video files
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Compress (size-targeted re-encode) instead of convert
    #[arg(long)]
    compress: bool,

    /// Target video codec (h264, hevc, vp9, av1)
    #[arg(long)]
    codec: Option<String>,

    /// Constant rate factor, 0-51
    #[arg(long)]
    crf: Option<u8>,

    /// Target video bitrate in kbit/s
    #[arg(long)]
    bitrate: Option<u32>,

    /// Output frame size as WIDTHxHEIGHT
    #[arg(long)]
    resolution: Option<String>,

    /// Override the configured concurrency limit
    #[arg(long)]
    jobs: Option<usize>,

    /// Print final task snapshots as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();
    let cli = Cli::parse();

    let mut config = QueueConfig::load();
    if let Some(jobs) = cli.jobs {
        config.max_concurrent = jobs;
    }
    config.validate()?;

    if !DependencyStatus::check(&config.ffmpeg_path).all_present() {
        bail!(
            "encoder binary '{}' is not runnable; install ffmpeg or set ffmpeg_path in {}",
            config.ffmpeg_path,
            QueueConfig::config_path().display()
        );
    }

    let codec: Option<VideoCodec> = cli
        .codec
        .as_deref()
        .map(|s| s.parse().map_err(anyhow::Error::msg))
        .transpose()?;
    let resolution: Option<Resolution> = cli
        .resolution
        .as_deref()
        .map(|s| s.parse().map_err(anyhow::Error::msg))
        .transpose()?;

    let inputs = collect_inputs(&cli.inputs)?;
    if inputs.is_empty() {
        bail!("no video files found in the given inputs");
    }

    let queue = TaskQueue::new(config.clone());
    let (subscription, mut events) = queue.subscribe();

    for input in inputs {
        let output = derive_output(&input, &config);
        let mut options = TaskOptions::new(input, output);
        options.codec = codec;
        options.resolution = resolution;
        options.bitrate_kbps = cli.bitrate;
        options.crf = cli.crf;

        let id = if cli.compress {
            queue.add_compress(options)?
        } else {
            queue.add_convert(options)?
        };
        let task = queue.get(id)?;
        println!("queued  {}  {}", id, task.filename());
    }

    // Drain snapshots until every task settles; Ctrl-C cancels the rest.
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(snapshot) => {
                    print_snapshot(&snapshot);
                    if queue.all_settled() {
                        break;
                    }
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("interrupted, cancelling remaining tasks");
                queue.shutdown().await;
                break;
            }
        }
    }
    queue.unsubscribe(subscription);

    let tasks = queue.get_all();
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
    } else {
        print_summary(&tasks);
    }

    let summary = queue.summary();
    queue.shutdown().await;
    if summary.failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Expand files and directories into the list of video inputs
fn collect_inputs(raw: &[PathBuf]) -> anyhow::Result<Vec<PathBuf>> {
    let mut inputs = Vec::new();
    for path in raw {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_file())
            {
                if is_video_file(entry.path()) {
                    inputs.push(entry.path().to_path_buf());
                }
            }
        } else if path.exists() {
            inputs.push(path.clone());
        } else {
            bail!("input does not exist: {}", path.display());
        }
    }
    inputs.sort();
    inputs.dedup();
    Ok(inputs)
}

/// Place the output next to the input, renamed per the output config
fn derive_output(input: &Path, config: &QueueConfig) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        "{}{}.{}",
        stem, config.output.suffix, config.output.container
    ))
}

fn print_snapshot(task: &TaskRecord) {
    match task.status {
        TaskStatus::Running => {
            if let Some(progress) = &task.progress {
                let percent = progress
                    .percent
                    .map(|p| format!("{p:5.1}%"))
                    .unwrap_or_else(|| "  ----".to_string());
                let speed = progress
                    .speed
                    .map(|s| format!("{s:.2}x"))
                    .unwrap_or_default();
                println!(
                    "encode  {}  {}  frame={} {}",
                    task.filename(),
                    percent,
                    progress.frame.unwrap_or(0),
                    speed
                );
            }
        }
        TaskStatus::Failed => {
            eprintln!(
                "failed  {}  {}",
                task.filename(),
                task.error.as_deref().unwrap_or("unknown error")
            );
        }
        status => println!("{status:<7} {}", task.filename()),
    }
}

fn print_summary(tasks: &[TaskRecord]) {
    let mut completed = 0usize;
    let mut failed = 0usize;
    let mut cancelled = 0usize;
    let mut output_bytes = 0u64;

    for task in tasks {
        match task.status {
            TaskStatus::Completed => {
                completed += 1;
                if let Ok(meta) = std::fs::metadata(&task.options.output) {
                    output_bytes += meta.len();
                }
            }
            TaskStatus::Failed => failed += 1,
            TaskStatus::Cancelled => cancelled += 1,
            _ => {}
        }
    }

    println!(
        "done: {completed} completed ({}), {failed} failed, {cancelled} cancelled",
        format_size(output_bytes, DECIMAL)
    );
}
