use super::command_builder::CommandPlan;
use super::parser::{FfmpegOutputParser, ParsedEvent};
use crate::error::{QueueError, QueueResult};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Message from a runner task back to the scheduler loop
#[derive(Debug)]
pub(crate) struct RunnerEvent {
    pub id: Uuid,
    pub update: RunnerUpdate,
}

#[derive(Debug)]
pub(crate) enum RunnerUpdate {
    /// A typed event parsed from one output line
    Parsed(ParsedEvent),
    /// The process is gone; reported exactly once per runner
    Exited(ExitOutcome),
}

/// Final word on a subprocess, straight from `wait()`
#[derive(Debug, Clone)]
pub(crate) struct ExitOutcome {
    pub code: Option<i32>,
    pub signal: Option<i32>,
    pub wait_error: Option<String>,
}

impl ExitOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        if let Some(err) = &self.wait_error {
            return format!("could not observe encoder exit: {err}");
        }
        match (self.code, self.signal) {
            (Some(code), _) => format!("encoder exited with status {code}"),
            (None, Some(signal)) => format!("encoder killed by signal {signal}"),
            (None, None) => "encoder exited abnormally".to_string(),
        }
    }

    fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = std::os::unix::process::ExitStatusExt::signal(&status);
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
            wait_error: None,
        }
    }
}

/// Control handle for one live subprocess. Owned by the scheduler and
/// dropped once the exit event has been processed.
#[derive(Debug)]
pub(crate) struct RunnerHandle {
    pid: Option<i32>,
    cancel_tx: mpsc::UnboundedSender<()>,
}

impl RunnerHandle {
    /// Suspend the process. SIGSTOP is not maskable, so success of the
    /// syscall means the process is stopped.
    #[cfg(unix)]
    pub fn pause(&self) -> QueueResult<()> {
        self.signal(nix::sys::signal::Signal::SIGSTOP)
    }

    #[cfg(not(unix))]
    pub fn pause(&self) -> QueueResult<()> {
        Err(QueueError::Unsupported("pause"))
    }

    #[cfg(unix)]
    pub fn resume(&self) -> QueueResult<()> {
        self.signal(nix::sys::signal::Signal::SIGCONT)
    }

    #[cfg(not(unix))]
    pub fn resume(&self) -> QueueResult<()> {
        Err(QueueError::Unsupported("resume"))
    }

    /// Ask the runner task to terminate the process: graceful first, forced
    /// after the grace period. Returns immediately.
    pub fn request_cancel(&self) {
        // send only fails when the runner already exited, which is fine
        let _ = self.cancel_tx.send(());
    }

    #[cfg(unix)]
    fn signal(&self, sig: nix::sys::signal::Signal) -> QueueResult<()> {
        let pid = self
            .pid
            .ok_or_else(|| QueueError::Signal("process id unavailable".into()))?;
        nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), sig)
            .map_err(|e| QueueError::Signal(format!("{sig} to pid {pid}: {e}")))
    }
}

/// Spawn the planned command and supervise it on a background task.
///
/// Each complete output line (stdout and stderr combined; the splitter
/// honors the carriage returns ffmpeg uses for its stats ticks) is parsed
/// and forwarded to `events`, followed by exactly one `Exited` message.
pub(crate) fn spawn(
    plan: &CommandPlan,
    id: Uuid,
    events: mpsc::UnboundedSender<RunnerEvent>,
    grace: Duration,
) -> std::io::Result<RunnerHandle> {
    let mut child = Command::new(&plan.program)
        .args(&plan.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let pid = child.id().map(|p| p as i32);
    debug!(task = %id, program = %plan.program, pid = ?pid, "spawned encoder");

    let (cancel_tx, cancel_rx) = mpsc::unbounded_channel();
    tokio::spawn(supervise(child, id, pid, events, grace, cancel_rx));

    Ok(RunnerHandle { pid, cancel_tx })
}

async fn supervise(
    mut child: Child,
    id: Uuid,
    pid: Option<i32>,
    events: mpsc::UnboundedSender<RunnerEvent>,
    grace: Duration,
    mut cancel_rx: mpsc::UnboundedReceiver<()>,
) {
    let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(pump_lines(stdout, line_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(pump_lines(stderr, line_tx.clone()));
    }
    drop(line_tx);

    let mut parser = FfmpegOutputParser::new();
    let mut terminating = false;
    let mut killed = false;
    let mut cancel_closed = false;
    let mut kill_deadline = Instant::now() + Duration::from_secs(86_400);

    loop {
        tokio::select! {
            maybe_line = line_rx.recv() => match maybe_line {
                Some(line) => {
                    if let Some(event) = parser.parse_line(&line) {
                        let _ = events.send(RunnerEvent {
                            id,
                            update: RunnerUpdate::Parsed(event),
                        });
                    }
                }
                // both pipes closed, the process is on its way out
                None => break,
            },
            request = cancel_rx.recv(), if !terminating && !cancel_closed => match request {
                Some(()) => {
                    terminate_gracefully(&mut child, pid);
                    terminating = true;
                    kill_deadline = Instant::now() + grace;
                }
                None => cancel_closed = true,
            },
            _ = tokio::time::sleep_until(kill_deadline), if terminating && !killed => {
                warn!(task = %id, "grace period elapsed, killing encoder");
                let _ = child.start_kill();
                killed = true;
            }
        }
    }

    let status = if terminating && !killed {
        match tokio::time::timeout_at(kill_deadline, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task = %id, "grace period elapsed, killing encoder");
                let _ = child.start_kill();
                child.wait().await
            }
        }
    } else {
        child.wait().await
    };

    let outcome = match status {
        Ok(status) => ExitOutcome::from_status(status),
        Err(e) => ExitOutcome {
            code: None,
            signal: None,
            wait_error: Some(e.to_string()),
        },
    };
    debug!(task = %id, ?outcome, "encoder exited");
    let _ = events.send(RunnerEvent {
        id,
        update: RunnerUpdate::Exited(outcome),
    });
}

/// First step of cancellation: wake the process if it is paused, then ask it
/// to terminate. Forced kill happens separately once the grace period runs out.
fn terminate_gracefully(child: &mut Child, pid: Option<i32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;

        if let Some(pid) = pid {
            let pid = Pid::from_raw(pid);
            let _ = kill(pid, Signal::SIGCONT);
            let _ = kill(pid, Signal::SIGTERM);
            return;
        }
    }
    let _ = pid;
    let _ = child.start_kill();
}

/// Forward complete lines from a child pipe, splitting on both `\n` and the
/// `\r` ffmpeg uses to redraw its stats line in place.
async fn pump_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut acc: Vec<u8> = Vec::new();

    loop {
        let consumed = {
            let chunk = match reader.fill_buf().await {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.is_empty() {
                break;
            }
            for &byte in chunk {
                if byte == b'\n' || byte == b'\r' {
                    if !acc.is_empty() {
                        let line = String::from_utf8_lossy(&acc).into_owned();
                        acc.clear();
                        if tx.send(line).is_err() {
                            return;
                        }
                    }
                } else {
                    acc.push(byte);
                }
            }
            chunk.len()
        };
        reader.consume(consumed);
    }

    if !acc.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&acc).into_owned());
    }
}
