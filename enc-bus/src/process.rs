use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;

const DIAG_CHAN_CAP: usize = 256;
const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("encoder {0} pipe was not captured")]
    MissingPipe(&'static str),
    #[error("encoder process died unexpectedly (exit code {exit:?})")]
    DiedUnexpectedly { exit: Option<i32> },
    #[error("error waiting for encoder process: {0}")]
    Wait(std::io::Error),
    #[error("encoder process did not exit within {0:?} after end of stream")]
    JoinTimeout(Duration),
}

/// Finished command line for the encoder subprocess; building it is the
/// caller's business.
#[derive(Debug, Clone)]
pub struct EncoderCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
}

#[derive(Debug)]
enum DiagEvent {
    Line(String),
    Progress { frames: u64 },
    Fatal(String),
    StreamClosed,
}

/// What one pump call observed. `stream_closed` is latched: once the
/// diagnostic stream is gone it stays reported.
#[derive(Debug, Default)]
pub struct DiagStatus {
    pub events: usize,
    pub stream_closed: bool,
    pub fatal: Option<String>,
    pub progress_frames: Option<u64>,
}

/// The two modes of the one diagnostics polling function: non-blocking inside
/// the hot per-frame loop, a bounded blocking poll during shutdown waits.
#[derive(Debug, Clone, Copy)]
pub enum PumpMode {
    NonBlocking,
    BlockFor(Duration),
}

pub struct EncoderProcess {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    diag_rx: mpsc::Receiver<DiagEvent>,
    abort: CancellationToken,
    exit: Option<ExitStatus>,
    stream_closed: bool,
    progress_frames: u64,
}

impl EncoderProcess {
    pub async fn spawn(cmd: &EncoderCommand) -> Result<Self, ProcessError> {
        let label = cmd
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| cmd.program.display().to_string());

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &cmd.work_dir {
            command.current_dir(dir);
        }
        log::info!("spawning encoder: {} {}", cmd.program.display(), cmd.args.join(" "));
        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: cmd.program.display().to_string(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take().ok_or(ProcessError::MissingPipe("stderr"))?;
        let (diag_tx, diag_rx) = mpsc::channel(DIAG_CHAN_CAP);
        tokio::spawn(pump_stderr(stderr, label.clone(), diag_tx));

        Ok(Self {
            label,
            child,
            stdin,
            diag_rx,
            abort: CancellationToken::new(),
            exit: None,
            stream_closed: false,
            progress_frames: 0,
        })
    }

    /// The frame-feed side of the child: present exactly once.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Cooperative abort: cancels the feed so the child sees end-of-input.
    /// Never terminates the process forcibly — a stuck child is reported by
    /// `join`, not killed, to avoid corrupting partially written output.
    pub fn request_abort(&self) {
        if !self.abort.is_cancelled() {
            log::info!("{}: abort requested", self.label);
            self.abort.cancel();
        }
    }

    pub fn is_alive(&mut self) -> bool {
        if self.exit.is_some() {
            return false;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                log::debug!("{}: exited with {status}", self.label);
                self.exit = Some(status);
                false
            }
            Ok(None) => true,
            Err(e) => {
                log::warn!("{}: liveness check failed: {e}", self.label);
                false
            }
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.and_then(|status| status.code())
    }

    /// Last progress counter parsed from the diagnostic stream.
    pub fn progress_frames(&self) -> u64 {
        self.progress_frames
    }

    pub fn died_unexpectedly(&self) -> ProcessError {
        ProcessError::DiedUnexpectedly { exit: self.exit_code() }
    }

    /// One polling function for the diagnostic stream; see [`PumpMode`].
    pub async fn pump_diagnostics(&mut self, mode: PumpMode) -> DiagStatus {
        let mut status = DiagStatus::default();
        match mode {
            PumpMode::NonBlocking => loop {
                match self.diag_rx.try_recv() {
                    Ok(event) => self.apply(event, &mut status),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        self.stream_closed = true;
                        break;
                    }
                }
            },
            PumpMode::BlockFor(limit) => {
                match tokio::time::timeout(limit, self.diag_rx.recv()).await {
                    Ok(Some(event)) => {
                        self.apply(event, &mut status);
                        while let Ok(event) = self.diag_rx.try_recv() {
                            self.apply(event, &mut status);
                        }
                    }
                    Ok(None) => self.stream_closed = true,
                    Err(_) => {}
                }
            }
        }
        status.stream_closed = self.stream_closed;
        status
    }

    fn apply(&mut self, event: DiagEvent, status: &mut DiagStatus) {
        status.events += 1;
        match event {
            DiagEvent::Line(_) => {}
            DiagEvent::Progress { frames } => {
                self.progress_frames = frames;
                status.progress_frames = Some(frames);
            }
            DiagEvent::Fatal(line) => {
                log::error!("{}: {}", self.label, line.trim_end());
                status.fatal = Some(line);
            }
            DiagEvent::StreamClosed => self.stream_closed = true,
        }
    }

    /// Bounded wait for the child to exit, draining diagnostics each poll
    /// tick. Exceeding the bound is a hard failure report, not a kill.
    pub async fn join(
        &mut self,
        limit: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus, ProcessError> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some(status) = self.exit {
                return Ok(status);
            }
            match tokio::time::timeout(JOIN_POLL_INTERVAL, self.child.wait()).await {
                Ok(Ok(status)) => {
                    self.exit = Some(status);
                    // Collect what the pump still holds before reporting.
                    self.pump_diagnostics(PumpMode::BlockFor(Duration::from_millis(50)))
                        .await;
                    log::info!("{}: exited with {status}", self.label);
                    return Ok(status);
                }
                Ok(Err(e)) => return Err(ProcessError::Wait(e)),
                Err(_) => {
                    self.pump_diagnostics(PumpMode::NonBlocking).await;
                    if cancel.is_cancelled() {
                        self.request_abort();
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ProcessError::JoinTimeout(limit));
                    }
                }
            }
        }
    }
}

async fn pump_stderr(stderr: ChildStderr, label: String, tx: mpsc::Sender<DiagEvent>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                log::debug!("{label}: {}", line.trim_end());
                let event = if let Some(frames) = parse_progress(&line) {
                    DiagEvent::Progress { frames }
                } else if is_fatal(&line) {
                    DiagEvent::Fatal(line)
                } else {
                    DiagEvent::Line(line)
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                log::debug!("{label}: diagnostic stream read failed: {e}");
                break;
            }
        }
    }
    let _ = tx.send(DiagEvent::StreamClosed).await;
}

/// Pulls `key<value>` out of a diagnostics line, tolerating padding between
/// the key and the value.
fn extract_value(line: &str, key: &str) -> Option<String> {
    let start = line.find(key)? + key.len();
    let rest = line[start..].trim_start();
    let end = rest
        .find(|c: char| c.is_whitespace())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// Understands both `frame=  123 ...` and `123 frames: ...` progress styles.
fn parse_progress(line: &str) -> Option<u64> {
    if let Some(value) = extract_value(line, "frame=") {
        if let Ok(frames) = value.parse() {
            return Some(frames);
        }
    }
    let mut words = line.split_whitespace();
    let first = words.next()?;
    let second = words.next()?;
    if second.starts_with("frames") {
        return first.parse().ok();
    }
    None
}

fn is_fatal(line: &str) -> bool {
    let lowered = line.trim_start().to_ascii_lowercase();
    lowered.starts_with("error") || lowered.contains("error:") || lowered.contains("[error]")
}

#[cfg(test)]
#[path = "process_test.rs"]
mod process_test;
