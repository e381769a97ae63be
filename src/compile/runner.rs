//! External tool execution
//!
//! Spawns the TeX engine / bibliography tool, streams combined output
//! line-by-line and supports cooperative termination (signal, grace period,
//! force kill). Output is never interpreted here.

use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, warn};

use super::request::CompileRequest;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_INTERVAL: Duration = Duration::from_millis(25);

/// Shared flag observed by an in-flight tool run.
///
/// Cleared by the scheduler between attempts; set from any thread.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Errors raised before or while driving an external tool
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not found: {0}")]
    NotFound(String),

    #[error("failed to launch {tool}: {source}")]
    Spawn {
        tool: String,
        source: std::io::Error,
    },
}

/// How a tool run ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    /// Process exited on its own; -1 when killed by a signal
    Exited(i32),
    Cancelled,
    TimedOut,
}

/// Combined output plus final status of one tool run
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Interleaved stdout/stderr, captured as it arrived
    pub output: String,
}

/// Spawns external tools and shepherds them to completion
#[derive(Clone, Debug)]
pub struct ProcessRunner {
    /// Time allowed between the termination signal and force kill
    grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(2),
        }
    }
}

impl ProcessRunner {
    #[must_use]
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run a tool to completion, streaming its combined output.
    ///
    /// Returns an error only when the process cannot start; abnormal exits,
    /// timeouts and cancellation are values in the outcome.
    pub fn run(
        &self,
        program: &str,
        args: &[String],
        cwd: &Path,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<RunOutcome, ToolError> {
        debug!("running {program} {args:?} in {}", cwd.display());

        let mut child = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::NotFound(program.to_string())
                } else {
                    ToolError::Spawn {
                        tool: program.to_string(),
                        source: e,
                    }
                }
            })?;

        let (line_tx, line_rx) = flume::unbounded::<String>();
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, line_tx);
        }

        let deadline = Instant::now() + timeout;
        let mut output = String::new();

        let status = loop {
            if cancel.is_cancelled() {
                self.terminate(&mut child, program);
                break RunStatus::Cancelled;
            }
            if Instant::now() >= deadline {
                warn!("{program} exceeded {}s timeout", timeout.as_secs());
                self.terminate(&mut child, program);
                break RunStatus::TimedOut;
            }

            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok(line) => {
                    output.push_str(&line);
                    output.push('\n');
                }
                Err(flume::RecvTimeoutError::Timeout) => {}
                Err(flume::RecvTimeoutError::Disconnected) => {
                    // Streams closed; the process should exit momentarily
                    match self.reap(&mut child, deadline, cancel) {
                        Some(status) => break status,
                        None => {
                            self.terminate(&mut child, program);
                            break if cancel.is_cancelled() {
                                RunStatus::Cancelled
                            } else {
                                RunStatus::TimedOut
                            };
                        }
                    }
                }
            }
        };

        drain_remaining(&line_rx, &mut output);
        Ok(RunOutcome { status, output })
    }

    /// Wait for exit after the streams closed, still honoring cancel/timeout
    fn reap(&self, child: &mut Child, deadline: Instant, cancel: &CancelToken) -> Option<RunStatus> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Some(RunStatus::Exited(status.code().unwrap_or(-1)));
                }
                Ok(None) => {
                    if cancel.is_cancelled() || Instant::now() >= deadline {
                        return None;
                    }
                    std::thread::sleep(REAP_INTERVAL);
                }
                Err(_) => return Some(RunStatus::Exited(-1)),
            }
        }
    }

    /// Cooperative termination: signal, wait out the grace period, force kill
    fn terminate(&self, child: &mut Child, program: &str) {
        #[cfg(unix)]
        unsafe {
            libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
        }
        #[cfg(not(unix))]
        let _ = child.kill();

        let grace_deadline = Instant::now() + self.grace;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return,
                Ok(None) => {
                    if Instant::now() >= grace_deadline {
                        warn!("{program} ignored termination signal, killing");
                        let _ = child.kill();
                        let _ = child.wait();
                        return;
                    }
                    std::thread::sleep(REAP_INTERVAL);
                }
                Err(_) => return,
            }
        }
    }
}

fn pump_lines(reader: impl Read + Send + 'static, tx: Sender<String>) {
    std::thread::spawn(move || {
        let reader = BufReader::new(reader);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

fn drain_remaining(rx: &Receiver<String>, output: &mut String) {
    while let Ok(line) = rx.try_recv() {
        output.push_str(&line);
        output.push('\n');
    }
}

/// Cheap availability probe used to classify environment errors early
#[must_use]
pub fn tool_available(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// One pass's status plus the log text the analyzer should consume
#[derive(Clone, Debug)]
pub struct PassOutput {
    pub status: RunStatus,
    pub log_text: String,
}

/// Seam between the scheduler and the external toolchain.
///
/// The production implementation shells out; tests script it.
pub trait Toolchain: Send {
    /// Run one compiler pass (1-based `pass`) and return its log
    fn run_compiler(
        &self,
        request: &CompileRequest,
        pass: u32,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError>;

    /// Run the bibliography tool once
    fn run_bibliography(
        &self,
        request: &CompileRequest,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError>;

    /// Whether the output artifact exists; the authoritative success signal
    fn artifact_exists(&self, request: &CompileRequest) -> bool;
}

/// Real toolchain backed by the configured engine and bibliography binaries
pub struct TexToolchain {
    runner: ProcessRunner,
    bib_tool: String,
}

impl TexToolchain {
    #[must_use]
    pub fn new(bib_tool: impl Into<String>) -> Self {
        Self {
            runner: ProcessRunner::default(),
            bib_tool: bib_tool.into(),
        }
    }
}

impl Toolchain for TexToolchain {
    fn run_compiler(
        &self,
        request: &CompileRequest,
        _pass: u32,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError> {
        let outcome = self.runner.run(
            request.engine.command(),
            &request.engine_args(),
            &request.working_dir,
            timeout,
            cancel,
        )?;
        // The log file next to the source is authoritative; captured output
        // is the fallback when it cannot be read.
        let log_text =
            std::fs::read_to_string(request.log_path()).unwrap_or_else(|_| outcome.output.clone());
        Ok(PassOutput {
            status: outcome.status,
            log_text,
        })
    }

    fn run_bibliography(
        &self,
        request: &CompileRequest,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError> {
        let args = vec![request.base_name()];
        let outcome = self
            .runner
            .run(&self.bib_tool, &args, &request.working_dir, timeout, cancel)?;
        let blg = request.working_dir.join(format!("{}.blg", request.base_name()));
        let log_text = std::fs::read_to_string(blg).unwrap_or_else(|_| outcome.output.clone());
        Ok(PassOutput {
            status: outcome.status,
            log_text,
        })
    }

    fn artifact_exists(&self, request: &CompileRequest) -> bool {
        request.pdf_path().exists()
    }
}
