//! Compile scheduling
//!
//! Owns the compile state machine (`Idle → Debouncing → Compiling →
//! terminal`), the debounce timer, the single-flight guarantee and the
//! multi-pass/bibliography policy. A dedicated worker thread drives the
//! toolchain; everything the UI needs to know flows back through an ordered
//! event channel.

use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use log::{debug, info, warn};

use super::log_parser::{merge_diagnostics, parse_log, references_bibliography};
use super::request::{
    AttemptId, CompileEvent, CompilePhase, CompileRequest, CompileResult, CompileStatus,
    Diagnostic, DocumentSnapshot, EngineKind, Severity,
};
use super::runner::{CancelToken, RunStatus, ToolError, Toolchain};

/// Settings a compile attempt is built from
#[derive(Clone, Debug)]
pub struct CompileSettings {
    /// Working .tex file the snapshot is written to
    pub source_path: PathBuf,
    pub engine: EngineKind,
    /// Upper bound on compiler passes per attempt
    pub pass_budget: u32,
    pub shell_escape: bool,
    /// Request the position-mapping side file
    pub synctex: bool,
    /// Quiet period after the last edit before compiling
    pub debounce: Duration,
    /// Per-pass timeout
    pub pass_timeout: Duration,
}

impl CompileSettings {
    /// Defaults mirroring the common TeX workflow: three passes, generous
    /// per-pass timeout, sync output on.
    #[must_use]
    pub fn for_source(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
            engine: EngineKind::default(),
            pass_budget: 3,
            shell_escape: false,
            synctex: true,
            debounce: Duration::from_millis(400),
            pass_timeout: Duration::from_secs(30),
        }
    }
}

/// Called on the worker thread after a successful attempt, before any
/// completion event is emitted. This is where the preview invalidates its
/// cache and rebuilds the sync index, so observers never pair a success
/// event with stale contents.
pub type SuccessHook = Box<dyn Fn(&CompileResult) + Send>;

enum ControlMsg {
    Request(DocumentSnapshot),
    Cancel,
    UpdateSettings(CompileSettings),
    Shutdown,
}

/// Handle owned by the UI thread
pub struct CompileScheduler {
    control_tx: Sender<ControlMsg>,
    events_rx: Receiver<CompileEvent>,
    cancel: CancelToken,
    worker: Option<JoinHandle<()>>,
}

impl CompileScheduler {
    #[must_use]
    pub fn new(toolchain: impl Toolchain + 'static, settings: CompileSettings) -> Self {
        Self::with_success_hook(toolchain, settings, None)
    }

    #[must_use]
    pub fn with_success_hook(
        toolchain: impl Toolchain + 'static,
        settings: CompileSettings,
        on_success: Option<SuccessHook>,
    ) -> Self {
        let (control_tx, control_rx) = flume::unbounded();
        let (events_tx, events_rx) = flume::unbounded();
        let cancel = CancelToken::new();

        let worker_cancel = cancel.clone();
        let worker = std::thread::spawn(move || {
            Worker {
                toolchain,
                settings,
                control_rx,
                events: events_tx,
                cancel: worker_cancel,
                on_success,
                next_attempt: 1,
                environment_fault: None,
                in_flight: false,
            }
            .run();
        });

        Self {
            control_tx,
            events_rx,
            cancel,
            worker: Some(worker),
        }
    }

    /// Called on every relevant edit. Resets the debounce timer while
    /// debouncing; while compiling, the snapshot is recorded as pending and
    /// honored as soon as the current attempt resolves.
    pub fn request_compile(&self, snapshot: DocumentSnapshot) {
        let _ = self.control_tx.send(ControlMsg::Request(snapshot));
    }

    /// Cooperatively terminate the in-flight attempt (or drop a pending
    /// debounce). The attempt resolves to `Cancelled` before anything else
    /// runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
        let _ = self.control_tx.send(ControlMsg::Cancel);
    }

    /// Replace the settings; also clears an environment-error poisoning so
    /// the next request is attempted again.
    pub fn update_settings(&self, settings: CompileSettings) {
        let _ = self.control_tx.send(ControlMsg::UpdateSettings(settings));
    }

    /// Ordered event stream for the UI thread
    #[must_use]
    pub fn events(&self) -> &Receiver<CompileEvent> {
        &self.events_rx
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.control_tx.send(ControlMsg::Shutdown);
    }
}

impl Drop for CompileScheduler {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

enum Flow {
    Idle,
    Shutdown,
}

struct Worker<T: Toolchain> {
    toolchain: T,
    settings: CompileSettings,
    control_rx: Receiver<ControlMsg>,
    events: Sender<CompileEvent>,
    cancel: CancelToken,
    on_success: Option<SuccessHook>,
    next_attempt: u64,
    /// Set when the toolchain itself is unusable; attempts are refused with
    /// this diagnostic until the settings change.
    environment_fault: Option<Diagnostic>,
    in_flight: bool,
}

impl<T: Toolchain> Worker<T> {
    fn run(mut self) {
        loop {
            let Ok(msg) = self.control_rx.recv() else {
                return;
            };
            match msg {
                ControlMsg::Request(snapshot) => {
                    if matches!(self.serve_burst(snapshot), Flow::Shutdown) {
                        return;
                    }
                }
                ControlMsg::Cancel => self.cancel.reset(),
                ControlMsg::UpdateSettings(settings) => self.apply_settings(settings),
                ControlMsg::Shutdown => return,
            }
        }
    }

    /// Serve one burst of requests: debounce, compile, then honor anything
    /// that queued up mid-compile without a fresh debounce delay.
    fn serve_burst(&mut self, first: DocumentSnapshot) -> Flow {
        let mut next = Some((first, true));

        while let Some((mut snapshot, wants_debounce)) = next.take() {
            let attempt = self.allocate_attempt();

            if wants_debounce {
                self.emit(CompileEvent::StateChanged {
                    attempt,
                    phase: CompilePhase::Debouncing,
                });
                let mut deadline = Instant::now() + self.settings.debounce;
                loop {
                    match self.control_rx.recv_deadline(deadline) {
                        Ok(ControlMsg::Request(s)) => {
                            // coalesce the burst: newest snapshot, timer reset
                            snapshot = s;
                            deadline = Instant::now() + self.settings.debounce;
                        }
                        Ok(ControlMsg::Cancel) => {
                            self.cancel.reset();
                            self.emit(CompileEvent::StateChanged {
                                attempt,
                                phase: CompilePhase::Cancelled,
                            });
                            return Flow::Idle;
                        }
                        Ok(ControlMsg::UpdateSettings(s)) => self.apply_settings(s),
                        Ok(ControlMsg::Shutdown) => return Flow::Shutdown,
                        Err(flume::RecvTimeoutError::Timeout) => break,
                        Err(flume::RecvTimeoutError::Disconnected) => return Flow::Shutdown,
                    }
                }
            }

            self.emit(CompileEvent::StateChanged {
                attempt,
                phase: CompilePhase::Compiling,
            });

            debug_assert!(!self.in_flight, "two compile attempts believed concurrent");
            self.in_flight = true;
            let result = self.run_attempt(attempt, &snapshot);
            self.in_flight = false;

            let phase = match result.status {
                CompileStatus::Success => CompilePhase::Succeeded,
                CompileStatus::Cancelled => CompilePhase::Cancelled,
                CompileStatus::Failure | CompileStatus::TimedOut => CompilePhase::Failed,
            };
            if result.is_success() {
                if let Some(hook) = &self.on_success {
                    hook(&result);
                }
            }
            self.emit(CompileEvent::StateChanged { attempt, phase });
            self.emit(CompileEvent::Finished { attempt, result });
            self.cancel.reset();

            loop {
                match self.control_rx.try_recv() {
                    Ok(ControlMsg::Request(s)) => next = Some((s, false)),
                    // the attempt this cancel targeted has already resolved;
                    // a request queued before it is still honored
                    Ok(ControlMsg::Cancel) => self.cancel.reset(),
                    Ok(ControlMsg::UpdateSettings(s)) => self.apply_settings(s),
                    Ok(ControlMsg::Shutdown) => return Flow::Shutdown,
                    Err(flume::TryRecvError::Empty) => break,
                    Err(flume::TryRecvError::Disconnected) => return Flow::Shutdown,
                }
            }
        }
        Flow::Idle
    }

    fn run_attempt(&mut self, attempt: AttemptId, snapshot: &DocumentSnapshot) -> CompileResult {
        if let Some(diag) = &self.environment_fault {
            warn!("refusing compile: toolchain unavailable");
            return failure(self.settings.source_path.clone(), diag.clone(), String::new(), 0);
        }

        let request = self.build_request();
        info!(
            "attempt {:?}: {} {}",
            attempt,
            request.engine.command(),
            request.source_path.display()
        );

        if let Err(e) = write_snapshot(&request.source_path, &snapshot.text) {
            return failure(
                request.source_path.clone(),
                Diagnostic::error(format!(
                    "cannot write {}: {e}",
                    request.source_path.display()
                )),
                String::new(),
                0,
            );
        }

        let needs_bib = references_bibliography(&snapshot.text);
        let mut diagnostics: Vec<Diagnostic> = Vec::new();
        let mut passes = 0u32;
        let mut bib_done = false;
        let mut last_log = String::new();
        let budget = self.settings.pass_budget.max(1);

        loop {
            if self.cancel.is_cancelled() {
                return cancelled(request.source_path.clone(), last_log, passes);
            }

            passes += 1;
            self.emit(CompileEvent::PassStarted {
                attempt,
                pass: passes,
            });

            let out = match self.toolchain.run_compiler(
                &request,
                passes,
                self.settings.pass_timeout,
                &self.cancel,
            ) {
                Ok(out) => out,
                Err(e) => return self.environment_failure(e, passes),
            };

            let exit_code = match out.status {
                RunStatus::Cancelled => {
                    return cancelled(request.source_path.clone(), out.log_text, passes);
                }
                RunStatus::TimedOut => {
                    let mut result = failure(
                        request.source_path.clone(),
                        Diagnostic::error(format!(
                            "pass {passes} timed out after {}s",
                            self.settings.pass_timeout.as_secs()
                        )),
                        out.log_text,
                        passes,
                    );
                    result.status = CompileStatus::TimedOut;
                    return result;
                }
                RunStatus::Exited(code) => code,
            };

            last_log = out.log_text;
            let report = parse_log(&last_log);
            merge_diagnostics(&mut diagnostics, report.diagnostics);

            let has_errors = diagnostics.iter().any(|d| d.severity == Severity::Error);
            if exit_code != 0 || has_errors {
                if diagnostics.is_empty() {
                    diagnostics.push(Diagnostic::error(format!(
                        "compiler exited with status {exit_code}"
                    )));
                }
                return CompileResult {
                    status: CompileStatus::Failure,
                    source_path: request.source_path.clone(),
                    pdf_path: None,
                    synctex_path: None,
                    log_text: last_log,
                    diagnostics,
                    passes_used: passes,
                };
            }

            let mut rerun = report.needs_rerun;

            if needs_bib && !bib_done {
                bib_done = true;
                self.emit(CompileEvent::BibliographyStarted { attempt });
                match self.toolchain.run_bibliography(
                    &request,
                    self.settings.pass_timeout,
                    &self.cancel,
                ) {
                    Ok(bib) => match bib.status {
                        RunStatus::Cancelled => {
                            return cancelled(request.source_path.clone(), last_log, passes);
                        }
                        RunStatus::TimedOut => {
                            let mut result = failure(
                                request.source_path.clone(),
                                Diagnostic::error("bibliography tool timed out"),
                                last_log,
                                passes,
                            );
                            result.status = CompileStatus::TimedOut;
                            return result;
                        }
                        // Citations changed by construction; the next pass
                        // runs regardless of the previous log.
                        RunStatus::Exited(0) => rerun = true,
                        RunStatus::Exited(code) => {
                            diagnostics.push(Diagnostic::error(format!(
                                "bibliography tool failed (exit status {code})"
                            )));
                            return CompileResult {
                                status: CompileStatus::Failure,
                                source_path: request.source_path.clone(),
                                pdf_path: None,
                                synctex_path: None,
                                log_text: last_log,
                                diagnostics,
                                passes_used: passes,
                            };
                        }
                    },
                    Err(e) => return self.environment_failure(e, passes),
                }
            }

            if !rerun || passes >= budget {
                break;
            }
        }

        if !self.toolchain.artifact_exists(&request) {
            diagnostics.push(Diagnostic::error("compilation produced no output document"));
            return CompileResult {
                status: CompileStatus::Failure,
                source_path: request.source_path.clone(),
                pdf_path: None,
                synctex_path: None,
                log_text: last_log,
                diagnostics,
                passes_used: passes,
            };
        }

        CompileResult {
            status: CompileStatus::Success,
            pdf_path: Some(request.pdf_path()),
            synctex_path: request.synctex.then(|| request.synctex_path()),
            source_path: request.source_path,
            log_text: last_log,
            diagnostics,
            passes_used: passes,
        }
    }

    fn environment_failure(&mut self, error: ToolError, passes: u32) -> CompileResult {
        let diag = Diagnostic::error(format!("{error}; check the toolchain configuration"));
        // a missing or unlaunchable tool will not change until the
        // configuration does; refuse further attempts
        self.environment_fault = Some(diag.clone());
        failure(self.settings.source_path.clone(), diag, String::new(), passes)
    }

    fn build_request(&self) -> CompileRequest {
        let working_dir = self
            .settings
            .source_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        CompileRequest {
            source_path: self.settings.source_path.clone(),
            working_dir,
            engine: self.settings.engine,
            pass_budget: self.settings.pass_budget,
            shell_escape: self.settings.shell_escape,
            synctex: self.settings.synctex,
        }
    }

    fn apply_settings(&mut self, settings: CompileSettings) {
        debug!("compile settings updated");
        self.settings = settings;
        self.environment_fault = None;
    }

    fn allocate_attempt(&mut self) -> AttemptId {
        let id = AttemptId::new(self.next_attempt);
        self.next_attempt += 1;
        id
    }

    fn emit(&self, event: CompileEvent) {
        let _ = self.events.send(event);
    }
}

fn failure(
    source_path: PathBuf,
    diagnostic: Diagnostic,
    log_text: String,
    passes: u32,
) -> CompileResult {
    CompileResult {
        status: CompileStatus::Failure,
        source_path,
        pdf_path: None,
        synctex_path: None,
        log_text,
        diagnostics: vec![diagnostic],
        passes_used: passes,
    }
}

fn cancelled(source_path: PathBuf, log_text: String, passes: u32) -> CompileResult {
    CompileResult {
        status: CompileStatus::Cancelled,
        source_path,
        pdf_path: None,
        synctex_path: None,
        log_text,
        diagnostics: Vec::new(),
        passes_used: passes,
    }
}

/// Write the snapshot to the working file, skipping the write when the
/// on-disk content already matches (keeps file watchers quiet).
fn write_snapshot(path: &Path, text: &str) -> std::io::Result<()> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == text {
            return Ok(());
        }
    }
    std::fs::write(path, text)
}

/// Auxiliary files the toolchain litters next to the source; removed by the
/// editor's "clean" action.
const AUX_EXTENSIONS: &[&str] = &[
    "aux",
    "log",
    "toc",
    "lof",
    "lot",
    "bbl",
    "blg",
    "out",
    "nav",
    "snm",
    "synctex.gz",
    "fls",
    "fdb_latexmk",
    "dvi",
];

/// Remove auxiliary files generated for `source_path`. Missing files are not
/// an error.
pub fn clean_auxiliary_files(source_path: &Path) {
    let Some(stem) = source_path.file_stem() else {
        return;
    };
    let dir = source_path.parent().unwrap_or_else(|| Path::new("."));
    for ext in AUX_EXTENSIONS {
        let path = dir.join(format!("{}.{ext}", stem.to_string_lossy()));
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                debug!("could not remove {}: {e}", path.display());
            }
        }
    }
}
