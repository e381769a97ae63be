//! Scheduler scenarios driven through a scripted toolchain

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use texforge::compile::{
    CancelToken, CompileEvent, CompilePhase, CompileRequest, CompileResult, CompileScheduler,
    CompileSettings, CompileStatus, DocumentSnapshot, PassOutput, RunStatus, SuccessHook,
    ToolError, Toolchain,
};
use texforge::preview::{
    PageKey, PageRenderer, PageSurface, PreviewController, RenderBackend, RenderFault, SyncNode,
    SyncNodeSource, SyncParseError,
};

const CLEAN_LOG: &str = "Output written on main.pdf (1 page).\n";
const RERUN_LOG: &str = "LaTeX Warning: Label(s) may have changed. Rerun to get cross-references right.\n";

#[derive(Clone, Debug, PartialEq)]
enum Call {
    Compile { pass: u32, text: String },
    Bibliography,
}

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<PassOutput>>,
    busy: AtomicUsize,
    overlapped: AtomicBool,
    tool_missing: AtomicBool,
    tool_broken: AtomicBool,
}

/// Scripted toolchain: compiler passes pop pre-arranged outputs (falling
/// back to a clean log) and every invocation is recorded.
#[derive(Clone)]
struct FakeToolchain {
    shared: Arc<Shared>,
    /// Simulated duration of one compiler pass
    delay: Duration,
}

impl FakeToolchain {
    fn with_delay(delay: Duration) -> (Self, Arc<Shared>) {
        let shared = Arc::new(Shared::default());
        (
            Self {
                shared: Arc::clone(&shared),
                delay,
            },
            shared,
        )
    }
}

impl Shared {
    fn push_pass(&self, status: RunStatus, log: &str) {
        self.script
            .lock()
            .unwrap()
            .push_back(PassOutput {
                status,
                log_text: log.to_string(),
            });
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn compile_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Compile { .. }))
            .count()
    }
}

impl Toolchain for FakeToolchain {
    fn run_compiler(
        &self,
        request: &CompileRequest,
        pass: u32,
        _timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError> {
        if self.shared.tool_missing.load(Ordering::SeqCst) {
            return Err(ToolError::NotFound(request.engine.command().to_string()));
        }
        if self.shared.tool_broken.load(Ordering::SeqCst) {
            return Err(ToolError::Spawn {
                tool: request.engine.command().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            });
        }

        if self.shared.busy.fetch_add(1, Ordering::SeqCst) > 0 {
            self.shared.overlapped.store(true, Ordering::SeqCst);
        }

        let text = std::fs::read_to_string(&request.source_path).unwrap_or_default();
        self.shared
            .calls
            .lock()
            .unwrap()
            .push(Call::Compile { pass, text });

        let deadline = Instant::now() + self.delay;
        let mut cancelled = false;
        while Instant::now() < deadline {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        self.shared.busy.fetch_sub(1, Ordering::SeqCst);

        if cancelled {
            return Ok(PassOutput {
                status: RunStatus::Cancelled,
                log_text: String::new(),
            });
        }
        Ok(self
            .shared
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PassOutput {
                status: RunStatus::Exited(0),
                log_text: CLEAN_LOG.to_string(),
            }))
    }

    fn run_bibliography(
        &self,
        _request: &CompileRequest,
        _timeout: Duration,
        _cancel: &CancelToken,
    ) -> Result<PassOutput, ToolError> {
        self.shared.calls.lock().unwrap().push(Call::Bibliography);
        Ok(PassOutput {
            status: RunStatus::Exited(0),
            log_text: String::new(),
        })
    }

    fn artifact_exists(&self, _request: &CompileRequest) -> bool {
        true
    }
}

struct Fixture {
    scheduler: CompileScheduler,
    shared: Arc<Shared>,
    source: PathBuf,
    _dir: tempfile::TempDir,
}

fn fixture() -> Fixture {
    fixture_with_delay(Duration::ZERO)
}

fn fixture_with_delay(delay: Duration) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.tex");
    let (toolchain, shared) = FakeToolchain::with_delay(delay);
    let scheduler = CompileScheduler::new(toolchain, quick_settings(&source));
    Fixture {
        scheduler,
        shared,
        source,
        _dir: dir,
    }
}

fn quick_settings(source: &PathBuf) -> CompileSettings {
    let mut settings = CompileSettings::for_source(source);
    settings.debounce = Duration::from_millis(25);
    settings.pass_timeout = Duration::from_secs(5);
    settings
}

fn wait_finished(scheduler: &CompileScheduler) -> CompileResult {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("attempt never finished");
        match scheduler.events().recv_timeout(remaining) {
            Ok(CompileEvent::Finished { result, .. }) => return result,
            Ok(_) => {}
            Err(e) => panic!("event channel failed: {e}"),
        }
    }
}

fn wait_phase(scheduler: &CompileScheduler, wanted: CompilePhase) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("phase never reached");
        match scheduler.events().recv_timeout(remaining) {
            Ok(CompileEvent::StateChanged { phase, .. }) if phase == wanted => return,
            Ok(_) => {}
            Err(e) => panic!("event channel failed: {e}"),
        }
    }
}

#[test]
fn plain_source_compiles_in_one_pass() {
    let fx = fixture();
    fx.scheduler
        .request_compile(DocumentSnapshot::new("\\documentclass{article}"));

    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.passes_used, 1);
    assert!(result.pdf_path.is_some());
    assert_eq!(fx.shared.compile_count(), 1);
}

#[test]
fn rapid_requests_coalesce_into_one_attempt_with_latest_snapshot() {
    let fx = fixture();
    for i in 0..5 {
        fx.scheduler
            .request_compile(DocumentSnapshot::new(format!("draft {i}")));
        std::thread::sleep(Duration::from_millis(3));
    }

    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(fx.shared.compile_count(), 1);
    assert_eq!(
        fx.shared.calls(),
        vec![Call::Compile {
            pass: 1,
            text: "draft 4".to_string()
        }]
    );

    // no second attempt sneaks in afterwards
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(fx.shared.compile_count(), 1);
}

#[test]
fn persistent_rerun_signal_stops_at_the_pass_budget() {
    let fx = fixture();
    for _ in 0..10 {
        fx.shared.push_pass(RunStatus::Exited(0), RERUN_LOG);
    }

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);

    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.passes_used, 3);
    assert_eq!(fx.shared.compile_count(), 3);
}

#[test]
fn rerun_signal_clearing_stops_early() {
    let fx = fixture();
    fx.shared.push_pass(RunStatus::Exited(0), RERUN_LOG);
    fx.shared.push_pass(RunStatus::Exited(0), CLEAN_LOG);

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);

    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.passes_used, 2);
}

#[test]
fn bibliography_runs_once_between_first_and_second_pass() {
    let fx = fixture();
    fx.shared.push_pass(
        RunStatus::Exited(0),
        "Rerun to get citations correct\n",
    );
    fx.shared.push_pass(RunStatus::Exited(0), RERUN_LOG);
    fx.shared.push_pass(RunStatus::Exited(0), CLEAN_LOG);

    let source = "\\documentclass{article}\n\\bibliography{refs}\n";
    fx.scheduler.request_compile(DocumentSnapshot::new(source));
    let result = wait_finished(&fx.scheduler);

    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(result.passes_used, 3);
    let calls = fx.shared.calls();
    assert_eq!(calls.len(), 4);
    assert!(matches!(calls[0], Call::Compile { pass: 1, .. }));
    assert_eq!(calls[1], Call::Bibliography);
    assert!(matches!(calls[2], Call::Compile { pass: 2, .. }));
    assert!(matches!(calls[3], Call::Compile { pass: 3, .. }));
}

#[test]
fn error_diagnostics_fail_the_attempt_without_further_passes() {
    let fx = fixture();
    fx.shared.push_pass(
        RunStatus::Exited(1),
        "./main.tex:4: Undefined control sequence.\n",
    );

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);

    assert_eq!(result.status, CompileStatus::Failure);
    assert_eq!(result.passes_used, 1);
    assert!(result.pdf_path.is_none());
    assert_eq!(result.diagnostics.len(), 1);
    assert_eq!(result.diagnostics[0].line, Some(4));
    assert_eq!(fx.shared.compile_count(), 1);
}

#[test]
fn timed_out_pass_reports_timed_out() {
    let fx = fixture();
    fx.shared.push_pass(RunStatus::TimedOut, "");

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::TimedOut);
}

#[test]
fn cancel_mid_compile_resolves_cancelled_then_honors_the_next_request() {
    let fx = fixture_with_delay(Duration::from_millis(300));

    fx.scheduler.request_compile(DocumentSnapshot::new("first"));
    wait_phase(&fx.scheduler, CompilePhase::Compiling);
    fx.scheduler.cancel();

    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Cancelled);

    fx.scheduler
        .request_compile(DocumentSnapshot::new("second"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Success);
    // the retry compiled the new snapshot
    let calls = fx.shared.calls();
    let Some(Call::Compile { text, .. }) = calls.last() else {
        panic!("expected a compile call");
    };
    assert_eq!(text, "second");
}

#[test]
fn request_queued_before_a_cancel_is_still_honored() {
    let fx = fixture_with_delay(Duration::from_millis(300));

    fx.scheduler.request_compile(DocumentSnapshot::new("first"));
    wait_phase(&fx.scheduler, CompilePhase::Compiling);
    fx.scheduler
        .request_compile(DocumentSnapshot::new("second"));
    fx.scheduler.cancel();

    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Cancelled);

    // the snapshot that queued up before the cancel still compiles
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Success);
    let calls = fx.shared.calls();
    let Some(Call::Compile { text, .. }) = calls.last() else {
        panic!("expected a compile call");
    };
    assert_eq!(text, "second");
}

#[test]
fn missing_tool_poisons_until_settings_change() {
    let fx = fixture();
    fx.shared.tool_missing.store(true, Ordering::SeqCst);

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Failure);
    assert!(result.diagnostics[0].message.contains("not found"));

    // the binary appears, but no config change happened: still refused
    fx.shared.tool_missing.store(false, Ordering::SeqCst);
    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Failure);
    assert_eq!(fx.shared.compile_count(), 0);

    fx.scheduler.update_settings(quick_settings(&fx.source));
    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Success);
    assert_eq!(fx.shared.compile_count(), 1);
}

#[test]
fn unlaunchable_tool_poisons_until_settings_change() {
    let fx = fixture();
    fx.shared.tool_broken.store(true, Ordering::SeqCst);

    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    let result = wait_finished(&fx.scheduler);
    assert_eq!(result.status, CompileStatus::Failure);
    assert!(result.diagnostics[0].message.contains("failed to launch"));

    // the permissions get fixed, but no config change happened: still refused
    fx.shared.tool_broken.store(false, Ordering::SeqCst);
    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    assert_eq!(wait_finished(&fx.scheduler).status, CompileStatus::Failure);
    assert_eq!(fx.shared.compile_count(), 0);

    fx.scheduler.update_settings(quick_settings(&fx.source));
    fx.scheduler.request_compile(DocumentSnapshot::new("x"));
    assert_eq!(wait_finished(&fx.scheduler).status, CompileStatus::Success);
    assert_eq!(fx.shared.compile_count(), 1);
}

#[test]
fn success_hook_applies_the_result_before_success_is_announced() {
    struct StubRenderer;
    impl PageRenderer for StubRenderer {
        fn page_count(&self) -> usize {
            1
        }
        fn render(&self, _key: &PageKey) -> Result<PageSurface, RenderFault> {
            Ok(PageSurface {
                width_px: 1,
                height_px: 1,
                pixels: vec![0; 3],
            })
        }
    }
    struct StubBackend;
    impl RenderBackend for StubBackend {
        fn open(&self, _path: &Path) -> Result<Arc<dyn PageRenderer>, RenderFault> {
            Ok(Arc::new(StubRenderer))
        }
    }
    struct NoSync;
    impl SyncNodeSource for NoSync {
        fn load(&self, _sync: &Path, _source: &Path) -> Result<Vec<SyncNode>, SyncParseError> {
            Ok(Vec::new())
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("main.tex");
    let (toolchain, _shared) = FakeToolchain::with_delay(Duration::ZERO);

    let preview = Arc::new(Mutex::new(PreviewController::with_config(
        Box::new(StubBackend),
        Box::new(NoSync),
        1,
        1 << 20,
    )));
    let applied = Arc::new(AtomicUsize::new(0));

    let hook_preview = Arc::clone(&preview);
    let hook_applied = Arc::clone(&applied);
    let hook: SuccessHook = Box::new(move |result: &CompileResult| {
        hook_preview
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .document_compiled(result);
        hook_applied.fetch_add(1, Ordering::SeqCst);
    });

    let scheduler =
        CompileScheduler::with_success_hook(toolchain, quick_settings(&source), Some(hook));
    scheduler.request_compile(DocumentSnapshot::new("\\documentclass{article}"));

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("attempt never succeeded");
        match scheduler.events().recv_timeout(remaining) {
            Ok(CompileEvent::StateChanged {
                phase: CompilePhase::Succeeded,
                ..
            }) => {
                // the preview applied the result before success was announced
                assert_eq!(applied.load(Ordering::SeqCst), 1);
                let preview = preview.lock().unwrap();
                assert_eq!(preview.page_count(), Some(1));
                break;
            }
            Ok(_) => {}
            Err(e) => panic!("event channel failed: {e}"),
        }
    }
}

#[test]
fn attempts_never_overlap() {
    let fx = fixture_with_delay(Duration::from_millis(40));

    // requests landing mid-compile queue up as pending attempts
    for i in 0..6 {
        fx.scheduler
            .request_compile(DocumentSnapshot::new(format!("rev {i}")));
        std::thread::sleep(Duration::from_millis(20));
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let mut finished = 0;
    while Instant::now() < deadline {
        match fx
            .scheduler
            .events()
            .recv_timeout(Duration::from_millis(200))
        {
            Ok(CompileEvent::Finished { .. }) => finished += 1,
            Ok(_) => {}
            Err(_) => break,
        }
    }

    assert!(finished >= 1);
    assert!(!fx.shared.overlapped.load(Ordering::SeqCst));
}

#[test]
fn events_carry_monotonic_attempt_ids() {
    let fx = fixture();
    fx.scheduler.request_compile(DocumentSnapshot::new("a"));
    wait_finished(&fx.scheduler);
    fx.scheduler.request_compile(DocumentSnapshot::new("b"));
    wait_finished(&fx.scheduler);

    fx.scheduler.request_compile(DocumentSnapshot::new("c"));
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut last = None;
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("attempt never finished");
        match fx.scheduler.events().recv_timeout(remaining) {
            Ok(event) => {
                if let Some(prev) = last {
                    assert!(event.attempt() >= prev);
                }
                let done = matches!(event, CompileEvent::Finished { .. });
                last = Some(event.attempt());
                if done {
                    break;
                }
            }
            Err(e) => panic!("event channel failed: {e}"),
        }
    }
}
