//! Compile request, result and event types

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Unique identifier for compile attempts.
///
/// Events from a superseded attempt carry a smaller id than the latest one
/// the UI has applied, so stale messages can be discarded.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AttemptId(pub u64);

impl AttemptId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

/// Supported TeX engines
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Pdflatex,
    Xelatex,
    Lualatex,
}

impl EngineKind {
    /// Name of the engine binary
    #[must_use]
    pub fn command(self) -> &'static str {
        match self {
            EngineKind::Pdflatex => "pdflatex",
            EngineKind::Xelatex => "xelatex",
            EngineKind::Lualatex => "lualatex",
        }
    }
}

/// One compile attempt, built from the configuration at debounce expiry.
///
/// Immutable; owned by the in-flight attempt.
#[derive(Clone, Debug)]
pub struct CompileRequest {
    /// Path to the working .tex file (snapshot is written here)
    pub source_path: PathBuf,
    /// Directory the toolchain runs in
    pub working_dir: PathBuf,
    pub engine: EngineKind,
    /// Upper bound on compiler passes for this attempt
    pub pass_budget: u32,
    pub shell_escape: bool,
    /// Ask the engine for a position-mapping side file
    pub synctex: bool,
}

impl CompileRequest {
    /// File stem of the source, used to derive sibling artifact paths
    #[must_use]
    pub fn base_name(&self) -> String {
        self.source_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.sibling("log")
    }

    #[must_use]
    pub fn pdf_path(&self) -> PathBuf {
        self.sibling("pdf")
    }

    /// The side file may be emitted compressed or plain; prefer the
    /// compressed name, which is what the engines produce by default.
    #[must_use]
    pub fn synctex_path(&self) -> PathBuf {
        let gz = self.sibling("synctex.gz");
        if gz.exists() { gz } else { self.sibling("synctex") }
    }

    /// Argument list for one compiler pass
    #[must_use]
    pub fn engine_args(&self) -> Vec<String> {
        let mut args = vec![
            "-interaction=nonstopmode".to_string(),
            "-file-line-error".to_string(),
            "-halt-on-error".to_string(),
        ];
        if self.synctex {
            args.push("-synctex=1".to_string());
        }
        if self.shell_escape {
            args.push("-shell-escape".to_string());
        }
        let file_name = self
            .source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        args.push(file_name);
        args
    }

    fn sibling(&self, ext: &str) -> PathBuf {
        self.working_dir
            .join(format!("{}.{ext}", self.base_name()))
    }
}

/// Diagnostic severity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Severity {
    Error,
    Warning,
}

/// One line-anchored (or anchor-less) message extracted from a compiler log
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Diagnostic {
    pub file: Option<String>,
    /// 1-based line in `file`
    pub line: Option<u32>,
    pub severity: Severity,
    pub message: String,
}

impl Diagnostic {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            severity: Severity::Error,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            file: None,
            line: None,
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    /// Key used for de-duplication across passes
    #[must_use]
    pub fn dedup_key(&self) -> (Option<&str>, Option<u32>, &str) {
        (self.file.as_deref(), self.line, &self.message)
    }
}

/// Terminal status of a compile attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompileStatus {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

/// Outcome of one completed attempt, handed to the UI thread
#[derive(Clone, Debug)]
pub struct CompileResult {
    pub status: CompileStatus,
    /// Working .tex file this attempt compiled
    pub source_path: PathBuf,
    /// Path to the produced document; present only on success
    pub pdf_path: Option<PathBuf>,
    /// Position-mapping side file, when the attempt requested one
    pub synctex_path: Option<PathBuf>,
    /// Log text of the final pass
    pub log_text: String,
    /// Union of diagnostics across passes, de-duplicated, in first-seen order
    pub diagnostics: Vec<Diagnostic>,
    pub passes_used: u32,
}

impl CompileResult {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == CompileStatus::Success
    }
}

/// Scheduler states, exported so the UI can label what is happening
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompilePhase {
    Idle,
    Debouncing,
    Compiling,
    Succeeded,
    Failed,
    Cancelled,
}

/// One-way, ordered messages from the compile worker to the UI thread
#[derive(Clone, Debug)]
pub enum CompileEvent {
    /// The state machine moved
    StateChanged {
        attempt: AttemptId,
        phase: CompilePhase,
    },
    /// A compiler pass started (1-based)
    PassStarted { attempt: AttemptId, pass: u32 },
    /// The bibliography tool started
    BibliographyStarted { attempt: AttemptId },
    /// The attempt resolved; diagnostics are final for this attempt
    Finished {
        attempt: AttemptId,
        result: CompileResult,
    },
}

impl CompileEvent {
    /// Attempt this event belongs to
    #[must_use]
    pub fn attempt(&self) -> AttemptId {
        match self {
            CompileEvent::StateChanged { attempt, .. }
            | CompileEvent::PassStarted { attempt, .. }
            | CompileEvent::BibliographyStarted { attempt }
            | CompileEvent::Finished { attempt, .. } => *attempt,
        }
    }
}

/// Immutable view of the editor buffer handed to `request_compile`
#[derive(Clone, Debug)]
pub struct DocumentSnapshot {
    pub text: String,
}

impl DocumentSnapshot {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn request() -> CompileRequest {
        CompileRequest {
            source_path: PathBuf::from("/tmp/paper/main.tex"),
            working_dir: PathBuf::from("/tmp/paper"),
            engine: EngineKind::Pdflatex,
            pass_budget: 3,
            shell_escape: false,
            synctex: true,
        }
    }

    #[test]
    fn engine_args_include_synctex_and_file_name() {
        let args = request().engine_args();
        assert!(args.contains(&"-synctex=1".to_string()));
        assert!(args.contains(&"-interaction=nonstopmode".to_string()));
        assert_eq!(args.last().unwrap(), "main.tex");
        assert!(!args.contains(&"-shell-escape".to_string()));
    }

    #[test]
    fn shell_escape_is_opt_in() {
        let mut req = request();
        req.shell_escape = true;
        assert!(req.engine_args().contains(&"-shell-escape".to_string()));
    }

    #[test]
    fn sibling_paths_share_the_base_name() {
        let req = request();
        assert_eq!(req.log_path(), Path::new("/tmp/paper/main.log"));
        assert_eq!(req.pdf_path(), Path::new("/tmp/paper/main.pdf"));
    }
}
