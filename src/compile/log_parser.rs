//! Compiler log analysis
//!
//! Turns the line-oriented log of a TeX pass into structured diagnostics and
//! a "needs another pass" signal. Parsing is pure: the same log text always
//! yields the same report.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use super::request::{Diagnostic, Severity};

static FILE_LINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^([^:\n]+?\.\w+):(\d+):\s*(.+?)\s*$").expect("file:line regex")
});

static WARNING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^(?:LaTeX|Package \S+|Class \S+) Warning:\s*(.+?)\s*$")
        .expect("warning regex")
});

static WARNING_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"on (?:input )?line (\d+)").expect("warning line regex"));

static BADBOX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^((?:Overfull|Underfull) \\[hv]box .*?) at lines? (\d+)")
        .expect("badbox regex")
});

static ERROR_LINE_NO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^l\.(\d+)").expect("l.<num> regex"));

/// Phrases the engine prints when a later pass would change the output
const RERUN_PHRASES: &[&str] = &[
    "Rerun to get cross-references right",
    "Rerun to get bibliographical references right",
    "Rerun to get citations correct",
    "Rerun LaTeX",
    "Please rerun LaTeX",
    "Label(s) may have changed",
    "There were undefined references",
];

/// Source directives that require a bibliography tool run
const BIB_DIRECTIVES: &[&str] = &[
    "\\bibliography{",
    "\\addbibresource{",
    "\\begin{thebibliography}",
    "\\printbibliography",
];

/// Structured result of analyzing one pass's log text
#[derive(Clone, Debug, Default)]
pub struct LogReport {
    pub diagnostics: Vec<Diagnostic>,
    pub needs_rerun: bool,
}

/// Parse one pass's log into diagnostics plus the rerun signal.
///
/// Extraction order: `file:line: message` lines first, then `!` error
/// blocks (scanning ahead for an `l.<num>` anchor), then known warning
/// templates. Duplicates collapse by (file, line, message).
#[must_use]
pub fn parse_log(log_text: &str) -> LogReport {
    let mut report = LogReport {
        diagnostics: Vec::new(),
        needs_rerun: RERUN_PHRASES.iter().any(|p| log_text.contains(p)),
    };
    let mut seen: HashSet<(Option<String>, Option<u32>, String)> = HashSet::new();

    let mut push = |report: &mut LogReport, diag: Diagnostic| {
        let key = (diag.file.clone(), diag.line, diag.message.clone());
        if seen.insert(key) {
            report.diagnostics.push(diag);
        }
    };

    for caps in FILE_LINE_RE.captures_iter(log_text) {
        let message = caps[3].to_string();
        // `-file-line-error` renders errors this way; warnings never do
        push(
            &mut report,
            Diagnostic {
                file: Some(caps[1].to_string()),
                line: caps[2].parse().ok(),
                severity: Severity::Error,
                message,
            },
        );
    }

    let lines: Vec<&str> = log_text.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let Some(rest) = line.strip_prefix('!') else {
            continue;
        };
        let message = rest.trim();
        let message = if message.is_empty() {
            "see log for details".to_string()
        } else {
            message.to_string()
        };
        // the offending source line, if TeX echoed it, follows shortly after
        let anchor = lines[i + 1..]
            .iter()
            .take(6)
            .find_map(|l| ERROR_LINE_NO_RE.captures(l))
            .and_then(|c| c[1].parse().ok());
        push(
            &mut report,
            Diagnostic {
                file: None,
                line: anchor,
                severity: Severity::Error,
                message,
            },
        );
    }

    for caps in WARNING_RE.captures_iter(log_text) {
        let mut diag = Diagnostic::warning(caps[1].to_string());
        diag.line = WARNING_LINE_RE
            .captures(&diag.message)
            .and_then(|c| c[1].parse().ok());
        push(&mut report, diag);
    }

    for caps in BADBOX_RE.captures_iter(log_text) {
        let mut diag = Diagnostic::warning(caps[1].to_string());
        diag.line = caps[2].parse().ok();
        push(&mut report, diag);
    }

    report
}

/// True when the source references a bibliography and the bibliography tool
/// should run after the first pass.
#[must_use]
pub fn references_bibliography(source: &str) -> bool {
    BIB_DIRECTIVES.iter().any(|d| source.contains(d))
}

/// Merge a pass's diagnostics into the attempt-wide union, preserving
/// first-seen order and dropping duplicates.
pub fn merge_diagnostics(into: &mut Vec<Diagnostic>, pass: Vec<Diagnostic>) {
    for diag in pass {
        if !into.iter().any(|d| d.dedup_key() == diag.dedup_key()) {
            into.push(diag);
        }
    }
}
