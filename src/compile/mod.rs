//! Compilation pipeline: scheduler, process runner, log analysis

mod log_parser;
mod request;
mod runner;
mod scheduler;

pub use log_parser::{LogReport, merge_diagnostics, parse_log, references_bibliography};
pub use request::{
    AttemptId, CompileEvent, CompilePhase, CompileRequest, CompileResult, CompileStatus,
    Diagnostic, DocumentSnapshot, EngineKind, Severity,
};
pub use runner::{
    CancelToken, PassOutput, ProcessRunner, RunOutcome, RunStatus, TexToolchain, ToolError,
    Toolchain, tool_available,
};
pub use scheduler::{CompileScheduler, CompileSettings, SuccessHook, clean_auxiliary_files};
