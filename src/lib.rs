//! Compile-and-preview engine for a LaTeX editor: debounced background
//! compilation with multi-pass/bibliography policy, structured log
//! diagnostics, a byte-budgeted page cache and bidirectional source↔output
//! navigation.

pub mod compile;
pub mod config;
pub mod preview;

pub use compile::{
    CompileEvent, CompilePhase, CompileResult, CompileScheduler, CompileSettings, CompileStatus,
    Diagnostic, DocumentSnapshot, EngineKind, Severity, TexToolchain,
};
pub use config::Config;
pub use preview::{PageStatus, PreviewController};
