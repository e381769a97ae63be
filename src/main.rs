use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{info, warn};
use notify::{RecursiveMode, Watcher};
use simplelog::{Config as LogConfig, LevelFilter, WriteLogger};

use texforge::EngineKind;
use texforge::compile::{
    CompileEvent, CompilePhase, CompileScheduler, CompileStatus, Diagnostic, DocumentSnapshot,
    Severity, TexToolchain, clean_auxiliary_files, tool_available,
};
use texforge::config::Config;

#[derive(Parser)]
#[command(name = "texforge", version, about = "Compile LaTeX sources, once or on every change")]
struct Cli {
    /// Main .tex file
    source: PathBuf,

    /// TeX engine: pdflatex, xelatex or lualatex
    #[arg(long)]
    engine: Option<String>,

    /// Recompile whenever the source file changes on disk
    #[arg(long)]
    watch: bool,

    /// Allow \write18 shell escapes
    #[arg(long)]
    shell_escape: bool,

    /// Compiler passes per attempt
    #[arg(long)]
    passes: Option<u32>,

    /// Remove auxiliary files next to the source and exit
    #[arg(long)]
    clean: bool,
}

fn main() -> Result<()> {
    WriteLogger::init(
        LevelFilter::Debug,
        LogConfig::default(),
        File::create("texforge.log")?,
    )?;

    let cli = Cli::parse();
    info!("starting texforge for {}", cli.source.display());

    if cli.clean {
        clean_auxiliary_files(&cli.source);
        return Ok(());
    }

    let config = Config::load();
    let mut settings = config.compile_settings(&cli.source);
    if let Some(engine) = &cli.engine {
        settings.engine = parse_engine(engine)?;
    }
    if let Some(passes) = cli.passes {
        settings.pass_budget = passes;
    }
    settings.shell_escape = settings.shell_escape || cli.shell_escape;

    if !tool_available(settings.engine.command()) {
        warn!("{} not found on PATH", settings.engine.command());
        eprintln!(
            "warning: {} does not appear to be installed",
            settings.engine.command()
        );
    }

    let toolchain = TexToolchain::new(config.compile.bib_tool.clone());
    let scheduler = CompileScheduler::new(toolchain, settings);

    scheduler.request_compile(read_snapshot(&cli.source)?);

    if cli.watch {
        run_watch(&scheduler, &cli.source)
    } else {
        let status = wait_for_result(&scheduler)?;
        if status != CompileStatus::Success {
            std::process::exit(1);
        }
        Ok(())
    }
}

fn parse_engine(name: &str) -> Result<EngineKind> {
    match name.to_ascii_lowercase().as_str() {
        "pdflatex" => Ok(EngineKind::Pdflatex),
        "xelatex" => Ok(EngineKind::Xelatex),
        "lualatex" => Ok(EngineKind::Lualatex),
        other => bail!("unknown engine {other:?} (expected pdflatex, xelatex or lualatex)"),
    }
}

fn read_snapshot(path: &Path) -> Result<DocumentSnapshot> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    Ok(DocumentSnapshot::new(text))
}

/// Block until the current attempt resolves, echoing progress
fn wait_for_result(scheduler: &CompileScheduler) -> Result<CompileStatus> {
    loop {
        let event = scheduler.events().recv()?;
        if let Some(status) = report_event(&event) {
            return Ok(status);
        }
    }
}

/// Recompile on every on-disk change until interrupted
fn run_watch(scheduler: &CompileScheduler, source: &Path) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    let mut watcher = notify::recommended_watcher(tx)?;
    let dir = source.parent().filter(|p| !p.as_os_str().is_empty());
    watcher.watch(dir.unwrap_or_else(|| Path::new(".")), RecursiveMode::NonRecursive)?;

    println!("watching {} (ctrl-c to stop)", source.display());

    loop {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(Ok(event)) => {
                let touches_source = event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == source.file_name());
                if touches_source && event.kind.is_modify() {
                    match read_snapshot(source) {
                        Ok(snapshot) => scheduler.request_compile(snapshot),
                        Err(e) => warn!("skipping change: {e}"),
                    }
                }
            }
            Ok(Err(e)) => warn!("watch error: {e}"),
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        }

        while let Ok(event) = scheduler.events().try_recv() {
            report_event(&event);
        }
    }
}

/// Print one scheduler event; returns the final status when the attempt
/// resolved.
fn report_event(event: &CompileEvent) -> Option<CompileStatus> {
    match event {
        CompileEvent::StateChanged { phase, .. } => {
            if *phase == CompilePhase::Compiling {
                println!("compiling...");
            }
            None
        }
        CompileEvent::PassStarted { pass, .. } => {
            if *pass > 1 {
                println!("pass {pass}");
            }
            None
        }
        CompileEvent::BibliographyStarted { .. } => {
            println!("running bibliography tool");
            None
        }
        CompileEvent::Finished { result, .. } => {
            for diag in &result.diagnostics {
                print_diagnostic(diag);
            }
            match result.status {
                CompileStatus::Success => {
                    let pdf = result
                        .pdf_path
                        .as_deref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default();
                    println!(
                        "ok: {pdf} ({} pass{})",
                        result.passes_used,
                        if result.passes_used == 1 { "" } else { "es" }
                    );
                }
                CompileStatus::Failure => println!("failed"),
                CompileStatus::Cancelled => println!("cancelled"),
                CompileStatus::TimedOut => println!("timed out"),
            }
            Some(result.status)
        }
    }
}

fn print_diagnostic(diag: &Diagnostic) {
    let severity = match diag.severity {
        Severity::Error => "error",
        Severity::Warning => "warning",
    };
    match (&diag.file, diag.line) {
        (Some(file), Some(line)) => println!("{file}:{line}: {severity}: {}", diag.message),
        (None, Some(line)) => println!("line {line}: {severity}: {}", diag.message),
        _ => println!("{severity}: {}", diag.message),
    }
}
