//! YAML configuration
//!
//! Loaded from `<config dir>/texforge/config.yaml`; every field has a serde
//! default so a partial (or missing) file still yields a usable config. The
//! config is passed by value, never held in a global.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::compile::{CompileSettings, EngineKind};
use crate::preview::{DEFAULT_CACHE_BUDGET, DEFAULT_RENDER_WORKERS};

const CONFIG_FILENAME: &str = "config.yaml";
const APP_NAME: &str = "texforge";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub compile: CompileConfig,

    #[serde(default)]
    pub preview: PreviewConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileConfig {
    #[serde(default)]
    pub engine: EngineKind,

    /// External bibliography tool, invoked as `<bib_tool> <base name>`
    #[serde(default = "default_bib_tool")]
    pub bib_tool: String,

    #[serde(default = "default_pass_budget")]
    pub pass_budget: u32,

    #[serde(default)]
    pub shell_escape: bool,

    #[serde(default = "default_true")]
    pub synctex: bool,

    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_pass_timeout_secs")]
    pub pass_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    #[serde(default = "default_cache_budget")]
    pub cache_budget_bytes: usize,

    #[serde(default = "default_render_workers")]
    pub render_workers: usize,
}

fn default_true() -> bool {
    true
}

fn default_bib_tool() -> String {
    "bibtex".to_string()
}

fn default_pass_budget() -> u32 {
    3
}

fn default_debounce_ms() -> u64 {
    400
}

fn default_pass_timeout_secs() -> u64 {
    30
}

fn default_cache_budget() -> usize {
    DEFAULT_CACHE_BUDGET
}

fn default_render_workers() -> usize {
    DEFAULT_RENDER_WORKERS
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            engine: EngineKind::default(),
            bib_tool: default_bib_tool(),
            pass_budget: default_pass_budget(),
            shell_escape: false,
            synctex: true,
            debounce_ms: default_debounce_ms(),
            pass_timeout_secs: default_pass_timeout_secs(),
        }
    }
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            cache_budget_bytes: default_cache_budget(),
            render_workers: default_render_workers(),
        }
    }
}

impl Config {
    /// Load from the default location; falls back to defaults when the file
    /// is missing or unparseable (a broken config never blocks startup).
    #[must_use]
    pub fn load() -> Self {
        let Some(path) = default_path() else {
            warn!("could not determine config directory, using defaults");
            return Self::default();
        };
        if !path.exists() {
            return Self::default();
        }
        Self::load_from(&path)
    }

    #[must_use]
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str(&content) {
                Ok(config) => {
                    debug!("loaded config from {}", path.display());
                    config
                }
                Err(e) => {
                    error!("failed to parse {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                error!("failed to read {}: {e}", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        let Some(path) = default_path() else {
            return Err(std::io::Error::other("no config directory"));
        };
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self).map_err(std::io::Error::other)?;
        fs::write(path, content)
    }

    /// Compile settings for one source file
    #[must_use]
    pub fn compile_settings(&self, source_path: impl Into<PathBuf>) -> CompileSettings {
        CompileSettings {
            source_path: source_path.into(),
            engine: self.compile.engine,
            pass_budget: self.compile.pass_budget,
            shell_escape: self.compile.shell_escape,
            synctex: self.compile.synctex,
            debounce: Duration::from_millis(self.compile.debounce_ms),
            pass_timeout: Duration::from_secs(self.compile.pass_timeout_secs),
        }
    }
}

fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_NAME).join(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "compile:\n  engine: xelatex\n").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.compile.engine, EngineKind::Xelatex);
        assert_eq!(config.compile.pass_budget, 3);
        assert_eq!(config.compile.bib_tool, "bibtex");
        assert_eq!(config.preview.render_workers, DEFAULT_RENDER_WORKERS);
    }

    #[test]
    fn broken_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, ": not yaml [").unwrap();

        let config = Config::load_from(&path);
        assert_eq!(config.compile.pass_budget, 3);
    }

    #[test]
    fn round_trips_through_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.compile.shell_escape = true;
        config.preview.render_workers = 4;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path);
        assert!(loaded.compile.shell_escape);
        assert_eq!(loaded.preview.render_workers, 4);
    }

    #[test]
    fn settings_carry_timeouts() {
        let config = Config::default();
        let settings = config.compile_settings("main.tex");
        assert_eq!(settings.debounce, Duration::from_millis(400));
        assert_eq!(settings.pass_timeout, Duration::from_secs(30));
        assert!(settings.synctex);
    }
}
