//! Configuration for the grader.
//!
//! Read from the JSON file named by `SCRIPTGRADE_CONFIG` when set; every
//! field has a default, so running without a config file works. A few
//! environment variables override the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info, warn};

/// Names of the environment variables consulted by [`Config::load`].
pub const CONFIG_ENV: &str = "SCRIPTGRADE_CONFIG";
pub const PYTHON_ENV: &str = "SCRIPTGRADE_PYTHON";
pub const TIMEOUT_ENV: &str = "SCRIPTGRADE_TIMEOUT";
pub const COURSE_DIR_ENV: &str = "SCRIPTGRADE_COURSE_DIR";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// How submissions are executed.
    #[serde(default)]
    pub interpreter: InterpreterConfig,

    /// Upper bound on interpreter processes running at the same time.
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,

    /// Where submissions and reference solutions live.
    #[serde(default)]
    pub course: CourseConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interpreter: InterpreterConfig::default(),
            max_concurrent_runs: default_max_concurrent_runs(),
            course: CourseConfig::default(),
        }
    }
}

/// Interpreter used to run submissions.
#[derive(Debug, Clone, Deserialize)]
pub struct InterpreterConfig {
    /// Program to spawn (looked up on `PATH` if not absolute).
    #[serde(default = "default_program")]
    pub program: String,

    /// Extra arguments placed before the harness.
    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the interpreter.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Kill a run after this many seconds. Unset or 0 means no limit, in
    /// which case a script that never terminates blocks its caller.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Start the interpreter in the script's directory so relative data
    /// files resolve.
    #[serde(default = "default_true")]
    pub run_in_script_dir: bool,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            args: Vec::new(),
            env: HashMap::new(),
            timeout_seconds: None,
            run_in_script_dir: true,
        }
    }
}

impl InterpreterConfig {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }
}

/// Course folder layout.
#[derive(Debug, Clone, Deserialize)]
pub struct CourseConfig {
    /// Base directory the other two paths are resolved against.
    #[serde(default = "default_course_root")]
    pub root: PathBuf,

    /// Folder with student submissions (`<student>_A<n>.py`, ...).
    #[serde(default = "default_submissions")]
    pub submissions: PathBuf,

    /// Folder with reference solutions.
    #[serde(default = "default_solutions")]
    pub solutions: PathBuf,
}

impl Default for CourseConfig {
    fn default() -> Self {
        Self {
            root: default_course_root(),
            submissions: default_submissions(),
            solutions: default_solutions(),
        }
    }
}

impl CourseConfig {
    pub fn submissions_dir(&self) -> PathBuf {
        resolve(&self.root, &self.submissions)
    }

    pub fn solutions_dir(&self) -> PathBuf {
        resolve(&self.root, &self.solutions)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

impl Config {
    /// Load the configuration file (if any) and apply environment overrides.
    ///
    /// Priority: env vars > config file > defaults.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => {
                debug!("{CONFIG_ENV} not set, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Parse a JSON config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        info!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    /// Apply overrides looked up through `lookup` (the process environment in
    /// production).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(program) = lookup(PYTHON_ENV).filter(|p| !p.is_empty()) {
            self.interpreter.program = program;
        }

        if let Some(raw) = lookup(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.interpreter.timeout_seconds = Some(secs),
                Err(e) => warn!(value = %raw, error = %e, "Ignoring invalid {TIMEOUT_ENV}"),
            }
        }

        if let Some(dir) = lookup(COURSE_DIR_ENV).filter(|d| !d.is_empty()) {
            self.course.root = PathBuf::from(dir);
        }
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }
}

fn default_program() -> String {
    "python3".into()
}

fn default_course_root() -> PathBuf {
    ".".into()
}

fn default_submissions() -> PathBuf {
    "uebungen".into()
}

fn default_solutions() -> PathBuf {
    "musterloesung".into()
}

const fn default_max_concurrent_runs() -> usize {
    1
}

const fn default_true() -> bool {
    true
}
