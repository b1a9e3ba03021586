//! Script execution and output capture.
//!
//! The engine reads a submission, hands it to a [`ScriptRunner`] together
//! with a fresh [`PlotSink`], and folds everything the run reported into an
//! [`ExecutionResult`]. It never fails: unreadable files, crashing scripts
//! and misbehaving interpreters all end up in [`ExecutionResult::error`].
//!
//! Runs block until the script finishes. Unless a timeout is configured, a
//! submission that loops forever holds its execution slot forever.

mod capture;
mod subprocess;

pub use capture::{PlotSink, SegmentCollector};
pub use subprocess::SubprocessRunner;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Serialize, Serializer};
use tokio::sync::Semaphore;
use tracing::{debug, info, instrument, warn};

/// A submission read from disk.
#[derive(Debug, Clone)]
pub struct Script {
    pub path: PathBuf,
    pub source: String,
}

impl Script {
    /// File name used in tracebacks.
    pub fn display_name(&self) -> String {
        self.path.file_name().map_or_else(
            || self.path.display().to_string(),
            |name| name.to_string_lossy().into_owned(),
        )
    }
}

/// A captured figure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlotImage {
    mime_type: String,
    bytes: Vec<u8>,
}

impl PlotImage {
    pub const PNG: &'static str = "image/png";

    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Decode a base64 payload as sent by the harness.
    pub fn from_base64(
        mime_type: impl Into<String>,
        encoded: &str,
    ) -> Result<Self, base64::DecodeError> {
        Ok(Self::new(mime_type, BASE64.decode(encoded)?))
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// `data:` URI for embedding the image inline.
    pub fn data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.to_base64())
    }

    /// Whether the payload starts with the PNG signature.
    pub fn is_png(&self) -> bool {
        self.bytes.starts_with(b"\x89PNG\r\n\x1a\n")
    }
}

impl Serialize for PlotImage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            mime_type: &'a str,
            data: String,
        }

        Wire {
            mime_type: &self.mime_type,
            data: self.to_base64(),
        }
        .serialize(serializer)
    }
}

/// Console text printed since the previous plot, paired with the plot that
/// followed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSegment {
    pub text: String,
    /// `None` when the display call happened with no figure open.
    pub image: Option<PlotImage>,
}

/// What went wrong during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// The script file could not be read.
    FileAccess,
    Syntax,
    /// Unhandled exception raised by the script.
    Runtime,
    /// The script called `sys.exit` with a failure status.
    Exit,
    Timeout,
    /// The interpreter could not be started.
    Launch,
    /// The interpreter died without reporting a result.
    Crashed,
    /// The harness sent something the host could not understand.
    Protocol,
}

/// Structured description of a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Fault {
    pub kind: FaultKind,
    /// Exception type name, when the fault came from the script.
    pub exception: Option<String>,
    pub message: String,
    /// Line in the submission where the fault surfaced.
    pub line: Option<u32>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            exception: None,
            message: message.into(),
            line: None,
        }
    }

    #[must_use]
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = Some(exception.into());
        self
    }

    #[must_use]
    pub const fn with_line(mut self, line: Option<u32>) -> Self {
        self.line = line;
        self
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ERROR]: ")?;
        if let Some(exception) = &self.exception {
            write!(f, "{exception}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(line) = self.line {
            write!(f, " (line {line})")?;
        }
        Ok(())
    }
}

/// Everything one run produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    /// Text/plot pairs in the order the plots were shown.
    pub segments: Vec<OutputSegment>,
    /// Trimmed text printed after the last plot.
    ///
    /// Also filled when the run faulted, with whatever was printed between
    /// the last plot and the fault.
    pub trailing_text: String,
    pub error: Option<Fault>,
    /// Whatever the interpreter wrote to stderr (warnings, tracebacks of
    /// subprocesses, ...).
    pub stderr: String,
}

impl ExecutionResult {
    /// Result for a run that failed before anything could execute.
    pub fn from_fault(fault: Fault) -> Self {
        Self {
            error: Some(fault),
            ..Self::default()
        }
    }

    /// Flat diagnostic line for renderers that only show text.
    pub fn error_text(&self) -> Option<String> {
        self.error.as_ref().map(ToString::to_string)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Whether the script called the plot-display operation at least once.
    pub fn has_plots(&self) -> bool {
        !self.segments.is_empty()
    }

    pub fn images(&self) -> impl Iterator<Item = &PlotImage> {
        self.segments.iter().filter_map(|s| s.image.as_ref())
    }
}

/// How a run ended, as reported by a runner that kept contact with the
/// script until the end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Completion {
    /// Untrimmed text printed after the last plot.
    pub trailing: String,
    pub fault: Option<Fault>,
    pub stderr: String,
}

/// Failures of the execution machinery itself, as opposed to the script.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("failed to launch interpreter `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("script did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("interpreter exited without reporting a result ({status})")]
    Crashed { status: String, stderr: String },

    #[error("harness protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RunnerError {
    pub const fn kind(&self) -> FaultKind {
        match self {
            Self::Launch { .. } => FaultKind::Launch,
            Self::Timeout(_) => FaultKind::Timeout,
            Self::Crashed { .. } | Self::Io(_) => FaultKind::Crashed,
            Self::Protocol(_) => FaultKind::Protocol,
        }
    }

    /// Stderr captured before the runner lost the script, if any.
    pub fn stderr(&self) -> &str {
        match self {
            Self::Crashed { stderr, .. } => stderr,
            _ => "",
        }
    }

    /// Fault for the result, with the last stderr line appended when the
    /// interpreter died on its own.
    pub fn to_fault(&self) -> Fault {
        let message = match self.stderr().lines().rev().find(|l| !l.trim().is_empty()) {
            Some(last) => format!("{self}: {}", last.trim()),
            None => self.to_string(),
        };
        Fault::new(self.kind(), message)
    }
}

/// Code-execution primitive driven by the [`Engine`].
///
/// A runner executes the script in a namespace nobody else sees, redirects
/// its console output, and reports every plot-display call to `sink` as it
/// happens. Segments delivered to the sink stay there even if the runner
/// later returns an error.
#[async_trait]
pub trait ScriptRunner: Send + Sync {
    async fn execute(
        &self,
        script: &Script,
        sink: &mut dyn PlotSink,
    ) -> Result<Completion, RunnerError>;
}

/// Runs submissions and collects their output.
///
/// Each run gets its own collector and, with [`SubprocessRunner`], its own
/// interpreter process. The semaphore bounds how many interpreters exist at
/// once; with the default of one slot, runs queue up in arrival order.
pub struct Engine<R> {
    runner: Arc<R>,
    slots: Arc<Semaphore>,
}

impl<R> Clone for Engine<R> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<R: ScriptRunner> Engine<R> {
    /// Engine that runs one script at a time.
    pub fn new(runner: R) -> Self {
        Self::with_max_concurrent(runner, 1)
    }

    pub fn with_max_concurrent(runner: R, max_concurrent: usize) -> Self {
        Self {
            runner: Arc::new(runner),
            slots: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run the script at `path` and capture its output.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn run(&self, path: &Path) -> ExecutionResult {
        let source = match tokio::fs::read_to_string(path).await {
            Ok(source) => source,
            Err(e) => {
                warn!(error = %e, "Cannot read script");
                return ExecutionResult::from_fault(Fault::new(
                    FaultKind::FileAccess,
                    format!("Error reading file {}: {e}", path.display()),
                ));
            }
        };

        let script = Script {
            path: path.to_path_buf(),
            source,
        };

        let Ok(_slot) = self.slots.acquire().await else {
            return ExecutionResult::from_fault(Fault::new(
                FaultKind::Launch,
                "execution slots are closed",
            ));
        };

        let mut collector = SegmentCollector::default();
        let outcome = self.runner.execute(&script, &mut collector).await;
        let segments = collector.into_segments();

        let result = match outcome {
            Ok(completion) => ExecutionResult {
                segments,
                trailing_text: completion.trailing.trim().to_string(),
                error: completion.fault,
                stderr: completion.stderr,
            },
            Err(e) => {
                warn!(error = %e, "Runner lost the script");
                ExecutionResult {
                    segments,
                    trailing_text: String::new(),
                    error: Some(e.to_fault()),
                    stderr: e.stderr().to_string(),
                }
            }
        };

        if !result.has_plots() {
            debug!("Script produced no plots");
        }
        info!(
            segments = result.segments.len(),
            failed = result.error.is_some(),
            "Script run finished"
        );

        result
    }
}
