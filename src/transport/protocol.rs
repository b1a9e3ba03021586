//! Harness protocol message types.
//!
//! Length-prefixed JSON protocol between the host and the bootstrap harness
//! running inside the interpreter process.
//! Messages are framed as: [4-byte BE length][JSON payload]

use serde::{Deserialize, Serialize};

/// Request sent from host to harness on the child's stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarnessRequest {
    /// Execute one script in a fresh namespace.
    Execute {
        id: String,
        /// Name reported in tracebacks.
        filename: String,
        /// Absolute script path, bound to `__file__`.
        path: String,
        code: String,
    },
}

/// Event sent from harness to host on the private event channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HarnessEvent {
    /// Harness is up and has installed its plot sink.
    Ready {
        python: String,
        /// matplotlib version, absent when the library cannot be imported.
        #[serde(default)]
        matplotlib: Option<String>,
    },
    /// The script called the plot-display operation.
    Segment {
        text: String,
        /// Base64 image payload, absent when no figure was open.
        #[serde(default)]
        image: Option<String>,
        #[serde(default)]
        mime_type: Option<String>,
    },
    /// The script ran to completion.
    Finished { trailing: String },
    /// The script raised and nothing caught it.
    Fault {
        kind: HarnessFaultKind,
        exception: String,
        message: String,
        #[serde(default)]
        line: Option<u32>,
        trailing: String,
    },
}

/// Fault categories the harness can distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarnessFaultKind {
    Syntax,
    Runtime,
    Exit,
    /// The harness itself could not read or decode the request.
    Protocol,
}
