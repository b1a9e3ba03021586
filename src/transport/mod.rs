//! Transport layer for host ↔ harness communication.
//!
//! Provides length-prefixed JSON framing over the interpreter child's pipes.
//! The host writes one request to the child's stdin; the harness answers on
//! its duplicated stdout with a stream of events.

pub mod protocol;

pub use protocol::{HarnessEvent, HarnessFaultKind, HarnessRequest};

use anyhow::{Context, Result};

/// Maximum message size (64 MB). Safety valve against malformed messages.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

/// Write a length-prefixed message to a writer.
///
/// Format: [4-byte big-endian length][payload bytes]
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| anyhow::anyhow!("Message too large: {} bytes", payload.len()))?;
    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed message from a reader.
///
/// Returns the raw payload bytes. Enforces `MAX_MESSAGE_SIZE`.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);

    anyhow::ensure!(
        len <= MAX_MESSAGE_SIZE,
        "Message exceeds max size: {len} > {MAX_MESSAGE_SIZE}"
    );

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Serialize a request and send it as one frame.
pub async fn send_request<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    req: &HarnessRequest,
) -> Result<()> {
    let bytes = serde_json::to_vec(req).context("Failed to serialize request")?;
    send_message(writer, &bytes).await
}

/// Read the next event frame.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary,
/// which is how a dying child looks from this side.
pub async fn recv_event<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Option<HarnessEvent>> {
    let bytes = match recv_message(reader).await {
        Ok(bytes) => bytes,
        Err(e) if is_eof(&e) => return Ok(None),
        Err(e) => return Err(e.context("Failed to read harness event")),
    };
    let event = serde_json::from_slice(&bytes).context("Failed to parse harness event")?;
    Ok(Some(event))
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == std::io::ErrorKind::UnexpectedEof)
}
