//! Remote command transport.
//!
//! One request and one response per TCP connection. Both are JSON objects
//! framed with a length prefix:
//!
//! ```text
//! ┌──────────────────┬──────────────────────┐
//! │ Length (4, BE)   │ JSON body (Length)   │
//! └──────────────────┴──────────────────────┘
//! ```
//!
//! A receiver rejects a declared length above its ceiling without reading
//! the body.

mod client;
mod server;
mod wire;

pub use client::{RemoteClient, DEFAULT_MAX_RESPONSE_BYTES};
pub use server::{ServerContext, TransportServer};
pub use wire::{decode_request, decode_response, encode_response, WireAction, WireRequest};

use crate::error::{QvmError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default ceiling on a request body.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Write one framed message.
pub async fn send_message<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(body.len())
        .map_err(|_| QvmError::MessageTooLarge { len: body.len(), limit: u32::MAX as usize })?;

    // Send length prefix (4 bytes, big-endian)
    writer.write_all(&len.to_be_bytes()).await.map_err(QvmError::transport)?;
    writer.write_all(body).await.map_err(QvmError::transport)?;
    writer.flush().await.map_err(QvmError::transport)?;
    Ok(())
}

/// Read one framed message of at most `limit` bytes.
pub async fn recv_message<R>(reader: &mut R, limit: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(QvmError::transport)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > limit {
        return Err(QvmError::MessageTooLarge { len, limit });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(QvmError::transport)?;
    Ok(buf)
}

/// Serialize `value` and write it as one framed message.
pub async fn send_json<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)?;
    send_message(writer, &body).await
}

/// Read one framed message and decode it as JSON.
pub async fn recv_json<R, T>(reader: &mut R, limit: usize) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = recv_message(reader, limit).await?;
    serde_json::from_slice(&body).map_err(|e| QvmError::MalformedMessage { reason: e.to_string() })
}
