//! Binary wire codec and length-prefixed framing.
//!
//! Records use a fixed little-endian layout:
//!
//! ```text
//! Operation       := u8 kind | u32 key_len | key | u32 value_len | value
//! OpResult        := u8 status | u32 message_len | message
//! BatchedRequest  := u32 count | count * Operation
//! BatchedResponse := u32 count | count * OpResult
//! ```
//!
//! On the socket each payload is preceded by a `u32` little-endian length
//! header, in both directions.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::HEADER_SIZE;
use crate::protocol::{
    BatchedRequest, BatchedResponse, OpResult, Operation, OperationKind, ResultStatus,
};

/// Decoding failure on truncated or malformed input. Every claimed length is
/// validated against the remaining input before any allocation, so
/// adversarial payloads fail fast instead of panicking or ballooning memory.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated input: needed {needed} more bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("{0} trailing bytes after record")]
    TrailingBytes(usize),
}

/// Record types that can cross the wire.
pub trait Wire: Sized {
    /// Appends the encoded record to `buf`. Never fails and never mutates
    /// the record.
    fn encode(&self, buf: &mut BytesMut);

    /// Decodes one record from the front of `buf`, advancing it.
    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Decodes a record that must span the entire input.
    fn decode_exact(mut buf: &[u8]) -> Result<Self, DecodeError> {
        let record = Self::decode(&mut buf)?;
        if !buf.is_empty() {
            return Err(DecodeError::TrailingBytes(buf.len()));
        }
        Ok(record)
    }
}

fn take_u8(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    if buf.remaining() < 1 {
        return Err(DecodeError::Truncated {
            needed: 1,
            remaining: 0,
        });
    }
    Ok(buf.get_u8())
}

fn take_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4 - buf.remaining(),
            remaining: buf.remaining(),
        });
    }
    Ok(buf.get_u32_le())
}

fn take_bytes(buf: &mut &[u8]) -> Result<Vec<u8>, DecodeError> {
    let len = take_u32(buf)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: len - buf.remaining(),
            remaining: buf.remaining(),
        });
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32_le(bytes.len() as u32);
    buf.put_slice(bytes);
}

impl Wire for Operation {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(1 + 2 * 4 + self.key.len() + self.value.len());
        buf.put_u8(self.kind.0);
        put_bytes(buf, &self.key);
        put_bytes(buf, &self.value);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let kind = OperationKind(take_u8(buf)?);
        let key = take_bytes(buf)?;
        let value = take_bytes(buf)?;
        Ok(Operation { kind, key, value })
    }
}

impl Wire for OpResult {
    fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(1 + 4 + self.message.len());
        buf.put_u8(self.status.0);
        put_bytes(buf, &self.message);
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let status = ResultStatus(take_u8(buf)?);
        let message = take_bytes(buf)?;
        Ok(OpResult { status, message })
    }
}

impl Wire for BatchedRequest {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.operations.len() as u32);
        for operation in &self.operations {
            operation.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = take_u32(buf)? as usize;
        // Capacity bounded by the input size; each record is at least 9 bytes.
        let mut operations = Vec::with_capacity(count.min(buf.remaining() / 9 + 1));
        for _ in 0..count {
            operations.push(Operation::decode(buf)?);
        }
        Ok(BatchedRequest { operations })
    }
}

impl Wire for BatchedResponse {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.results.len() as u32);
        for result in &self.results {
            result.encode(buf);
        }
    }

    fn decode(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let count = take_u32(buf)? as usize;
        let mut results = Vec::with_capacity(count.min(buf.remaining() / 5 + 1));
        for _ in 0..count {
            results.push(OpResult::decode(buf)?);
        }
        Ok(BatchedResponse { results })
    }
}

/// Writes one length-prefixed frame and flushes.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame into `buf`, reusing its allocation, and
/// returns the payload length. A clean close at a frame boundary yields
/// `None`. Callers needing a deadline wrap the call in `tokio::time::timeout`.
pub async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_SIZE];
    if let Err(err) = reader.read_exact(&mut header).await {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            return Ok(None);
        }
        return Err(err);
    }

    let len = u32::from_le_bytes(header) as usize;
    buf.resize(len, 0);
    reader.read_exact(buf).await?;
    Ok(Some(len))
}
