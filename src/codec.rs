//! Envelope codec for Requests and Responses.
//!
//! Local transport carries exactly one JSON document per connection with no
//! length prefix:
//!
//! ```text
//! writer: [JSON document] then half-close (shutdown write side)
//! reader: read to EOF, decode
//! ```
//!
//! Remote transport carries the same document as an HTTP POST body.
//!
//! Decode failures are [`AcommError::Protocol`] errors; they abort the one
//! connection they came from and nothing else.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::constants::MAX_ENVELOPE_SIZE;
use crate::error::{AcommError, Result};
use crate::protocol::{Request, Response};

/// Encode a value as one JSON document.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| AcommError::protocol(format!("encode failed: {e}")))
}

/// Decode one JSON document without contract checks.
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if bytes.is_empty() {
        return Err(AcommError::protocol("empty envelope"));
    }
    serde_json::from_slice(bytes).map_err(|e| AcommError::protocol(format!("invalid envelope: {e}")))
}

/// Decode and validate a Request.
pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    let req: Request = decode(bytes)?;
    req.validate()?;
    Ok(req)
}

/// Decode and validate a Response.
///
/// Rejects responses with both or neither of result/error set.
pub fn decode_response(bytes: &[u8]) -> Result<Response> {
    let resp: Response = decode(bytes)?;
    resp.validate()?;
    Ok(resp)
}

/// Write one envelope and half-close the writer.
pub async fn write_envelope<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = encode(value)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

/// Read until the peer half-closes, refusing documents larger than
/// [`MAX_ENVELOPE_SIZE`].
pub async fn read_to_eof<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = (MAX_ENVELOPE_SIZE + 1) as u64;
    reader.take(limit).read_to_end(&mut buf).await?;
    if buf.len() > MAX_ENVELOPE_SIZE {
        return Err(AcommError::protocol(format!(
            "envelope exceeds {MAX_ENVELOPE_SIZE} bytes"
        )));
    }
    Ok(buf)
}

/// Read one Request from a connection.
pub async fn read_request<R>(reader: &mut R) -> Result<Request>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_to_eof(reader).await?;
    decode_request(&bytes)
}

/// Read one Response from a connection.
pub async fn read_response<R>(reader: &mut R) -> Result<Response>
where
    R: AsyncRead + Unpin,
{
    let bytes = read_to_eof(reader).await?;
    decode_response(&bytes)
}
