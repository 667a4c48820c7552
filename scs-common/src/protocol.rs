//! Wire framing for the compile server.
//!
//! One request and one response per connection:
//!
//! * request: 8-byte length header followed by the XML payload. A header with
//!   non-zero high 32 bits was written by an opposite-endian client and is
//!   byte-swapped before use; the low 32 bits are the payload length.
//! * response: 4-byte little-endian payload length, then (v2+) one job-state
//!   byte, then the payload (compressed bytecode or UTF-8 error text).

use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, trace};

use crate::types::{JobState, ProtocolVersion};

/// Bounded wait for a complete request frame.
pub const RECEIVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Bounded wait for each outgoing block.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Outgoing payloads are written in blocks of this size.
pub const SEND_BLOCK_SIZE: usize = 4096;

/// Transient send failures tolerated per block.
pub const SEND_RETRIES: u32 = 3;

/// Upper bound on an accepted request payload.
pub const MAX_REQUEST_SIZE: usize = 64 * 1024 * 1024;

/// Upper bound on an accepted response payload (forwarding client side).
pub const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("network I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?} waiting for the peer")]
    Timeout(Duration),

    #[error("peer closed the connection mid-frame")]
    ConnectionClosed,

    #[error("zero-length payload")]
    EmptyPayload,

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("unknown job state byte {0}")]
    UnknownState(u8),
}

fn map_read_error(err: io::Error) -> ProtocolError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        ProtocolError::ConnectionClosed
    } else {
        ProtocolError::Io(err)
    }
}

/// Decode the 8-byte request header into a payload length.
pub fn decode_request_header(header: [u8; 8]) -> usize {
    let mut raw = u64::from_le_bytes(header);
    if raw >> 32 != 0 {
        raw = raw.swap_bytes();
    }
    (raw & 0xFFFF_FFFF) as usize
}

/// Read one request payload, bounded by `wait` overall.
pub async fn read_request<R>(reader: &mut R, wait: Duration) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;

    let mut header = [0u8; 8];
    timeout_at(deadline, reader.read_exact(&mut header))
        .await
        .map_err(|_| ProtocolError::Timeout(wait))?
        .map_err(map_read_error)?;

    let len = decode_request_header(header);
    if len == 0 {
        return Err(ProtocolError::EmptyPayload);
    }
    if len > MAX_REQUEST_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_REQUEST_SIZE,
        });
    }

    let mut payload = vec![0u8; len];
    timeout_at(deadline, reader.read_exact(&mut payload))
        .await
        .map_err(|_| ProtocolError::Timeout(wait))?
        .map_err(map_read_error)?;

    trace!(bytes = len, "request frame received");
    Ok(payload)
}

/// Write `data` in fixed-size blocks, retrying transient failures.
async fn write_blocks<W>(writer: &mut W, data: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    for block in data.chunks(SEND_BLOCK_SIZE) {
        let mut attempt = 0;
        loop {
            match timeout(SEND_TIMEOUT, writer.write_all(block)).await {
                Ok(Ok(())) => break,
                Ok(Err(err))
                    if matches!(
                        err.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) && attempt < SEND_RETRIES =>
                {
                    attempt += 1;
                    debug!(attempt, "transient send failure, retrying: {err}");
                }
                Ok(Err(err)) => return Err(ProtocolError::Io(err)),
                Err(_) => return Err(ProtocolError::Timeout(SEND_TIMEOUT)),
            }
        }
    }
    Ok(())
}

/// Write one request frame (client side).
pub async fn write_request<W>(writer: &mut W, payload: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        return Err(ProtocolError::EmptyPayload);
    }
    writer
        .write_all(&(payload.len() as u64).to_le_bytes())
        .await?;
    write_blocks(writer, payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode the response header for `version`.
pub fn encode_response_header(
    version: ProtocolVersion,
    state: JobState,
    payload_len: usize,
) -> Vec<u8> {
    let mut header = Vec::with_capacity(5);
    header.extend_from_slice(&(payload_len as u32).to_le_bytes());
    if version.has_state_byte() {
        header.push(state.as_byte());
    }
    header
}

/// Write one response frame.
pub async fn write_response<W>(
    writer: &mut W,
    version: ProtocolVersion,
    state: JobState,
    payload: &[u8],
) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    let header = encode_response_header(version, state, payload.len());
    write_blocks(writer, &header).await?;
    write_blocks(writer, payload).await?;
    writer.flush().await?;
    trace!(%version, %state, bytes = payload.len(), "response frame sent");
    Ok(())
}

/// A decoded response frame (client side).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// `None` for v1 responses, which carry no state byte.
    pub state: Option<JobState>,
    pub payload: Vec<u8>,
}

/// Read one response frame (client side), bounded by `wait` overall.
pub async fn read_response<R>(
    reader: &mut R,
    version: ProtocolVersion,
    wait: Duration,
) -> Result<Response, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let deadline = Instant::now() + wait;

    let mut len_bytes = [0u8; 4];
    timeout_at(deadline, reader.read_exact(&mut len_bytes))
        .await
        .map_err(|_| ProtocolError::Timeout(wait))?
        .map_err(map_read_error)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_RESPONSE_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: len,
            limit: MAX_RESPONSE_SIZE,
        });
    }

    let state = if version.has_state_byte() {
        let mut byte = [0u8; 1];
        timeout_at(deadline, reader.read_exact(&mut byte))
            .await
            .map_err(|_| ProtocolError::Timeout(wait))?
            .map_err(map_read_error)?;
        Some(JobState::from_byte(byte[0]).ok_or(ProtocolError::UnknownState(byte[0]))?)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    timeout_at(deadline, reader.read_exact(&mut payload))
        .await
        .map_err(|_| ProtocolError::Timeout(wait))?
        .map_err(map_read_error)?;

    Ok(Response { state, payload })
}

/// Half-close our side and wait (bounded) for the peer to close theirs.
///
/// Used by protocol v2.1, where the client acknowledges the response by
/// shutting down the connection.
pub async fn await_peer_shutdown<S>(stream: &mut S, wait: Duration) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.shutdown().await?;
    let drain = async {
        let mut sink = [0u8; 256];
        loop {
            match stream.read(&mut sink).await {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(err) => return Err(ProtocolError::Io(err)),
            }
        }
    };
    timeout(wait, drain)
        .await
        .map_err(|_| ProtocolError::Timeout(wait))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn header_little_endian() {
        let _guard = crate::test_guard!();
        assert_eq!(decode_request_header(1234u64.to_le_bytes()), 1234);
    }

    #[test]
    fn header_opposite_endian_is_swapped() {
        let _guard = crate::test_guard!();
        assert_eq!(decode_request_header(1234u64.to_be_bytes()), 1234);
    }

    #[tokio::test]
    async fn request_frame_round_trip() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(64 * 1024);
        let payload = vec![b'x'; 10_000];
        write_request(&mut client, &payload).await.unwrap();
        let got = read_request(&mut server, RECEIVE_TIMEOUT).await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn big_endian_client_frame_is_accepted() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024);
        client.write_all(&5u64.to_be_bytes()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let got = read_request(&mut server, RECEIVE_TIMEOUT).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn zero_length_request_is_rejected() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024);
        client.write_all(&0u64.to_le_bytes()).await.unwrap();
        let err = read_request(&mut server, RECEIVE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyPayload));
    }

    #[tokio::test]
    async fn oversized_request_is_rejected() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024);
        client
            .write_all(&((MAX_REQUEST_SIZE as u64) + 1).to_le_bytes())
            .await
            .unwrap();
        let err = read_request(&mut server, RECEIVE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[tokio::test]
    async fn truncated_request_reports_closed_connection() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024);
        client.write_all(&100u64.to_le_bytes()).await.unwrap();
        client.write_all(b"short").await.unwrap();
        drop(client);
        let err = read_request(&mut server, RECEIVE_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024);
        client.write_all(&100u64.to_le_bytes()).await.unwrap();
        let err = read_request(&mut server, Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Timeout(_)));
        drop(client);
    }

    #[tokio::test]
    async fn v1_response_has_no_state_byte() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(64 * 1024);
        write_response(&mut server, ProtocolVersion::V1, JobState::Done, b"abc")
            .await
            .unwrap();
        drop(server);
        let mut raw = Vec::new();
        client.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, [3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn v2_response_round_trip_with_large_payload() {
        let _guard = crate::test_guard!();
        let (mut client, mut server) = duplex(1024 * 1024);
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        write_response(&mut server, ProtocolVersion::V2, JobState::CacheHit, &payload)
            .await
            .unwrap();
        let resp = read_response(&mut client, ProtocolVersion::V2, RECEIVE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(resp.state, Some(JobState::CacheHit));
        assert_eq!(resp.payload, payload);
    }

    #[tokio::test]
    async fn peer_shutdown_completes_when_client_closes() {
        let _guard = crate::test_guard!();
        let (client, mut server) = duplex(1024);
        drop(client);
        await_peer_shutdown(&mut server, Duration::from_secs(1))
            .await
            .unwrap();
    }
}
