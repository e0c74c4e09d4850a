//! PostgreSQL wire protocol adapter.
//!
//! Frames the v3 protocol: an untyped startup phase (length-prefixed
//! only) followed by typed frames `tag (1) || length (4, includes
//! itself) || body`. The adapter stays byte-compatible — the only frames
//! it synthesizes are `ErrorResponse`/`ReadyForQuery` on censor denials,
//! and the only frames it modifies are `DataRow` bodies, with every
//! length field corrected.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

pub const SSL_REQUEST_CODE: u32 = 80877103;
pub const GSSENC_REQUEST_CODE: u32 = 80877104;
pub const CANCEL_REQUEST_CODE: u32 = 80877102;

/// Upper bound on a single frame; the server never sends more.
const MAX_FRAME_LEN: usize = 512 * 1024 * 1024;

pub const TAG_QUERY: u8 = b'Q';
pub const TAG_DATA_ROW: u8 = b'D';
pub const TAG_ERROR_RESPONSE: u8 = b'E';
pub const TAG_READY_FOR_QUERY: u8 = b'Z';
pub const TAG_TERMINATE: u8 = b'X';

/// A protocol frame. `tag == 0` marks the untyped startup-phase form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgFrame {
    pub tag: u8,
    pub body: Bytes,
}

impl PgFrame {
    pub fn typed(tag: u8, body: impl Into<Bytes>) -> Self {
        Self { tag, body: body.into() }
    }

    pub fn untyped(body: impl Into<Bytes>) -> Self {
        Self { tag: 0, body: body.into() }
    }

    pub fn is_query(&self) -> bool {
        self.tag == TAG_QUERY
    }

    pub fn is_data_row(&self) -> bool {
        self.tag == TAG_DATA_ROW
    }

    /// SQL text of a Query frame: the body minus its NUL terminator.
    pub fn sql(&self) -> Option<String> {
        if !self.is_query() {
            return None;
        }
        let end = self.body.iter().position(|&b| b == 0).unwrap_or(self.body.len());
        Some(String::from_utf8_lossy(&self.body[..end]).into_owned())
    }

    /// Startup-phase request code (protocol version or magic).
    pub fn startup_code(&self) -> Option<u32> {
        if self.tag != 0 || self.body.len() < 4 {
            return None;
        }
        Some(u32::from_be_bytes(self.body[..4].try_into().unwrap()))
    }
}

/// Read one untyped (startup-phase) frame.
pub async fn read_untyped_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<PgFrame>, ProxyError> {
    let mut len_buf = [0u8; 4];
    match read_full_or_eof(stream, &mut len_buf).await? {
        false => return Ok(None),
        true => {}
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(ProxyError::Protocol(format!("startup frame length {len}")));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok(Some(PgFrame::untyped(body)))
}

/// Read one typed frame. `None` on clean EOF at a frame boundary.
pub async fn read_frame<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<PgFrame>, ProxyError> {
    let mut tag = [0u8; 1];
    if !read_full_or_eof(stream, &mut tag).await? {
        return Ok(None);
    }
    let len = stream.read_u32().await? as usize;
    if !(4..=MAX_FRAME_LEN).contains(&len) {
        return Err(ProxyError::Protocol(format!("frame length {len}")));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    Ok(Some(PgFrame::typed(tag[0], body)))
}

/// Write a frame, with the length field recomputed from the body.
pub async fn write_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    frame: &PgFrame,
) -> Result<(), ProxyError> {
    let mut out = Vec::with_capacity(5 + frame.body.len());
    if frame.tag != 0 {
        out.push(frame.tag);
    }
    out.extend_from_slice(&((frame.body.len() + 4) as u32).to_be_bytes());
    out.extend_from_slice(&frame.body);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// Read exactly `buf.len()` bytes; `false` on EOF before the first byte.
async fn read_full_or_eof<S: AsyncRead + Unpin>(
    stream: &mut S,
    buf: &mut [u8],
) -> Result<bool, ProxyError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    Ok(true)
}

/// Build an `ErrorResponse` frame the way the server would emit it.
pub fn error_response(sqlstate: &str, message: &str) -> PgFrame {
    let mut body = Vec::new();
    for (field, value) in [
        (b'S', "ERROR"),
        (b'V', "ERROR"),
        (b'C', sqlstate),
        (b'M', message),
    ] {
        body.push(field);
        body.extend_from_slice(value.as_bytes());
        body.push(0);
    }
    body.push(0);
    PgFrame::typed(TAG_ERROR_RESPONSE, body)
}

/// `ReadyForQuery` with idle transaction status.
pub fn ready_for_query_idle() -> PgFrame {
    PgFrame::typed(TAG_READY_FOR_QUERY, vec![b'I'])
}

/// Rewrite every non-NULL column of a `DataRow` body through `rewrite`.
///
/// Returns `None` when nothing changed. Column length prefixes in the
/// result always match the rewritten values.
pub fn rewrite_data_row(
    body: &[u8],
    mut rewrite: impl FnMut(&[u8]) -> Option<Vec<u8>>,
) -> Result<Option<Vec<u8>>, ProxyError> {
    if body.len() < 2 {
        return Err(ProxyError::Protocol("DataRow body too short".into()));
    }
    let ncols = u16::from_be_bytes([body[0], body[1]]) as usize;

    let mut out = Vec::with_capacity(body.len());
    out.extend_from_slice(&body[..2]);
    let mut changed = false;
    let mut pos = 2usize;

    for _ in 0..ncols {
        if body.len() < pos + 4 {
            return Err(ProxyError::Protocol("DataRow truncated at column length".into()));
        }
        let len = i32::from_be_bytes(body[pos..pos + 4].try_into().unwrap());
        pos += 4;

        if len < 0 {
            out.extend_from_slice(&(-1i32).to_be_bytes());
            continue;
        }
        let len = len as usize;
        if body.len() < pos + len {
            return Err(ProxyError::Protocol("DataRow truncated at column value".into()));
        }
        let value = &body[pos..pos + len];
        pos += len;

        match rewrite(value) {
            Some(new_value) => {
                out.extend_from_slice(&(new_value.len() as i32).to_be_bytes());
                out.extend_from_slice(&new_value);
                changed = true;
            }
            None => {
                out.extend_from_slice(&(len as i32).to_be_bytes());
                out.extend_from_slice(value);
            }
        }
    }

    if pos != body.len() {
        return Err(ProxyError::Protocol("DataRow has trailing bytes".into()));
    }
    Ok(changed.then_some(out))
}
