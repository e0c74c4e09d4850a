//! MySQL wire protocol adapter.
//!
//! Packets are `length (3, LE) || sequence (1) || payload`. The server
//! speaks first. Command packets restart the sequence at zero, which is
//! how the adapter tells a fresh `COM_QUERY` from handshake or
//! auth-switch continuation traffic without tracking capabilities.
//!
//! Text result sets are followed per query: column-count packet, column
//! definitions, then rows until a terminator. Row values are
//! length-encoded strings and get rewritten in place with their length
//! prefixes corrected.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;

pub const COM_QUERY: u8 = 0x03;
pub const COM_QUIT: u8 = 0x01;

const NULL_VALUE: u8 = 0xFB;
const MAX_PACKET_LEN: usize = 0xFF_FF_FF;

/// Error number reported on censor denials (access denied family).
pub const CENSOR_DENIED_ERRNO: u16 = 1045;
pub const CENSOR_DENIED_SQLSTATE: &str = "28000";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyPacket {
    pub seq: u8,
    pub payload: Bytes,
}

impl MyPacket {
    pub fn new(seq: u8, payload: impl Into<Bytes>) -> Self {
        Self { seq, payload: payload.into() }
    }

    /// A command packet carrying SQL. Commands always restart at seq 0.
    pub fn is_query(&self) -> bool {
        self.seq == 0 && self.payload.first() == Some(&COM_QUERY)
    }

    pub fn sql(&self) -> Option<String> {
        if !self.is_query() {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload[1..]).into_owned())
    }
}

pub async fn read_packet<S: AsyncRead + Unpin>(
    stream: &mut S,
) -> Result<Option<MyPacket>, ProxyError> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = stream.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
        }
        filled += n;
    }
    let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
    let seq = header[3];
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(MyPacket::new(seq, payload)))
}

/// Write a packet, recomputing the 3-byte length from the payload.
pub async fn write_packet<S: AsyncWrite + Unpin>(
    stream: &mut S,
    packet: &MyPacket,
) -> Result<(), ProxyError> {
    if packet.payload.len() > MAX_PACKET_LEN {
        return Err(ProxyError::Protocol("oversized MySQL packet".into()));
    }
    let len = (packet.payload.len() as u32).to_le_bytes();
    let mut out = Vec::with_capacity(4 + packet.payload.len());
    out.extend_from_slice(&len[..3]);
    out.push(packet.seq);
    out.extend_from_slice(&packet.payload);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

/// ERR packet as the server would produce it.
pub fn error_packet(seq: u8, errno: u16, sqlstate: &str, message: &str) -> MyPacket {
    let mut payload = vec![0xFF];
    payload.extend_from_slice(&errno.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(sqlstate.as_bytes());
    payload.extend_from_slice(message.as_bytes());
    MyPacket::new(seq, payload)
}

pub fn is_ok_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0x00)
}

pub fn is_err_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFF)
}

/// EOF marker (also the deprecated-EOF result-set terminator).
pub fn is_eof_packet(payload: &[u8]) -> bool {
    payload.first() == Some(&0xFE) && payload.len() < 9
}

// ── Length-encoded integers and strings ──────────────────────────────────

/// Decode a length-encoded integer; returns `(value, bytes consumed)`.
pub fn read_lenenc_int(data: &[u8]) -> Option<(u64, usize)> {
    match *data.first()? {
        v @ 0x00..=0xFA => Some((v as u64, 1)),
        0xFC => {
            let v = u16::from_le_bytes(data.get(1..3)?.try_into().ok()?);
            Some((v as u64, 3))
        }
        0xFD => {
            let b = data.get(1..4)?;
            Some((u32::from_le_bytes([b[0], b[1], b[2], 0]) as u64, 4))
        }
        0xFE => {
            let v = u64::from_le_bytes(data.get(1..9)?.try_into().ok()?);
            Some((v, 9))
        }
        _ => None,
    }
}

pub fn write_lenenc_int(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xFA => out.push(value as u8),
        0xFB..=0xFFFF => {
            out.push(0xFC);
            out.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xFF_FFFF => {
            out.push(0xFD);
            out.extend_from_slice(&(value as u32).to_le_bytes()[..3]);
        }
        _ => {
            out.push(0xFE);
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
}

/// Column count from a result-set header packet.
pub fn parse_column_count(payload: &[u8]) -> Option<u64> {
    let (count, consumed) = read_lenenc_int(payload)?;
    (consumed == payload.len() && count > 0).then_some(count)
}

/// Rewrite every non-NULL value of a text-protocol row.
pub fn rewrite_text_row(
    payload: &[u8],
    ncols: u64,
    mut rewrite: impl FnMut(&[u8]) -> Option<Vec<u8>>,
) -> Result<Option<Vec<u8>>, ProxyError> {
    let mut out = Vec::with_capacity(payload.len());
    let mut changed = false;
    let mut pos = 0usize;

    for _ in 0..ncols {
        if payload.get(pos) == Some(&NULL_VALUE) {
            out.push(NULL_VALUE);
            pos += 1;
            continue;
        }
        let (len, consumed) = read_lenenc_int(&payload[pos..])
            .ok_or_else(|| ProxyError::Protocol("row value length does not parse".into()))?;
        pos += consumed;
        let len = len as usize;
        if payload.len() < pos + len {
            return Err(ProxyError::Protocol("row truncated at value".into()));
        }
        let value = &payload[pos..pos + len];
        pos += len;

        match rewrite(value) {
            Some(new_value) => {
                write_lenenc_int(&mut out, new_value.len() as u64);
                out.extend_from_slice(&new_value);
                changed = true;
            }
            None => {
                write_lenenc_int(&mut out, len as u64);
                out.extend_from_slice(value);
            }
        }
    }

    if pos != payload.len() {
        return Err(ProxyError::Protocol("row has trailing bytes".into()));
    }
    Ok(changed.then_some(out))
}

// ── Result-set tracking ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseState {
    Idle,
    AwaitHeader,
    Columns { remaining: u64, ncols: u64 },
    AfterColumns { ncols: u64 },
    Rows { ncols: u64 },
}

/// What the pipeline should do with a server packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowAction {
    Forward,
    /// The packet is a text result-set row with this many columns.
    Rewrite { ncols: u64 },
}

/// Tracks the handshake → command → result-set phases on the server-bound
/// direction so only row packets reach the decryptor.
pub struct ResponseTracker {
    state: ResponseState,
    pending_queries: u32,
}

impl Default for ResponseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseTracker {
    pub fn new() -> Self {
        Self { state: ResponseState::Idle, pending_queries: 0 }
    }

    /// Called when the client→db pump forwards a `COM_QUERY`.
    pub fn query_sent(&mut self) {
        if self.state == ResponseState::Idle {
            self.state = ResponseState::AwaitHeader;
        } else {
            self.pending_queries += 1;
        }
    }

    fn response_done(&mut self) {
        if self.pending_queries > 0 {
            self.pending_queries -= 1;
            self.state = ResponseState::AwaitHeader;
        } else {
            self.state = ResponseState::Idle;
        }
    }

    /// Advance on one server→client packet.
    pub fn on_server_packet(&mut self, payload: &[u8]) -> RowAction {
        match self.state {
            ResponseState::Idle => RowAction::Forward,

            ResponseState::AwaitHeader => {
                if is_ok_packet(payload) || is_err_packet(payload) || payload.first() == Some(&0xFB)
                {
                    self.response_done();
                    return RowAction::Forward;
                }
                match parse_column_count(payload) {
                    Some(ncols) => {
                        self.state = ResponseState::Columns { remaining: ncols, ncols };
                    }
                    None => self.response_done(),
                }
                RowAction::Forward
            }

            ResponseState::Columns { remaining, ncols } => {
                let remaining = remaining - 1;
                self.state = if remaining == 0 {
                    ResponseState::AfterColumns { ncols }
                } else {
                    ResponseState::Columns { remaining, ncols }
                };
                RowAction::Forward
            }

            ResponseState::AfterColumns { ncols } => {
                if is_eof_packet(payload) {
                    // Classic protocol: EOF between definitions and rows.
                    self.state = ResponseState::Rows { ncols };
                    return RowAction::Forward;
                }
                if is_err_packet(payload) {
                    self.response_done();
                    return RowAction::Forward;
                }
                // Deprecated-EOF servers go straight to rows.
                self.state = ResponseState::Rows { ncols };
                RowAction::Rewrite { ncols }
            }

            ResponseState::Rows { ncols } => {
                if is_eof_packet(payload) || is_err_packet(payload) {
                    self.response_done();
                    return RowAction::Forward;
                }
                RowAction::Rewrite { ncols }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn row_packet(values: &[Option<&[u8]>]) -> Vec<u8> {
        let mut payload = Vec::new();
        for v in values {
            match v {
                None => payload.push(NULL_VALUE),
                Some(v) => {
                    write_lenenc_int(&mut payload, v.len() as u64);
                    payload.extend_from_slice(v);
                }
            }
        }
        payload
    }

    #[tokio::test]
    async fn packet_roundtrip() {
        let (mut a, mut b) = duplex(4096);
        let packet = MyPacket::new(0, vec![COM_QUERY, b'S', b'E', b'L']);
        write_packet(&mut a, &packet).await.unwrap();
        let read = read_packet(&mut b).await.unwrap().unwrap();
        assert_eq!(read, packet);
        assert!(read.is_query());
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let (a, mut b) = duplex(16);
        drop(a);
        assert!(read_packet(&mut b).await.unwrap().is_none());
    }

    #[test]
    fn lenenc_int_roundtrip() {
        for value in [0u64, 0xFA, 0xFB, 0xFFFF, 0x1_0000, 0xFF_FFFF, 0x100_0000, u64::MAX] {
            let mut buf = Vec::new();
            write_lenenc_int(&mut buf, value);
            let (parsed, consumed) = read_lenenc_int(&buf).unwrap();
            assert_eq!(parsed, value);
            assert_eq!(consumed, buf.len());
        }
    }

    #[test]
    fn auth_continuation_is_not_a_query() {
        // Same first byte as COM_QUERY, but mid-sequence.
        let packet = MyPacket::new(3, vec![COM_QUERY, 1, 2, 3]);
        assert!(!packet.is_query());
    }

    #[test]
    fn sql_extraction() {
        let packet = MyPacket::new(0, b"\x03SELECT 1".to_vec());
        assert_eq!(packet.sql().unwrap(), "SELECT 1");
    }

    #[test]
    fn error_packet_shape() {
        let packet = error_packet(1, CENSOR_DENIED_ERRNO, CENSOR_DENIED_SQLSTATE, "denied");
        assert_eq!(packet.seq, 1);
        assert_eq!(packet.payload[0], 0xFF);
        assert_eq!(u16::from_le_bytes([packet.payload[1], packet.payload[2]]), 1045);
        assert_eq!(packet.payload[3], b'#');
        assert_eq!(&packet.payload[4..9], b"28000");
    }

    #[test]
    fn rewrite_row_fixes_lengths() {
        let payload = row_packet(&[Some(b"cell"), None, Some(b"keep")]);
        let out = rewrite_text_row(&payload, 3, |v| {
            (v == b"cell").then(|| vec![b'x'; 300])
        })
        .unwrap()
        .unwrap();

        let mut seen = Vec::new();
        rewrite_text_row(&out, 3, |v| {
            seen.push(v.len());
            None
        })
        .unwrap();
        assert_eq!(seen, vec![300, 4]);
        // 300 needs the 0xFC two-byte length form.
        assert_eq!(out[0], 0xFC);
    }

    #[test]
    fn rewrite_rejects_truncated_row() {
        let mut payload = row_packet(&[Some(b"value")]);
        payload.pop();
        assert!(rewrite_text_row(&payload, 1, |_| None).is_err());
    }

    #[test]
    fn tracker_follows_classic_resultset() {
        let mut t = ResponseTracker::new();
        t.query_sent();

        assert_eq!(t.on_server_packet(&[0x02]), RowAction::Forward); // 2 columns
        assert_eq!(t.on_server_packet(b"coldef1"), RowAction::Forward);
        assert_eq!(t.on_server_packet(b"coldef2"), RowAction::Forward);
        assert_eq!(t.on_server_packet(&[0xFE, 0, 0, 2, 0]), RowAction::Forward); // EOF
        assert_eq!(
            t.on_server_packet(&row_packet(&[Some(b"a"), Some(b"b")])),
            RowAction::Rewrite { ncols: 2 }
        );
        assert_eq!(t.on_server_packet(&[0xFE, 0, 0, 2, 0]), RowAction::Forward); // EOF
        // Back to idle: unrelated traffic passes through.
        assert_eq!(t.on_server_packet(&row_packet(&[Some(b"x")])), RowAction::Forward);
    }

    #[test]
    fn tracker_follows_deprecated_eof_resultset() {
        let mut t = ResponseTracker::new();
        t.query_sent();

        assert_eq!(t.on_server_packet(&[0x01]), RowAction::Forward); // 1 column
        assert_eq!(t.on_server_packet(b"coldef"), RowAction::Forward);
        // No EOF: first row follows the definitions directly.
        assert_eq!(
            t.on_server_packet(&row_packet(&[Some(b"v")])),
            RowAction::Rewrite { ncols: 1 }
        );
        assert_eq!(t.on_server_packet(&[0xFE, 0, 0, 0, 0]), RowAction::Forward);
    }

    #[test]
    fn tracker_handles_ok_and_err_responses() {
        let mut t = ResponseTracker::new();
        t.query_sent();
        assert_eq!(t.on_server_packet(&[0x00, 0, 0]), RowAction::Forward); // OK
        // Next query gets its own tracking.
        t.query_sent();
        assert_eq!(t.on_server_packet(&[0xFF, 0x28, 0x04]), RowAction::Forward); // ERR
    }

    #[test]
    fn tracker_queues_pipelined_queries() {
        let mut t = ResponseTracker::new();
        t.query_sent();
        t.query_sent();
        assert_eq!(t.on_server_packet(&[0x00]), RowAction::Forward); // OK for first
        // Second response is tracked as a result set.
        assert_eq!(t.on_server_packet(&[0x01]), RowAction::Forward);
        assert_eq!(t.on_server_packet(b"coldef"), RowAction::Forward);
        assert_eq!(
            t.on_server_packet(&row_packet(&[Some(b"v")])),
            RowAction::Rewrite { ncols: 1 }
        );
    }
}
