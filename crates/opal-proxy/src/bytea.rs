//! PostgreSQL bytea text encodings.
//!
//! Result rows carry bytea columns as text in one of two server-side
//! formats: `hex` (`\x` followed by lowercase hex digits) or the legacy
//! `escape` format (printable bytes literal, backslash doubled,
//! everything else as `\ooo` octal). The adapter decodes before the
//! decryptor runs and re-encodes afterwards so the client sees a value
//! indistinguishable from a native response.

use opal_core::ByteaFormat;

/// Decode a text-format bytea value. `None` when the text is not a valid
/// encoding; the caller then treats the bytes as raw.
pub fn decode(format: ByteaFormat, text: &[u8]) -> Option<Vec<u8>> {
    match format {
        ByteaFormat::Hex => decode_hex(text),
        ByteaFormat::Escape => decode_escape(text),
    }
}

pub fn encode(format: ByteaFormat, bytes: &[u8]) -> Vec<u8> {
    match format {
        ByteaFormat::Hex => encode_hex(bytes),
        ByteaFormat::Escape => encode_escape(bytes),
    }
}

pub fn decode_hex(text: &[u8]) -> Option<Vec<u8>> {
    let rest = text.strip_prefix(b"\\x")?;
    hex::decode(rest).ok()
}

pub fn encode_hex(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + bytes.len() * 2);
    out.extend_from_slice(b"\\x");
    out.extend_from_slice(hex::encode(bytes).as_bytes());
    out
}

pub fn decode_escape(text: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        let b = text[i];
        if b != b'\\' {
            out.push(b);
            i += 1;
            continue;
        }
        // Backslash escape: either a doubled backslash or three octal digits.
        if text.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else if text.len() >= i + 4
            && text[i + 1..i + 4].iter().all(|d| (b'0'..=b'7').contains(d))
        {
            let value = (text[i + 1] - b'0') as u16 * 64
                + (text[i + 2] - b'0') as u16 * 8
                + (text[i + 3] - b'0') as u16;
            if value > 0xFF {
                return None;
            }
            out.push(value as u8);
            i += 4;
        } else {
            return None;
        }
    }
    Some(out)
}

pub fn encode_escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            0x20..=0x7E => out.push(b),
            _ => {
                out.push(b'\\');
                out.push(b'0' + (b >> 6));
                out.push(b'0' + ((b >> 3) & 0x7));
                out.push(b'0' + (b & 0x7));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let data = b"hello\x00\xff world";
        let encoded = encode_hex(data);
        assert_eq!(&encoded[..2], b"\\x");
        assert_eq!(decode_hex(&encoded).unwrap(), data);
    }

    #[test]
    fn hex_literal_matches_server_output() {
        assert_eq!(encode_hex(b"hello"), b"\\x68656c6c6f".to_vec());
        assert_eq!(decode_hex(b"\\x68656c6c6f").unwrap(), b"hello");
    }

    #[test]
    fn hex_rejects_non_hex() {
        assert!(decode_hex(b"no prefix").is_none());
        assert!(decode_hex(b"\\xzz").is_none());
    }

    #[test]
    fn escape_roundtrip() {
        let data: Vec<u8> = (0u8..=255).collect();
        let encoded = encode_escape(&data);
        assert_eq!(decode_escape(&encoded).unwrap(), data);
    }

    #[test]
    fn escape_printable_passthrough() {
        assert_eq!(encode_escape(b"plain text"), b"plain text".to_vec());
        assert_eq!(decode_escape(b"plain text").unwrap(), b"plain text");
    }

    #[test]
    fn escape_backslash_doubles() {
        assert_eq!(encode_escape(b"a\\b"), b"a\\\\b".to_vec());
        assert_eq!(decode_escape(b"a\\\\b").unwrap(), b"a\\b");
    }

    #[test]
    fn escape_octal() {
        assert_eq!(encode_escape(&[0x00, 0x07]), b"\\000\\007".to_vec());
        assert_eq!(decode_escape(b"\\000\\007").unwrap(), vec![0x00, 0x07]);
    }

    #[test]
    fn escape_rejects_dangling_backslash() {
        assert!(decode_escape(b"oops\\").is_none());
        assert!(decode_escape(b"bad\\9zz").is_none());
    }

    #[test]
    fn format_dispatch() {
        assert_eq!(
            decode(ByteaFormat::Hex, b"\\x00ff").unwrap(),
            vec![0x00, 0xff]
        );
        assert_eq!(
            encode(ByteaFormat::Escape, &[0x01]),
            b"\\001".to_vec()
        );
    }
}
