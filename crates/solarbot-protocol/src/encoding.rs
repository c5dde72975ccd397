//! Hex and base64 helpers for frame logging and broker transport
//!
//! Base64 follows the RFC 4648 standard alphabet with `=` padding. The
//! decoder skips ASCII whitespace, accepts but does not require padding,
//! and rejects any other non-alphabet byte.

use thiserror::Error;

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodingError {
    #[error("invalid hex token {0:?}")]
    InvalidHex(String),

    #[error("invalid base64 byte {0:?}")]
    InvalidBase64(char),

    #[error("truncated base64 input")]
    TruncatedBase64,
}

/// Format bytes as uppercase hex pairs separated by spaces, e.g. `"68 41 16"`
#[must_use]
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a space-separated hex pair string back into bytes
#[allow(clippy::missing_errors_doc)]
pub fn from_hex(s: &str) -> Result<Vec<u8>, EncodingError> {
    s.split_whitespace()
        .map(|tok| {
            u8::from_str_radix(tok, 16).map_err(|_| EncodingError::InvalidHex(tok.to_string()))
        })
        .collect()
}

/// Encode bytes as standard base64 with padding
#[must_use]
pub fn to_base64(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len().div_ceil(3) * 4);

    for chunk in bytes.chunks(3) {
        let b0 = chunk[0];
        let b1 = chunk.get(1).copied().unwrap_or(0);
        let b2 = chunk.get(2).copied().unwrap_or(0);

        out.push(BASE64_ALPHABET[(b0 >> 2) as usize] as char);
        out.push(BASE64_ALPHABET[(((b0 & 0x03) << 4) | (b1 >> 4)) as usize] as char);
        if chunk.len() > 1 {
            out.push(BASE64_ALPHABET[(((b1 & 0x0F) << 2) | (b2 >> 6)) as usize] as char);
        } else {
            out.push('=');
        }
        if chunk.len() > 2 {
            out.push(BASE64_ALPHABET[(b2 & 0x3F) as usize] as char);
        } else {
            out.push('=');
        }
    }

    out
}

/// Decode standard base64, skipping whitespace and accepting `=` padding
#[allow(clippy::missing_errors_doc)]
pub fn from_base64(s: &str) -> Result<Vec<u8>, EncodingError> {
    let mut sextets = Vec::with_capacity(s.len());
    for c in s.chars() {
        if c.is_ascii_whitespace() {
            continue;
        }
        if c == '=' {
            // Padding only ever trails; anything after it must be
            // whitespace or more padding.
            break;
        }
        let value = match c {
            'A'..='Z' => c as u8 - b'A',
            'a'..='z' => c as u8 - b'a' + 26,
            '0'..='9' => c as u8 - b'0' + 52,
            '+' => 62,
            '/' => 63,
            _ => return Err(EncodingError::InvalidBase64(c)),
        };
        sextets.push(value);
    }

    let mut out = Vec::with_capacity(sextets.len() * 3 / 4);
    for group in sextets.chunks(4) {
        match group.len() {
            4 => {
                out.push((group[0] << 2) | (group[1] >> 4));
                out.push((group[1] << 4) | (group[2] >> 2));
                out.push((group[2] << 6) | group[3]);
            }
            3 => {
                out.push((group[0] << 2) | (group[1] >> 4));
                out.push((group[1] << 4) | (group[2] >> 2));
            }
            2 => {
                out.push((group[0] << 2) | (group[1] >> 4));
            }
            _ => return Err(EncodingError::TruncatedBase64),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        let bytes = vec![0x68, 0x41, 0x00, 0x02, 0xAF, 0x16];
        let hex = to_hex(&bytes);
        assert_eq!(hex, "68 41 00 02 AF 16");
        assert_eq!(from_hex(&hex).unwrap(), bytes);
    }

    #[test]
    fn test_hex_rejects_garbage() {
        assert!(from_hex("68 4Z").is_err());
    }

    #[test]
    fn test_base64_known_vectors() {
        // RFC 4648 §10 test vectors
        assert_eq!(to_base64(b""), "");
        assert_eq!(to_base64(b"f"), "Zg==");
        assert_eq!(to_base64(b"fo"), "Zm8=");
        assert_eq!(to_base64(b"foo"), "Zm9v");
        assert_eq!(to_base64(b"foob"), "Zm9vYg==");
        assert_eq!(to_base64(b"fooba"), "Zm9vYmE=");
        assert_eq!(to_base64(b"foobar"), "Zm9vYmFy");
    }

    #[test]
    fn test_base64_decode_padded_and_unpadded() {
        assert_eq!(from_base64("Zm9vYg==").unwrap(), b"foob");
        assert_eq!(from_base64("Zm9vYg").unwrap(), b"foob");
    }

    #[test]
    fn test_base64_decode_skips_whitespace() {
        assert_eq!(from_base64("Zm9v\nYmFy ").unwrap(), b"foobar");
    }

    #[test]
    fn test_base64_rejects_non_alphabet() {
        assert_eq!(
            from_base64("Zm9*"),
            Err(EncodingError::InvalidBase64('*'))
        );
    }

    #[test]
    fn test_base64_rejects_lone_sextet() {
        assert_eq!(from_base64("Z"), Err(EncodingError::TruncatedBase64));
    }

    #[test]
    fn test_base64_frame_roundtrip() {
        let frame = vec![0x68, 0x82, 0x00, 0x0B, 0x00, 0x01, 0xF2, 0x80, 0x16];
        assert_eq!(from_base64(&to_base64(&frame)).unwrap(), frame);
    }
}
