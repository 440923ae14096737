//! Wire format for a stored cell record: the original (pre-canonicalization)
//! key followed by the raw formula/value bytes, so the original spelling of
//! an identifier can be recovered for display even after canonicalization
//! has folded it into a lookup key.
//!
//! Layout: `u16` little-endian key length, then that many bytes of key,
//! then the remaining bytes are the value verbatim.

use crate::error::{Error, Result};

/// Encode `(original_key, value)` into a single byte buffer suitable for a
/// redb table value.
pub fn marshal(original_key: &str, value: &[u8]) -> Vec<u8> {
    let key_bytes = original_key.as_bytes();
    let mut out = Vec::with_capacity(2 + key_bytes.len() + value.len());
    out.extend_from_slice(&(key_bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(key_bytes);
    out.extend_from_slice(value);
    out
}

/// Decode a buffer produced by [`marshal`] back into `(original_key, value)`.
pub fn unmarshal(data: &[u8]) -> Result<(String, Vec<u8>)> {
    if data.len() < 2 {
        return Err(Error::Serializer(format!(
            "record too short to contain a key length: {} bytes",
            data.len()
        )));
    }
    let key_len = u16::from_le_bytes([data[0], data[1]]) as usize;
    if data.len() < 2 + key_len {
        return Err(Error::Serializer(format!(
            "record declares key length {key_len} but only {} bytes remain",
            data.len() - 2
        )));
    }
    let key = String::from_utf8(data[2..2 + key_len].to_vec())
        .map_err(|e| Error::Serializer(format!("key is not valid utf-8: {e}")))?;
    let value = data[2 + key_len..].to_vec();
    Ok((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let buf = marshal("Sheet1.A1", b"=1+2");
        let (key, value) = unmarshal(&buf).unwrap();
        assert_eq!(key, "Sheet1.A1");
        assert_eq!(value, b"=1+2");
    }

    #[test]
    fn round_trips_empty_value() {
        let buf = marshal("A1", b"");
        let (key, value) = unmarshal(&buf).unwrap();
        assert_eq!(key, "A1");
        assert!(value.is_empty());
    }

    #[test]
    fn rejects_short_buffer() {
        assert!(unmarshal(&[0u8]).is_err());
    }

    #[test]
    fn rejects_truncated_key() {
        // Declares a 10-byte key but supplies none.
        assert!(unmarshal(&[10, 0]).is_err());
    }
}
