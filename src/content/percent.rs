//! Percent-encoding (`%XX`) decoder.

use bytes::{BufMut, Bytes, BytesMut};

use super::ContentDecoder;
use crate::error::ContentError;

pub struct PercentDecoder;

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

impl ContentDecoder for PercentDecoder {
    fn name(&self) -> &'static str {
        "percent"
    }

    fn estimate_size(&self, encoded_len: usize) -> usize {
        encoded_len
    }

    /// Malformed escapes are copied as they are.
    fn decode(&self, input: &[u8]) -> Result<Bytes, ContentError> {
        let mut out = BytesMut::with_capacity(self.estimate_size(input.len()));
        let mut i = 0;
        while i < input.len() {
            if input[i] == b'%' && i + 2 < input.len() {
                if let (Some(hi), Some(lo)) = (hex_value(input[i + 1]), hex_value(input[i + 2])) {
                    out.put_u8((hi << 4) | lo);
                    i += 3;
                    continue;
                }
            }
            out.put_u8(input[i]);
            i += 1;
        }
        Ok(out.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(input: &[u8]) -> Bytes {
        PercentDecoder.decode(input).unwrap()
    }

    #[test]
    fn test_escapes() {
        assert_eq!(decode(b"user%40example.com"), Bytes::from_static(b"user@example.com"));
        assert_eq!(decode(b"%2f%2F"), Bytes::from_static(b"//"));
    }

    #[test]
    fn test_malformed_copied_literally() {
        assert_eq!(decode(b"100%"), Bytes::from_static(b"100%"));
        assert_eq!(decode(b"%zz%4"), Bytes::from_static(b"%zz%4"));
        assert_eq!(decode(b"%%41"), Bytes::from_static(b"%A"));
    }
}
