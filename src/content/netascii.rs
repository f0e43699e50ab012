//! TFTP netascii decoder.

use bytes::{BufMut, Bytes, BytesMut};

use super::ContentDecoder;
use crate::error::ContentError;

const CR: u8 = b'\r';
const LF: u8 = b'\n';
const NUL: u8 = 0;

/// Maps CR LF to LF and CR NUL to CR. A lone CR is kept.
pub struct NetasciiDecoder;

impl ContentDecoder for NetasciiDecoder {
    fn name(&self) -> &'static str {
        "netascii"
    }

    fn estimate_size(&self, encoded_len: usize) -> usize {
        encoded_len
    }

    fn decode(&self, input: &[u8]) -> Result<Bytes, ContentError> {
        let mut out = BytesMut::with_capacity(self.estimate_size(input.len()));
        let mut bytes = input.iter().copied().peekable();
        while let Some(b) = bytes.next() {
            if b != CR {
                out.put_u8(b);
                continue;
            }
            match bytes.peek() {
                Some(&LF) => {
                    bytes.next();
                    out.put_u8(LF);
                }
                Some(&NUL) => {
                    bytes.next();
                    out.put_u8(CR);
                }
                _ => out.put_u8(CR),
            }
        }
        Ok(out.freeze())
    }
}
