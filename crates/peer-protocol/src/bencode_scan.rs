use crate::ProtocolError;

const MAX_DEPTH: usize = 32;

/// Byte length of the first bencoded value in `buf`.
///
/// ut_metadata `data` frames carry the raw piece payload immediately
/// after the bencoded header; this locates the boundary without decoding.
pub fn bencoded_len(buf: &[u8]) -> Result<usize, ProtocolError> {
    value_end(buf, 0, 0)
}

fn value_end(buf: &[u8], pos: usize, depth: usize) -> Result<usize, ProtocolError> {
    if depth > MAX_DEPTH {
        return Err(ProtocolError::BadBencodePrefix);
    }
    match buf.get(pos) {
        Some(b'i') => {
            let mut i = pos + 1;
            while *buf.get(i).ok_or(ProtocolError::BadBencodePrefix)? != b'e' {
                i += 1;
            }
            Ok(i + 1)
        }
        Some(b'l') | Some(b'd') => {
            // Dict entries scan the same as a flat value sequence.
            let mut i = pos + 1;
            while *buf.get(i).ok_or(ProtocolError::BadBencodePrefix)? != b'e' {
                i = value_end(buf, i, depth + 1)?;
            }
            Ok(i + 1)
        }
        Some(b'0'..=b'9') => {
            let mut i = pos;
            let mut len: usize = 0;
            while let Some(&c) = buf.get(i) {
                match c {
                    b'0'..=b'9' => {
                        len = len
                            .checked_mul(10)
                            .and_then(|l| l.checked_add((c - b'0') as usize))
                            .ok_or(ProtocolError::BadBencodePrefix)?;
                        i += 1;
                    }
                    b':' => {
                        let end = i + 1 + len;
                        if end > buf.len() {
                            return Err(ProtocolError::BadBencodePrefix);
                        }
                        return Ok(end);
                    }
                    _ => return Err(ProtocolError::BadBencodePrefix),
                }
            }
            Err(ProtocolError::BadBencodePrefix)
        }
        _ => Err(ProtocolError::BadBencodePrefix),
    }
}
