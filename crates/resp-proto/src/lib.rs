//! Client-side codec for the RESP wire protocol.
//!
//! Requests are encoded as arrays of bulk strings. Replies are decoded
//! incrementally: [`decode`] inspects the front of a read buffer and either
//! yields a complete [`Reply`] together with the number of bytes it occupied,
//! or reports that more data is needed.

use thiserror::Error;

/// A decoded server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK\r\n`
    Simple(String),
    /// `-ERR message\r\n`
    Error(String),
    /// `:42\r\n`
    Integer(i64),
    /// `$3\r\nfoo\r\n`; `$-1\r\n` is the nil bulk.
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`; `*-1\r\n` is the nil array.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            Reply::Error(message) => Some(message),
            _ => None,
        }
    }
}

/// The byte stream does not hold valid RESP frames. Unrecoverable: the frame
/// boundaries are lost, so the connection cannot be trusted afterwards.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unknown reply type byte {0:#04x}")]
    UnknownType(u8),
    #[error("malformed {0} header")]
    BadHeader(&'static str),
    #[error("bulk payload not terminated by CRLF")]
    MissingTerminator,
}

/// Encode one command as a RESP array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A]) -> Vec<u8> {
    let payload: usize = args.iter().map(|a| a.as_ref().len() + 16).sum();
    let mut out = Vec::with_capacity(16 + payload);
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        let arg = arg.as_ref();
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
    out
}

/// Try to decode a single reply from the front of `buf`.
///
/// Returns the reply and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn decode(buf: &[u8]) -> Result<Option<(Reply, usize)>, FrameError> {
    let Some(&type_byte) = buf.first() else {
        return Ok(None);
    };
    match type_byte {
        b'+' => Ok(line(buf).map(|(text, used)| (Reply::Simple(lossy(text)), used))),
        b'-' => Ok(line(buf).map(|(text, used)| (Reply::Error(lossy(text)), used))),
        b':' => match line(buf) {
            None => Ok(None),
            Some((text, used)) => {
                let n = parse_int(text).ok_or(FrameError::BadHeader("integer"))?;
                Ok(Some((Reply::Integer(n), used)))
            }
        },
        b'$' => decode_bulk(buf),
        b'*' => decode_array(buf),
        other => Err(FrameError::UnknownType(other)),
    }
}

fn lossy(text: &[u8]) -> String {
    String::from_utf8_lossy(text).into_owned()
}

/// Payload of a CRLF-terminated line, without the leading type byte, plus the
/// total number of bytes the line occupies.
fn line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let end = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[1..end], end + 2))
}

fn parse_int(text: &[u8]) -> Option<i64> {
    std::str::from_utf8(text).ok()?.parse().ok()
}

fn decode_bulk(buf: &[u8]) -> Result<Option<(Reply, usize)>, FrameError> {
    let Some((header, used)) = line(buf) else {
        return Ok(None);
    };
    let len = parse_int(header).ok_or(FrameError::BadHeader("bulk"))?;
    if len < 0 {
        return Ok(Some((Reply::Bulk(None), used)));
    }
    let len = len as usize;
    if buf.len() < used + len + 2 {
        return Ok(None);
    }
    if &buf[used + len..used + len + 2] != b"\r\n" {
        return Err(FrameError::MissingTerminator);
    }
    let payload = buf[used..used + len].to_vec();
    Ok(Some((Reply::Bulk(Some(payload)), used + len + 2)))
}

fn decode_array(buf: &[u8]) -> Result<Option<(Reply, usize)>, FrameError> {
    let Some((header, mut used)) = line(buf) else {
        return Ok(None);
    };
    let len = parse_int(header).ok_or(FrameError::BadHeader("array"))?;
    if len < 0 {
        return Ok(Some((Reply::Array(None), used)));
    }
    let mut items = Vec::with_capacity(len as usize);
    for _ in 0..len {
        match decode(&buf[used..])? {
            Some((item, n)) => {
                items.push(item);
                used += n;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((Reply::Array(Some(items)), used)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_single_word_command() {
        assert_eq!(encode_command(&[b"PING"]), b"*1\r\n$4\r\nPING\r\n".to_vec());
    }

    #[test]
    fn encodes_set_command() {
        let cmd = encode_command(&[b"SET".as_slice(), b"key", b"value"]);
        assert_eq!(cmd, b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n".to_vec());
    }

    #[test]
    fn decodes_simple_string() {
        let (reply, used) = decode(b"+OK\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Simple("OK".to_owned()));
        assert_eq!(used, 5);
    }

    #[test]
    fn decodes_error_reply() {
        let (reply, _) = decode(b"-ERR unknown command\r\n").unwrap().unwrap();
        assert!(reply.is_error());
        assert_eq!(reply.error_message(), Some("ERR unknown command"));
    }

    #[test]
    fn decodes_integer() {
        let (reply, used) = decode(b":1000\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Integer(1000));
        assert_eq!(used, 7);
    }

    #[test]
    fn rejects_malformed_integer() {
        assert_eq!(
            decode(b":one\r\n").unwrap_err(),
            FrameError::BadHeader("integer")
        );
    }

    #[test]
    fn decodes_bulk_string() {
        let (reply, used) = decode(b"$3\r\nfoo\r\nrest").unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(Some(b"foo".to_vec())));
        assert_eq!(used, 9);
    }

    #[test]
    fn decodes_nil_bulk() {
        let (reply, used) = decode(b"$-1\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Bulk(None));
        assert_eq!(used, 5);
    }

    #[test]
    fn bulk_without_terminator_is_an_error() {
        assert_eq!(
            decode(b"$3\r\nfooXX").unwrap_err(),
            FrameError::MissingTerminator
        );
    }

    #[test]
    fn decodes_nested_array() {
        let frame = b"*2\r\n$3\r\nfoo\r\n*1\r\n:7\r\n";
        let (reply, used) = decode(frame).unwrap().unwrap();
        assert_eq!(used, frame.len());
        assert_eq!(
            reply,
            Reply::Array(Some(vec![
                Reply::Bulk(Some(b"foo".to_vec())),
                Reply::Array(Some(vec![Reply::Integer(7)])),
            ]))
        );
    }

    #[test]
    fn decodes_nil_array() {
        let (reply, _) = decode(b"*-1\r\n").unwrap().unwrap();
        assert_eq!(reply, Reply::Array(None));
    }

    #[test]
    fn rejects_unknown_type_byte() {
        assert_eq!(decode(b"!boom\r\n").unwrap_err(), FrameError::UnknownType(b'!'));
    }

    #[test]
    fn every_partial_prefix_is_incomplete() {
        let frames: &[&[u8]] = &[
            b"+OK\r\n",
            b":1000\r\n",
            b"$3\r\nfoo\r\n",
            b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
        ];
        for frame in frames {
            for cut in 0..frame.len() {
                assert_eq!(decode(&frame[..cut]).unwrap(), None, "cut at {cut}");
            }
            assert!(decode(frame).unwrap().is_some());
        }
    }
}
