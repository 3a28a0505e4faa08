use std::io::{self, Read, Write};

use crate::constants::MESSAGE_TERMINATOR;

/// Result of scanning a connection's receive buffer for one request.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameResult {
    /// A full request is present. `len` excludes the terminator, `consumed` includes it.
    Complete { len: usize, consumed: usize },
    /// No terminator yet and there is still room to read more.
    Incomplete,
    /// The buffer is full and holds no terminator.
    Oversized,
}

/// Find the first NUL-terminated request in `buf`.
///
/// `capacity` is the size of the receive buffer `buf` was read into; once
/// `buf` fills it without a terminator the request can never complete.
pub fn try_parse_frame(buf: &[u8], capacity: usize) -> FrameResult {
    match buf.iter().position(|&b| b == MESSAGE_TERMINATOR) {
        Some(pos) => FrameResult::Complete {
            len: pos,
            consumed: pos + 1,
        },
        None if buf.len() >= capacity => FrameResult::Oversized,
        None => FrameResult::Incomplete,
    }
}

/// Append `payload` to an outgoing buffer, adding the terminator if the
/// payload does not already end with one.
pub fn write_response(buf: &mut Vec<u8>, payload: &[u8]) {
    buf.extend_from_slice(payload);
    if payload.last() != Some(&MESSAGE_TERMINATOR) {
        buf.push(MESSAGE_TERMINATOR);
    }
}

/// True when a request carries nothing but whitespace.
pub fn is_blank(request: &[u8]) -> bool {
    request.iter().all(|b| b.is_ascii_whitespace())
}

/// Blocking client side: send one request, terminator appended if missing.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let mut frame = Vec::with_capacity(payload.len() + 1);
    write_response(&mut frame, payload);
    writer.write_all(&frame)?;
    writer.flush()
}

/// Blocking client side: read up to the next terminator. Bytes read past it
/// stay in `pending` for the next call.
pub fn read_message<R: Read>(reader: &mut R, pending: &mut Vec<u8>) -> io::Result<Vec<u8>> {
    let mut chunk = [0u8; 4096];
    loop {
        if let Some(pos) = pending.iter().position(|&b| b == MESSAGE_TERMINATOR) {
            let message = pending[..pos].to_vec();
            pending.drain(..=pos);
            return Ok(message);
        }
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before message terminator",
            ));
        }
        pending.extend_from_slice(&chunk[..n]);
    }
}
