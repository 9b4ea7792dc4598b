//! Length-prefixed message framing.
//!
//! Every peer message is a 4-byte big-endian length followed by the payload
//! bytes. Frames beyond [`MAX_FRAME_LEN`] are rejected before allocation, so
//! a malicious length prefix cannot exhaust memory.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use failure::Fail;

/// The largest accepted frame payload.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A framing error.
#[derive(Debug, Fail)]
pub enum FrameError {
    /// The underlying stream failed.
    #[fail(display = "Stream error: {}", _0)]
    Io(#[cause] io::Error),
    /// The advertised length exceeds `MAX_FRAME_LEN`.
    #[fail(display = "Frame of {} bytes exceeds the limit", _0)]
    Oversized(usize),
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Reads one length-prefixed frame.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let len = reader.read_u32::<BigEndian>()? as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(len));
    }
    let mut payload = vec![0; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

/// Writes one length-prefixed frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized(payload.len()));
    }
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_frame, write_frame, FrameError};
    use std::io::Cursor;

    #[test]
    fn frame_round_trip() {
        let mut buffer = Vec::new();
        write_frame(&mut buffer, b"hello").expect("write");
        write_frame(&mut buffer, b"").expect("write");

        let mut cursor = Cursor::new(buffer);
        assert_eq!(read_frame(&mut cursor).expect("read"), b"hello");
        assert_eq!(read_frame(&mut cursor).expect("read"), b"");
    }

    #[test]
    fn oversized_length_is_rejected_without_allocation() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&u32::max_value().to_be_bytes());
        let mut cursor = Cursor::new(buffer);
        match read_frame(&mut cursor) {
            Err(FrameError::Oversized(len)) => assert_eq!(len, u32::max_value() as usize),
            other => panic!("expected Oversized, got {:?}", other.map(|v| v.len())),
        }
    }
}
