//! Length-prefixed frames carrying JSON envelopes.
//!
//! A frame is a little-endian `u32` payload length followed by the payload.
//! The simulator pushes every message through [`encode_envelope`] and
//! [`decode_envelope`] so that what crosses a link is bytes, the same as it
//! would be on a socket.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::protocol::Envelope;

/// Frames larger than this are rejected before allocating.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame io: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    TooLarge(usize),
    #[error("frame truncated: expected {expected} payload bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("undecodable envelope: {0}")]
    Codec(#[from] serde_json::Error),
}

pub fn write_frame<W: Write>(out: &mut W, data: &[u8]) -> Result<(), FrameError> {
    if data.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(data.len()));
    }
    out.write_all(&(data.len() as u32).to_le_bytes())?;
    out.write_all(data)?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the reader was already at a clean end.
pub fn read_frame<R: Read>(input: &mut R) -> Result<Option<Vec<u8>>, FrameError> {
    let mut len_bytes = [0u8; 4];
    match input.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }

    let mut buf = Vec::with_capacity(len);
    let found = input.take(len as u64).read_to_end(&mut buf)?;
    if found < len {
        return Err(FrameError::Truncated {
            expected: len,
            found,
        });
    }
    Ok(Some(buf))
}

pub fn encode_envelope(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(envelope)?;
    let mut frame = Vec::with_capacity(payload.len() + 4);
    write_frame(&mut frame, &payload)?;
    Ok(frame)
}

pub fn decode_envelope(frame: &[u8]) -> Result<Envelope, FrameError> {
    let mut reader = frame;
    match read_frame(&mut reader)? {
        Some(payload) => Ok(serde_json::from_slice(&payload)?),
        None => Err(FrameError::Truncated {
            expected: 4,
            found: frame.len(),
        }),
    }
}
