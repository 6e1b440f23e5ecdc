//! Length-prefixed binary framing for TCPROS.
//!
//! Frame layout (4-byte prefix + payload):
//!
//! ```text
//! +-------------+------------------+
//! | length      | payload          |
//! | 4 bytes LE  | length bytes     |
//! +-------------+------------------+
//! ```
//!
//! Every message on a TCPROS socket is one frame: the connection header
//! first, then one frame per serialized message. A zero-length frame is
//! legal and carries an empty payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix in bytes.
pub const FRAME_PREFIX_SIZE: usize = 4;

/// Encodes a payload into a frame: `u32le(len) || payload`.
pub fn encode_frame(payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf
}

/// Incremental decoder for a stream of frames.
///
/// Data arrives in arbitrary chunks via [`extend`](Self::extend); complete
/// payloads are drained with [`decode`](Self::decode). The decoder is
/// greedy: a chunk containing several complete frames yields all of them
/// before `decode` returns `None` for the partial tail.
///
/// A declared length above [`MAX_PAYLOAD_SIZE`] fails as soon as the four
/// prefix bytes are known and poisons the decoder; every later call
/// returns an error and the caller must close the underlying socket.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            poisoned: false,
        }
    }

    /// Appends raw bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next frame payload.
    ///
    /// Returns `Ok(Some(payload))` for each complete frame, `Ok(None)`
    /// when more data is needed, or `Err` once the stream is poisoned.
    pub fn decode(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }

        if self.buffer.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_le_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]);

        if len > MAX_PAYLOAD_SIZE {
            self.poisoned = true;
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let total = FRAME_PREFIX_SIZE + len as usize;
        if self.buffer.len() < total {
            return Ok(None);
        }

        self.buffer.advance(FRAME_PREFIX_SIZE);
        Ok(Some(self.buffer.split_to(len as usize).freeze()))
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns whether an earlier framing error has poisoned the stream.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }
}
