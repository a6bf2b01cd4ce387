//! Length-prefixed framing for agent messages.
//!
//! Every message on a client socket (and inside the Pageant shared region)
//! is a 4-byte big-endian length followed by exactly that many payload
//! bytes. Decoding peeks at the header and never consumes a partial frame,
//! so callers can keep appending reads to the same buffer.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Size of the big-endian length header.
pub const LENGTH_PREFIX: usize = 4;

/// Default upper bound on a single payload (256 KiB).
pub const DEFAULT_MAX_FRAME: usize = 256 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The header declares more payload than the configured maximum.
    #[error("frame declares {len} bytes, maximum is {max}")]
    TooLarge { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result of inspecting a buffer for one frame.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded<'a> {
    /// At least this many further bytes are needed before anything can be
    /// returned. Nothing was consumed.
    NeedMore(usize),
    /// One whole frame, plus whatever followed it in the buffer.
    Complete { payload: &'a [u8], rest: &'a [u8] },
}

/// Inspect `buf` for a single frame without consuming it.
///
/// An oversized length is reported as soon as the header is readable,
/// whether or not the declared payload has arrived.
pub fn decode(buf: &[u8], max_frame: usize) -> Result<Decoded<'_>, FrameError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(Decoded::NeedMore(LENGTH_PREFIX - buf.len()));
    }

    let mut header = [0u8; LENGTH_PREFIX];
    header.copy_from_slice(&buf[..LENGTH_PREFIX]);
    let len = u32::from_be_bytes(header) as usize;
    if len > max_frame {
        return Err(FrameError::TooLarge { len, max: max_frame });
    }

    let total = LENGTH_PREFIX + len;
    if buf.len() < total {
        return Ok(Decoded::NeedMore(total - buf.len()));
    }

    Ok(Decoded::Complete {
        payload: &buf[LENGTH_PREFIX..total],
        rest: &buf[total..],
    })
}

/// Frame `payload` as `len || payload`.
pub fn encode(payload: &[u8], max_frame: usize) -> Result<Bytes, FrameError> {
    let mut dst = BytesMut::with_capacity(LENGTH_PREFIX + payload.len());
    put_frame(payload, max_frame, &mut dst)?;
    Ok(dst.freeze())
}

fn put_frame(payload: &[u8], max_frame: usize, dst: &mut BytesMut) -> Result<(), FrameError> {
    if payload.len() > max_frame || u32::try_from(payload.len()).is_err() {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_frame,
        });
    }
    dst.reserve(LENGTH_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    Ok(())
}

/// Stateless codec over `BytesMut` buffers.
///
/// Unlike `LengthDelimitedCodec` this keeps the header in the buffer until
/// the whole frame is present, so a partially read frame is always visible
/// to [`decode`] as-is.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let step = match decode(src, self.max_frame)? {
            Decoded::NeedMore(n) => Err(n),
            Decoded::Complete { payload, .. } => Ok(payload.len()),
        };

        match step {
            Err(missing) => {
                src.reserve(missing);
                Ok(None)
            }
            Ok(len) => {
                let mut frame = src.split_to(LENGTH_PREFIX + len);
                frame.advance(LENGTH_PREFIX);
                tracing::trace!(frame_len = len, "Decoded frame");
                Ok(Some(frame.freeze()))
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(&item, self.max_frame, dst)
    }
}

impl Encoder<&[u8]> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        put_frame(item, self.max_frame, dst)
    }
}
