//! Reference wire codec for the frame contract.
//!
//! Frames are carried as a big-endian `u32` length prefix followed by the
//! bincode encoding of [`Frame`] (big-endian, fixed-width integers). The
//! production bit-level codec is an external collaborator; this one exists
//! so the driver, the client mirror and the test suites can speak the frame
//! contract over a real transport.

use bincode::config;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{error::CodecError, frame::Frame};

const LENGTH_PREFIX: usize = 4;

fn wire_config() -> impl config::Config {
    config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Length-prefixed bincode framing for [`Frame`] values.
#[derive(Clone, Copy, Debug)]
pub struct WireCodec {
    max_frame_size: usize,
}

impl WireCodec {
    /// Create a codec enforcing `max_frame_size` on both directions.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self { Self { max_frame_size } }

    /// Maximum frame size currently enforced.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize { self.max_frame_size }

    /// Adopt the tuned maximum frame size.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size;
    }
}

impl Default for WireCodec {
    fn default() -> Self { Self::new(65_536) }
}

impl Decoder for WireCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_frame_size {
            return Err(CodecError::Oversized {
                size: len,
                max: self.max_frame_size,
            });
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_PREFIX);
        let body = src.split_to(len);
        let (frame, _) = bincode::decode_from_slice(&body, wire_config())?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for WireCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = bincode::encode_to_vec(&frame, wire_config())?;
        if body.len() > self.max_frame_size {
            return Err(CodecError::Oversized {
                size: body.len(),
                max: self.max_frame_size,
            });
        }
        dst.reserve(LENGTH_PREFIX + body.len());
        dst.put_u32(u32::try_from(body.len()).expect("frame size bounded by max_frame_size"));
        dst.extend_from_slice(&body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::method::{ExecutionMethod, Method};

    #[test]
    fn frame_survives_a_wire_trip() {
        let mut codec = WireCodec::default();
        let frame = Frame::method(9, Method::Execution(ExecutionMethod::Sync));
        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).expect("encode");
        let decoded = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_input_yields_none() {
        let mut codec = WireCodec::default();
        let frame = Frame::content(1, vec![7; 32], true);
        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).expect("encode");
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let mut codec = WireCodec::new(64);
        let frame = Frame::content(1, vec![0; 256], true);
        let mut buf = BytesMut::new();
        assert!(matches!(
            codec.encode(frame, &mut buf),
            Err(CodecError::Oversized { .. })
        ));
    }
}
