//! Length-prefixed frame codec.
//!
//! Frames are laid out as:
//! - 4 bytes: network magic
//! - 4 bytes: big-endian body length
//! - N bytes: bincode-serialized [`Frame`]

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{MAX_MESSAGE_SIZE, NETWORK_MAGIC};
use crate::error::{P2pError, P2pResult};
use crate::protocol::Frame;

/// Header size: 4 bytes magic + 4 bytes length.
const HEADER_SIZE: usize = 8;

/// Codec for length-prefixed frames.
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Body length of the frame being read, once its header was seen.
    current_length: Option<usize>,
}

impl MessageCodec {
    /// Create a new codec.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = P2pError;

    fn decode(&mut self, src: &mut BytesMut) -> P2pResult<Option<Frame>> {
        let length = match self.current_length {
            Some(length) => length,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }

                let magic = [src[0], src[1], src[2], src[3]];
                if magic != NETWORK_MAGIC {
                    return Err(P2pError::InvalidMagic {
                        expected: NETWORK_MAGIC,
                        actual: magic,
                    });
                }

                let length = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
                if length > MAX_MESSAGE_SIZE {
                    return Err(P2pError::MessageTooLarge {
                        size: length,
                        max: MAX_MESSAGE_SIZE,
                    });
                }

                src.advance(HEADER_SIZE);
                self.current_length = Some(length);
                length
            }
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length);
        self.current_length = None;

        let frame = kni_core::serialization::deserialize_bounded(&body, MAX_MESSAGE_SIZE as u64)?;
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for MessageCodec {
    type Error = P2pError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> P2pResult<()> {
        let body = kni_core::serialization::serialize(&frame)?;
        if body.len() > MAX_MESSAGE_SIZE {
            return Err(P2pError::MessageTooLarge {
                size: body.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + body.len());
        dst.put_slice(&NETWORK_MAGIC);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
