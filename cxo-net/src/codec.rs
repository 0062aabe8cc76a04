//! Length-prefixed frame codec.
//!
//! Wire format: a 4-byte little-endian unsigned length, then that many
//! bytes of opaque payload. The engine never looks inside the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NetError;

/// Number of bytes in the length prefix.
pub const HEAD_LEN: usize = 4;

/// Codec for length-prefixed opaque frames.
///
/// `max_message_size == 0` disables the size check. An oversize frame is
/// fatal in both directions: on decode the stream is desynchronized beyond
/// recovery, on encode the caller handed over a payload it was configured
/// not to send.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    fn check_size(&self, size: usize) -> Result<(), NetError> {
        if self.max_message_size > 0 && size > self.max_message_size {
            return Err(NetError::FrameTooLarge {
                size,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        if src.len() < HEAD_LEN {
            return Ok(None);
        }

        let mut head = [0u8; HEAD_LEN];
        head.copy_from_slice(&src[..HEAD_LEN]);
        let raw = u32::from_le_bytes(head);

        let len = usize::try_from(raw).map_err(|_| NetError::LengthOverflow(raw))?;
        self.check_size(len)?;

        if src.len() < HEAD_LEN + len {
            src.reserve(HEAD_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEAD_LEN);
        Ok(Some(src.split_to(len).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), NetError> {
        let len = u32::try_from(item.len()).map_err(|_| NetError::FrameTooLarge {
            size: item.len(),
            max: u32::MAX as usize,
        })?;
        self.check_size(item.len())?;

        dst.reserve(HEAD_LEN + item.len());
        dst.put_u32_le(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(payload: &[u8]) -> Bytes {
        let mut codec = FrameCodec::new(0);
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn encode_then_decode_is_identity() {
        for payload in [&b""[..], &b"\xff"[..], &[0xAA; 65535][..]] {
            assert_eq!(&roundtrip(payload)[..], payload);
        }
    }

    #[test]
    fn wire_layout_is_little_endian() {
        let mut codec = FrameCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"abc"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn partial_input_yields_none() {
        let mut codec = FrameCodec::new(0);

        // Incomplete head.
        let mut buf = BytesMut::from(&[5u8, 0, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Complete head, incomplete body.
        let mut buf = BytesMut::from(&[5u8, 0, 0, 0, b'x', b'y'][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // The rest of the body arrives.
        buf.extend_from_slice(b"zzz");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"xyzzz");
    }

    #[test]
    fn multiple_frames_decode_in_order() {
        let mut codec = FrameCodec::new(0);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(b"one"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"two"), &mut buf).unwrap();
        codec.encode(Bytes::new(), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn max_size_boundary() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();

        // Exactly at the limit: accepted.
        codec
            .encode(Bytes::from(vec![0u8; 16]), &mut buf)
            .unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 16);

        // One byte over: rejected on encode...
        let err = codec
            .encode(Bytes::from(vec![0u8; 17]), &mut buf)
            .unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { size: 17, max: 16 }));
        assert!(err.is_fatal());

        // ...and on decode, before the body even arrives.
        let mut buf = BytesMut::from(&[17u8, 0, 0, 0][..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(err, NetError::FrameTooLarge { size: 17, max: 16 }));
    }

    #[test]
    fn zero_max_disables_the_check() {
        let mut codec = FrameCodec::new(0);
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::from(vec![0u8; 1 << 20]), &mut buf)
            .unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), 1 << 20);
    }
}
