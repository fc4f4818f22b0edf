//! Length-prefixed frames: a `u32` big-endian length, then the body

use crate::error::FramingError;
use bytes::{Bytes, BytesMut};
use shared::FRAME_HEADER_LEN;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Splits the inbound stream into frame bodies and prefixes outbound ones.
///
/// A declared length above `max_frame_size` is an error before any of the
/// body is buffered.
#[derive(Debug)]
pub struct FrameCodec {
    length_codec: LengthDelimitedCodec,
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            length_codec: LengthDelimitedCodec::builder()
                .length_field_length(FRAME_HEADER_LEN)
                .big_endian()
                .max_frame_length(max_frame_size)
                .new_codec(),
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

/// Length announced by the frame header at the start of `src`
fn declared_len(src: &[u8]) -> usize {
    src.get(..FRAME_HEADER_LEN).map_or(0, |header| {
        u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize
    })
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = FramingError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.length_codec.decode(src) {
            Ok(frame) => Ok(frame),
            // the header is still unconsumed when the limit trips
            Err(e)
                if e
                    .get_ref()
                    .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>()) =>
            {
                Err(FramingError::FrameTooLarge {
                    size: declared_len(src),
                    max: self.max_frame_size,
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FramingError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Ok(self.length_codec.encode(body, dst)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_waits_for_complete_frames() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[0, 3, 1, 2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&[3, 0, 0, 0, 1, 9]);

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &[1, 2, 3]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &[9]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_rejects_oversized_frames() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::from(&17u32.to_be_bytes()[..]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FramingError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    #[test]
    fn test_frame_at_limit_is_accepted() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::from(&[0, 0, 0, 4, 1, 2, 3, 4][..]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_encode_matches_shared_frame_layout() {
        let mut codec = FrameCodec::new(64);
        let mut buf = BytesMut::new();
        codec.encode(Bytes::from_static(&[7, 8, 9]), &mut buf).unwrap();
        assert_eq!(&buf[..], &shared::frame(&[7, 8, 9])[..]);
    }

    #[tokio::test]
    async fn test_framed_stream_across_split_reads() {
        let mut wire = shared::frame(b"hello");
        wire.extend(shared::frame(b""));
        wire.extend(shared::frame(b"world"));

        let stream = tokio_test::io::Builder::new()
            .read(&wire[..2])
            .read(&wire[2..11])
            .read(&wire[11..])
            .build();
        let mut frames = FramedRead::new(stream, FrameCodec::new(64));

        assert_eq!(&frames.next().await.unwrap().unwrap()[..], b"hello");
        assert!(frames.next().await.unwrap().unwrap().is_empty());
        assert_eq!(&frames.next().await.unwrap().unwrap()[..], b"world");
        assert!(frames.next().await.is_none());
    }

    #[tokio::test]
    async fn test_framed_sink_writes_prefixed_bodies() {
        let stream = tokio_test::io::Builder::new()
            .write(&shared::frame(b"abc"))
            .build();
        let mut sink = FramedWrite::new(stream, FrameCodec::new(64));
        sink.send(Bytes::from_static(b"abc")).await.unwrap();
    }
}
