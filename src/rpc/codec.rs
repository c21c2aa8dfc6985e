//! Newline-delimited JSON framing
//!
//! Each envelope occupies exactly one line. Line framing errors are fatal to the
//! connection, but a line that is not valid JSON for the expected type is
//! surfaced as a per-frame decode failure so the loop can answer and continue.

use std::{io, marker::PhantomData};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::{
    bytes::BytesMut,
    codec::{Decoder, Encoder, LinesCodec, LinesCodecError},
};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds the maximum length of {max} bytes")]
    FrameTooLong { max: usize },
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Decodes frames into `D` and encodes `E` frames.
pub struct EnvelopeCodec<D, E> {
    lines: LinesCodec,
    max_frame_bytes: usize,
    _envelopes: PhantomData<fn(E) -> D>,
}

impl<D, E> EnvelopeCodec<D, E> {
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_frame_bytes),
            max_frame_bytes,
            _envelopes: PhantomData,
        }
    }

    fn map_lines_error(&self, err: LinesCodecError) -> CodecError {
        match err {
            LinesCodecError::MaxLineLengthExceeded => CodecError::FrameTooLong {
                max: self.max_frame_bytes,
            },
            LinesCodecError::Io(err) => CodecError::Io(err),
        }
    }

    fn parse(line: String) -> Option<Result<D, serde_json::Error>>
    where
        D: DeserializeOwned,
    {
        // Blank lines are keep-alive noise, not frames.
        if line.trim().is_empty() {
            return None;
        }
        Some(serde_json::from_str(&line))
    }
}

impl<D: DeserializeOwned, E> Decoder for EnvelopeCodec<D, E> {
    type Item = Result<D, serde_json::Error>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.lines.decode(src).map_err(|err| self.map_lines_error(err))? {
                Some(line) => {
                    if let Some(frame) = Self::parse(line) {
                        return Ok(Some(frame));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self
                .lines
                .decode_eof(src)
                .map_err(|err| self.map_lines_error(err))?
            {
                Some(line) => {
                    if let Some(frame) = Self::parse(line) {
                        return Ok(Some(frame));
                    }
                }
                None => return Ok(None),
            }
        }
    }
}

impl<D, E: Serialize> Encoder<E> for EnvelopeCodec<D, E> {
    type Error = CodecError;

    fn encode(&mut self, item: E, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        if line.len() > self.max_frame_bytes {
            return Err(CodecError::FrameTooLong {
                max: self.max_frame_bytes,
            });
        }
        self.lines
            .encode(line, dst)
            .map_err(|err| self.map_lines_error(err))
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::rpc::envelope::{Request, RequestId};

    #[test]
    fn decodes_one_envelope_per_line() {
        let mut codec = EnvelopeCodec::<Value, Value>::new(1024);
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\n{\"c\""[..]);

        let first = codec.decode(&mut buf).expect("decode").expect("frame");
        let second = codec.decode(&mut buf).expect("decode").expect("frame");
        let partial = codec.decode(&mut buf).expect("decode");

        assert_eq!(first.expect("json"), json!({"a": 1}));
        assert_eq!(second.expect("json"), json!({"b": 2}));
        assert!(partial.is_none());
    }

    #[test]
    fn malformed_line_is_a_frame_level_failure() {
        let mut codec = EnvelopeCodec::<Value, Value>::new(1024);
        let mut buf = BytesMut::from(&b"not json\n{\"ok\":true}\n"[..]);

        let bad = codec.decode(&mut buf).expect("decode").expect("frame");
        let good = codec.decode(&mut buf).expect("decode").expect("frame");

        assert!(bad.is_err());
        assert_eq!(good.expect("json"), json!({"ok": true}));
    }

    #[test]
    fn blank_lines_are_skipped() {
        let mut codec = EnvelopeCodec::<Value, Value>::new(1024);
        let mut buf = BytesMut::from(&b"\n  \n{\"x\":1}\n"[..]);

        let frame = codec.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.expect("json"), json!({"x": 1}));
    }

    #[test]
    fn over_length_frame_is_rejected() {
        let mut codec = EnvelopeCodec::<Value, Value>::new(8);
        let mut buf = BytesMut::from(&b"{\"long\":\"value\"}\n"[..]);

        let err = codec.decode(&mut buf).expect_err("line too long");
        assert!(matches!(err, CodecError::FrameTooLong { max: 8 }));
    }

    #[test]
    fn encoder_writes_newline_terminated_json() {
        let mut codec = EnvelopeCodec::<Value, Request>::new(1024);
        let mut buf = BytesMut::new();
        let request = Request::new(RequestId::from("id-1"), "Test.Test", json!("hi"));

        codec.encode(request.clone(), &mut buf).expect("encode");

        let text = std::str::from_utf8(&buf).expect("utf8");
        assert!(text.ends_with('\n'));
        assert_eq!(text.matches('\n').count(), 1);

        let decoded: Request = serde_json::from_str(text.trim_end()).expect("round trip");
        assert_eq!(decoded, request);
    }

    #[tokio::test]
    async fn framed_writer_flushes_and_closes_typed_envelopes() {
        let (writer, reader) = tokio::io::duplex(1024);
        let mut sink = FramedWrite::new(writer, EnvelopeCodec::<Value, Request>::new(1024));
        let request = Request::new(RequestId::from("id-2"), "Test.Test", json!([1, 2]));

        sink.send(request.clone()).await.expect("send");
        sink.close().await.expect("close");

        let mut frames = FramedRead::new(reader, EnvelopeCodec::<Request, Value>::new(1024));
        let frame = frames.next().await.expect("frame").expect("read");
        assert_eq!(frame.expect("json"), request);
        assert!(frames.next().await.is_none());
    }
}
