//! Frame codec for control socket messages.
//!
//! Every message is a 4-byte big-endian length followed by a JSON body, so a
//! message is self-delimiting even on a stream socket. Descriptors never
//! travel in the body; they ride alongside the first byte of the frame as
//! ancillary data (see `transport`).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Control messages are tiny; anything above this is a confused peer.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

fn invalid(e: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}

/// Length-prefixed JSON codec for one message type.
pub struct JsonCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        let frames = LengthDelimitedCodec::builder()
            .big_endian()
            .length_field_length(4)
            .max_frame_length(MAX_FRAME_LENGTH)
            .new_codec();
        Self {
            frames,
            _message: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<T>> {
        let Some(body) = self.frames.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&body).map(Some).map_err(invalid)
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> io::Result<()> {
        let body = serde_json::to_vec(&item).map_err(invalid)?;
        tracing::trace!(body_bytes = body.len(), "Encoding control message");
        self.frames.encode(Bytes::from(body), dst)
    }
}

/// Encode a single message into a standalone frame.
pub fn encode_frame<T: Serialize>(item: T) -> io::Result<BytesMut> {
    let mut buf = BytesMut::new();
    JsonCodec::<T>::new().encode(item, &mut buf)?;
    Ok(buf)
}
