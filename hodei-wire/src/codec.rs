use crate::message::{OrchestratorMessage, WorkerMessage};
use bytes::BytesMut;
use prost::Message;
use std::io;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. Large log payloads must be chunked below
/// this by the sender.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("i/o error on worker stream: {0}")]
    Io(#[from] io::Error),
    #[error("malformed frame: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] prost::EncodeError),
}

/// Length-prefixed (u32 big-endian) framing around prost-encoded messages.
/// `In` is the message type decoded from the peer, `Out` the type encoded
/// towards it.
pub struct MessageCodec<In, Out> {
    inner: LengthDelimitedCodec,
    _marker: PhantomData<fn(Out) -> In>,
}

/// Decodes `WorkerMessage`, encodes `OrchestratorMessage`.
pub type OrchestratorCodec = MessageCodec<WorkerMessage, OrchestratorMessage>;

/// Decodes `OrchestratorMessage`, encodes `WorkerMessage`.
pub type WorkerCodec = MessageCodec<OrchestratorMessage, WorkerMessage>;

impl<In, Out> MessageCodec<In, Out> {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(DEFAULT_MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_bytes)
                .length_field_type::<u32>()
                .new_codec(),
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for MessageCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: Message + Default, Out> Decoder for MessageCodec<In, Out> {
    type Item = In;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>, WireError> {
        match self.inner.decode(src)? {
            Some(frame) => Ok(Some(In::decode(frame.freeze())?)),
            None => Ok(None),
        }
    }
}

impl<In, Out: Message> Encoder<Out> for MessageCodec<In, Out> {
    type Error = WireError;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<(), WireError> {
        let mut buf = BytesMut::with_capacity(item.encoded_len());
        item.encode(&mut buf)?;
        self.inner.encode(buf.freeze(), dst)?;
        Ok(())
    }
}
