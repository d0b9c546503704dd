//! Framed codec for control-plane communication.
//!
//! Uses LengthDelimitedCodec for framing + serde_json for serialization.
//! Works over any AsyncRead/AsyncWrite (sockets, pipes, in-memory duplex).
//! A malformed or unrecognized payload surfaces as `InvalidData`, which the
//! control plane treats as a protocol violation.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Codec that frames messages with a 4-byte length prefix and serializes
/// with JSON.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let item = serde_json::from_slice(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > 100_000 {
            tracing::info!(json_size_bytes = json.len(), "Large control frame being encoded");
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{MasterMessage, WorkerMessage};

    #[test]
    fn codec_roundtrip_worker_message() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        let msg = WorkerMessage::Register {
            slot: 3,
            generation: 7,
            pid: 4242,
        };
        codec.encode(msg, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(
            decoded,
            WorkerMessage::Register {
                slot: 3,
                generation: 7,
                pid: 4242
            }
        ));
    }

    #[test]
    fn codec_roundtrip_master_message() {
        let mut codec = JsonCodec::<MasterMessage>::new();
        let mut buf = BytesMut::new();

        codec.encode(MasterMessage::Bootstrap, &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();

        assert!(matches!(decoded, MasterMessage::Bootstrap));
    }

    #[test]
    fn partial_frame_decodes_to_none() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        codec
            .encode(WorkerMessage::Ready, &mut buf)
            .unwrap();
        // Withhold the last byte of the frame.
        let partial = buf.split_to(buf.len() - 1);
        let mut partial = BytesMut::from(&partial[..]);

        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn unknown_cmd_is_invalid_data() {
        let mut codec = JsonCodec::<WorkerMessage>::new();
        let mut buf = BytesMut::new();

        let payload = br#"{"cmd":"reticulate"}"#;
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(payload);

        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
