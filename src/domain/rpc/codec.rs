use std::fmt::Debug;
use std::io;
use std::str::FromStr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::domain::rpc::protocol::Envelope;
use crate::error::{ConversionError, RpcError};

const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Turns an envelope into the body of one frame and back.
pub trait MessageSerializer: Debug + Send + Sync {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, RpcError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, RpcError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BincodeSerializer;

impl MessageSerializer for BincodeSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, RpcError> {
        bincode::serialize(envelope).map_err(|e| RpcError::Codec(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, RpcError> {
        bincode::deserialize(bytes).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, envelope: &Envelope) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(envelope).map_err(|e| RpcError::Codec(e.to_string()))
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Envelope, RpcError> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Codec(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SerializerType {
    #[default]
    Bincode,
    Json,
}

impl SerializerType {
    pub fn build(&self) -> Arc<dyn MessageSerializer> {
        match self {
            SerializerType::Bincode => Arc::new(BincodeSerializer),
            SerializerType::Json => Arc::new(JsonSerializer),
        }
    }
}

impl FromStr for SerializerType {
    type Err = ConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bincode" => Ok(SerializerType::Bincode),
            "json" => Ok(SerializerType::Json),
            _ => Err(ConversionError::UnknownSerializer(s.to_string())),
        }
    }
}

/// Combines LengthDelimitedCodec (4 byte length prefix) with a pluggable
/// envelope serializer.
#[derive(Debug)]
pub struct EnvelopeCodec {
    codec: LengthDelimitedCodec,
    serializer: Arc<dyn MessageSerializer>,
}

impl EnvelopeCodec {
    pub fn new(serializer: Arc<dyn MessageSerializer>) -> Self {
        let codec = LengthDelimitedCodec::builder().length_field_length(4).max_frame_length(MAX_FRAME_LENGTH).new_codec();
        Self { codec, serializer }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = self.serializer.serialize(&item).map_err(io::Error::other)?;
        self.codec.encode(Bytes::from(bytes), dst)
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.codec.decode(src)? {
            Some(bytes) => {
                let item = self.serializer.deserialize(&bytes).map_err(io::Error::other)?;
                Ok(Some(item))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::domain::model::definition::TaskKind;
    use crate::domain::rpc::protocol::{Payload, TaskExecuteRequest};
    use crate::domain::utils::id::{Host, NodeCode, TaskInstanceId, WorkflowInstanceId};

    fn request() -> Envelope {
        Envelope::request(
            7,
            Payload::TaskExecuteRequest(TaskExecuteRequest {
                task_instance_id: TaskInstanceId::new("t-1"),
                workflow_instance_id: WorkflowInstanceId::new("wf-1"),
                node_code: NodeCode::new("a"),
                attempt: 2,
                kind: TaskKind::Shell,
                params: BTreeMap::from([("command".to_string(), "echo hi".to_string())]),
                master_host: Host::new("127.0.0.1:5678"),
            }),
        )
    }

    #[test]
    fn frames_carry_a_four_byte_length_prefix() {
        for serializer in [SerializerType::Bincode, SerializerType::Json] {
            let mut codec = EnvelopeCodec::new(serializer.build());
            let mut buf = BytesMut::new();
            codec.encode(request(), &mut buf).unwrap();

            let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
            assert_eq!(declared, buf.len() - 4);
            assert_eq!(codec.decode(&mut buf).unwrap(), Some(request()));
        }
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let mut codec = EnvelopeCodec::new(SerializerType::Bincode.build());
        let mut full = BytesMut::new();
        codec.encode(request(), &mut full).unwrap();

        let mut partial = full.split_to(full.len() / 2);
        assert_eq!(codec.decode(&mut partial).unwrap(), None);
        partial.unsplit(full);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn unknown_serializer_is_rejected() {
        assert_eq!("JSON".parse::<SerializerType>(), Ok(SerializerType::Json));
        assert!(matches!("protobuf".parse::<SerializerType>(), Err(ConversionError::UnknownSerializer(_))));
    }
}
