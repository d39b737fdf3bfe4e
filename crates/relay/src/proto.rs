// Protobuf encoding of staged records
//
// The store keeps the sequence as the row key, so only the message body
// travels through this schema.

use crate::types::{Sequence, StagedMessage};
use bytes::Bytes;
use prost::Message;

#[derive(Clone, PartialEq, prost::Message)]
pub struct StagedRecord {
    #[prost(string, tag = "1")]
    pub exchange: String,
    #[prost(string, tag = "2")]
    pub routing_key: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub payload: Bytes,
}

/// Convert internal StagedMessage to protobuf StagedRecord
pub fn message_to_proto(msg: &StagedMessage) -> StagedRecord {
    StagedRecord {
        exchange: msg.exchange.clone(),
        routing_key: msg.routing_key.clone(),
        payload: msg.payload.clone(),
    }
}

/// Convert protobuf StagedRecord back into a StagedMessage stored under `sequence`
pub fn proto_to_message(sequence: Sequence, proto: StagedRecord) -> StagedMessage {
    StagedMessage {
        sequence,
        exchange: proto.exchange,
        routing_key: proto.routing_key,
        payload: proto.payload,
    }
}

pub fn encode_message(msg: &StagedMessage) -> Vec<u8> {
    message_to_proto(msg).encode_to_vec()
}

pub fn decode_message(sequence: Sequence, buf: &[u8]) -> Result<StagedMessage, prost::DecodeError> {
    let proto = StagedRecord::decode(buf)?;
    Ok(proto_to_message(sequence, proto))
}
