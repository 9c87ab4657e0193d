//! Request/response messages exchanged between nodes.
//!
//! Each message kind travels on its own [`Topic`], so a receiver dispatches
//! on the topic before looking at the payload. The payload is an
//! [`Envelope`]:
//!
//! ```text
//! [correlation: 16 bytes] [from: u64] [map: string] [message fields ...]
//! ```
//!
//! A response carries the correlation id of the request it answers.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use kestrel_common::{BlockId, KestrelError, NodeId, Result};
use kestrel_storage::Codec;
use uuid::Uuid;

/// Message channel names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topic {
    PutRequest = 1,
    PutResponse = 2,
    GetRequest = 3,
    GetResponse = 4,
    Failure = 5,
}

impl Topic {
    /// True for topics that answer an earlier request.
    pub fn is_response(&self) -> bool {
        matches!(self, Topic::PutResponse | Topic::GetResponse | Topic::Failure)
    }
}

impl TryFrom<u8> for Topic {
    type Error = KestrelError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Topic::PutRequest),
            2 => Ok(Topic::PutResponse),
            3 => Ok(Topic::GetRequest),
            4 => Ok(Topic::GetResponse),
            5 => Ok(Topic::Failure),
            other => Err(KestrelError::Codec(format!("unknown topic {other}"))),
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Topic::PutRequest => "kestrel.dhash.put.request",
            Topic::PutResponse => "kestrel.dhash.put.response",
            Topic::GetRequest => "kestrel.dhash.get.request",
            Topic::GetResponse => "kestrel.dhash.get.response",
            Topic::Failure => "kestrel.dhash.failure",
        };
        write!(f, "{name}")
    }
}

/// Distributed map operations. Keys and values travel in their encoded form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `block_id` is the owner's shard root, if the sender has learned it.
    PutRequest {
        key: Bytes,
        value: Bytes,
        block_id: Option<BlockId>,
    },
    PutResponse {
        block_id: BlockId,
    },
    GetRequest {
        key: Bytes,
        block_id: Option<BlockId>,
    },
    GetResponse {
        value: Option<Bytes>,
    },
    /// The owner could not serve a request.
    Failure {
        reason: String,
    },
}

impl Message {
    pub fn topic(&self) -> Topic {
        match self {
            Message::PutRequest { .. } => Topic::PutRequest,
            Message::PutResponse { .. } => Topic::PutResponse,
            Message::GetRequest { .. } => Topic::GetRequest,
            Message::GetResponse { .. } => Topic::GetResponse,
            Message::Failure { .. } => Topic::Failure,
        }
    }

    fn encode_fields(&self, buf: &mut BytesMut) {
        match self {
            Message::PutRequest {
                key,
                value,
                block_id,
            } => {
                key.encode(buf);
                value.encode(buf);
                block_id.encode(buf);
            }
            Message::PutResponse { block_id } => block_id.encode(buf),
            Message::GetRequest { key, block_id } => {
                key.encode(buf);
                block_id.encode(buf);
            }
            Message::GetResponse { value } => value.encode(buf),
            Message::Failure { reason } => reason.encode(buf),
        }
    }

    fn decode_fields(topic: Topic, buf: &mut &[u8]) -> Result<Self> {
        Ok(match topic {
            Topic::PutRequest => Message::PutRequest {
                key: Bytes::decode(buf)?,
                value: Bytes::decode(buf)?,
                block_id: Option::<BlockId>::decode(buf)?,
            },
            Topic::PutResponse => Message::PutResponse {
                block_id: BlockId::decode(buf)?,
            },
            Topic::GetRequest => Message::GetRequest {
                key: Bytes::decode(buf)?,
                block_id: Option::<BlockId>::decode(buf)?,
            },
            Topic::GetResponse => Message::GetResponse {
                value: Option::<Bytes>::decode(buf)?,
            },
            Topic::Failure => Message::Failure {
                reason: String::decode(buf)?,
            },
        })
    }
}

/// A message plus its routing header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub correlation: Uuid,
    pub from: NodeId,
    /// Name of the distributed map the message is for.
    pub map: String,
    pub message: Message,
}

impl Envelope {
    pub fn topic(&self) -> Topic {
        self.message.topic()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_slice(self.correlation.as_bytes());
        buf.put_u64_le(self.from.0);
        self.map.encode(&mut buf);
        self.message.encode_fields(&mut buf);
        buf.freeze()
    }

    /// Decodes a payload received on `topic`.
    pub fn decode(topic: Topic, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        if buf.remaining() < 16 + 8 {
            return Err(KestrelError::Codec(format!(
                "envelope header needs 24 bytes, got {}",
                buf.remaining()
            )));
        }
        let mut correlation = [0u8; 16];
        buf.copy_to_slice(&mut correlation);
        let from = NodeId(buf.get_u64_le());
        let map = String::decode(&mut buf)?;
        let message = Message::decode_fields(topic, &mut buf)?;
        if !buf.is_empty() {
            return Err(KestrelError::Codec(format!(
                "{} trailing bytes after {topic} message",
                buf.len()
            )));
        }
        Ok(Self {
            correlation: Uuid::from_bytes(correlation),
            from,
            map,
            message,
        })
    }

    /// Builds the reply to this request, reusing its correlation id.
    pub fn reply(&self, from: NodeId, message: Message) -> Envelope {
        Envelope {
            correlation: self.correlation,
            from,
            map: self.map.clone(),
            message,
        }
    }
}
