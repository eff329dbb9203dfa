//! Wire protocol messages.
//!
//! Everything that crosses a peer connection is an [`RpcEnvelope`]: a batch
//! of [`RpcMessage`] records, each an operation plus sender-stamped
//! metadata. Envelopes serialize with the same bounded bincode options as
//! the DAG records; the transport is expected to length-prefix the encoded
//! envelope on its stream.
//!
//! ## Operations
//!
//! | Code | Operation | Payload |
//! |------|-----------|---------|
//! | 0 | `Ping` | none (reserved, unused) |
//! | 1 | `Update` | [`PeerTreeWire`] |
//! | 2 | `PublishEvent` | [`EventDescriptor`] |
//! | 3 | `JoinTopic` | topic CID |
//! | 4 | `LeaveTopic` | topic CID |
//! | 5 | `NewTopic` | [`TopicDescriptor`] |
//! | 6 | `RequestToPublish` | [`EventDescriptor`] |
//!
//! The enum variant order IS the operation code: bincode tags each variant
//! with its index, so reordering variants is a wire-breaking change. The
//! `op_codes_are_stable` test pins this down.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{
    from_canonical_bytes, to_canonical_bytes, Cid, EventDescriptor, TopicDescriptor,
};
use crate::error::PulsarcastError;
use crate::identity::Identity;
use crate::PROTOCOL_VERSION;

/// Maximum number of messages accepted in a single envelope.
pub const MAX_ENVELOPE_MESSAGES: usize = 64;

/// Metadata stamped on every outbound message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub created: DateTime<Utc>,
    pub protocol_version: String,
}

impl MessageMetadata {
    pub fn now() -> Self {
        Self {
            created: Utc::now(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// A peer's declared `{parents, children}` sets for one topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTreeWire {
    pub topic: Cid,
    pub parents: Vec<Identity>,
    pub children: Vec<Identity>,
}

/// One protocol operation. Variant order defines the wire operation code.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcOp {
    /// Reserved; ignored on receipt.
    Ping,
    /// Declare the sender's tree state for a topic.
    Update { peer_tree: PeerTreeWire },
    /// Disseminate an event (pending or committed).
    PublishEvent { event: EventDescriptor },
    /// Register the sender as a child in the topic's tree.
    JoinTopic { topic_id: Cid },
    /// Remove the sender from the topic's tree.
    LeaveTopic { topic_id: Cid },
    /// Announce a freshly created topic descriptor.
    NewTopic { topic: TopicDescriptor },
    /// Ask an authorized peer to commit the carried event.
    RequestToPublish { event: EventDescriptor },
}

impl RpcOp {
    /// Numeric operation code as it appears on the wire.
    pub fn op_code(&self) -> u32 {
        match self {
            RpcOp::Ping => 0,
            RpcOp::Update { .. } => 1,
            RpcOp::PublishEvent { .. } => 2,
            RpcOp::JoinTopic { .. } => 3,
            RpcOp::LeaveTopic { .. } => 4,
            RpcOp::NewTopic { .. } => 5,
            RpcOp::RequestToPublish { .. } => 6,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RpcOp::Ping => "PING",
            RpcOp::Update { .. } => "UPDATE",
            RpcOp::PublishEvent { .. } => "PUBLISH_EVENT",
            RpcOp::JoinTopic { .. } => "JOIN_TOPIC",
            RpcOp::LeaveTopic { .. } => "LEAVE_TOPIC",
            RpcOp::NewTopic { .. } => "NEW_TOPIC",
            RpcOp::RequestToPublish { .. } => "REQUEST_TO_PUBLISH",
        }
    }

    /// The topic this operation concerns, where one is carried directly.
    pub fn topic_id(&self) -> Option<Cid> {
        match self {
            RpcOp::JoinTopic { topic_id } | RpcOp::LeaveTopic { topic_id } => Some(*topic_id),
            RpcOp::Update { peer_tree } => Some(peer_tree.topic),
            RpcOp::PublishEvent { event } | RpcOp::RequestToPublish { event } => Some(event.topic),
            RpcOp::Ping | RpcOp::NewTopic { .. } => None,
        }
    }
}

/// A single operation with its metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub metadata: MessageMetadata,
    pub op: RpcOp,
}

impl RpcMessage {
    pub fn new(op: RpcOp) -> Self {
        Self { metadata: MessageMetadata::now(), op }
    }
}

/// A batch of messages as written to a peer stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcEnvelope {
    pub msgs: Vec<RpcMessage>,
}

impl RpcEnvelope {
    pub fn single(op: RpcOp) -> Self {
        Self { msgs: vec![RpcMessage::new(op)] }
    }

    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        to_canonical_bytes(self)
    }

    /// Bounded decode; rejects oversized buffers and oversized batches.
    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        let envelope: RpcEnvelope = from_canonical_bytes(bytes)?;
        if envelope.msgs.len() > MAX_ENVELOPE_MESSAGES {
            return Err(PulsarcastError::Validation(format!(
                "envelope with {} messages exceeds maximum {MAX_ENVELOPE_MESSAGES}",
                envelope.msgs.len()
            ))
            .into());
        }
        Ok(envelope)
    }
}
