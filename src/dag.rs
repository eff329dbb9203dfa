//! Content-addressed DAG nodes: topics and events.
//!
//! The two record types of the protocol, [`TopicNode`] and [`EventNode`], are
//! immutable once constructed. Their sole identifier is the [`Cid`]: the
//! blake3 hash of the canonical serialization. Identical semantic content
//! yields an identical CID; changing any field yields a new one. A topic is
//! never mutated in place: an updated descriptor is a new node with a new
//! CID, republished through the topic's meta-topic.
//!
//! ## Canonical serialization
//!
//! Records serialize through bincode with fixed-int encoding and ordered
//! maps (`BTreeMap`/`BTreeSet`), so the byte form is deterministic and
//! `deserialize(serialize(x)).serialize() == serialize(x)` holds exactly.
//! Deserialization is always bounded to prevent memory exhaustion from
//! hostile inputs.
//!
//! ## Policy encoding
//!
//! Publisher and request policies travel on the wire as an
//! `{enabled, peers}` pair and are decoded at the boundary into tagged
//! variants: `enabled=false` maps to `Unrestricted`/`Disabled`,
//! `enabled=true` with peers to an allow list, and (for the request policy
//! only) `enabled=true` with no peers to `Open`. An enabled publisher
//! policy with an empty peer list does not decode.

use std::collections::{BTreeMap, BTreeSet};

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::PulsarcastError;
use crate::identity::Identity;
use crate::PROTOCOL_VERSION;

/// Maximum size of a serialized DAG node (1 MiB), aligned with what the
/// content store will accept for a single value.
pub const MAX_NODE_SIZE: usize = 1024 * 1024;

/// Maximum buffer accepted when deserializing a node, slightly larger than
/// [`MAX_NODE_SIZE`] to allow for framing overhead.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_NODE_SIZE as u64) + 4096;

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Maximum event payload size (64 KiB).
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Name under which every topic links its meta-topic.
pub const META_TOPIC_NAME: &str = "meta";

/// Returns bincode options for canonical node (de)serialization.
/// Fixed-int encoding keeps the byte form stable; the limit bounds decoding.
pub(crate) fn canonical_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Serialize a record with the canonical options.
pub(crate) fn to_canonical_bytes<T: Serialize>(value: &T) -> anyhow::Result<Vec<u8>> {
    Ok(canonical_options().serialize(value)?)
}

/// Deserialize a record with the canonical options, bounds enforced.
pub(crate) fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<T> {
    Ok(canonical_options().deserialize(bytes)?)
}

#[inline]
pub fn is_valid_topic_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_TOPIC_NAME_LENGTH
        && name.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

// ============================================================================
// Content identifiers
// ============================================================================

/// Content identifier: blake3 hash of a record's canonical serialization.
///
/// Doubles as address and integrity check. Base58 is the canonical string
/// encoding, used for display and as map keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cid([u8; 32]);

impl Cid {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Hash arbitrary serialized content into its CID.
    pub fn of(content: &[u8]) -> Self {
        Self(*blake3::hash(content).as_bytes())
    }

    pub fn to_base58(self) -> String {
        bs58::encode(self.0).into_string()
    }

    pub fn from_base58(s: &str) -> anyhow::Result<Self> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| PulsarcastError::Validation(format!("invalid base58 CID: {e}")))?;
        if bytes.len() != 32 {
            return Err(
                PulsarcastError::Validation(format!("CID must be 32 bytes, got {}", bytes.len()))
                    .into(),
            );
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Display for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_base58())
    }
}

impl std::fmt::Debug for Cid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Cid({}..)", hex::encode(&self.0[..8]))
    }
}

// ============================================================================
// Publish policies
// ============================================================================

/// Who may commit an event as its final publisher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PublisherPolicy {
    /// Anyone subscribed may publish directly.
    Unrestricted,
    /// Only the listed peers may commit events.
    AllowList(BTreeSet<Identity>),
}

impl PublisherPolicy {
    pub fn may_publish(&self, peer: &Identity) -> bool {
        match self {
            PublisherPolicy::Unrestricted => true,
            PublisherPolicy::AllowList(peers) => peers.contains(peer),
        }
    }
}

/// Who may request publish delegation from an authorized peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestPolicy {
    /// Requests are dropped outright.
    Disabled,
    /// Any peer may request.
    Open,
    /// Only the listed peers may request.
    AllowList(BTreeSet<Identity>),
}

impl RequestPolicy {
    pub fn may_request(&self, peer: &Identity) -> bool {
        match self {
            RequestPolicy::Disabled => false,
            RequestPolicy::Open => true,
            RequestPolicy::AllowList(peers) => peers.contains(peer),
        }
    }
}

/// How a freshly committed event picks its `parent` link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventLinking {
    /// Link to the most recent event this node has seen for the topic.
    LastSeen,
    /// The publisher must supply the parent explicitly.
    Custom,
}

/// Wire form of both policies: the `{enabled, peers}` pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyWire {
    pub enabled: bool,
    pub peers: Vec<Identity>,
}

impl PolicyWire {
    fn from_publisher(policy: &PublisherPolicy) -> Self {
        match policy {
            PublisherPolicy::Unrestricted => Self { enabled: false, peers: Vec::new() },
            PublisherPolicy::AllowList(peers) => Self {
                enabled: true,
                peers: peers.iter().copied().collect(),
            },
        }
    }

    fn into_publisher(self) -> anyhow::Result<PublisherPolicy> {
        if !self.enabled {
            return Ok(PublisherPolicy::Unrestricted);
        }
        if self.peers.is_empty() {
            return Err(PulsarcastError::Validation(
                "publisher policy enabled with no peers".to_string(),
            )
            .into());
        }
        Ok(PublisherPolicy::AllowList(self.peers.into_iter().collect()))
    }

    fn from_request(policy: &RequestPolicy) -> Self {
        match policy {
            RequestPolicy::Disabled => Self { enabled: false, peers: Vec::new() },
            RequestPolicy::Open => Self { enabled: true, peers: Vec::new() },
            RequestPolicy::AllowList(peers) => Self {
                enabled: true,
                peers: peers.iter().copied().collect(),
            },
        }
    }

    fn into_request(self) -> RequestPolicy {
        match (self.enabled, self.peers.is_empty()) {
            (false, _) => RequestPolicy::Disabled,
            (true, true) => RequestPolicy::Open,
            (true, false) => RequestPolicy::AllowList(self.peers.into_iter().collect()),
        }
    }
}

// ============================================================================
// Topic nodes
// ============================================================================

/// Immutable topic metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicMetadata {
    pub created: DateTime<Utc>,
    pub protocol_version: String,
    pub allowed_publishers: PublisherPolicy,
    pub request_to_publish: RequestPolicy,
    pub event_linking: EventLinking,
}

/// Options accepted when constructing a [`TopicNode`].
///
/// `allowed_publishers` defaults to an allow list holding only the author;
/// `request_to_publish` defaults to open. The author is always inserted into
/// an explicit allow list so that publish delegation terminates at the root.
#[derive(Clone, Debug, Default)]
pub struct TopicNodeOptions {
    pub parent: Option<Cid>,
    pub sub_topics: BTreeMap<String, Cid>,
    pub allowed_publishers: Option<PublisherPolicy>,
    pub request_to_publish: Option<RequestPolicy>,
    pub event_linking: Option<EventLinking>,
    pub created: Option<DateTime<Utc>>,
}

/// An immutable, content-addressed topic descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicNode {
    pub name: String,
    pub author: Identity,
    pub parent: Option<Cid>,
    /// Sub-topics by label, including the automatically bound `meta` topic.
    pub sub_topics: BTreeMap<String, Cid>,
    pub metadata: TopicMetadata,
}

impl TopicNode {
    pub fn new(name: &str, author: Identity, options: TopicNodeOptions) -> anyhow::Result<Self> {
        if !is_valid_topic_name(name) {
            return Err(PulsarcastError::Validation(format!(
                "invalid topic name {name:?}"
            ))
            .into());
        }

        let allowed_publishers = match options.allowed_publishers {
            Some(PublisherPolicy::AllowList(mut peers)) => {
                peers.insert(author);
                PublisherPolicy::AllowList(peers)
            }
            Some(PublisherPolicy::Unrestricted) => PublisherPolicy::Unrestricted,
            None => PublisherPolicy::AllowList(BTreeSet::from([author])),
        };

        Ok(Self {
            name: name.to_string(),
            author,
            parent: options.parent,
            sub_topics: options.sub_topics,
            metadata: TopicMetadata {
                created: options.created.unwrap_or_else(Utc::now),
                protocol_version: PROTOCOL_VERSION.to_string(),
                allowed_publishers,
                request_to_publish: options.request_to_publish.unwrap_or(RequestPolicy::Open),
                event_linking: options.event_linking.unwrap_or(EventLinking::LastSeen),
            },
        })
    }

    /// CID of the meta-topic bound to this topic, if present.
    pub fn meta(&self) -> Option<Cid> {
        self.sub_topics.get(META_TOPIC_NAME).copied()
    }

    /// Canonical serialization; input to [`TopicNode::cid`].
    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        to_canonical_bytes(&TopicDescriptor::from(self))
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        let descriptor: TopicDescriptor = from_canonical_bytes(bytes)?;
        descriptor.into_node()
    }

    pub fn cid(&self) -> anyhow::Result<Cid> {
        Ok(Cid::of(&self.serialize()?))
    }

    /// Display-only projection; never used for identity or equality.
    pub fn to_readable(&self) -> ReadableTopic {
        ReadableTopic {
            name: self.name.clone(),
            author: self.author.to_hex(),
            parent: self.parent.map(|c| c.to_base58()),
            sub_topics: self
                .sub_topics
                .iter()
                .map(|(label, cid)| (label.clone(), cid.to_base58()))
                .collect(),
            created: self.metadata.created.to_rfc3339(),
        }
    }
}

/// Wire/canonical form of a topic descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicDescriptor {
    pub name: String,
    pub author: Identity,
    pub parent: Option<Cid>,
    /// Sub-topic links by label (the `#` map).
    pub sub_topics: BTreeMap<String, Cid>,
    pub metadata: TopicMetadataWire,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicMetadataWire {
    pub created: DateTime<Utc>,
    pub protocol_version: String,
    pub allowed_publishers: PolicyWire,
    pub request_to_publish: PolicyWire,
    pub event_linking: EventLinking,
}

impl From<&TopicNode> for TopicDescriptor {
    fn from(node: &TopicNode) -> Self {
        Self {
            name: node.name.clone(),
            author: node.author,
            parent: node.parent,
            sub_topics: node.sub_topics.clone(),
            metadata: TopicMetadataWire {
                created: node.metadata.created,
                protocol_version: node.metadata.protocol_version.clone(),
                allowed_publishers: PolicyWire::from_publisher(&node.metadata.allowed_publishers),
                request_to_publish: PolicyWire::from_request(&node.metadata.request_to_publish),
                event_linking: node.metadata.event_linking,
            },
        }
    }
}

impl TopicDescriptor {
    pub fn into_node(self) -> anyhow::Result<TopicNode> {
        if !is_valid_topic_name(&self.name) {
            return Err(PulsarcastError::Validation(format!(
                "invalid topic name {:?}",
                self.name
            ))
            .into());
        }
        Ok(TopicNode {
            name: self.name,
            author: self.author,
            parent: self.parent,
            sub_topics: self.sub_topics,
            metadata: TopicMetadata {
                created: self.metadata.created,
                protocol_version: self.metadata.protocol_version,
                allowed_publishers: self.metadata.allowed_publishers.into_publisher()?,
                request_to_publish: self.metadata.request_to_publish.into_request(),
                event_linking: self.metadata.event_linking,
            },
        })
    }
}

/// String-encoded view of a topic for logs and display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadableTopic {
    pub name: String,
    pub author: String,
    pub parent: Option<String>,
    pub sub_topics: BTreeMap<String, String>,
    pub created: String,
}

// ============================================================================
// Event nodes
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub created: DateTime<Utc>,
    pub protocol_version: String,
}

/// An immutable, content-addressed event.
///
/// `author` is the peer that originated the event; `publisher` is the peer
/// that committed it, unset while authorization is pending. Committing an
/// event produces a new node (and a new CID) via [`EventNode::as_published`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventNode {
    pub topic: Cid,
    pub author: Identity,
    pub publisher: Option<Identity>,
    pub payload: Vec<u8>,
    pub parent: Option<Cid>,
    pub metadata: EventMetadata,
}

impl EventNode {
    pub fn new(
        topic: Cid,
        author: Identity,
        payload: Vec<u8>,
        parent: Option<Cid>,
    ) -> anyhow::Result<Self> {
        if payload.is_empty() {
            return Err(PulsarcastError::Validation("event payload is empty".to_string()).into());
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PulsarcastError::Validation(format!(
                "event payload of {} bytes exceeds maximum {MAX_PAYLOAD_SIZE}",
                payload.len()
            ))
            .into());
        }
        Ok(Self {
            topic,
            author,
            publisher: None,
            payload,
            parent,
            metadata: EventMetadata {
                created: Utc::now(),
                protocol_version: PROTOCOL_VERSION.to_string(),
            },
        })
    }

    #[inline]
    pub fn is_published(&self) -> bool {
        self.publisher.is_some()
    }

    /// A committed copy of this event with `publisher` set. The copy is a
    /// distinct node with its own CID; the pending original is unchanged.
    pub fn as_published(&self, publisher: Identity) -> Self {
        let mut node = self.clone();
        node.publisher = Some(publisher);
        node
    }

    /// A copy with the parent link set, used when the commit site resolves
    /// the topic's event-linking policy.
    pub fn with_parent(&self, parent: Option<Cid>) -> Self {
        let mut node = self.clone();
        node.parent = parent;
        node
    }

    pub fn serialize(&self) -> anyhow::Result<Vec<u8>> {
        to_canonical_bytes(&EventDescriptor::from(self))
    }

    pub fn deserialize(bytes: &[u8]) -> anyhow::Result<Self> {
        let descriptor: EventDescriptor = from_canonical_bytes(bytes)?;
        descriptor.into_node()
    }

    pub fn cid(&self) -> anyhow::Result<Cid> {
        Ok(Cid::of(&self.serialize()?))
    }

    /// Display-only projection; never used for identity or equality.
    pub fn to_readable(&self) -> ReadableEvent {
        ReadableEvent {
            topic: self.topic.to_base58(),
            author: self.author.to_hex(),
            publisher: self.publisher.map(Identity::to_hex),
            payload_bytes: self.payload.len(),
            parent: self.parent.map(|c| c.to_base58()),
            created: self.metadata.created.to_rfc3339(),
        }
    }
}

/// Wire/canonical form of an event descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDescriptor {
    pub publisher: Option<Identity>,
    pub author: Identity,
    pub topic: Cid,
    pub payload: Vec<u8>,
    pub parent: Option<Cid>,
    pub metadata: EventMetadata,
}

impl From<&EventNode> for EventDescriptor {
    fn from(node: &EventNode) -> Self {
        Self {
            publisher: node.publisher,
            author: node.author,
            topic: node.topic,
            payload: node.payload.clone(),
            parent: node.parent,
            metadata: node.metadata.clone(),
        }
    }
}

impl EventDescriptor {
    pub fn into_node(self) -> anyhow::Result<EventNode> {
        if self.payload.is_empty() {
            return Err(PulsarcastError::Validation("event payload is empty".to_string()).into());
        }
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PulsarcastError::Validation(format!(
                "event payload of {} bytes exceeds maximum {MAX_PAYLOAD_SIZE}",
                self.payload.len()
            ))
            .into());
        }
        Ok(EventNode {
            topic: self.topic,
            author: self.author,
            publisher: self.publisher,
            payload: self.payload,
            parent: self.parent,
            metadata: self.metadata,
        })
    }
}

/// String-encoded view of an event for logs and display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadableEvent {
    pub topic: String,
    pub author: String,
    pub publisher: Option<String>,
    pub payload_bytes: usize,
    pub parent: Option<String>,
    pub created: String,
}
