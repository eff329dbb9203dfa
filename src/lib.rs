//! # Pulsarcast - Tree-Based PubSub over a Peer-to-Peer Overlay
//!
//! Pulsarcast is a decentralized, topic-based publish/subscribe protocol.
//! Topics and events are immutable, content-addressed records kept in a
//! shared content store; events disseminate along a lazily built spanning
//! tree rooted at each topic's author instead of flooding a full mesh.
//!
//! - **Content addressing**: a record's only identifier is the hash of its
//!   canonical serialization; all links (topic parents, sub-topics, event
//!   chains) are by hash
//! - **Dissemination trees**: per-topic `{parents, children}` peer sets,
//!   grown by routing joins toward the topic author
//! - **Delegated authorization**: peers that may not commit an event relay
//!   it as a request-to-publish toward a peer that may, at worst the root
//! - **Self-healing**: unreachable peers are purged after bounded retries
//!   and orphaned subscribers re-join the tree
//!
//! ## Architecture
//!
//! The engine follows the actor pattern: a public, cheap-to-clone handle
//! sends commands over an async channel to a private actor that owns all
//! mutable state and processes commands sequentially. The transport layer
//! and the content store (a DHT in production) stay behind the traits in
//! [`protocols`]; the node consumes authenticated peer streams and
//! `get`/`put`/`closest_peer`, nothing more.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: lifecycle + create/subscribe/publish |
//! | `engine` | Pulsarcast actor: trees, authorization, fan-out |
//! | `identity` | Ed25519 keypairs and 32-byte peer identities |
//! | `dag` | `TopicNode`/`EventNode`, CIDs, canonical serialization |
//! | `messages` | Wire RPC envelope and operation records |
//! | `directory` | Topic descriptor cache over the content store |
//! | `tree` | Per-topic tree entries and event caches |
//! | `peers` | Peer registry and lifetime tracking |
//! | `protocols` | Collaborator traits (`ContentStore`, `PulsarcastRpc`) |
//! | `error` | Typed error taxonomy |

pub mod dag;
pub mod directory;
pub mod engine;
pub mod error;
pub mod identity;
pub mod messages;
pub mod node;
pub mod peers;
pub mod protocols;
pub mod tree;

/// Protocol version embedded in record and message metadata.
pub const PROTOCOL_VERSION: &str = "pulsarcast/0.1.0";

pub use dag::{
    Cid, EventLinking, EventNode, PublisherPolicy, RequestPolicy, TopicNode, TopicNodeOptions,
};
pub use engine::{Config, PublishOptions, PublishOutcome, Pulsarcast, SubscribeOptions};
pub use error::PulsarcastError;
pub use identity::{Identity, Keypair};
pub use messages::{RpcEnvelope, RpcMessage, RpcOp};
pub use node::{Node, PROTOCOL_ID};
pub use protocols::{ContentStore, PulsarcastRpc};
