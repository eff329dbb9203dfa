//! Collaborator trait definitions.
//!
//! Pulsarcast consumes its surroundings through two seams, kept as traits so
//! the engine depends on capabilities rather than implementations:
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Content store | [`ContentStore`] | get/put of content-addressed records, closest-peer routing view |
//! | Transport | [`PulsarcastRpc`] | ordered, authenticated delivery of envelopes to peers |
//!
//! The content store is treated as eventually consistent and best-effort;
//! `put` is idempotent (values are keyed by their own hash) and safe to
//! retry. The transport dials lazily: `send` either reuses an established
//! stream to the peer or sets one up, and an error means the peer was not
//! reachable for this attempt.

use anyhow::Result;
use async_trait::async_trait;

use crate::dag::Cid;
use crate::identity::Identity;
use crate::messages::RpcEnvelope;

/// External content-addressed store (a DHT in production deployments).
#[async_trait]
pub trait ContentStore: Send + Sync + 'static {
    /// Fetch the value stored under `key`, if any.
    async fn get(&self, key: &Cid) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`. Keys are content hashes, so re-putting the
    /// same value is a no-op on well-behaved stores.
    async fn put(&self, key: Cid, value: Vec<u8>) -> Result<()>;

    /// The peer in the local routing view closest to `target` by the
    /// overlay's distance metric, excluding the local node itself.
    async fn closest_peer(&self, target: &Identity) -> Result<Option<Identity>>;
}

/// Point-to-point envelope delivery over the transport overlay.
#[async_trait]
pub trait PulsarcastRpc: Send + Sync + 'static {
    /// Deliver an envelope to `to`, dialing if no stream is up. Messages
    /// sent to the same peer arrive in the order they were sent.
    async fn send(&self, to: &Identity, envelope: RpcEnvelope) -> Result<()>;
}
