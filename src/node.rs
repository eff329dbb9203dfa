//! High-level node API.
//!
//! A [`Node`] owns the identity and collaborators and gates the engine
//! behind an explicit lifecycle: every protocol operation before `start()`
//! (or after `stop()`) is rejected, and a second `start()` is an error
//! rather than a silent no-op.
//!
//! ## Quick start
//!
//! ```ignore
//! let node = Node::new(Keypair::generate(), store, network, Config::default());
//! node.start().await?;
//!
//! let (topic_id, _topic) = node.create_topic("news", TopicNodeOptions::default()).await?;
//! let (_topic, mut events) = node.subscribe(topic_id, SubscribeOptions::default()).await?;
//! node.publish(topic_id, b"hello".to_vec(), PublishOptions::default()).await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("got {:?}", event.to_readable());
//! }
//! ```
//!
//! Inbound wiring: the embedder registers a transport handler for the
//! protocol id and forwards each decoded envelope through
//! [`Node::handle_rpc`] (or grabs a cloned engine handle with
//! [`Node::engine`] and uses its `deliver` for fire-and-forget dispatch).

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::dag::{Cid, EventNode, TopicNode, TopicNodeOptions};
use crate::engine::{Config, PublishOptions, PublishOutcome, Pulsarcast, SubscribeOptions};
use crate::error::PulsarcastError;
use crate::identity::{Identity, Keypair};
use crate::messages::RpcEnvelope;
use crate::protocols::{ContentStore, PulsarcastRpc};

/// Protocol id the transport overlay should register for pulsarcast streams.
pub const PROTOCOL_ID: &str = "/pulsarcast/0.1.0";

/// A pulsarcast node: identity, collaborators and a lifecycle around the
/// engine actor.
pub struct Node<S, N> {
    keypair: Keypair,
    config: Config,
    store: Arc<S>,
    network: Arc<N>,
    engine: Mutex<Option<Pulsarcast>>,
}

impl<S, N> Node<S, N>
where
    S: ContentStore,
    N: PulsarcastRpc,
{
    pub fn new(keypair: Keypair, store: Arc<S>, network: Arc<N>, config: Config) -> Self {
        Self {
            keypair,
            config,
            store,
            network,
            engine: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// Spawn the engine actor. Fails if the node is already running.
    pub async fn start(&self) -> anyhow::Result<()> {
        let mut guard = self.engine.lock().expect("engine lock poisoned");
        if guard.is_some() {
            return Err(PulsarcastError::AlreadyStarted.into());
        }
        *guard = Some(Pulsarcast::spawn(
            self.keypair.identity(),
            self.config.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.network),
        ));
        Ok(())
    }

    /// Stop the engine actor. Fails if the node was never started.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let engine = {
            let mut guard = self.engine.lock().expect("engine lock poisoned");
            guard.take().ok_or(PulsarcastError::NotStarted)?
        };
        engine.quit().await;
        Ok(())
    }

    fn running_engine(&self) -> anyhow::Result<Pulsarcast> {
        self.engine
            .lock()
            .expect("engine lock poisoned")
            .clone()
            .ok_or_else(|| PulsarcastError::NotStarted.into())
    }

    /// Cloned handle to the running engine, for transport glue.
    pub fn engine(&self) -> anyhow::Result<Pulsarcast> {
        self.running_engine()
    }

    /// Create (and persist) a topic authored by this node, subscribing it
    /// to both the topic and its meta-topic as root.
    pub async fn create_topic(
        &self,
        name: &str,
        options: TopicNodeOptions,
    ) -> anyhow::Result<(Cid, TopicNode)> {
        self.running_engine()?.create_topic(name, options).await
    }

    /// Join a topic and receive its events on the returned channel.
    pub async fn subscribe(
        &self,
        topic_id: Cid,
        options: SubscribeOptions,
    ) -> anyhow::Result<(TopicNode, mpsc::Receiver<EventNode>)> {
        self.running_engine()?.subscribe(topic_id, options).await
    }

    /// Leave a topic. A no-op when not subscribed; rejected for topics this
    /// node authored.
    pub async fn unsubscribe(&self, topic_id: Cid) -> anyhow::Result<()> {
        self.running_engine()?.unsubscribe(topic_id).await
    }

    /// Publish a payload on a topic. When this node is not an allowed
    /// publisher the outcome carries `event_cid: None` and a pending event
    /// that has been relayed as a request-to-publish.
    pub async fn publish(
        &self,
        topic_id: Cid,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> anyhow::Result<PublishOutcome> {
        self.running_engine()?.publish(topic_id, payload, options).await
    }

    /// Topic CIDs this node is currently subscribed to.
    pub async fn subscriptions(&self) -> anyhow::Result<Vec<Cid>> {
        Ok(self.running_engine()?.subscriptions().await)
    }

    /// Feed an inbound envelope from the transport into the engine.
    pub async fn handle_rpc(&self, from: Identity, envelope: RpcEnvelope) -> anyhow::Result<()> {
        self.running_engine()?.handle_rpc(from, envelope).await
    }
}
