//! The Pulsarcast engine: dissemination trees and the publish/authorization
//! state machine.
//!
//! A cheap-to-clone [`Pulsarcast`] handle talks to a private actor over a
//! command channel; the actor owns every piece of mutable protocol state
//! (topic directory, per-topic tree entries, event caches, peer registry,
//! subscriber channels) and processes commands to completion, one at a
//! time. Local calls and inbound wire messages funnel into the same
//! handlers: a local `publish` is treated exactly like a `PUBLISH_EVENT`
//! that originated at this node.
//!
//! ## Trees
//!
//! Per topic, every participating peer keeps `{parents, children}`. The
//! topic author is the root and holds no parents. A join is routed to the
//! peer in the local routing view closest to the author; a receiver that is
//! not itself joined extends the chain toward the root before
//! acknowledging. Event fan-out is undirected: an event is relayed to all
//! tree neighbors except the one it arrived from, and the content-addressed
//! event cache drops duplicates arriving over redundant paths.
//!
//! ## Authorization
//!
//! Publishing is gated by the topic's publisher policy. An unauthorized
//! origin does not fail: the pending event (no publisher, no CID returned)
//! is relayed as `REQUEST_TO_PUBLISH` until it reaches a peer allowed to
//! commit it, at worst the root author. The committing peer stamps itself
//! as publisher, links the event into the topic's event chain, persists it
//! to the content store and fans the committed version out.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use lru::LruCache;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::dag::{
    Cid, EventDescriptor, EventNode, TopicDescriptor, TopicNode, TopicNodeOptions,
    META_TOPIC_NAME,
};
use crate::directory::TopicDirectory;
use crate::error::PulsarcastError;
use crate::identity::Identity;
use crate::messages::{PeerTreeWire, RpcEnvelope, RpcOp};
use crate::peers::PeerRegistry;
use crate::protocols::{ContentStore, PulsarcastRpc};
use crate::tree::{EventTree, TreeEntry};

// ============================================================================
// Configuration
// ============================================================================

/// Default capacity of the topic descriptor cache.
pub const DEFAULT_TOPIC_CACHE_SIZE: usize = 1024;

/// Default per-topic event cache capacity.
pub const DEFAULT_EVENT_CACHE_SIZE: usize = 4096;

/// Default capacity of the seen request-to-publish tracker.
pub const DEFAULT_SEEN_REQUEST_CACHE_SIZE: usize = 4096;

/// Default number of delivery attempts before a peer is considered gone.
pub const DEFAULT_MAX_SEND_ATTEMPTS: usize = 3;

/// Default command channel capacity.
pub const DEFAULT_COMMAND_CAPACITY: usize = 1024;

/// Default per-subscription event channel capacity.
pub const DEFAULT_SUBSCRIPTION_CAPACITY: usize = 256;

/// Default interval between maintenance rounds (registry pruning).
pub const DEFAULT_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

/// Engine configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Capacity of the topic descriptor cache.
    pub topic_cache_size: usize,
    /// Per-topic event cache capacity.
    pub event_cache_size: usize,
    /// Capacity of the seen request-to-publish tracker.
    pub seen_request_cache_size: usize,
    /// Delivery attempts per peer before escalating to tree repair.
    pub max_send_attempts: usize,
    /// Command channel capacity.
    pub command_capacity: usize,
    /// Per-subscription event channel capacity.
    pub subscription_capacity: usize,
    /// Interval between maintenance rounds.
    pub maintenance_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic_cache_size: DEFAULT_TOPIC_CACHE_SIZE,
            event_cache_size: DEFAULT_EVENT_CACHE_SIZE,
            seen_request_cache_size: DEFAULT_SEEN_REQUEST_CACHE_SIZE,
            max_send_attempts: DEFAULT_MAX_SEND_ATTEMPTS,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
            subscription_capacity: DEFAULT_SUBSCRIPTION_CAPACITY,
            maintenance_interval: DEFAULT_MAINTENANCE_INTERVAL,
        }
    }
}

// ============================================================================
// Public option and result types
// ============================================================================

/// Options for [`Pulsarcast::subscribe`].
#[derive(Clone, Debug)]
pub struct SubscribeOptions {
    /// Also join the topic's `meta` sub-topic. On by default so that
    /// descriptor updates reach every subscriber.
    pub subscribe_to_meta: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self { subscribe_to_meta: true }
    }
}

/// Options for [`Pulsarcast::publish`].
#[derive(Clone, Debug, Default)]
pub struct PublishOptions {
    /// Parent event to link to, required when the topic uses custom event
    /// linking and ignored under last-seen linking.
    pub parent: Option<Cid>,
}

/// What a `publish` call produced.
///
/// `event_cid` is `None` when the caller was not authorized to commit the
/// event: the returned [`EventNode`] is pending (`is_published() == false`)
/// and has been relayed as a request-to-publish.
#[derive(Clone, Debug)]
pub struct PublishOutcome {
    pub event_cid: Option<Cid>,
    pub topic: TopicNode,
    pub event: EventNode,
}

// ============================================================================
// Commands sent from handle to actor
// ============================================================================

enum Command {
    CreateTopic {
        name: String,
        options: TopicNodeOptions,
        reply: oneshot::Sender<anyhow::Result<(Cid, TopicNode)>>,
    },
    Subscribe {
        topic_id: Cid,
        options: SubscribeOptions,
        reply: oneshot::Sender<anyhow::Result<(TopicNode, mpsc::Receiver<EventNode>)>>,
    },
    Unsubscribe {
        topic_id: Cid,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Publish {
        topic_id: Cid,
        payload: Vec<u8>,
        options: PublishOptions,
        reply: oneshot::Sender<anyhow::Result<PublishOutcome>>,
    },
    HandleRpc {
        from: Identity,
        envelope: RpcEnvelope,
        reply: Option<oneshot::Sender<anyhow::Result<()>>>,
    },
    Subscriptions {
        reply: oneshot::Sender<Vec<Cid>>,
    },
    TreeEntry {
        topic_id: Cid,
        reply: oneshot::Sender<Option<TreeEntry>>,
    },
    Quit,
}

// ============================================================================
// Handle (public API - cheap to clone)
// ============================================================================

/// Handle to a running Pulsarcast engine.
#[derive(Clone)]
pub struct Pulsarcast {
    cmd_tx: mpsc::Sender<Command>,
}

impl Pulsarcast {
    /// Spawn the engine actor for `identity` over the given collaborators.
    pub fn spawn<S, N>(identity: Identity, config: Config, store: Arc<S>, network: Arc<N>) -> Self
    where
        S: ContentStore,
        N: PulsarcastRpc,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity);
        let actor = PulsarcastActor::new(identity, config, store, network);
        tokio::spawn(actor.run(cmd_rx));
        Self { cmd_tx }
    }

    pub async fn create_topic(
        &self,
        name: &str,
        options: TopicNodeOptions,
    ) -> anyhow::Result<(Cid, TopicNode)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::CreateTopic { name: name.to_string(), options, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?
    }

    /// Join a topic's dissemination tree and receive its events.
    pub async fn subscribe(
        &self,
        topic_id: Cid,
        options: SubscribeOptions,
    ) -> anyhow::Result<(TopicNode, mpsc::Receiver<EventNode>)> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe { topic_id, options, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?
    }

    /// Leave a topic's tree. Unsubscribing from a topic this node is not
    /// subscribed to is a no-op.
    pub async fn unsubscribe(&self, topic_id: Cid) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe { topic_id, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?
    }

    pub async fn publish(
        &self,
        topic_id: Cid,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> anyhow::Result<PublishOutcome> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { topic_id, payload, options, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?
    }

    /// Process an inbound envelope and wait until it has been handled.
    pub async fn handle_rpc(&self, from: Identity, envelope: RpcEnvelope) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::HandleRpc { from, envelope, reply: Some(tx) })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))?
    }

    /// Enqueue an inbound envelope without waiting for it to be processed.
    /// Per-sender ordering is preserved by the command channel. Transport
    /// glue should prefer this to [`Pulsarcast::handle_rpc`] so that two
    /// peers delivering to each other cannot wait on one another.
    pub async fn deliver(&self, from: Identity, envelope: RpcEnvelope) -> anyhow::Result<()> {
        self.cmd_tx
            .send(Command::HandleRpc { from, envelope, reply: None })
            .await
            .map_err(|_| anyhow::anyhow!("Pulsarcast actor closed"))
    }

    /// Topic CIDs this node is subscribed to.
    pub async fn subscriptions(&self) -> Vec<Cid> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Subscriptions { reply: tx }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// This node's `{parents, children}` entry for a topic, if any.
    pub async fn tree_entry(&self, topic_id: Cid) -> Option<TreeEntry> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::TreeEntry { topic_id, reply: tx }).await.is_err() {
            return None;
        }
        rx.await.unwrap_or_default()
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }
}

// ============================================================================
// Actor (owns state)
// ============================================================================

struct PulsarcastActor<S, N> {
    identity: Identity,
    config: Config,
    store: Arc<S>,
    network: Arc<N>,
    directory: TopicDirectory<S>,
    /// This node's own tree membership per topic.
    trees: HashMap<Cid, TreeEntry>,
    /// Events seen per topic, with the last-seen pointer.
    event_trees: HashMap<Cid, EventTree>,
    subscriptions: HashSet<Cid>,
    /// Per-topic subscriber channels; every sender gets every event once.
    subscribers: HashMap<Cid, Vec<mpsc::Sender<EventNode>>>,
    peers: PeerRegistry,
    /// Pending request-to-publish CIDs already relayed, to stop relay loops.
    seen_requests: LruCache<Cid, ()>,
}

impl<S, N> PulsarcastActor<S, N>
where
    S: ContentStore,
    N: PulsarcastRpc,
{
    fn new(identity: Identity, config: Config, store: Arc<S>, network: Arc<N>) -> Self {
        let seen_cap = NonZeroUsize::new(config.seen_request_cache_size)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            identity,
            directory: TopicDirectory::new(Arc::clone(&store), config.topic_cache_size),
            store,
            network,
            trees: HashMap::new(),
            event_trees: HashMap::new(),
            subscriptions: HashSet::new(),
            subscribers: HashMap::new(),
            peers: PeerRegistry::new(),
            seen_requests: LruCache::new(seen_cap),
            config,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::CreateTopic { name, options, reply }) => {
                            let _ = reply.send(self.handle_create_topic(&name, options).await);
                        }
                        Some(Command::Subscribe { topic_id, options, reply }) => {
                            let _ = reply.send(self.handle_subscribe_cmd(topic_id, options).await);
                        }
                        Some(Command::Unsubscribe { topic_id, reply }) => {
                            let _ = reply.send(self.handle_unsubscribe_cmd(topic_id).await);
                        }
                        Some(Command::Publish { topic_id, payload, options, reply }) => {
                            let _ = reply.send(self.handle_publish_cmd(topic_id, payload, options).await);
                        }
                        Some(Command::HandleRpc { from, envelope, reply }) => {
                            let result = self.handle_envelope(from, envelope).await;
                            if let Some(reply) = reply {
                                let _ = reply.send(result);
                            }
                        }
                        Some(Command::Subscriptions { reply }) => {
                            let _ = reply.send(self.subscriptions.iter().copied().collect());
                        }
                        Some(Command::TreeEntry { topic_id, reply }) => {
                            let _ = reply.send(self.trees.get(&topic_id).cloned());
                        }
                        Some(Command::Quit) => {
                            debug!("Pulsarcast actor quitting");
                            break;
                        }
                        None => {
                            debug!("Pulsarcast handle dropped, actor quitting");
                            break;
                        }
                    }
                }
                _ = maintenance.tick() => {
                    self.peers.prune();
                }
            }
        }
    }

    // ========================================================================
    // Topic creation
    // ========================================================================

    async fn handle_create_topic(
        &mut self,
        name: &str,
        mut options: TopicNodeOptions,
    ) -> anyhow::Result<(Cid, TopicNode)> {
        // Declared parent and sub-topics must already exist.
        let parent_node = match options.parent {
            Some(parent_id) => Some(self.directory.resolve(&parent_id).await?),
            None => None,
        };
        let declared: Vec<Cid> = options.sub_topics.values().copied().collect();
        for sub_topic_id in declared {
            self.directory.resolve(&sub_topic_id).await?;
        }

        // The meta-topic is inherited from the parent, or created fresh.
        let inherited_meta = parent_node.as_ref().and_then(TopicNode::meta);
        let meta_id = match inherited_meta {
            Some(meta_id) => meta_id,
            None => {
                let meta = TopicNode::new(
                    META_TOPIC_NAME,
                    self.identity,
                    TopicNodeOptions::default(),
                )?;
                let bytes = meta.serialize()?;
                let (meta_id, meta) = self.directory.register(meta)?;
                self.store.put(meta_id, bytes).await?;
                trace!(topic = %meta_id, name = %meta.name, "created meta-topic");
                meta_id
            }
        };
        options.sub_topics.insert(META_TOPIC_NAME.to_string(), meta_id);

        let topic = TopicNode::new(name, self.identity, options)?;
        let bytes = topic.serialize()?;
        let (topic_id, topic) = self.directory.register(topic)?;
        self.store.put(topic_id, bytes).await?;

        // The author is trivially joined as root of its own topic. A fresh
        // meta-topic is also rooted here; an inherited one belongs to the
        // parent's author and is joined like any other subscription.
        self.join_as_root(topic_id);
        if inherited_meta.is_some() {
            if let Err(err) = self.subscribe_silently(meta_id).await {
                warn!(topic = %topic_id, meta = %meta_id, error = %err, "failed to join inherited meta-topic");
            }
        } else {
            self.join_as_root(meta_id);
        }

        // Announce the new descriptor on the parent's meta-topic. Best
        // effort: an unauthorized announcement simply becomes a pending
        // request-to-publish toward the parent's author.
        if let Some(parent) = parent_node {
            if let Some(parent_meta) = parent.meta() {
                let announcement =
                    EventNode::new(parent_meta, self.identity, topic.serialize()?, None)?;
                if let Err(err) = self
                    .process_publish_event(None, announcement, PublishOptions::default())
                    .await
                {
                    warn!(
                        topic = %topic_id,
                        parent_meta = %parent_meta,
                        error = %err,
                        "failed to announce topic on parent meta-topic"
                    );
                }
            }
        }

        debug!(topic = %topic_id, name = %name, "created topic");
        Ok((topic_id, topic))
    }

    fn join_as_root(&mut self, topic_id: Cid) {
        self.trees.entry(topic_id).or_default();
        self.subscriptions.insert(topic_id);
        self.ensure_event_tree(topic_id);
    }

    fn ensure_event_tree(&mut self, topic_id: Cid) -> &mut EventTree {
        let capacity = self.config.event_cache_size;
        self.event_trees
            .entry(topic_id)
            .or_insert_with(|| EventTree::new(capacity))
    }

    // ========================================================================
    // Subscribe / join
    // ========================================================================

    async fn handle_subscribe_cmd(
        &mut self,
        topic_id: Cid,
        options: SubscribeOptions,
    ) -> anyhow::Result<(TopicNode, mpsc::Receiver<EventNode>)> {
        let topic = self.directory.resolve(&topic_id).await?;

        let (event_tx, event_rx) = mpsc::channel(self.config.subscription_capacity);
        if self.subscriptions.contains(&topic_id) {
            // Already joined; just add another listener.
            self.subscribers.entry(topic_id).or_default().push(event_tx);
            return Ok((topic, event_rx));
        }

        self.join(topic_id, &topic, None).await?;

        self.subscriptions.insert(topic_id);
        self.ensure_event_tree(topic_id);
        self.subscribers.entry(topic_id).or_default().push(event_tx);

        // Descriptor updates arrive on the meta-topic, so join it too
        // unless the caller opted out.
        if options.subscribe_to_meta {
            if let Some(meta_id) = topic.meta() {
                if let Err(err) = self.subscribe_silently(meta_id).await {
                    warn!(
                        topic = %topic_id,
                        meta = %meta_id,
                        error = %err,
                        "failed to join meta-topic"
                    );
                }
            }
        }

        debug!(topic = %topic_id, name = %topic.name, "subscribed to topic");
        Ok((topic, event_rx))
    }

    /// Join a topic's tree without registering a subscriber channel.
    async fn subscribe_silently(&mut self, topic_id: Cid) -> anyhow::Result<()> {
        if self.subscriptions.contains(&topic_id) {
            return Ok(());
        }
        let topic = self.directory.resolve(&topic_id).await?;
        self.join(topic_id, &topic, None).await?;
        self.subscriptions.insert(topic_id);
        self.ensure_event_tree(topic_id);
        Ok(())
    }

    /// Join the dissemination tree for `topic_id`, routing toward the
    /// topic's author. `exclude` prevents joining back through the peer
    /// whose own join triggered this one.
    async fn join(
        &mut self,
        topic_id: Cid,
        topic: &TopicNode,
        exclude: Option<Identity>,
    ) -> anyhow::Result<()> {
        if topic.author == self.identity {
            self.trees.entry(topic_id).or_default();
            return Ok(());
        }

        if let Some(entry) = self.trees.get(&topic_id) {
            if !entry.is_orphan() {
                // Already joined with a live parent; nothing to do.
                return Ok(());
            }
        }

        let target = self
            .store
            .closest_peer(&topic.author)
            .await?
            .filter(|candidate| *candidate != self.identity && Some(*candidate) != exclude)
            .ok_or(PulsarcastError::NoRouteToAuthor(topic_id))?;

        self.send_with_retry(target, RpcOp::JoinTopic { topic_id })
            .await?;

        self.trees.entry(topic_id).or_default().add_parent(target);
        self.ensure_event_tree(topic_id);
        // Record that the target now carries us as a child.
        self.peers
            .ensure(target)
            .tree_mut(topic_id)
            .add_child(self.identity);

        debug!(
            topic = %topic_id,
            parent = %hex::encode(&target.as_bytes()[..8]),
            "joined dissemination tree"
        );
        Ok(())
    }

    async fn handle_join(&mut self, from: Identity, topic_id: Cid) -> anyhow::Result<()> {
        let topic = self.directory.resolve(&topic_id).await?;

        self.trees.entry(topic_id).or_default().add_child(from);
        self.ensure_event_tree(topic_id);
        self.peers
            .ensure(from)
            .tree_mut(topic_id)
            .add_parent(self.identity);

        // Extend the chain toward the root before acknowledging, so the
        // new child hangs off a connected subtree.
        if topic.author != self.identity {
            let orphan = self
                .trees
                .get(&topic_id)
                .map(TreeEntry::is_orphan)
                .unwrap_or(true);
            if orphan {
                if let Err(err) = self.join(topic_id, &topic, Some(from)).await {
                    warn!(
                        topic = %topic_id,
                        error = %err,
                        "could not extend join toward topic author"
                    );
                }
            }
        }

        // Answer with our tree state for the topic; doubles as the join
        // acknowledgement.
        let peer_tree = self.own_tree_wire(topic_id);
        if let Err(err) = self
            .send_with_retry(from, RpcOp::Update { peer_tree })
            .await
        {
            debug!(
                topic = %topic_id,
                peer = %hex::encode(&from.as_bytes()[..8]),
                error = %err,
                "failed to send join update"
            );
        }

        trace!(
            topic = %topic_id,
            child = %hex::encode(&from.as_bytes()[..8]),
            "registered child"
        );
        Ok(())
    }

    fn own_tree_wire(&self, topic_id: Cid) -> PeerTreeWire {
        let entry = self.trees.get(&topic_id).cloned().unwrap_or_default();
        PeerTreeWire {
            topic: topic_id,
            parents: entry.parents,
            children: entry.children,
        }
    }

    // ========================================================================
    // Unsubscribe / leave
    // ========================================================================

    async fn handle_unsubscribe_cmd(&mut self, topic_id: Cid) -> anyhow::Result<()> {
        if !self.subscriptions.contains(&topic_id) {
            // Idempotent: no state, no LEAVE messages.
            return Ok(());
        }

        let topic = self.directory.resolve(&topic_id).await?;
        if topic.author == self.identity {
            return Err(PulsarcastError::RootCannotLeave(topic_id).into());
        }

        self.subscriptions.remove(&topic_id);
        self.subscribers.remove(&topic_id);
        self.event_trees.remove(&topic_id);

        let neighbors = self
            .trees
            .remove(&topic_id)
            .map(|entry| entry.neighbors())
            .unwrap_or_default();

        for neighbor in neighbors {
            if let Some(peer) = self.peers.get_mut(&neighbor) {
                if let Some(tree) = peer.tree(&topic_id) {
                    let mut tree = tree.clone();
                    tree.remove_peer(&self.identity);
                    peer.update_tree(topic_id, tree);
                }
            }
            if let Err(err) = self
                .send_with_retry(neighbor, RpcOp::LeaveTopic { topic_id })
                .await
            {
                debug!(
                    topic = %topic_id,
                    peer = %hex::encode(&neighbor.as_bytes()[..8]),
                    error = %err,
                    "failed to notify neighbor of leave"
                );
            }
        }

        debug!(topic = %topic_id, "unsubscribed from topic");
        Ok(())
    }

    async fn handle_leave(&mut self, from: Identity, topic_id: Cid) -> anyhow::Result<()> {
        if let Some(peer) = self.peers.get_mut(&from) {
            peer.remove_tree(&topic_id);
        }

        let lost_parent = match self.trees.get_mut(&topic_id) {
            Some(entry) => {
                entry.remove_peer(&from);
                entry.is_orphan()
            }
            None => return Ok(()),
        };

        // A dependent left behind without a parent re-runs its own join.
        if lost_parent && self.subscriptions.contains(&topic_id) {
            let topic = self.directory.resolve(&topic_id).await?;
            if topic.author != self.identity {
                debug!(topic = %topic_id, "parent left, re-joining tree");
                if let Err(err) = self.join(topic_id, &topic, Some(from)).await {
                    warn!(topic = %topic_id, error = %err, "re-join after leave failed");
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Publish / authorization
    // ========================================================================

    async fn handle_publish_cmd(
        &mut self,
        topic_id: Cid,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> anyhow::Result<PublishOutcome> {
        // The caller-supplied parent travels inside the pending event so a
        // request-to-publish still carries it to whichever peer commits.
        let event = EventNode::new(topic_id, self.identity, payload, options.parent)?;
        // A local publish is just a PUBLISH_EVENT originating at this node.
        self.process_publish_event(None, event, options).await
    }

    /// Common path for locally originated and inbound events. `from` is the
    /// neighbor the event arrived from, or `None` when it originated here.
    async fn process_publish_event(
        &mut self,
        from: Option<Identity>,
        event: EventNode,
        options: PublishOptions,
    ) -> anyhow::Result<PublishOutcome> {
        let topic_id = event.topic;
        let topic = self.directory.resolve(&topic_id).await?;
        let event_cid = event.cid()?;

        // Content addressing is the de-duplication mechanism: an event
        // already cached arrived over a redundant path and stops here.
        if let Some(tree) = self.event_trees.get(&topic_id) {
            if tree.contains(&event_cid) {
                trace!(topic = %topic_id, event = %event_cid, "duplicate event dropped");
                return Ok(PublishOutcome {
                    event_cid: Some(event_cid),
                    topic,
                    event,
                });
            }
        }

        let newly_originated = from.is_none() && event.author == self.identity;

        if newly_originated && !event.is_published() {
            if !topic.metadata.allowed_publishers.may_publish(&self.identity) {
                // Not an error: hand the pending event to the network as a
                // request-to-publish and report it as pending.
                self.seen_requests.put(event_cid, ());
                self.relay_to_neighbors(
                    topic_id,
                    RpcOp::RequestToPublish { event: EventDescriptor::from(&event) },
                    None,
                )
                .await;
                debug!(
                    topic = %topic_id,
                    event = %event_cid,
                    "publish pending, requested delegation"
                );
                return Ok(PublishOutcome { event_cid: None, topic, event });
            }

            let committed = self.commit_event(&topic, event, options.parent).await?;
            let committed_cid = committed.cid()?;
            self.deliver_local(topic_id, &committed).await;
            self.relay_to_neighbors(
                topic_id,
                RpcOp::PublishEvent { event: EventDescriptor::from(&committed) },
                None,
            )
            .await;
            return Ok(PublishOutcome {
                event_cid: Some(committed_cid),
                topic,
                event: committed,
            });
        }

        // Inbound events must already be committed; a pending event travels
        // as REQUEST_TO_PUBLISH, never as PUBLISH_EVENT.
        if !event.is_published() {
            return Err(PulsarcastError::Validation(
                "received unpublished event on the publish path".to_string(),
            )
            .into());
        }

        self.ensure_event_tree(topic_id).insert(event_cid, event.clone());
        self.deliver_local(topic_id, &event).await;
        self.relay_to_neighbors(
            topic_id,
            RpcOp::PublishEvent { event: EventDescriptor::from(&event) },
            from,
        )
        .await;

        Ok(PublishOutcome { event_cid: Some(event_cid), topic, event })
    }

    /// Stamp this node as publisher, link the event into the topic's chain,
    /// persist it and cache it. Returns the committed node.
    async fn commit_event(
        &mut self,
        topic: &TopicNode,
        event: EventNode,
        custom_parent: Option<Cid>,
    ) -> anyhow::Result<EventNode> {
        let topic_id = event.topic;
        let linking = topic.metadata.event_linking;

        let committed = {
            let published = event.as_published(self.identity);
            let tree = self.ensure_event_tree(topic_id);
            tree.link_new(&published, linking, custom_parent)?
        };
        let cid = committed.cid()?;
        self.store.put(cid, committed.serialize()?).await?;
        self.ensure_event_tree(topic_id).insert(cid, committed.clone());

        debug!(
            topic = %topic_id,
            event = %cid,
            author = %hex::encode(&committed.author.as_bytes()[..8]),
            "committed event"
        );
        Ok(committed)
    }

    async fn handle_publish_event(
        &mut self,
        from: Identity,
        descriptor: EventDescriptor,
    ) -> anyhow::Result<()> {
        let event = descriptor.into_node()?;
        self.process_publish_event(Some(from), event, PublishOptions::default())
            .await?;
        Ok(())
    }

    async fn handle_request_to_publish(
        &mut self,
        from: Identity,
        descriptor: EventDescriptor,
    ) -> anyhow::Result<()> {
        let event = descriptor.into_node()?;
        let topic_id = event.topic;
        let topic = self.directory.resolve(&topic_id).await?;
        let pending_cid = event.cid()?;

        if self.seen_requests.contains(&pending_cid) {
            trace!(topic = %topic_id, event = %pending_cid, "duplicate request dropped");
            return Ok(());
        }
        self.seen_requests.put(pending_cid, ());

        // An unauthorized request is dropped without any reply; the origin
        // only ever sees its pending publish.
        if !topic.metadata.request_to_publish.may_request(&event.author) {
            debug!(
                topic = %topic_id,
                author = %hex::encode(&event.author.as_bytes()[..8]),
                "dropping request-to-publish from unauthorized author"
            );
            return Ok(());
        }

        if topic.metadata.allowed_publishers.may_publish(&self.identity) {
            // Promote: commit the pending event here and fan the committed
            // version out to every neighbor, including back toward the
            // requesting author.
            let custom_parent = event.parent;
            let committed = self.commit_event(&topic, event, custom_parent).await?;
            self.deliver_local(topic_id, &committed).await;
            self.relay_to_neighbors(
                topic_id,
                RpcOp::PublishEvent { event: EventDescriptor::from(&committed) },
                None,
            )
            .await;
            return Ok(());
        }

        // Not authorized here: keep relaying toward the root author.
        self.relay_to_neighbors(
            topic_id,
            RpcOp::RequestToPublish { event: EventDescriptor::from(&event) },
            Some(from),
        )
        .await;
        Ok(())
    }

    // ========================================================================
    // Update / new topic
    // ========================================================================

    fn handle_update(&mut self, from: Identity, peer_tree: PeerTreeWire) {
        let mut entry = TreeEntry::new();
        for parent in peer_tree.parents {
            entry.add_parent(parent);
        }
        for child in peer_tree.children {
            entry.add_child(child);
        }
        self.peers.ensure(from).update_tree(peer_tree.topic, entry);
        trace!(
            topic = %peer_tree.topic,
            peer = %hex::encode(&from.as_bytes()[..8]),
            "recorded peer tree update"
        );
    }

    fn handle_new_topic(&mut self, from: Identity, descriptor: TopicDescriptor) -> anyhow::Result<()> {
        let node = descriptor.into_node()?;
        let (topic_id, node) = self.directory.register(node)?;
        debug!(
            topic = %topic_id,
            name = %node.name,
            peer = %hex::encode(&from.as_bytes()[..8]),
            "registered announced topic"
        );
        Ok(())
    }

    // ========================================================================
    // Inbound dispatch
    // ========================================================================

    async fn handle_envelope(
        &mut self,
        from: Identity,
        envelope: RpcEnvelope,
    ) -> anyhow::Result<()> {
        self.peers.ensure(from).attach_connection();

        for message in envelope.msgs {
            let op_name = message.op.name();
            let result = match message.op {
                RpcOp::Ping => Ok(()),
                RpcOp::Update { peer_tree } => {
                    self.handle_update(from, peer_tree);
                    Ok(())
                }
                RpcOp::PublishEvent { event } => self.handle_publish_event(from, event).await,
                RpcOp::JoinTopic { topic_id } => self.handle_join(from, topic_id).await,
                RpcOp::LeaveTopic { topic_id } => self.handle_leave(from, topic_id).await,
                RpcOp::NewTopic { topic } => self.handle_new_topic(from, topic),
                RpcOp::RequestToPublish { event } => {
                    self.handle_request_to_publish(from, event).await
                }
            };

            // A failing message is dropped and logged; the connection and
            // the rest of the batch are unaffected.
            if let Err(err) = result {
                warn!(
                    op = op_name,
                    peer = %hex::encode(&from.as_bytes()[..8]),
                    error = %err,
                    "dropped inbound message"
                );
            }
        }
        Ok(())
    }

    // ========================================================================
    // Delivery and transport plumbing
    // ========================================================================

    /// Hand an event to every local subscriber of the topic, in order.
    async fn deliver_local(&mut self, topic_id: Cid, event: &EventNode) {
        let Some(senders) = self.subscribers.get_mut(&topic_id) else {
            return;
        };
        let mut open = Vec::with_capacity(senders.len());
        for sender in senders.drain(..) {
            if sender.send(event.clone()).await.is_ok() {
                open.push(sender);
            }
        }
        *senders = open;
    }

    /// Fan an operation out to every tree neighbor except `except`.
    /// Delivery failures escalate to tree repair rather than surfacing.
    async fn relay_to_neighbors(&mut self, topic_id: Cid, op: RpcOp, except: Option<Identity>) {
        let neighbors: Vec<Identity> = self
            .trees
            .get(&topic_id)
            .map(|entry| entry.neighbors())
            .unwrap_or_default()
            .into_iter()
            .filter(|peer| Some(*peer) != except && *peer != self.identity)
            .collect();

        let mut failed = Vec::new();
        for neighbor in neighbors {
            if let Err(err) = self.send_with_retry(neighbor, op.clone()).await {
                debug!(
                    topic = %topic_id,
                    peer = %hex::encode(&neighbor.as_bytes()[..8]),
                    error = %err,
                    "relay failed"
                );
                failed.push(neighbor);
            }
        }
        for peer in failed {
            self.handle_peer_failure(peer).await;
        }
    }

    /// Send one operation to a peer, retrying up to the configured number
    /// of attempts. Exhaustion yields [`PulsarcastError::Connection`].
    async fn send_with_retry(&mut self, to: Identity, op: RpcOp) -> anyhow::Result<()> {
        let envelope = RpcEnvelope::single(op);
        let attempts = self.config.max_send_attempts.max(1);
        let network = Arc::clone(&self.network);

        for attempt in 1..=attempts {
            match network.send(&to, envelope.clone()).await {
                Ok(()) => {
                    self.peers.ensure(to).attach_connection();
                    return Ok(());
                }
                Err(err) => {
                    trace!(
                        peer = %hex::encode(&to.as_bytes()[..8]),
                        attempt,
                        error = %err,
                        "send attempt failed"
                    );
                }
            }
        }
        Err(PulsarcastError::Connection { peer: to, attempts }.into())
    }

    /// A peer is unreachable: purge it and repair every tree it was part
    /// of. Orphaned subscribed topics re-run their join.
    async fn handle_peer_failure(&mut self, peer: Identity) {
        self.peers.remove(&peer);

        let mut orphaned = Vec::new();
        for (topic_id, entry) in self.trees.iter_mut() {
            if entry.remove_peer(&peer) && entry.is_orphan() {
                orphaned.push(*topic_id);
            }
        }

        debug!(
            peer = %hex::encode(&peer.as_bytes()[..8]),
            orphaned_topics = orphaned.len(),
            "purged unreachable peer"
        );

        for topic_id in orphaned {
            if !self.subscriptions.contains(&topic_id) {
                continue;
            }
            let topic = match self.directory.resolve(&topic_id).await {
                Ok(topic) => topic,
                Err(err) => {
                    warn!(topic = %topic_id, error = %err, "cannot resolve topic for repair");
                    continue;
                }
            };
            if topic.author == self.identity {
                continue;
            }
            if let Err(err) = self.join(topic_id, &topic, Some(peer)).await {
                warn!(topic = %topic_id, error = %err, "tree repair failed");
            } else {
                debug!(topic = %topic_id, "tree repaired after peer failure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = Config::default();
        assert!(config.max_send_attempts >= 1);
        assert!(config.command_capacity >= 16);
        assert!(config.subscription_capacity >= 16);
        assert!(config.topic_cache_size >= 16);
        assert!(config.event_cache_size >= 16);
        assert!(config.maintenance_interval >= Duration::from_secs(1));
    }

    #[test]
    fn subscribe_options_default_to_meta_join() {
        assert!(SubscribeOptions::default().subscribe_to_meta);
        assert!(PublishOptions::default().parent.is_none());
    }
}
