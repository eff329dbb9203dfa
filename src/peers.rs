//! Peer registry.
//!
//! A [`Peer`] is created on first contact, inbound or outbound, and carries
//! the connection state plus a record of that peer's dissemination-tree
//! membership per topic (as learned from joins, leaves and UPDATE
//! messages). A peer with no live connection and no topic associations has
//! no reason to be tracked and is pruned on the maintenance tick.

use std::collections::HashMap;

use tracing::trace;

use crate::dag::Cid;
use crate::identity::Identity;
use crate::tree::TreeEntry;

/// A remote peer as seen by the local node.
#[derive(Clone, Debug)]
pub struct Peer {
    pub identity: Identity,
    connected: bool,
    /// This peer's tree membership per topic.
    trees: HashMap<Cid, TreeEntry>,
}

impl Peer {
    pub fn new(identity: Identity) -> Self {
        Self {
            identity,
            connected: false,
            trees: HashMap::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Mark the transport stream up. Connections are established lazily, on
    /// the first successful exchange in either direction.
    pub fn attach_connection(&mut self) {
        self.connected = true;
    }

    pub fn detach_connection(&mut self) {
        self.connected = false;
    }

    /// Replace the recorded tree state for a topic (UPDATE semantics).
    pub fn update_tree(&mut self, topic: Cid, entry: TreeEntry) {
        self.trees.insert(topic, entry);
    }

    pub fn tree(&self, topic: &Cid) -> Option<&TreeEntry> {
        self.trees.get(topic)
    }

    pub fn tree_mut(&mut self, topic: Cid) -> &mut TreeEntry {
        self.trees.entry(topic).or_default()
    }

    pub fn remove_tree(&mut self, topic: &Cid) -> Option<TreeEntry> {
        self.trees.remove(topic)
    }

    pub fn has_topics(&self) -> bool {
        !self.trees.is_empty()
    }
}

/// All peers the local node currently tracks.
#[derive(Default)]
pub struct PeerRegistry {
    peers: HashMap<Identity, Peer>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a peer, creating the entry on first contact.
    pub fn ensure(&mut self, identity: Identity) -> &mut Peer {
        self.peers
            .entry(identity)
            .or_insert_with(|| Peer::new(identity))
    }

    pub fn get(&self, identity: &Identity) -> Option<&Peer> {
        self.peers.get(identity)
    }

    pub fn get_mut(&mut self, identity: &Identity) -> Option<&mut Peer> {
        self.peers.get_mut(identity)
    }

    pub fn remove(&mut self, identity: &Identity) -> Option<Peer> {
        self.peers.remove(identity)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Drop peers with no connection and no topic associations. Returns how
    /// many entries were removed.
    pub fn prune(&mut self) -> usize {
        let before = self.peers.len();
        self.peers
            .retain(|_, peer| peer.is_connected() || peer.has_topics());
        let removed = before - self.peers.len();
        if removed > 0 {
            trace!(removed, remaining = self.peers.len(), "pruned idle peers");
        }
        removed
    }
}
