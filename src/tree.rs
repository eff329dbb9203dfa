//! Per-topic tree state.
//!
//! Two trees live here. [`TreeEntry`] is one peer's view of a topic's
//! dissemination tree: the parents it relays through toward the root and
//! the children relying on it. [`EventTree`] is the local cache of events
//! seen for a topic, with the `most_recent` pointer that resolves last-seen
//! event linking.
//!
//! A peer reachable from multiple paths may hold more than one parent;
//! redundant paths are permitted and de-duplicated by the event cache on
//! delivery.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::dag::{Cid, EventLinking, EventNode};
use crate::error::PulsarcastError;
use crate::identity::Identity;

/// One peer's parents/children for a single topic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeEntry {
    pub parents: Vec<Identity>,
    pub children: Vec<Identity>,
}

impl TreeEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parent unless already present. Returns whether it was added.
    pub fn add_parent(&mut self, peer: Identity) -> bool {
        if self.parents.contains(&peer) {
            return false;
        }
        self.parents.push(peer);
        true
    }

    /// Add a child unless already present. Returns whether it was added.
    pub fn add_child(&mut self, peer: Identity) -> bool {
        if self.children.contains(&peer) {
            return false;
        }
        self.children.push(peer);
        true
    }

    /// Drop a peer from both sets. Returns whether anything was removed.
    pub fn remove_peer(&mut self, peer: &Identity) -> bool {
        let before = self.parents.len() + self.children.len();
        self.parents.retain(|p| p != peer);
        self.children.retain(|c| c != peer);
        before != self.parents.len() + self.children.len()
    }

    pub fn contains(&self, peer: &Identity) -> bool {
        self.parents.contains(peer) || self.children.contains(peer)
    }

    /// Parents and children, de-duplicated, in insertion order.
    pub fn neighbors(&self) -> Vec<Identity> {
        let mut out = self.parents.clone();
        for child in &self.children {
            if !out.contains(child) {
                out.push(*child);
            }
        }
        out
    }

    /// A non-root entry with no parents has lost its path to the root.
    pub fn is_orphan(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty() && self.children.is_empty()
    }
}

/// Local cache of events seen for one topic.
pub struct EventTree {
    events: LruCache<Cid, EventNode>,
    most_recent: Option<Cid>,
}

impl EventTree {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            events: LruCache::new(capacity),
            most_recent: None,
        }
    }

    /// Resolve the parent link for a newly committed event.
    ///
    /// Last-seen linking points at the most recent cached event; custom
    /// linking requires the caller-supplied parent and fails without one.
    pub fn link_new(
        &self,
        event: &EventNode,
        linking: EventLinking,
        custom_parent: Option<Cid>,
    ) -> anyhow::Result<EventNode> {
        match linking {
            EventLinking::Custom => match custom_parent {
                Some(parent) => Ok(event.with_parent(Some(parent))),
                None => Err(PulsarcastError::Validation(
                    "topic requires a custom event parent and none was supplied".to_string(),
                )
                .into()),
            },
            EventLinking::LastSeen => Ok(event.with_parent(self.most_recent)),
        }
    }

    /// Cache an event, advancing `most_recent` when the event's embedded
    /// creation timestamp is newer than the current pointer's.
    pub fn insert(&mut self, cid: Cid, event: EventNode) {
        let newer = match self.most_recent.and_then(|mr| self.events.peek(&mr)) {
            Some(current) => current.metadata.created < event.metadata.created,
            None => true,
        };
        if newer {
            self.most_recent = Some(cid);
        }
        self.events.put(cid, event);
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.events.contains(cid)
    }

    pub fn get(&mut self, cid: &Cid) -> Option<&EventNode> {
        self.events.get(cid)
    }

    pub fn most_recent(&self) -> Option<Cid> {
        self.most_recent
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn make_identity(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn make_event(payload: &[u8]) -> EventNode {
        EventNode::new(Cid::of(b"topic"), make_identity(1), payload.to_vec(), None).unwrap()
    }

    #[test]
    fn tree_entry_deduplicates() {
        let mut entry = TreeEntry::new();
        let peer = make_identity(1);

        assert!(entry.add_parent(peer));
        assert!(!entry.add_parent(peer));
        assert!(entry.add_child(make_identity(2)));
        assert_eq!(entry.parents.len(), 1);
        assert_eq!(entry.children.len(), 1);
    }

    #[test]
    fn neighbors_merge_parents_and_children() {
        let mut entry = TreeEntry::new();
        let shared = make_identity(1);
        entry.add_parent(shared);
        entry.add_child(shared);
        entry.add_child(make_identity(2));

        let neighbors = entry.neighbors();
        assert_eq!(neighbors.len(), 2);
        assert!(neighbors.contains(&shared));
    }

    #[test]
    fn remove_peer_clears_both_roles() {
        let mut entry = TreeEntry::new();
        let peer = make_identity(1);
        entry.add_parent(peer);
        entry.add_child(peer);
        assert!(entry.contains(&peer));

        assert!(entry.remove_peer(&peer));
        assert!(entry.is_empty());
        assert!(!entry.remove_peer(&peer));
    }

    #[test]
    fn orphan_detection() {
        let mut entry = TreeEntry::new();
        entry.add_child(make_identity(2));
        assert!(entry.is_orphan());
        entry.add_parent(make_identity(1));
        assert!(!entry.is_orphan());
    }

    #[test]
    fn last_seen_linking_uses_most_recent() {
        let mut tree = EventTree::new(16);
        let first = make_event(b"first");
        let first_cid = first.cid().unwrap();
        tree.insert(first_cid, first);

        let second = make_event(b"second");
        let linked = tree
            .link_new(&second, EventLinking::LastSeen, None)
            .unwrap();
        assert_eq!(linked.parent, Some(first_cid));
    }

    #[test]
    fn custom_linking_requires_a_parent() {
        let tree = EventTree::new(16);
        let event = make_event(b"x");

        assert!(tree.link_new(&event, EventLinking::Custom, None).is_err());

        let parent = Cid::of(b"parent");
        let linked = tree
            .link_new(&event, EventLinking::Custom, Some(parent))
            .unwrap();
        assert_eq!(linked.parent, Some(parent));
    }

    #[test]
    fn most_recent_tracks_newest_timestamp() {
        let mut tree = EventTree::new(16);

        let mut newer = make_event(b"newer");
        newer.metadata.created = Utc::now();
        let mut older = make_event(b"older");
        older.metadata.created = newer.metadata.created - Duration::seconds(30);

        let newer_cid = newer.cid().unwrap();
        let older_cid = older.cid().unwrap();

        tree.insert(newer_cid, newer);
        // An older event arriving later must not move the pointer back.
        tree.insert(older_cid, older);
        assert_eq!(tree.most_recent(), Some(newer_cid));
    }

    #[test]
    fn insert_is_idempotent_by_cid() {
        let mut tree = EventTree::new(16);
        let event = make_event(b"dup");
        let cid = event.cid().unwrap();

        tree.insert(cid, event.clone());
        tree.insert(cid, event);
        assert_eq!(tree.len(), 1);
    }
}
