//! Topic directory: local descriptor cache over the content store.
//!
//! Resolution order is cache, then store. A hit from the store is decoded,
//! cached, and returned; a miss surfaces as
//! [`PulsarcastError::NotFound`]. Registering a topic only caches it;
//! persisting the descriptor to the store is an explicit follow-up done by
//! the node that created it.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::trace;

use crate::dag::{Cid, TopicNode};
use crate::error::PulsarcastError;
use crate::protocols::ContentStore;

pub struct TopicDirectory<S> {
    store: Arc<S>,
    cache: LruCache<Cid, TopicNode>,
}

impl<S: ContentStore> TopicDirectory<S> {
    pub fn new(store: Arc<S>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or(NonZeroUsize::new(1).expect("1 is non-zero"));
        Self {
            store,
            cache: LruCache::new(capacity),
        }
    }

    /// Resolve a topic CID to its descriptor, fetching from the content
    /// store on a cache miss.
    pub async fn resolve(&mut self, topic_id: &Cid) -> anyhow::Result<TopicNode> {
        if let Some(node) = self.cache.get(topic_id) {
            return Ok(node.clone());
        }

        let bytes = self
            .store
            .get(topic_id)
            .await?
            .ok_or(PulsarcastError::NotFound(*topic_id))?;
        let node = TopicNode::deserialize(&bytes)?;
        trace!(topic = %topic_id, name = %node.name, "resolved topic from content store");
        self.cache.put(*topic_id, node.clone());
        Ok(node)
    }

    /// Compute the CID and cache the descriptor locally.
    pub fn register(&mut self, node: TopicNode) -> anyhow::Result<(Cid, TopicNode)> {
        let cid = node.cid()?;
        self.cache.put(cid, node.clone());
        Ok((cid, node))
    }

    /// Cached descriptor, if present. Does not touch the store.
    pub fn cached(&mut self, topic_id: &Cid) -> Option<&TopicNode> {
        self.cache.get(topic_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::TopicNodeOptions;
    use crate::identity::Identity;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    /// Minimal in-memory store for directory tests.
    struct MapStore {
        values: Mutex<HashMap<Cid, Vec<u8>>>,
    }

    impl MapStore {
        fn new() -> Self {
            Self { values: Mutex::new(HashMap::new()) }
        }
    }

    #[async_trait]
    impl ContentStore for MapStore {
        async fn get(&self, key: &Cid) -> Result<Option<Vec<u8>>> {
            Ok(self.values.lock().await.get(key).cloned())
        }

        async fn put(&self, key: Cid, value: Vec<u8>) -> Result<()> {
            self.values.lock().await.insert(key, value);
            Ok(())
        }

        async fn closest_peer(&self, _target: &Identity) -> Result<Option<Identity>> {
            Ok(None)
        }
    }

    fn make_topic() -> TopicNode {
        TopicNode::new(
            "news",
            Identity::from_bytes([1u8; 32]),
            TopicNodeOptions::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn resolve_misses_surface_not_found() {
        let store = Arc::new(MapStore::new());
        let mut directory = TopicDirectory::new(store, 16);

        let err = directory.resolve(&Cid::of(b"missing")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PulsarcastError>(),
            Some(PulsarcastError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn resolve_falls_through_to_store_then_caches() {
        let store = Arc::new(MapStore::new());
        let topic = make_topic();
        let cid = topic.cid().unwrap();
        store.put(cid, topic.serialize().unwrap()).await.unwrap();

        let mut directory = TopicDirectory::new(Arc::clone(&store), 16);
        let resolved = directory.resolve(&cid).await.unwrap();
        assert_eq!(resolved, topic);

        // Drop the backing value; the cache must now answer.
        store.values.lock().await.clear();
        let cached = directory.resolve(&cid).await.unwrap();
        assert_eq!(cached, topic);
    }

    #[tokio::test]
    async fn register_caches_without_persisting() {
        let store = Arc::new(MapStore::new());
        let mut directory = TopicDirectory::new(Arc::clone(&store), 16);

        let (cid, _) = directory.register(make_topic()).unwrap();
        assert!(directory.cached(&cid).is_some());
        assert!(store.values.lock().await.is_empty());
    }
}
