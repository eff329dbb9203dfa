//! In-memory collaborators for integration tests: a shared content store
//! with per-node routing views, and a router that delivers envelopes
//! between engine actors while recording all traffic.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use pulsarcast::identity::distance_cmp;
use pulsarcast::{
    Cid, Config, ContentStore, Identity, Keypair, Node, Pulsarcast, PulsarcastRpc, RpcEnvelope,
};

/// Content store backed by a cluster-wide value map plus a per-node routing
/// view, standing in for the DHT.
pub struct MemoryStore {
    values: Arc<Mutex<HashMap<Cid, Vec<u8>>>>,
    self_id: Identity,
    routing: Mutex<Vec<Identity>>,
}

impl MemoryStore {
    pub fn new(values: Arc<Mutex<HashMap<Cid, Vec<u8>>>>, self_id: Identity) -> Self {
        Self {
            values,
            self_id,
            routing: Mutex::new(Vec::new()),
        }
    }

    pub fn add_route(&self, peer: Identity) {
        let mut routing = self.routing.lock().unwrap();
        if !routing.contains(&peer) {
            routing.push(peer);
        }
    }

    pub fn remove_route(&self, peer: &Identity) {
        self.routing.lock().unwrap().retain(|p| p != peer);
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get(&self, key: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().unwrap().get(key).cloned())
    }

    async fn put(&self, key: Cid, value: Vec<u8>) -> Result<()> {
        self.values.lock().unwrap().insert(key, value);
        Ok(())
    }

    async fn closest_peer(&self, target: &Identity) -> Result<Option<Identity>> {
        let routing = self.routing.lock().unwrap();
        Ok(routing
            .iter()
            .copied()
            .filter(|peer| *peer != self.self_id)
            .min_by(|a, b| distance_cmp(&target.xor_distance(a), &target.xor_distance(b))))
    }
}

/// One recorded send: `(from, to, op_code)`.
pub type TrafficRecord = (Identity, Identity, u32);

/// Cluster-wide message router standing in for the transport overlay.
#[derive(Default)]
pub struct Router {
    handles: Mutex<HashMap<Identity, Pulsarcast>>,
    down: Mutex<HashSet<Identity>>,
    log: Mutex<Vec<TrafficRecord>>,
}

impl Router {
    pub fn register(&self, identity: Identity, handle: Pulsarcast) {
        self.handles.lock().unwrap().insert(identity, handle);
    }

    pub fn mark_down(&self, identity: Identity) {
        self.down.lock().unwrap().insert(identity);
    }

    /// Number of sends from `from` to `to` with the given op code.
    pub fn sends_between(&self, from: Identity, to: Identity, op_code: u32) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(f, t, op)| *f == from && *t == to && *op == op_code)
            .count()
    }
}

/// Per-node transport handle over the shared [`Router`].
pub struct MemoryNetwork {
    router: Arc<Router>,
    self_id: Identity,
}

impl MemoryNetwork {
    pub fn new(router: Arc<Router>, self_id: Identity) -> Self {
        Self { router, self_id }
    }
}

#[async_trait]
impl PulsarcastRpc for MemoryNetwork {
    async fn send(&self, to: &Identity, envelope: RpcEnvelope) -> Result<()> {
        if self.router.down.lock().unwrap().contains(to) {
            anyhow::bail!("peer is down");
        }
        let handle = self
            .router
            .handles
            .lock()
            .unwrap()
            .get(to)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown peer"))?;

        {
            let mut log = self.router.log.lock().unwrap();
            for msg in &envelope.msgs {
                log.push((self.self_id, *to, msg.op.op_code()));
            }
        }

        // Fire-and-forget into the target actor; per-sender ordering is
        // preserved by the target's command channel.
        handle.deliver(self.self_id, envelope).await
    }
}

pub struct ClusterNode {
    pub node: Node<MemoryStore, MemoryNetwork>,
    pub store: Arc<MemoryStore>,
    pub identity: Identity,
}

/// A set of started nodes wired through one router and one value map.
pub struct Cluster {
    pub router: Arc<Router>,
    pub nodes: Vec<ClusterNode>,
}

impl Cluster {
    /// Build `n` started nodes where every node routes to every other.
    pub async fn new(n: usize) -> Cluster {
        let views: Vec<Vec<usize>> = (0..n)
            .map(|i| (0..n).filter(|j| *j != i).collect())
            .collect();
        Self::with_routing(&views).await
    }

    /// Build one started node per routing view; `views[i]` lists the node
    /// indices visible in node `i`'s routing view.
    pub async fn with_routing(views: &[Vec<usize>]) -> Cluster {
        let values = Arc::new(Mutex::new(HashMap::new()));
        let router = Arc::new(Router::default());

        let keypairs: Vec<Keypair> = views.iter().map(|_| Keypair::generate()).collect();
        let identities: Vec<Identity> = keypairs.iter().map(Keypair::identity).collect();

        let mut nodes = Vec::with_capacity(views.len());
        for (i, view) in views.iter().enumerate() {
            let store = Arc::new(MemoryStore::new(Arc::clone(&values), identities[i]));
            for j in view {
                store.add_route(identities[*j]);
            }
            let network = Arc::new(MemoryNetwork::new(Arc::clone(&router), identities[i]));
            let node = Node::new(
                keypairs[i].clone(),
                Arc::clone(&store),
                network,
                Config::default(),
            );
            node.start().await.expect("start failed");
            router.register(identities[i], node.engine().expect("engine handle"));
            nodes.push(ClusterNode {
                node,
                store,
                identity: identities[i],
            });
        }

        Cluster { router, nodes }
    }

    pub fn identity(&self, i: usize) -> Identity {
        self.nodes[i].identity
    }

    /// Take node `i` off the network: sends to it fail and it disappears
    /// from every routing view.
    pub fn kill(&self, i: usize) {
        let dead = self.nodes[i].identity;
        self.router.mark_down(dead);
        for node in &self.nodes {
            node.store.remove_route(&dead);
        }
    }
}

/// Poll `probe` until it returns true or the timeout elapses.
pub async fn wait_until<F, Fut>(mut probe: F, what: &str)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if probe().await {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
