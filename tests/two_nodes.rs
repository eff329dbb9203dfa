//! Two-node scenarios: topic creation, subscription, publishing under both
//! publisher policies, and unsubscribe behavior.

mod common;

use std::time::Duration;

use common::Cluster;
use pulsarcast::{
    Cid, EventLinking, PublishOptions, PublisherPolicy, PulsarcastError, SubscribeOptions,
    TopicNodeOptions,
};
use tokio::time::timeout;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire op code for LEAVE_TOPIC.
const LEAVE_TOPIC: u32 = 4;

#[tokio::test]
async fn create_topic_subscribes_author_as_root() {
    let cluster = Cluster::new(2).await;
    let author = &cluster.nodes[0].node;

    let (topic_id, topic) = author
        .create_topic("news", TopicNodeOptions::default())
        .await
        .expect("create_topic failed");

    assert_eq!(topic.author, cluster.identity(0));
    assert!(topic.meta().is_some(), "topic should carry a meta-topic link");

    // Author is subscribed to the topic and its meta-topic.
    let subscriptions = author.subscriptions().await.unwrap();
    assert!(subscriptions.contains(&topic_id));
    assert!(subscriptions.contains(&topic.meta().unwrap()));

    // Root of its own tree: joined, no parents.
    let entry = author.engine().unwrap().tree_entry(topic_id).await.unwrap();
    assert!(entry.parents.is_empty());
}

#[tokio::test]
async fn subscriber_resolves_the_authors_descriptor() {
    let cluster = Cluster::new(2).await;

    let (topic_id, topic) = cluster.nodes[0]
        .node
        .create_topic("news", TopicNodeOptions::default())
        .await
        .unwrap();

    let (resolved, _events) = cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .expect("subscribe failed");

    // Byte-identical descriptor on both sides.
    assert_eq!(resolved.serialize().unwrap(), topic.serialize().unwrap());

    let entry = cluster.nodes[1]
        .node
        .engine()
        .unwrap()
        .tree_entry(topic_id)
        .await
        .expect("subscriber should hold a tree entry");
    assert_eq!(entry.parents, vec![cluster.identity(0)]);
}

#[tokio::test]
async fn unrestricted_publish_reaches_author_and_echoes_locally() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic(
            "news",
            TopicNodeOptions {
                allowed_publishers: Some(PublisherPolicy::Unrestricted),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (_, mut author_events) = cluster.nodes[0]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();
    let (_, mut publisher_events) = cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();

    let outcome = cluster.nodes[1]
        .node
        .publish(topic_id, b"hello".to_vec(), PublishOptions::default())
        .await
        .expect("publish failed");

    assert!(outcome.event_cid.is_some());
    assert!(outcome.event.is_published());

    let at_author = timeout(RECV_TIMEOUT, author_events.recv())
        .await
        .expect("author timed out")
        .expect("author channel closed");
    let at_publisher = timeout(RECV_TIMEOUT, publisher_events.recv())
        .await
        .expect("publisher timed out")
        .expect("publisher channel closed");

    assert_eq!(at_author.payload, b"hello");
    assert_eq!(at_author.author, cluster.identity(1));
    assert_eq!(at_author.publisher, Some(cluster.identity(1)));
    // Both sides saw the same committed node, byte for byte.
    assert_eq!(
        at_author.serialize().unwrap(),
        at_publisher.serialize().unwrap()
    );
}

#[tokio::test]
async fn restricted_publish_is_delegated_to_the_author() {
    let cluster = Cluster::new(2).await;

    // Default policy: only the author may commit, requests are open.
    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic("restricted", TopicNodeOptions::default())
        .await
        .unwrap();

    let (_, mut author_events) = cluster.nodes[0]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();
    let (_, mut requester_events) = cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();

    let outcome = cluster.nodes[1]
        .node
        .publish(topic_id, b"x".to_vec(), PublishOptions::default())
        .await
        .expect("publish failed");

    // Pending at the caller: no CID, unpublished event.
    assert!(outcome.event_cid.is_none());
    assert!(!outcome.event.is_published());
    assert_eq!(outcome.event.author, cluster.identity(1));

    // The author commits and republishes with itself as publisher.
    let at_author = timeout(RECV_TIMEOUT, author_events.recv())
        .await
        .expect("author timed out")
        .expect("author channel closed");
    let at_requester = timeout(RECV_TIMEOUT, requester_events.recv())
        .await
        .expect("requester timed out")
        .expect("requester channel closed");

    assert_eq!(at_author.author, cluster.identity(1));
    assert_eq!(at_author.publisher, Some(cluster.identity(0)));
    assert_eq!(at_author.payload, b"x");
    assert_eq!(
        at_author.serialize().unwrap(),
        at_requester.serialize().unwrap()
    );

    // Exactly one committed event arrives on each side.
    assert!(
        timeout(Duration::from_millis(200), requester_events.recv())
            .await
            .is_err(),
        "requester received a duplicate event"
    );
}

#[tokio::test]
async fn consecutive_events_chain_under_last_seen_linking() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic("news", TopicNodeOptions::default())
        .await
        .unwrap();

    let first = cluster.nodes[0]
        .node
        .publish(topic_id, b"first".to_vec(), PublishOptions::default())
        .await
        .unwrap();
    let second = cluster.nodes[0]
        .node
        .publish(topic_id, b"second".to_vec(), PublishOptions::default())
        .await
        .unwrap();

    assert_eq!(first.event.parent, None);
    assert_eq!(second.event.parent, first.event_cid);
}

#[tokio::test]
async fn custom_linking_requires_and_uses_the_supplied_parent() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic(
            "log",
            TopicNodeOptions {
                allowed_publishers: Some(PublisherPolicy::Unrestricted),
                event_linking: Some(EventLinking::Custom),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // No parent supplied: the commit fails validation at the caller.
    let err = cluster.nodes[1]
        .node
        .publish(topic_id, b"first".to_vec(), PublishOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PulsarcastError>(),
        Some(PulsarcastError::Validation(_))
    ));

    let parent = Cid::of(b"genesis");
    let outcome = cluster.nodes[1]
        .node
        .publish(topic_id, b"second".to_vec(), PublishOptions { parent: Some(parent) })
        .await
        .unwrap();
    assert!(outcome.event_cid.is_some());
    assert_eq!(outcome.event.parent, Some(parent));
}

#[tokio::test]
async fn delegated_publish_preserves_a_custom_parent() {
    let cluster = Cluster::new(2).await;

    // Only the author commits; events link to caller-chosen parents.
    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic(
            "log",
            TopicNodeOptions {
                event_linking: Some(EventLinking::Custom),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let (_, mut author_events) = cluster.nodes[0]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();
    cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions { subscribe_to_meta: false })
        .await
        .unwrap();

    let parent = Cid::of(b"genesis");
    let outcome = cluster.nodes[1]
        .node
        .publish(topic_id, b"x".to_vec(), PublishOptions { parent: Some(parent) })
        .await
        .unwrap();

    // Pending at the caller, but the chosen parent rides along.
    assert!(outcome.event_cid.is_none());
    assert_eq!(outcome.event.parent, Some(parent));

    let committed = timeout(RECV_TIMEOUT, author_events.recv())
        .await
        .expect("author timed out")
        .expect("author channel closed");
    assert_eq!(committed.parent, Some(parent));
    assert_eq!(committed.author, cluster.identity(1));
    assert_eq!(committed.publisher, Some(cluster.identity(0)));
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic("news", TopicNodeOptions::default())
        .await
        .unwrap();

    cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions::default())
        .await
        .unwrap();

    cluster.nodes[1].node.unsubscribe(topic_id).await.unwrap();
    let leaves_after_first =
        cluster
            .router
            .sends_between(cluster.identity(1), cluster.identity(0), LEAVE_TOPIC);
    assert_eq!(leaves_after_first, 1);

    // Second unsubscribe succeeds without sending anything.
    cluster.nodes[1].node.unsubscribe(topic_id).await.unwrap();
    let leaves_after_second =
        cluster
            .router
            .sends_between(cluster.identity(1), cluster.identity(0), LEAVE_TOPIC);
    assert_eq!(leaves_after_second, leaves_after_first);
}

#[tokio::test]
async fn root_cannot_leave_its_own_topic() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic("news", TopicNodeOptions::default())
        .await
        .unwrap();

    let err = cluster.nodes[0].node.unsubscribe(topic_id).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PulsarcastError>(),
        Some(PulsarcastError::RootCannotLeave(_))
    ));
}

#[tokio::test]
async fn subscribing_to_an_unknown_topic_fails_with_not_found() {
    let cluster = Cluster::new(2).await;

    let err = cluster.nodes[1]
        .node
        .subscribe(Cid::of(b"no such topic"), SubscribeOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PulsarcastError>(),
        Some(PulsarcastError::NotFound(_))
    ));
}

#[tokio::test]
async fn meta_join_can_be_suppressed() {
    let cluster = Cluster::new(2).await;

    let (topic_id, _) = cluster.nodes[0]
        .node
        .create_topic("news", TopicNodeOptions::default())
        .await
        .unwrap();

    cluster.nodes[1]
        .node
        .subscribe(topic_id, SubscribeOptions { subscribe_to_meta: false })
        .await
        .unwrap();

    let subscriptions = cluster.nodes[1].node.subscriptions().await.unwrap();
    assert_eq!(subscriptions, vec![topic_id]);
}
