//! Multi-node scenarios over the in-process network.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use wikimesh_repl::instance::{RegisterResponse, RegistrationRequest};
use wikimesh_repl::loopback::LoopbackNetwork;
use wikimesh_repl::message::OutboundMessage;
use wikimesh_repl::message_log::MessageStatus;
use wikimesh_repl::receiver::{MessageReceiver, RelayDecision};
use wikimesh_repl::sender::RetryConfig;
use wikimesh_repl::transport::PeerClient;
use wikimesh_repl::{
    Direction, EntityRef, Instance, InstanceRule, InstanceStatus, Message, NodeBuilder, ReplConfig,
    ReplError, ReplicationConfig, ReplicationLevel, ReplicationNode,
};

const UPDATE: &str = "update";

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(String, Bytes)>>,
}

impl Recorder {
    fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

#[async_trait]
impl MessageReceiver for Recorder {
    async fn handle(&self, mut message: Message) -> wikimesh_repl::Result<RelayDecision> {
        let body = message.payload.take()?;
        self.seen.lock().push((message.header.id.clone(), body));
        Ok(RelayDecision::All)
    }
}

fn config(name: &str) -> ReplConfig {
    let mut config = ReplConfig::default();
    config.identity.id = Some(format!("{}-id", name));
    config.identity.name = name.to_string();
    config.identity.uri = format!("http://{}", name);
    config.receive_workers = 2;
    config.retry = RetryConfig {
        fixed_delay_ms: Some(20),
        ..RetryConfig::default()
    };
    config
}

fn uri(name: &str) -> String {
    format!("http://{}", name)
}

struct Mesh {
    network: Arc<LoopbackNetwork>,
    nodes: Vec<(Arc<ReplicationNode>, Arc<Recorder>)>,
}

impl Mesh {
    async fn new(names: &[&str]) -> Self {
        let network = LoopbackNetwork::new();
        let mut nodes = Vec::new();
        for name in names {
            let recorder = Arc::new(Recorder::default());
            let builder = NodeBuilder::new(config(name))
                .receiver(UPDATE, recorder.clone())
                .responder("ping", |header, body| {
                    let mut reply = body.to_vec();
                    reply.extend_from_slice(b" from ");
                    reply.extend_from_slice(header.receivers.join(",").as_bytes());
                    Ok(Bytes::from(reply))
                });
            let node = network.join(builder).unwrap();
            node.start().await;
            nodes.push((node, recorder));
        }
        Self { network, nodes }
    }

    fn node(&self, i: usize) -> &Arc<ReplicationNode> {
        &self.nodes[i].0
    }

    fn recorder(&self, i: usize) -> &Arc<Recorder> {
        &self.nodes[i].1
    }

    async fn link(&self, a: usize, b: usize) {
        let (from, to) = (self.node(a), self.node(b));
        assert!(from.registry().request_instance(&to.local().uri).await.unwrap());
        assert!(to
            .registry()
            .accept_requesting_instance(&from.local().uri)
            .await
            .unwrap());
    }

    async fn shutdown(&self) {
        for (node, _) in &self.nodes {
            node.shutdown().await;
        }
    }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn update(node: &ReplicationNode, body: &'static str) -> Message {
    Message::new(node.new_header(UPDATE), Bytes::from_static(body.as_bytes()))
}

#[tokio::test]
async fn test_registration_handshake() {
    let mesh = Mesh::new(&["a", "b"]).await;
    let (a, b) = (mesh.node(0), mesh.node(1));

    assert!(a.registry().request_instance(&uri("b")).await.unwrap());
    assert_eq!(
        a.registry().get_instance(&uri("b")).unwrap().status,
        InstanceStatus::Requested
    );
    let pending = b.registry().requesting_instances();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, "a-id");

    assert!(b.registry().accept_requesting_instance(&uri("a")).await.unwrap());
    let at_a = a.registry().get_instance(&uri("b")).unwrap();
    let at_b = b.registry().get_instance(&uri("a")).unwrap();
    assert_eq!(at_a.status, InstanceStatus::Registered);
    assert_eq!(at_b.status, InstanceStatus::Registered);
    assert!(at_a.receive_key.is_some());
    assert_eq!(at_a.receive_key, at_b.receive_key);

    // Asking again is a no-op.
    assert!(!a.registry().request_instance(&uri("b")).await.unwrap());
    mesh.shutdown().await;
}

/// Holds the first registration call until the other node has sent its own.
struct Gate {
    inner: Arc<dyn PeerClient>,
    barrier: Arc<tokio::sync::Barrier>,
    armed: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl PeerClient for Gate {
    async fn send_message(
        &self,
        target: &Instance,
        message: &OutboundMessage,
        signature: Option<&str>,
    ) -> wikimesh_repl::Result<()> {
        self.inner.send_message(target, message, signature).await
    }

    async fn register(
        &self,
        target_uri: &str,
        request: &RegistrationRequest,
    ) -> wikimesh_repl::Result<RegisterResponse> {
        if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
            self.barrier.wait().await;
        }
        self.inner.register(target_uri, request).await
    }

    async fn unregister(&self, target_uri: &str, local_id: &str) -> wikimesh_repl::Result<bool> {
        self.inner.unregister(target_uri, local_id).await
    }
}

#[tokio::test]
async fn test_crossing_requests_agree_on_link_key() {
    let network = LoopbackNetwork::new();
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let mut nodes = Vec::new();
    for name in ["a", "b"] {
        let recorder = Arc::new(Recorder::default());
        let (network_for_client, barrier) = (network.clone(), barrier.clone());
        let node = NodeBuilder::new(config(name))
            .receiver(UPDATE, recorder.clone())
            .client_factory(move |local| {
                let client: Arc<dyn PeerClient> = Arc::new(Gate {
                    inner: network_for_client.client(local.clone()),
                    barrier,
                    armed: std::sync::atomic::AtomicBool::new(true),
                });
                Ok(client)
            })
            .build()
            .unwrap();
        network.attach(&node);
        node.start().await;
        nodes.push((node, recorder));
    }
    let (a, b) = (&nodes[0].0, &nodes[1].0);

    let (uri_b, uri_a) = (uri("b"), uri("a"));
    let (at_a, at_b) = tokio::join!(
        a.registry().request_instance(&uri_b),
        b.registry().request_instance(&uri_a),
    );
    assert!(at_a.unwrap());
    assert!(at_b.unwrap());

    let b_at_a = a.registry().get_instance(&uri("b")).unwrap();
    let a_at_b = b.registry().get_instance(&uri("a")).unwrap();
    assert_eq!(b_at_a.status, InstanceStatus::Registered);
    assert_eq!(a_at_b.status, InstanceStatus::Registered);
    assert!(b_at_a.receive_key.is_some());
    assert_eq!(b_at_a.receive_key, a_at_b.receive_key);

    a.send(update(a, "rev 1")).unwrap();
    eventually("b handled", || nodes[1].1.count() == 1).await;
    let stats = a.sender().stats(&uri("b")).unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.dropped, 0);

    for (node, _) in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_decline_and_remove_notify_peer() {
    let mesh = Mesh::new(&["a", "b"]).await;
    let (a, b) = (mesh.node(0), mesh.node(1));

    assert!(a.registry().request_instance(&uri("b")).await.unwrap());
    assert!(b.registry().decline_requesting_instance(&uri("a")).await.unwrap());
    assert!(a.registry().get_instance(&uri("b")).is_none());
    assert!(b.registry().get_instance(&uri("a")).is_none());

    mesh.link(0, 1).await;
    assert!(a.registry().remove_instance(&uri("b")).await.unwrap());
    assert!(b.registry().get_instance(&uri("a")).is_none());
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_signed_delivery_between_registered_nodes() {
    let mesh = Mesh::new(&["a", "b"]).await;
    mesh.link(0, 1).await;
    let a = mesh.node(0);

    let message = update(a, "rev 1");
    let id = message.header.id.clone();
    let summary = a.send(message).unwrap();
    assert_eq!(summary.queued, vec![uri("b")]);

    eventually("delivery to b", || mesh.recorder(1).count() == 1).await;
    let seen = mesh.recorder(1).seen.lock().clone();
    assert_eq!(seen[0], (id.clone(), Bytes::from_static(b"rev 1")));
    eventually("sent mark", || {
        a.message_log().status(&id).unwrap() == Some(MessageStatus::Sent)
    })
    .await;
    eventually("handled mark", || {
        mesh.node(1).message_log().status(&id).unwrap() == Some(MessageStatus::Handled)
    })
    .await;
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_triangle_relay_is_deduplicated() {
    let mesh = Mesh::new(&["a", "b", "c"]).await;
    mesh.link(0, 1).await;
    mesh.link(1, 2).await;
    mesh.link(0, 2).await;

    mesh.node(0).send(update(mesh.node(0), "rev 1")).unwrap();
    eventually("both peers handled", || {
        mesh.recorder(1).count() == 1 && mesh.recorder(2).count() == 1
    })
    .await;
    eventually("queues drained", || {
        mesh.nodes.iter().all(|(n, _)| n.sender().total_depth() == 0)
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(mesh.recorder(0).count(), 0);
    assert_eq!(mesh.recorder(1).count(), 1);
    assert_eq!(mesh.recorder(2).count(), 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_chain_relay_reaches_unlinked_node() {
    let mesh = Mesh::new(&["a", "b", "c"]).await;
    mesh.link(0, 1).await;
    mesh.link(1, 2).await;

    let message = update(mesh.node(0), "rev 1");
    let id = message.header.id.clone();
    mesh.node(0).send(message).unwrap();
    eventually("c handled", || mesh.recorder(2).count() == 1).await;

    let seen = mesh.recorder(2).seen.lock().clone();
    assert_eq!(seen[0].0, id);
    assert_eq!(mesh.recorder(1).count(), 1);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_retry_after_transient_failures() {
    let mesh = Mesh::new(&["a", "b"]).await;
    mesh.link(0, 1).await;
    let a = mesh.node(0);
    let mut reports = a.sender().subscribe();

    mesh.network.fail_next(&uri("b"), 2);
    a.send(update(a, "rev 1")).unwrap();

    let report = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.target, uri("b"));
    assert_eq!(report.attempts, 3);
    let stats = a.sender().stats(&uri("b")).unwrap();
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.delivered, 1);
    eventually("b handled", || mesh.recorder(1).count() == 1).await;
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_removing_instance_purges_its_queue() {
    let mesh = Mesh::new(&["a", "b"]).await;
    mesh.link(0, 1).await;
    let a = mesh.node(0);

    mesh.network.set_down(&uri("b"), true);
    a.send(update(a, "rev 1")).unwrap();
    a.send(update(a, "rev 2")).unwrap();
    eventually("a retry", || {
        a.sender().stats(&uri("b")).is_some_and(|s| s.retried > 0)
    })
    .await;
    assert_eq!(a.sender().stats(&uri("b")).unwrap().enqueued, 2);

    assert!(a.registry().remove_instance(&uri("b")).await.unwrap());
    assert_eq!(a.sender().depth(&uri("b")), 0);
    mesh.network.set_down(&uri("b"), false);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mesh.recorder(1).count(), 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_ask_collects_every_answer() {
    let mesh = Mesh::new(&["a", "b", "c"]).await;
    mesh.link(0, 1).await;
    mesh.link(0, 2).await;
    let a = mesh.node(0);

    let question = Message::new(a.new_header("ping"), Bytes::from_static(b"hello"));
    let mut answers = a
        .ask_timeout(question, None, Duration::from_secs(5))
        .await
        .unwrap();
    answers.sort_by(|x, y| x.source.cmp(&y.source));
    assert_eq!(answers.len(), 2);
    assert_eq!(answers[0].source, uri("b"));
    assert_eq!(answers[1].source, uri("c"));
    assert!(answers[0].body.starts_with(b"hello from "));
    assert_eq!(a.correlator().pending(), 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_ask_times_out_when_peer_is_down() {
    let mesh = Mesh::new(&["a", "b"]).await;
    mesh.link(0, 1).await;
    let a = mesh.node(0);
    mesh.network.set_down(&uri("b"), true);

    let question = Message::new(a.new_header("ping"), Bytes::from_static(b"hello"));
    let err = a
        .ask_timeout(question, None, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, ReplError::Timeout { ms: 100 }));
    assert_eq!(a.correlator().pending(), 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_topology_push_and_publish() {
    let mesh = Mesh::new(&["a", "b", "c"]).await;
    mesh.link(0, 1).await;
    mesh.link(0, 2).await;
    let (a, b) = (mesh.node(0), mesh.node(1));
    let wiki = EntityRef::wiki("main");

    let rules = ReplicationConfig::all(InstanceRule::new(ReplicationLevel::None, Direction::Both))
        .with_rule(
            Some(&uri("b")),
            InstanceRule::new(ReplicationLevel::Full, Direction::SendOnly),
        );
    a.topology().set_configuration(&wiki, Some(rules)).unwrap();
    a.push_topology(&wiki).unwrap();
    eventually("b stored topology", || {
        b.topology().configuration(&wiki).unwrap().is_some()
    })
    .await;
    assert!(b.topology().accepts_from(&wiki, &uri("a")).unwrap());

    let document = EntityRef::document("main", ["Sandbox"], "WebHome");
    let summary = a
        .publish(update(a, "edit"), &document, ReplicationLevel::Reference)
        .unwrap();
    assert_eq!(summary.queued, vec![uri("b")]);
    eventually("b got the edit", || mesh.recorder(1).count() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(mesh.recorder(2).count(), 0);
    mesh.shutdown().await;
}

#[tokio::test]
async fn test_topology_refuses_unwanted_changes() {
    let mesh = Mesh::new(&["a", "b"]).await;
    mesh.link(0, 1).await;
    let (a, b) = (mesh.node(0), mesh.node(1));
    let wiki = EntityRef::wiki("private");

    b.topology()
        .set_configuration(
            &wiki,
            Some(ReplicationConfig::all(InstanceRule::new(
                ReplicationLevel::Full,
                Direction::SendOnly,
            ))),
        )
        .unwrap();
    let message = update(a, "edit");
    let id = message.header.id.clone();
    a.publish(message, &wiki, ReplicationLevel::Full).unwrap();
    eventually("delivered", || {
        a.message_log().status(&id).unwrap() == Some(MessageStatus::Sent)
    })
    .await;
    assert_eq!(mesh.recorder(1).count(), 0);
    assert!(b.message_log().status(&id).unwrap().is_none());
    mesh.shutdown().await;
}
