//! Replication node: builds and owns every component and exposes the
//! operations the rest of the application uses.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, warn};
use uuid::Uuid;

use crate::answer::{Answer, AnswerCorrelator, AnswerFuture, ANSWER_TYPE};
use crate::config::ReplConfig;
use crate::error::{ReplError, Result};
use crate::instance::{Instance, LocalInstance, RegisterResponse, RegistrationRequest};
use crate::message::{Message, MessageHeader};
use crate::message_log::{LoggedMessage, MessageLog};
use crate::receiver::{
    AnswerFn, AnswerReceiver, Dispatch, InboundMessage, MessageReceiver, ReceiveOutcome,
    ReceivePipeline, Responder, TopologyReceiver, TOPOLOGY_TYPE,
};
use crate::registry::InstanceRegistry;
use crate::relay::{RelayEngine, RelaySummary, ENTITY_KEY};
use crate::sender::SenderQueues;
use crate::signing::{HmacSigner, MessageSigner, NoopSigner};
use crate::store::{JournalTable, JsonFileTable, MemoryTable, Table};
use crate::topology::{EntityRef, ReplicationConfig, ReplicationLevel, TopologyResolver};
use crate::transport::{HttpPeerClient, PeerClient};

/// Durable tables of one node.
#[derive(Clone)]
pub struct Stores {
    /// Instance table keyed by uri.
    pub instances: Arc<dyn Table<Instance>>,
    /// Message log keyed by message id.
    pub messages: Arc<dyn Table<LoggedMessage>>,
    /// Topology configurations keyed by entity.
    pub topology: Arc<dyn Table<ReplicationConfig>>,
}

impl Stores {
    /// Everything in memory.
    pub fn in_memory() -> Self {
        Self {
            instances: Arc::new(MemoryTable::new()),
            messages: Arc::new(MemoryTable::new()),
            topology: Arc::new(MemoryTable::new()),
        }
    }

    /// Tables under `dir`. The message log, written for every message, is a
    /// journal; the others are JSON documents.
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            instances: Arc::new(JsonFileTable::open(dir.join("instances.json"))?),
            messages: Arc::new(JournalTable::open(dir.join("messages.journal"))?),
            topology: Arc::new(JsonFileTable::open(dir.join("topology.json"))?),
        })
    }
}

type ClientFactory = Box<dyn FnOnce(&LocalInstance) -> Result<Arc<dyn PeerClient>> + Send>;

/// Assembles a [`ReplicationNode`].
pub struct NodeBuilder {
    config: ReplConfig,
    client: Option<ClientFactory>,
    signer: Option<Arc<dyn MessageSigner>>,
    stores: Option<Stores>,
    dispatch: Dispatch,
    responders: Vec<(String, Arc<AnswerFn>)>,
}

impl NodeBuilder {
    /// Builder from configuration.
    pub fn new(config: ReplConfig) -> Self {
        Self {
            config,
            client: None,
            signer: None,
            stores: None,
            dispatch: Dispatch::new(),
            responders: Vec::new(),
        }
    }

    /// Use `client` instead of HTTP.
    pub fn client(self, client: Arc<dyn PeerClient>) -> Self {
        self.client_factory(move |_| Ok(client))
    }

    /// Build the peer client once the local identity is known.
    pub fn client_factory<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(&LocalInstance) -> Result<Arc<dyn PeerClient>> + Send + 'static,
    {
        self.client = Some(Box::new(factory));
        self
    }

    /// Override the signer chosen from the configuration.
    pub fn signer(mut self, signer: Arc<dyn MessageSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Use these tables instead of the configured ones.
    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    /// Handle messages of type `kind` with `receiver`.
    pub fn receiver(mut self, kind: impl Into<String>, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.dispatch = self.dispatch.with(kind, receiver);
        self
    }

    /// Answer questions of type `kind` with `respond`.
    pub fn responder<F>(mut self, kind: impl Into<String>, respond: F) -> Self
    where
        F: Fn(&MessageHeader, Bytes) -> Result<Bytes> + Send + Sync + 'static,
    {
        let respond: Arc<AnswerFn> = Arc::new(respond);
        self.responders.push((kind.into(), respond));
        self
    }

    /// Wire every component.
    pub fn build(self) -> Result<Arc<ReplicationNode>> {
        let config = self.config;
        config.validate()?;
        let local = config.local_instance()?;

        let stores = match (self.stores, &config.data_dir) {
            (Some(stores), _) => stores,
            (None, Some(dir)) => Stores::open(dir)?,
            (None, None) => Stores::in_memory(),
        };
        let client: Arc<dyn PeerClient> = match self.client {
            Some(factory) => factory(&local)?,
            None => Arc::new(HttpPeerClient::new(local.clone(), config.request_timeout())?),
        };
        let signer: Arc<dyn MessageSigner> = match self.signer {
            Some(signer) => signer,
            None if config.sign_messages => Arc::new(HmacSigner),
            None => Arc::new(NoopSigner),
        };

        let registry = Arc::new(InstanceRegistry::new(
            local.clone(),
            stores.instances,
            client.clone(),
        )?);
        let log = Arc::new(MessageLog::new(stores.messages));
        let sender = Arc::new(SenderQueues::new(
            registry.clone(),
            log.clone(),
            client,
            signer.clone(),
            config.retry.clone(),
        ));
        registry.add_listener(sender.clone());
        let topology = Arc::new(TopologyResolver::new(stores.topology, config.fallback_topology()));
        let relay = Arc::new(RelayEngine::new(
            local.clone(),
            registry.clone(),
            log.clone(),
            sender.clone(),
            topology.clone(),
        ));
        let correlator = Arc::new(AnswerCorrelator::new(local.clone(), registry.clone(), relay.clone()));

        let mut dispatch = self
            .dispatch
            .with(ANSWER_TYPE, Arc::new(AnswerReceiver::new(correlator.clone())))
            .with(
                TOPOLOGY_TYPE,
                Arc::new(TopologyReceiver::new(local.uri.clone(), topology.clone())),
            );
        for (kind, respond) in self.responders {
            dispatch = dispatch.with(kind, Arc::new(Responder::new(correlator.clone(), respond)));
        }
        info!(uri = %local.uri, id = %local.id, types = ?dispatch.kinds(), "replication node built");

        let pipeline = ReceivePipeline::new(
            local.clone(),
            registry.clone(),
            log.clone(),
            signer,
            topology.clone(),
            relay.clone(),
            dispatch,
            config.receive_queue_capacity,
        );

        Ok(Arc::new(ReplicationNode {
            config,
            local,
            registry,
            log,
            sender,
            topology,
            relay,
            correlator,
            pipeline,
            running: AtomicBool::new(false),
        }))
    }
}

/// One replication node.
pub struct ReplicationNode {
    config: ReplConfig,
    local: LocalInstance,
    registry: Arc<InstanceRegistry>,
    log: Arc<MessageLog>,
    sender: Arc<SenderQueues>,
    topology: Arc<TopologyResolver>,
    relay: Arc<RelayEngine>,
    correlator: Arc<AnswerCorrelator>,
    pipeline: ReceivePipeline,
    running: AtomicBool,
}

impl ReplicationNode {
    /// Builder from configuration.
    pub fn builder(config: ReplConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    /// Local identity.
    pub fn local(&self) -> &LocalInstance {
        &self.local
    }

    /// Configuration the node was built from.
    pub fn config(&self) -> &ReplConfig {
        &self.config
    }

    /// Instance registry.
    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    /// Message log.
    pub fn message_log(&self) -> &Arc<MessageLog> {
        &self.log
    }

    /// Sender queues.
    pub fn sender(&self) -> &Arc<SenderQueues> {
        &self.sender
    }

    /// Topology resolver.
    pub fn topology(&self) -> &Arc<TopologyResolver> {
        &self.topology
    }

    /// Answer correlator.
    pub fn correlator(&self) -> &Arc<AnswerCorrelator> {
        &self.correlator
    }

    /// Returns true between `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start receive workers and request the configured peers.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pipeline.start(self.config.receive_workers);
        for peer in &self.config.peers {
            if self.registry.get_instance_by_uri(peer).is_some() {
                continue;
            }
            match self.registry.request_instance(peer).await {
                Ok(true) => info!(peer = %peer, "registration requested at startup"),
                Ok(false) => warn!(peer = %peer, "peer did not accept registration request"),
                Err(e) => warn!(peer = %peer, error = %e, "registration request failed"),
            }
        }
        info!(uri = %self.local.uri, "replication node started");
    }

    /// Stop receive workers and sender queues.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.pipeline.shutdown().await;
        self.sender.shutdown().await;
        info!(uri = %self.local.uri, "replication node stopped");
    }

    /// Fresh header with a random id, originating here.
    pub fn new_header(&self, kind: impl Into<String>) -> MessageHeader {
        MessageHeader::new(Uuid::new_v4().to_string(), kind, self.local.uri.clone())
    }

    /// Broadcast a locally produced message to every registered instance.
    pub fn send(&self, message: Message) -> Result<RelaySummary> {
        let mut outbound = message.into_outbound()?;
        outbound.instance = None;
        self.relay.relay(&outbound)
    }

    /// Send a change of `entity` to the instances the topology selects.
    pub fn publish(&self, message: Message, entity: &EntityRef, level: ReplicationLevel) -> Result<RelaySummary> {
        self.relay.publish(message, entity, level)
    }

    /// Send our explicit configuration for `entity` to every registered
    /// instance.
    pub fn push_topology(&self, entity: &EntityRef) -> Result<RelaySummary> {
        let config = self.topology.configuration(entity)?.ok_or_else(|| ReplError::NotFound {
            what: format!("topology configuration for {}", entity),
        })?;
        let mut header = self.new_header(TOPOLOGY_TYPE);
        header.metadata.set(ENTITY_KEY, entity.to_string());
        let body = serde_json::to_vec(&config)?;
        self.send(Message::new(header, body))
    }

    /// Ask a question and wait for every answer.
    pub fn ask(&self, question: Message, receivers: Option<Vec<String>>) -> Result<AnswerFuture> {
        self.correlator.ask(question, receivers)
    }

    /// [`ReplicationNode::ask`] with a timeout.
    pub async fn ask_timeout(
        &self,
        question: Message,
        receivers: Option<Vec<String>>,
        timeout: Duration,
    ) -> Result<Vec<Answer>> {
        self.correlator.ask_timeout(question, receivers, timeout).await
    }

    /// Reply to a question.
    pub fn answer(&self, question: &MessageHeader, body: impl Into<Bytes>) -> Result<()> {
        self.correlator.answer_to(question, body)
    }

    /// Entry point of inbound messages.
    pub async fn receive(&self, inbound: InboundMessage) -> Result<ReceiveOutcome> {
        if !self.is_running() {
            return Err(ReplError::Shutdown);
        }
        self.pipeline.receive(inbound).await
    }

    /// Entry point of inbound registration requests.
    pub fn handle_register(&self, request: &RegistrationRequest) -> Result<RegisterResponse> {
        self.registry.handle_register(request)
    }

    /// Entry point of inbound unregistration requests.
    pub fn handle_unregister(&self, id_or_uri: &str) -> Result<bool> {
        self.registry.handle_unregister(id_or_uri)
    }
}
