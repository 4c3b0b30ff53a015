//! Receive path: authenticate the immediate hop, dedup on the message log,
//! dispatch by message type and relay onwards.
//!
//! Receivers are registered per type into a [`Dispatch`] table once at
//! startup. Immediate receivers run inside the inbound request; queued
//! receivers run on worker tasks fed by a bounded channel.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::answer::AnswerCorrelator;
use crate::error::{ReplError, Result};
use crate::instance::LocalInstance;
use crate::message::{Message, MessageHeader, OutboundMessage};
use crate::message_log::{MessageLog, MessageStatus};
use crate::registry::InstanceRegistry;
use crate::relay::{RelayEngine, ENTITY_KEY};
use crate::signing::MessageSigner;
use crate::topology::{EntityRef, ReplicationConfig, TopologyResolver};

/// Message type of topology configuration pushes.
pub const TOPOLOGY_TYPE: &str = "topology";

/// Where a receiver runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveMode {
    /// On a worker task, after the sender got its acknowledgement.
    Queued,
    /// Inline, before acknowledging.
    Immediate,
}

/// What to do with a message after handling it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayDecision {
    /// Stop here.
    None,
    /// Relay to every eligible registered instance.
    All,
    /// Relay to these instances only.
    Targets(Vec<String>),
}

/// Handler for one message type.
#[async_trait]
pub trait MessageReceiver: Send + Sync + 'static {
    /// Process a message. The payload may be read once.
    async fn handle(&self, message: Message) -> Result<RelayDecision>;

    /// Where this receiver runs.
    fn mode(&self) -> ReceiveMode {
        ReceiveMode::Queued
    }
}

/// Immutable type -> receiver table.
#[derive(Default, Clone)]
pub struct Dispatch {
    receivers: HashMap<String, Arc<dyn MessageReceiver>>,
}

impl Dispatch {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: handle `kind` with `receiver`. A later entry for the same
    /// type replaces the earlier one.
    pub fn with(mut self, kind: impl Into<String>, receiver: Arc<dyn MessageReceiver>) -> Self {
        self.receivers.insert(kind.into(), receiver);
        self
    }

    /// Receiver for `kind`.
    pub fn get(&self, kind: &str) -> Option<&Arc<dyn MessageReceiver>> {
        self.receivers.get(kind)
    }

    /// Registered types, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.receivers.keys().cloned().collect();
        kinds.sort();
        kinds
    }
}

/// Feeds answers to the correlator.
pub struct AnswerReceiver {
    correlator: Arc<AnswerCorrelator>,
}

impl AnswerReceiver {
    /// Receiver for `correlator`.
    pub fn new(correlator: Arc<AnswerCorrelator>) -> Self {
        Self { correlator }
    }
}

#[async_trait]
impl MessageReceiver for AnswerReceiver {
    async fn handle(&self, message: Message) -> Result<RelayDecision> {
        self.correlator.on_receive(message)?;
        Ok(RelayDecision::None)
    }

    fn mode(&self) -> ReceiveMode {
        ReceiveMode::Immediate
    }
}

/// Applies a peer's replication configuration for an entity.
pub struct TopologyReceiver {
    local_uri: String,
    topology: Arc<TopologyResolver>,
}

impl TopologyReceiver {
    /// Receiver storing into `topology`.
    pub fn new(local_uri: impl Into<String>, topology: Arc<TopologyResolver>) -> Self {
        Self {
            local_uri: local_uri.into(),
            topology,
        }
    }
}

#[async_trait]
impl MessageReceiver for TopologyReceiver {
    async fn handle(&self, mut message: Message) -> Result<RelayDecision> {
        let entity: EntityRef = message
            .header
            .metadata
            .first(ENTITY_KEY)
            .ok_or_else(|| ReplError::invalid("topology message without entity"))?
            .parse()?;
        let remote: ReplicationConfig = serde_json::from_slice(&message.payload.take()?)?;
        let merged = ReplicationConfig::merge_remote(&remote, &self.local_uri, &message.header.source);
        self.topology.set_configuration(&entity, Some(merged))?;
        info!(entity = %entity, source = %message.header.source, "applied remote topology");
        Ok(RelayDecision::None)
    }
}

/// Function answering a question: header and body in, answer body out.
pub type AnswerFn = dyn Fn(&MessageHeader, Bytes) -> Result<Bytes> + Send + Sync;

/// Answers questions of one type through the correlator.
pub struct Responder {
    correlator: Arc<AnswerCorrelator>,
    respond: Arc<AnswerFn>,
}

impl Responder {
    /// Responder calling `respond` for each question.
    pub fn new(correlator: Arc<AnswerCorrelator>, respond: Arc<AnswerFn>) -> Self {
        Self { correlator, respond }
    }
}

#[async_trait]
impl MessageReceiver for Responder {
    async fn handle(&self, mut message: Message) -> Result<RelayDecision> {
        let body = message.payload.take()?;
        let reply = (self.respond)(&message.header, body)?;
        self.correlator.answer_to(&message.header, reply)?;
        Ok(RelayDecision::None)
    }
}

/// A message as it arrives from the network.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Header fields.
    pub header: MessageHeader,
    /// Id or uri of the instance that sent it to us.
    pub instance: String,
    /// Body.
    pub body: Bytes,
    /// Signature presented by the sender.
    pub signature: Option<String>,
}

/// What happened to an accepted inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Queued for a worker.
    Queued,
    /// Handled inline.
    Handled,
    /// Already seen; nothing done.
    Duplicate,
    /// Not addressed to us; relayed onwards only.
    Forwarded,
    /// Refused by the topology for this entity and instance.
    Ignored,
}

struct Pipeline {
    local: LocalInstance,
    registry: Arc<InstanceRegistry>,
    log: Arc<MessageLog>,
    signer: Arc<dyn MessageSigner>,
    topology: Arc<TopologyResolver>,
    relay: Arc<RelayEngine>,
    dispatch: Dispatch,
}

impl Pipeline {
    fn apply(&self, message: &OutboundMessage, decision: RelayDecision) {
        let result = match decision {
            RelayDecision::None => return,
            RelayDecision::All => self.relay.relay(message),
            RelayDecision::Targets(targets) => self.relay.relay_to(message, &targets),
        };
        if let Err(e) = result {
            warn!(id = %message.id(), error = %e, "relay after handling failed");
        }
    }

    fn finish(&self, message: &OutboundMessage, decision: RelayDecision) {
        if let Err(e) = self.log.mark(message.id(), MessageStatus::Handled) {
            warn!(id = %message.id(), error = %e, "failed to mark message handled");
        }
        self.apply(message, decision);
    }

    async fn work(&self, message: OutboundMessage) {
        let Some(receiver) = self.dispatch.get(&message.header.kind) else {
            return;
        };
        match receiver.handle(message.to_message()).await {
            Ok(decision) => self.finish(&message, decision),
            Err(e) => warn!(id = %message.id(), kind = %message.header.kind, error = %e, "queued receiver failed"),
        }
    }
}

/// Inbound side of a node.
pub struct ReceivePipeline {
    inner: Arc<Pipeline>,
    tx: mpsc::Sender<OutboundMessage>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<OutboundMessage>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl ReceivePipeline {
    /// Pipeline with a processing queue of `capacity` entries.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: LocalInstance,
        registry: Arc<InstanceRegistry>,
        log: Arc<MessageLog>,
        signer: Arc<dyn MessageSigner>,
        topology: Arc<TopologyResolver>,
        relay: Arc<RelayEngine>,
        dispatch: Dispatch,
        capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Pipeline {
                local,
                registry,
                log,
                signer,
                topology,
                relay,
                dispatch,
            }),
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            tasks: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    /// Spawn `workers` tasks draining the processing queue.
    pub fn start(&self, workers: usize) {
        let mut tasks = self.tasks.lock();
        for worker in 0..workers.max(1) {
            let inner = self.inner.clone();
            let rx = self.rx.clone();
            let mut shutdown = self.shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        next = async { rx.lock().await.recv().await } => next,
                        _ = shutdown.changed() => None,
                    };
                    match next {
                        Some(message) => inner.work(message).await,
                        None => break,
                    }
                }
                debug!(worker, "receive worker stopped");
            }));
        }
        info!(workers = tasks.len(), "receive workers started");
    }

    /// Stop the workers. Queued messages stay logged as received.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "receive worker ended abnormally");
            }
        }
    }

    /// Accept one inbound message.
    pub async fn receive(&self, inbound: InboundMessage) -> Result<ReceiveOutcome> {
        let inner = &self.inner;
        let hop = inner
            .registry
            .get_instance(&inbound.instance)
            .filter(|i| i.is_registered())
            .ok_or_else(|| ReplError::UnknownInstance {
                instance: inbound.instance.clone(),
            })?;
        let message = OutboundMessage {
            header: inbound.header,
            instance: Some(hop.uri.clone()),
            body: inbound.body,
        };
        inner
            .signer
            .verify(hop.receive_key.as_deref(), &message, inbound.signature.as_deref())?;

        let kind = message.header.kind.clone();
        let receiver = inner
            .dispatch
            .get(&kind)
            .cloned()
            .ok_or_else(|| ReplError::invalid(format!("no receiver for message type '{}'", kind)))?;

        if kind != TOPOLOGY_TYPE {
            if let Some(entity) = message.header.metadata.first(ENTITY_KEY) {
                let entity: EntityRef = entity.parse()?;
                if !inner.topology.accepts_from(&entity, &hop.uri)? {
                    debug!(id = %message.id(), entity = %entity, from = %hop.uri, "topology refuses message");
                    return Ok(ReceiveOutcome::Ignored);
                }
            }
        }

        if !inner.log.save_if_absent(&message.header, MessageStatus::Received)? {
            debug!(id = %message.id(), from = %hop.uri, "duplicate message");
            return Ok(ReceiveOutcome::Duplicate);
        }

        if !message.header.is_addressed_to(&inner.local.uri) {
            inner.apply(&message, RelayDecision::All);
            return Ok(ReceiveOutcome::Forwarded);
        }

        match receiver.mode() {
            ReceiveMode::Immediate => match receiver.handle(message.to_message()).await {
                Ok(decision) => {
                    inner.finish(&message, decision);
                    Ok(ReceiveOutcome::Handled)
                }
                Err(e) => {
                    inner.log.delete(message.id())?;
                    Err(e)
                }
            },
            ReceiveMode::Queued => {
                let id = message.id().to_string();
                match self.tx.try_send(message) {
                    Ok(()) => Ok(ReceiveOutcome::Queued),
                    Err(err) => {
                        inner.log.delete(&id)?;
                        match err {
                            mpsc::error::TrySendError::Full(_) => {
                                warn!(id = %id, "receive queue full");
                                Err(ReplError::QueueFull)
                            }
                            mpsc::error::TrySendError::Closed(_) => Err(ReplError::Shutdown),
                        }
                    }
                }
            }
        }
    }

    /// Messages waiting for a worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}
