//! Relay engine: decides which registered instances get a copy of a message
//! and hands one copy per target to the sender queues.
//!
//! Copies keep the id, type, source, date, metadata and body of the original,
//! so every hop dedups on the same id.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::Result;
use crate::instance::{Instance, LocalInstance};
use crate::message::{Message, MessageHeader, OutboundMessage};
use crate::message_log::{MessageLog, MessageStatus};
use crate::registry::InstanceRegistry;
use crate::sender::SenderQueues;
use crate::topology::{EntityRef, ReplicationLevel, TopologyResolver};

/// Metadata key carrying the entity a message is about.
pub const ENTITY_KEY: &str = "entity";

/// Outcome of relaying one message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelaySummary {
    /// Message id.
    pub message_id: String,
    /// Targets a copy was queued for.
    pub queued: Vec<String>,
    /// Targets that could not be queued, with the reason.
    pub failed: Vec<(String, String)>,
}

impl RelaySummary {
    /// Returns true if every target got a copy.
    pub fn all_queued(&self) -> bool {
        self.failed.is_empty()
    }

    /// Number of targets attempted.
    pub fn total(&self) -> usize {
        self.queued.len() + self.failed.len()
    }
}

/// Registered instances that should get a copy of `header`.
///
/// Excludes the origin, the instance that handed us the message and the local
/// node. When the message names receivers, only those are kept.
pub fn relay_targets(
    registered: &[Instance],
    header: &MessageHeader,
    last_hop: Option<&str>,
    local_uri: &str,
) -> Vec<String> {
    registered
        .iter()
        .filter(|i| i.is_registered())
        .filter(|i| i.uri != header.source && i.uri != local_uri)
        .filter(|i| last_hop.map_or(true, |hop| !i.matches(hop)))
        .filter(|i| header.receivers.is_empty() || header.receivers.contains(&i.uri))
        .map(|i| i.uri.clone())
        .collect()
}

/// Relays messages through the sender queues.
pub struct RelayEngine {
    local: LocalInstance,
    registry: Arc<InstanceRegistry>,
    log: Arc<MessageLog>,
    sender: Arc<SenderQueues>,
    topology: Arc<TopologyResolver>,
}

impl RelayEngine {
    /// New relay engine.
    pub fn new(
        local: LocalInstance,
        registry: Arc<InstanceRegistry>,
        log: Arc<MessageLog>,
        sender: Arc<SenderQueues>,
        topology: Arc<TopologyResolver>,
    ) -> Self {
        Self {
            local,
            registry,
            log,
            sender,
            topology,
        }
    }

    /// Targets [`RelayEngine::relay`] would use for `message`.
    pub fn targets_for(&self, message: &OutboundMessage) -> Vec<String> {
        relay_targets(
            &self.registry.registered_instances(),
            &message.header,
            message.instance.as_deref(),
            &self.local.uri,
        )
    }

    /// Send to every eligible registered instance.
    pub fn relay(&self, message: &OutboundMessage) -> Result<RelaySummary> {
        let targets = self.targets_for(message);
        self.relay_to(message, &targets)
    }

    /// Send to an explicit, caller-filtered list of targets.
    pub fn relay_to(&self, message: &OutboundMessage, targets: &[String]) -> Result<RelaySummary> {
        self.log.save_if_absent(&message.header, MessageStatus::Stored)?;
        let mut summary = RelaySummary {
            message_id: message.id().to_string(),
            ..RelaySummary::default()
        };
        for target in targets {
            match self.sender.enqueue(message.clone(), target) {
                Ok(()) => summary.queued.push(target.clone()),
                Err(e) => {
                    warn!(id = %message.id(), target = %target, error = %e, "failed to queue relay copy");
                    summary.failed.push((target.clone(), e.to_string()));
                }
            }
        }
        debug!(
            id = %message.id(),
            kind = %message.header.kind,
            queued = summary.queued.len(),
            failed = summary.failed.len(),
            "message relayed"
        );
        Ok(summary)
    }

    /// Local-origin send of a change to `entity`, to the instances the
    /// topology replicates it to at `level` or above.
    ///
    /// The copies name their receivers, so downstream hops do not spread
    /// them beyond the selected instances.
    pub fn publish(
        &self,
        message: Message,
        entity: &EntityRef,
        level: ReplicationLevel,
    ) -> Result<RelaySummary> {
        let mut outbound = message.into_outbound()?;
        outbound.instance = None;
        outbound.header.metadata.set(ENTITY_KEY, entity.to_string());

        let candidates: Vec<String> = self
            .registry
            .registered_instances()
            .into_iter()
            .map(|i| i.uri)
            .filter(|uri| *uri != self.local.uri)
            .collect();
        let targets = self.topology.targets(entity, &candidates, level)?;
        if targets.is_empty() {
            debug!(id = %outbound.id(), entity = %entity, "no instance replicates this entity");
            self.log.save_if_absent(&outbound.header, MessageStatus::Stored)?;
            return Ok(RelaySummary {
                message_id: outbound.id().to_string(),
                ..RelaySummary::default()
            });
        }
        let outbound = outbound.relayed(targets.clone());
        self.relay_to(&outbound, &targets)
    }
}
