//! In-process network connecting nodes without HTTP.
//!
//! Used by tests and embedded fleets. Calls go straight to the target node's
//! inbound entry points; errors come back mapped through the same status
//! codes the HTTP surface uses, so retry behavior matches. Links can be taken
//! down or made to fail a number of times.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{ReplError, Result};
use crate::instance::{Instance, LocalInstance, RegisterResponse, RegistrationRequest};
use crate::message::OutboundMessage;
use crate::node::{NodeBuilder, ReplicationNode};
use crate::receiver::InboundMessage;
use crate::transport::{status_error, PeerClient};

#[derive(Debug, Default, Clone, Copy)]
struct Fault {
    down: bool,
    fail_next: usize,
}

/// Registry of in-process nodes by uri.
#[derive(Default)]
pub struct LoopbackNetwork {
    nodes: RwLock<HashMap<String, Weak<ReplicationNode>>>,
    faults: Mutex<HashMap<String, Fault>>,
    delivered: AtomicU64,
}

impl LoopbackNetwork {
    /// Empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Client presenting `local` to the other nodes.
    pub fn client(self: &Arc<Self>, local: LocalInstance) -> Arc<LoopbackClient> {
        Arc::new(LoopbackClient {
            network: self.clone(),
            local,
        })
    }

    /// Build a node wired to this network and attach it.
    pub fn join(self: &Arc<Self>, builder: NodeBuilder) -> Result<Arc<ReplicationNode>> {
        let network = self.clone();
        let node = builder
            .client_factory(move |local| {
                let client: Arc<dyn PeerClient> = network.client(local.clone());
                Ok(client)
            })
            .build()?;
        self.attach(&node);
        Ok(node)
    }

    /// Make `node` reachable at its uri.
    pub fn attach(&self, node: &Arc<ReplicationNode>) {
        self.nodes
            .write()
            .insert(node.local().uri.clone(), Arc::downgrade(node));
    }

    /// Remove the node at `uri`. Returns true if it was attached.
    pub fn detach(&self, uri: &str) -> bool {
        self.nodes.write().remove(uri).is_some()
    }

    /// Take the link to `uri` down or bring it back.
    pub fn set_down(&self, uri: &str, down: bool) {
        self.faults.lock().entry(uri.to_string()).or_default().down = down;
    }

    /// Fail the next `count` calls to `uri` with a network error.
    pub fn fail_next(&self, uri: &str, count: usize) {
        self.faults.lock().entry(uri.to_string()).or_default().fail_next = count;
    }

    /// Messages accepted by a target so far.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    fn route(&self, uri: &str) -> Result<Arc<ReplicationNode>> {
        {
            let mut faults = self.faults.lock();
            if let Some(fault) = faults.get_mut(uri) {
                if fault.down {
                    return Err(ReplError::network(format!("{} unreachable", uri)));
                }
                if fault.fail_next > 0 {
                    fault.fail_next -= 1;
                    return Err(ReplError::network(format!("{}: injected failure", uri)));
                }
            }
        }
        self.nodes
            .read()
            .get(uri)
            .and_then(Weak::upgrade)
            .ok_or_else(|| ReplError::network(format!("no route to {}", uri)))
    }
}

/// [`PeerClient`] over a [`LoopbackNetwork`].
pub struct LoopbackClient {
    network: Arc<LoopbackNetwork>,
    local: LocalInstance,
}

fn as_remote(uri: &str, e: ReplError) -> ReplError {
    status_error(uri, e.http_status())
}

#[async_trait]
impl PeerClient for LoopbackClient {
    async fn send_message(
        &self,
        target: &Instance,
        message: &OutboundMessage,
        signature: Option<&str>,
    ) -> Result<()> {
        let node = self.network.route(&target.uri)?;
        let inbound = InboundMessage {
            header: message.header.clone(),
            instance: self.local.id.clone(),
            body: message.body.clone(),
            signature: signature.map(str::to_string),
        };
        let outcome = node
            .receive(inbound)
            .await
            .map_err(|e| as_remote(&target.uri, e))?;
        self.network.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(from = %self.local.uri, to = %target.uri, id = %message.id(), ?outcome, "loopback delivery");
        Ok(())
    }

    async fn register(
        &self,
        target_uri: &str,
        request: &RegistrationRequest,
    ) -> Result<RegisterResponse> {
        let node = self.network.route(target_uri)?;
        node.handle_register(request)
            .map_err(|e| as_remote(target_uri, e))
    }

    async fn unregister(&self, target_uri: &str, local_id: &str) -> Result<bool> {
        let node = self.network.route(target_uri)?;
        node.handle_unregister(local_id)
            .map_err(|e| as_remote(target_uri, e))
    }
}
