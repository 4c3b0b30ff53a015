//! Instance registry: the registration state machine over the durable
//! instance table, with an in-memory index for lookups.
//!
//! ```text
//! (none) --request_instance--> Requested --confirm--> Registered
//! (none) --peer requests-----> Requesting --accept--> Registered
//! Requested  --cancel / peer declines--> (none)
//! Requesting --decline-----------------> (none)
//! Registered --remove / peer unregisters--> (none)
//! ```
//!
//! The index is rebuilt copy-on-write and swapped under a write lock, so
//! readers always see a complete snapshot. Transitions that call the peer
//! first claim the uri; a second caller racing on the same uri gets `false`.
//! No lock is held across a remote call.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::instance::{
    Instance, InstanceStatus, LocalInstance, RegisterOutcome, RegisterResponse,
    RegistrationRequest,
};
use crate::signing::generate_link_key;
use crate::store::{MemoryTable, Table};
use crate::transport::PeerClient;

/// Observer of registry changes.
pub trait RegistryListener: Send + Sync {
    /// Called after an instance row was deleted.
    fn instance_removed(&self, instance: &Instance);
}

#[derive(Debug, Clone, Default)]
struct InstanceIndex {
    by_uri: HashMap<String, Instance>,
    uri_by_id: HashMap<String, String>,
}

impl InstanceIndex {
    fn build(rows: Vec<Instance>) -> Self {
        let mut index = Self::default();
        for row in rows {
            index.insert(row);
        }
        index
    }

    fn insert(&mut self, instance: Instance) {
        if let Some(old) = self.by_uri.get(&instance.uri) {
            if old.id != instance.id {
                self.uri_by_id.remove(&old.id);
            }
        }
        self.uri_by_id.insert(instance.id.clone(), instance.uri.clone());
        self.by_uri.insert(instance.uri.clone(), instance);
    }

    fn remove(&mut self, uri: &str) -> Option<Instance> {
        let removed = self.by_uri.remove(uri)?;
        if self.uri_by_id.get(&removed.id).map(String::as_str) == Some(uri) {
            self.uri_by_id.remove(&removed.id);
        }
        Some(removed)
    }

    fn get(&self, id_or_uri: &str) -> Option<&Instance> {
        self.by_uri.get(id_or_uri).or_else(|| {
            self.uri_by_id
                .get(id_or_uri)
                .and_then(|uri| self.by_uri.get(uri))
        })
    }
}

/// Releases a per-uri claim on drop.
struct Claim<'a> {
    claims: &'a Mutex<HashSet<String>>,
    uri: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.claims.lock().remove(&self.uri);
    }
}

/// Registry of peer instances.
pub struct InstanceRegistry {
    local: LocalInstance,
    table: Arc<dyn Table<Instance>>,
    index: RwLock<Arc<InstanceIndex>>,
    write: Mutex<()>,
    claims: Mutex<HashSet<String>>,
    client: Arc<dyn PeerClient>,
    listeners: RwLock<Vec<Arc<dyn RegistryListener>>>,
}

impl InstanceRegistry {
    /// Registry over `table`, loading the index from it.
    pub fn new(
        local: LocalInstance,
        table: Arc<dyn Table<Instance>>,
        client: Arc<dyn PeerClient>,
    ) -> Result<Self> {
        let index = InstanceIndex::build(table.values()?);
        Ok(Self {
            local,
            table,
            index: RwLock::new(Arc::new(index)),
            write: Mutex::new(()),
            claims: Mutex::new(HashSet::new()),
            client,
            listeners: RwLock::new(Vec::new()),
        })
    }

    /// Registry over an in-memory table.
    pub fn in_memory(local: LocalInstance, client: Arc<dyn PeerClient>) -> Self {
        Self {
            local,
            table: Arc::new(MemoryTable::new()),
            index: RwLock::new(Arc::new(InstanceIndex::default())),
            write: Mutex::new(()),
            claims: Mutex::new(HashSet::new()),
            client,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The local node's identity.
    pub fn local(&self) -> &LocalInstance {
        &self.local
    }

    /// Subscribe to removals.
    pub fn add_listener(&self, listener: Arc<dyn RegistryListener>) {
        self.listeners.write().push(listener);
    }

    fn snapshot(&self) -> Arc<InstanceIndex> {
        self.index.read().clone()
    }

    /// Lookup by uri or by local id.
    pub fn get_instance(&self, id_or_uri: &str) -> Option<Instance> {
        self.snapshot().get(id_or_uri).cloned()
    }

    /// Lookup by exact uri.
    pub fn get_instance_by_uri(&self, uri: &str) -> Option<Instance> {
        self.snapshot().by_uri.get(uri).cloned()
    }

    /// All rows, sorted by uri.
    pub fn instances(&self) -> Vec<Instance> {
        let mut all: Vec<_> = self.snapshot().by_uri.values().cloned().collect();
        all.sort_by(|a, b| a.uri.cmp(&b.uri));
        all
    }

    fn with_status(&self, status: InstanceStatus) -> Vec<Instance> {
        self.instances()
            .into_iter()
            .filter(|i| i.status == status)
            .collect()
    }

    /// Rows with status `Registered`.
    pub fn registered_instances(&self) -> Vec<Instance> {
        self.with_status(InstanceStatus::Registered)
    }

    /// Rows with status `Requesting` (waiting for our decision).
    pub fn requesting_instances(&self) -> Vec<Instance> {
        self.with_status(InstanceStatus::Requesting)
    }

    /// Rows with status `Requested` (waiting for the peer).
    pub fn requested_instances(&self) -> Vec<Instance> {
        self.with_status(InstanceStatus::Requested)
    }

    /// Rebuild the index from the durable table and swap it in.
    pub fn reload(&self) -> Result<()> {
        let _write = self.write.lock();
        let index = InstanceIndex::build(self.table.values()?);
        let count = index.by_uri.len();
        *self.index.write() = Arc::new(index);
        debug!(instances = count, "instance index reloaded");
        Ok(())
    }

    fn claim(&self, uri: &str) -> Option<Claim<'_>> {
        let mut claims = self.claims.lock();
        if !claims.insert(uri.to_string()) {
            debug!(uri, "transition already in progress");
            return None;
        }
        Some(Claim {
            claims: &self.claims,
            uri: uri.to_string(),
        })
    }

    /// Write `instance` to the table and index. Caller holds `self.write`.
    fn store_locked(&self, instance: Instance) -> Result<()> {
        self.table.put(&instance.uri, instance.clone())?;
        let mut guard = self.index.write();
        let mut next = (**guard).clone();
        next.insert(instance);
        *guard = Arc::new(next);
        Ok(())
    }

    /// Delete the row for `uri`. Caller holds `self.write`.
    fn delete_locked(&self, uri: &str) -> Result<Option<Instance>> {
        self.table.delete(uri)?;
        let mut guard = self.index.write();
        if !guard.by_uri.contains_key(uri) {
            return Ok(None);
        }
        let mut next = (**guard).clone();
        let removed = next.remove(uri);
        *guard = Arc::new(next);
        Ok(removed)
    }

    /// Store `instance` only if the current status for its uri is `expected`.
    fn transition(&self, expected: Option<InstanceStatus>, instance: Instance) -> Result<bool> {
        let _write = self.write.lock();
        let current = self.snapshot().by_uri.get(&instance.uri).map(|i| i.status);
        if current != expected {
            return Ok(false);
        }
        self.store_locked(instance)?;
        Ok(true)
    }

    /// Delete the row for `uri` only if its status is `expected`.
    fn forget(&self, uri: &str, expected: Option<InstanceStatus>) -> Result<Option<Instance>> {
        let removed = {
            let _write = self.write.lock();
            let current = self.snapshot().by_uri.get(uri).map(|i| i.status);
            if expected.is_some() && current != expected {
                return Ok(None);
            }
            self.delete_locked(uri)?
        };
        if let Some(instance) = &removed {
            for listener in self.listeners.read().iter() {
                listener.instance_removed(instance);
            }
        }
        Ok(removed)
    }

    async fn notify_unregister(&self, uri: &str) {
        match self.client.unregister(uri, &self.local.id).await {
            Ok(true) => debug!(uri, "peer notified of unregistration"),
            Ok(false) => debug!(uri, "peer did not know us"),
            Err(e) => warn!(uri, error = %e, "failed to notify peer, local state kept"),
        }
    }

    /// Add a row directly. Fails (false) if a registered row exists for the uri.
    pub fn add_instance(&self, instance: Instance) -> Result<bool> {
        let _write = self.write.lock();
        if let Some(existing) = self.snapshot().by_uri.get(&instance.uri) {
            if existing.is_registered() {
                return Ok(false);
            }
        }
        info!(uri = %instance.uri, status = ?instance.status, "instance added");
        self.store_locked(instance)?;
        Ok(true)
    }

    /// Delete the row for `uri` and tell the peer, best effort.
    pub async fn remove_instance(&self, uri: &str) -> Result<bool> {
        let Some(_claim) = self.claim(uri) else {
            return Ok(false);
        };
        let Some(removed) = self.forget(uri, None)? else {
            return Ok(false);
        };
        info!(uri, status = ?removed.status, "instance removed");
        self.notify_unregister(uri).await;
        Ok(true)
    }

    /// Ask `uri` to register us; store it as `Requested` on success.
    pub async fn request_instance(&self, uri: &str) -> Result<bool> {
        if uri == self.local.uri {
            warn!(uri, "refusing to register with ourselves");
            return Ok(false);
        }
        let Some(_claim) = self.claim(uri) else {
            return Ok(false);
        };
        if self.get_instance_by_uri(uri).is_some() {
            return Ok(false);
        }

        let key = generate_link_key();
        let response = self
            .client
            .register(uri, &self.local.registration(Some(key.clone())))
            .await?;
        if response.outcome == RegisterOutcome::Conflict {
            warn!(uri, "peer reports a conflicting registration for us");
            return Ok(false);
        }

        let status = match response.status {
            Some(InstanceStatus::Registered) => InstanceStatus::Registered,
            _ => InstanceStatus::Requested,
        };
        let mut instance = peer_instance(uri, &response, status);
        instance.receive_key = response.key.clone().or(Some(key));

        let _write = self.write.lock();
        let status = match self.snapshot().by_uri.get(uri) {
            None => status,
            // The peer asked us while our own request was in flight. Both
            // sides hold both keys and settle on the same one.
            Some(existing) if existing.status == InstanceStatus::Requesting => {
                instance.receive_key =
                    agreed_key(instance.receive_key.take(), existing.receive_key.clone());
                InstanceStatus::Registered
            }
            Some(_) => return Ok(false),
        };
        info!(uri, ?status, "registration requested");
        self.store_locked(instance.with_status(status))?;
        Ok(true)
    }

    /// Accept a pending request from `uri` and confirm it to the peer.
    pub async fn accept_requesting_instance(&self, uri: &str) -> Result<bool> {
        let Some(_claim) = self.claim(uri) else {
            return Ok(false);
        };
        let Some(current) = self.get_instance_by_uri(uri) else {
            return Ok(false);
        };
        if current.status != InstanceStatus::Requesting {
            return Ok(false);
        }

        let response = self
            .client
            .register(uri, &self.local.registration(current.receive_key.clone()))
            .await?;
        let status = match (response.outcome, response.status) {
            (RegisterOutcome::Confirmed, _)
            | (RegisterOutcome::AlreadyKnown, Some(InstanceStatus::Registered)) => {
                InstanceStatus::Registered
            }
            // The peer had forgotten its request; our confirmation became a new request.
            (RegisterOutcome::Created, _) => InstanceStatus::Requested,
            _ => {
                warn!(uri, outcome = ?response.outcome, "peer did not confirm registration");
                return Ok(false);
            }
        };
        let mut accepted = peer_instance(uri, &response, status);
        accepted.receive_key = response.key.clone().or_else(|| current.receive_key.clone());
        accepted.properties = current.properties.clone();
        let stored = self.transition(Some(InstanceStatus::Requesting), accepted)?;
        if stored {
            info!(uri, ?status, "registration accepted");
        }
        Ok(stored && status == InstanceStatus::Registered)
    }

    /// Refuse a pending request from `uri`.
    pub async fn decline_requesting_instance(&self, uri: &str) -> Result<bool> {
        let Some(_claim) = self.claim(uri) else {
            return Ok(false);
        };
        if self.forget(uri, Some(InstanceStatus::Requesting))?.is_none() {
            return Ok(false);
        }
        info!(uri, "registration declined");
        self.notify_unregister(uri).await;
        Ok(true)
    }

    /// Peer confirmed our request: `Requested` becomes `Registered`.
    pub fn confirm_requested_instance(&self, instance: Instance) -> Result<bool> {
        let Some(current) = self.get_instance_by_uri(&instance.uri) else {
            return Ok(false);
        };
        let mut confirmed = instance.with_status(InstanceStatus::Registered);
        if confirmed.receive_key.is_none() {
            confirmed.receive_key = current.receive_key.clone();
        }
        let stored = self.transition(Some(InstanceStatus::Requested), confirmed)?;
        if stored {
            info!(uri = %current.uri, "registration confirmed by peer");
        }
        Ok(stored)
    }

    /// Withdraw our pending request to `uri`.
    pub async fn cancel_requested_instance(&self, uri: &str) -> Result<bool> {
        let Some(_claim) = self.claim(uri) else {
            return Ok(false);
        };
        if self.forget(uri, Some(InstanceStatus::Requested))?.is_none() {
            return Ok(false);
        }
        info!(uri, "registration request cancelled");
        self.notify_unregister(uri).await;
        Ok(true)
    }

    /// Inbound `instance/register`.
    pub fn handle_register(&self, request: &RegistrationRequest) -> Result<RegisterResponse> {
        let respond = |outcome, status| RegisterResponse {
            instance: self.local.clone(),
            outcome,
            status,
            key: None,
        };
        if request.uri == self.local.uri {
            return Ok(respond(RegisterOutcome::Conflict, None));
        }

        let current = self.get_instance_by_uri(&request.uri);
        match current {
            None => {
                let mut instance = Instance::new(
                    &request.id,
                    &request.name,
                    &request.uri,
                    InstanceStatus::Requesting,
                );
                instance.receive_key = request.key.clone();
                if !self.transition(None, instance)? {
                    return self.handle_register(request);
                }
                info!(uri = %request.uri, name = %request.name, "registration requested by peer");
                Ok(respond(RegisterOutcome::Created, Some(InstanceStatus::Requesting)))
            }
            Some(existing) if existing.id != request.id || existing.name != request.name => {
                warn!(
                    uri = %request.uri,
                    known_id = %existing.id,
                    known_name = %existing.name,
                    id = %request.id,
                    name = %request.name,
                    "registration conflicts with known instance"
                );
                Ok(respond(RegisterOutcome::Conflict, Some(existing.status)))
            }
            Some(existing) if existing.status == InstanceStatus::Requested => {
                let mut confirmed = existing.clone();
                confirmed.receive_key =
                    agreed_key(existing.receive_key.clone(), request.key.clone());
                let key = confirmed.receive_key.clone();
                if self.confirm_requested_instance(confirmed)? {
                    Ok(RegisterResponse {
                        key,
                        ..respond(RegisterOutcome::Confirmed, Some(InstanceStatus::Registered))
                    })
                } else {
                    self.handle_register(request)
                }
            }
            Some(existing) => Ok(respond(RegisterOutcome::AlreadyKnown, Some(existing.status))),
        }
    }

    /// Inbound `instance/unregister`. Returns false for an unknown id.
    pub fn handle_unregister(&self, id_or_uri: &str) -> Result<bool> {
        let Some(instance) = self.get_instance(id_or_uri) else {
            return Ok(false);
        };
        let Some(removed) = self.forget(&instance.uri, None)? else {
            return Ok(false);
        };
        info!(uri = %removed.uri, status = ?removed.status, "instance unregistered by peer");
        Ok(true)
    }
}

/// Link key both ends pick when each offered one: the smaller of the two.
fn agreed_key(ours: Option<String>, theirs: Option<String>) -> Option<String> {
    match (ours, theirs) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn peer_instance(requested_uri: &str, response: &RegisterResponse, status: InstanceStatus) -> Instance {
    let peer = &response.instance;
    if peer.uri != requested_uri {
        debug!(requested_uri, reported = %peer.uri, "peer reports a different uri, keeping ours");
    }
    Instance::new(&peer.id, &peer.name, requested_uri, status)
}
