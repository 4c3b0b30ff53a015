//! Peer instances and the registration handshake payloads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Registration status of a peer, as seen locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Both sides agreed; messages flow.
    Registered,
    /// We asked them and wait for their confirmation.
    Requested,
    /// They asked us and wait for our decision.
    Requesting,
}

/// A peer node participating in replication, identified by its base uri.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Opaque alias, accepted by lookups.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Base uri; the stable identity.
    pub uri: String,
    /// Local registration status.
    pub status: InstanceStatus,
    /// Shared link key used to sign and verify messages on this link.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_key: Option<String>,
    /// Free-form properties.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Instance {
    /// Create a new instance record.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        uri: impl Into<String>,
        status: InstanceStatus,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            uri: uri.into(),
            status,
            receive_key: None,
            properties: BTreeMap::new(),
        }
    }

    /// Same record with a different status.
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = status;
        self
    }

    /// Returns true when the peer is fully registered.
    pub fn is_registered(&self) -> bool {
        self.status == InstanceStatus::Registered
    }

    /// True if `id_or_uri` names this instance.
    pub fn matches(&self, id_or_uri: &str) -> bool {
        self.uri == id_or_uri || self.id == id_or_uri
    }
}

/// Identity of the local node, as presented to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalInstance {
    /// Local opaque id.
    pub id: String,
    /// Local display name.
    pub name: String,
    /// Local base uri.
    pub uri: String,
}

impl LocalInstance {
    /// Create a local identity.
    pub fn new(id: impl Into<String>, name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            uri: uri.into(),
        }
    }

    /// Registration request carrying this identity.
    pub fn registration(&self, key: Option<String>) -> RegistrationRequest {
        RegistrationRequest {
            id: self.id.clone(),
            name: self.name.clone(),
            uri: self.uri.clone(),
            key,
        }
    }
}

/// Parameters of `instance/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationRequest {
    /// Caller id.
    pub id: String,
    /// Caller name.
    pub name: String,
    /// Caller base uri.
    pub uri: String,
    /// Link key proposed by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Outcome of handling an inbound `instance/register`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// New `Requesting` row created; waits for a local decision.
    Created,
    /// The caller was already known with the same identity; nothing changed.
    AlreadyKnown,
    /// We had requested the caller; its request completes the handshake.
    Confirmed,
    /// A row exists for that uri with a different id or name.
    Conflict,
}

/// Body answered by `instance/register`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The answering node's identity.
    pub instance: LocalInstance,
    /// What happened on the answering side.
    pub outcome: RegisterOutcome,
    /// Status the answering side now records for the caller.
    pub status: Option<InstanceStatus>,
    /// Link key the answering side now holds for the caller, when it settled
    /// one. The caller adopts it so both ends sign with the same key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_id_or_uri() {
        let inst = Instance::new("id-1", "alpha", "http://alpha", InstanceStatus::Registered);
        assert!(inst.matches("id-1"));
        assert!(inst.matches("http://alpha"));
        assert!(!inst.matches("http://ALPHA"));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&InstanceStatus::Requesting).unwrap();
        assert_eq!(json, "\"requesting\"");
    }

    #[test]
    fn test_instance_json_skips_empty_fields() {
        let inst = Instance::new("i", "n", "u", InstanceStatus::Requested);
        let json = serde_json::to_string(&inst).unwrap();
        assert!(!json.contains("receive_key"));
        assert!(!json.contains("properties"));
        let back: Instance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, inst);
    }
}
