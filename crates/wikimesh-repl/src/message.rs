//! Replication messages: header, case-insensitive metadata and payload.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ReplError, Result};

/// Multi-valued string map with case-insensitive keys.
///
/// Keys are folded to lowercase for lookup; the first spelling seen is kept
/// for display and transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    entries: BTreeMap<String, (String, Vec<String>)>,
}

impl Metadata {
    /// Empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value under `key`.
    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .entry(key.to_ascii_lowercase())
            .or_insert_with(|| (key.to_string(), Vec::new()))
            .1
            .push(value.into());
    }

    /// Replace all values under `key` with a single value.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.entries
            .insert(key.to_ascii_lowercase(), (key.to_string(), vec![value.into()]));
    }

    /// Builder-style [`Metadata::set`].
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// First value under `key`.
    pub fn first(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .and_then(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// All values under `key`.
    pub fn get_all(&self, key: &str) -> &[String] {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    /// Remove `key`, returning its values.
    pub fn remove(&mut self, key: &str) -> Vec<String> {
        self.entries
            .remove(&key.to_ascii_lowercase())
            .map(|(_, values)| values)
            .unwrap_or_default()
    }

    /// Returns true if `key` has at least one value.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&key.to_ascii_lowercase())
    }

    /// Iterate `(key, value)` pairs, one per value, keys in original spelling.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.values().flat_map(|(key, values)| {
            values.iter().map(move |v| (key.as_str(), v.as_str()))
        })
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if there are no keys.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Everything about a message except its payload. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Dedup key, chosen by the producer.
    pub id: String,
    /// Creation date at the origin.
    pub date: DateTime<Utc>,
    /// Message type, selects the receiver.
    #[serde(rename = "type")]
    pub kind: String,
    /// Uri of the origin instance.
    pub source: String,
    /// Target uris; empty means broadcast.
    pub receivers: Vec<String>,
    /// Custom metadata.
    pub metadata: Metadata,
}

impl MessageHeader {
    /// New header dated now with no receivers and no metadata.
    pub fn new(id: impl Into<String>, kind: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            date: Utc::now(),
            kind: kind.into(),
            source: source.into(),
            receivers: Vec::new(),
            metadata: Metadata::new(),
        }
    }

    /// Returns true if `uri` should handle this message.
    pub fn is_addressed_to(&self, uri: &str) -> bool {
        self.receivers.is_empty() || self.receivers.iter().any(|r| r == uri)
    }
}

type PayloadOpener = Box<dyn FnOnce() -> std::io::Result<Box<dyn Read + Send>> + Send + Sync>;

/// Message body, opened lazily and consumed once.
pub enum Payload {
    /// Already in memory.
    Bytes(Bytes),
    /// Opened on first read.
    Lazy(PayloadOpener),
    /// Already read.
    Consumed,
}

impl Payload {
    /// Payload from an opener that is called on first read.
    pub fn lazy<F, R>(open: F) -> Self
    where
        F: FnOnce() -> std::io::Result<R> + Send + Sync + 'static,
        R: Read + Send + 'static,
    {
        Payload::Lazy(Box::new(move || open().map(|r| Box::new(r) as Box<dyn Read + Send>)))
    }

    /// Read the whole payload. A second call fails.
    pub fn take(&mut self) -> Result<Bytes> {
        match std::mem::replace(self, Payload::Consumed) {
            Payload::Bytes(bytes) => Ok(bytes),
            Payload::Lazy(open) => {
                let mut reader = open()?;
                let mut buf = Vec::new();
                reader.read_to_end(&mut buf)?;
                Ok(Bytes::from(buf))
            }
            Payload::Consumed => Err(ReplError::invalid("payload already consumed")),
        }
    }

    /// Returns true once the payload was read.
    pub fn is_consumed(&self) -> bool {
        matches!(self, Payload::Consumed)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Bytes(bytes)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(Bytes::from(bytes))
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Bytes(b) => write!(f, "Payload::Bytes({} bytes)", b.len()),
            Payload::Lazy(_) => f.write_str("Payload::Lazy"),
            Payload::Consumed => f.write_str("Payload::Consumed"),
        }
    }
}

/// A message as handed to producers and receivers.
#[derive(Debug)]
pub struct Message {
    /// Header fields.
    pub header: MessageHeader,
    /// Uri or id of the instance that handed us the message (last hop).
    /// None for locally produced messages.
    pub instance: Option<String>,
    /// Body.
    pub payload: Payload,
}

impl Message {
    /// Locally produced message.
    pub fn new(header: MessageHeader, payload: impl Into<Payload>) -> Self {
        Self {
            header,
            instance: None,
            payload: payload.into(),
        }
    }

    /// Materialise the payload into an outbound message.
    pub fn into_outbound(mut self) -> Result<OutboundMessage> {
        let body = self.payload.take()?;
        Ok(OutboundMessage {
            header: self.header,
            instance: self.instance,
            body,
        })
    }
}

/// A message ready to be queued: payload in memory, cloned per target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Header fields.
    pub header: MessageHeader,
    /// Last hop, when this is a relayed copy.
    pub instance: Option<String>,
    /// Body.
    pub body: Bytes,
}

impl OutboundMessage {
    /// Outbound message from header and body.
    pub fn new(header: MessageHeader, body: impl Into<Bytes>) -> Self {
        Self {
            header,
            instance: None,
            body: body.into(),
        }
    }

    /// Message id.
    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Copy for relaying: same id and body, receivers replaced.
    pub fn relayed(&self, receivers: Vec<String>) -> Self {
        let mut copy = self.clone();
        copy.header.receivers = receivers;
        copy
    }

    /// Receiver-side view with a fresh payload.
    pub fn to_message(&self) -> Message {
        Message {
            header: self.header.clone(),
            instance: self.instance.clone(),
            payload: Payload::Bytes(self.body.clone()),
        }
    }
}
