//! Replication topology: per-entity configuration of which instances get
//! which replication level, resolved through the entity hierarchy.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{debug, info};

use crate::error::{ReplError, Result};
use crate::store::{MemoryTable, Table};

/// A node of the hierarchy `global > wiki > space(s) > document`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    /// The whole farm.
    Global,
    /// One wiki.
    Wiki(String),
    /// A space; `path` has at least one segment, outermost first.
    Space {
        /// Owning wiki.
        wiki: String,
        /// Space names from the top-level space down.
        path: Vec<String>,
    },
    /// A document in a space.
    Document {
        /// Owning wiki.
        wiki: String,
        /// Enclosing space path.
        space: Vec<String>,
        /// Document name.
        name: String,
    },
}

impl EntityRef {
    /// Wiki reference.
    pub fn wiki(wiki: impl Into<String>) -> Self {
        EntityRef::Wiki(wiki.into())
    }

    /// Space reference from a path of space names.
    pub fn space<S: Into<String>>(wiki: impl Into<String>, path: impl IntoIterator<Item = S>) -> Self {
        EntityRef::Space {
            wiki: wiki.into(),
            path: path.into_iter().map(Into::into).collect(),
        }
    }

    /// Document reference.
    pub fn document<S: Into<String>>(
        wiki: impl Into<String>,
        space: impl IntoIterator<Item = S>,
        name: impl Into<String>,
    ) -> Self {
        EntityRef::Document {
            wiki: wiki.into(),
            space: space.into_iter().map(Into::into).collect(),
            name: name.into(),
        }
    }

    /// Enclosing entity. `Global` has none.
    pub fn parent(&self) -> Option<EntityRef> {
        match self {
            EntityRef::Global => None,
            EntityRef::Wiki(_) => Some(EntityRef::Global),
            EntityRef::Space { wiki, path } if path.len() <= 1 => Some(EntityRef::Wiki(wiki.clone())),
            EntityRef::Space { wiki, path } => Some(EntityRef::Space {
                wiki: wiki.clone(),
                path: path[..path.len() - 1].to_vec(),
            }),
            EntityRef::Document { wiki, space, .. } => Some(EntityRef::Space {
                wiki: wiki.clone(),
                path: space.clone(),
            }),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Global => f.write_str("global"),
            EntityRef::Wiki(wiki) => write!(f, "wiki:{}", wiki),
            EntityRef::Space { wiki, path } => write!(f, "space:{}/{}", wiki, path.join("/")),
            EntityRef::Document { wiki, space, name } => {
                write!(f, "document:{}/{}/{}", wiki, space.join("/"), name)
            }
        }
    }
}

impl FromStr for EntityRef {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "global" {
            return Ok(EntityRef::Global);
        }
        let bad = || ReplError::invalid(format!("malformed entity reference '{}'", s));
        let (kind, rest) = s.split_once(':').ok_or_else(bad)?;
        let segments: Vec<String> = rest.split('/').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(bad());
        }
        match (kind, segments.as_slice()) {
            ("wiki", [wiki]) => Ok(EntityRef::Wiki(wiki.clone())),
            ("space", [wiki, path @ ..]) if !path.is_empty() => Ok(EntityRef::Space {
                wiki: wiki.clone(),
                path: path.to_vec(),
            }),
            ("document", [wiki, space @ .., name]) if !space.is_empty() => Ok(EntityRef::Document {
                wiki: wiki.clone(),
                space: space.to_vec(),
                name: name.clone(),
            }),
            _ => Err(bad()),
        }
    }
}

impl Serialize for EntityRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EntityRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How much of an entity is replicated to an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationLevel {
    /// Nothing.
    #[default]
    None,
    /// Existence and metadata only.
    Reference,
    /// Complete content.
    Full,
}

/// Which way messages flow between us and an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// We send, we do not accept.
    SendOnly,
    /// We accept, we do not send.
    ReceiveOnly,
    /// Both ways.
    #[default]
    Both,
}

impl Direction {
    /// True if we may send to the instance.
    pub fn allows_send(self) -> bool {
        matches!(self, Direction::SendOnly | Direction::Both)
    }

    /// True if we accept from the instance.
    pub fn allows_receive(self) -> bool {
        matches!(self, Direction::ReceiveOnly | Direction::Both)
    }

    /// The same link seen from the other end.
    pub fn inverted(self) -> Self {
        match self {
            Direction::SendOnly => Direction::ReceiveOnly,
            Direction::ReceiveOnly => Direction::SendOnly,
            Direction::Both => Direction::Both,
        }
    }
}

/// Level and direction for one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceRule {
    /// Replication level.
    pub level: ReplicationLevel,
    /// Direction.
    pub direction: Direction,
}

impl InstanceRule {
    /// New rule.
    pub fn new(level: ReplicationLevel, direction: Direction) -> Self {
        Self { level, direction }
    }
}

/// Per-instance rules for one entity, with an optional wildcard for every
/// instance not listed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Rule for all instances without their own entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wildcard: Option<InstanceRule>,
    /// Rules keyed by instance uri.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instances: BTreeMap<String, InstanceRule>,
}

impl ReplicationConfig {
    /// Configuration applying `rule` to every instance.
    pub fn all(rule: InstanceRule) -> Self {
        Self {
            wildcard: Some(rule),
            instances: BTreeMap::new(),
        }
    }

    /// Builder: rule for `uri`, or the wildcard when `uri` is None.
    pub fn with_rule(mut self, uri: Option<&str>, rule: InstanceRule) -> Self {
        self.set_rule(uri, rule);
        self
    }

    /// Set the rule for `uri`, or the wildcard when `uri` is None.
    pub fn set_rule(&mut self, uri: Option<&str>, rule: InstanceRule) {
        match uri {
            Some(uri) => {
                self.instances.insert(uri.to_string(), rule);
            }
            None => self.wildcard = Some(rule),
        }
    }

    /// Explicit rule stored under `uri` (or the wildcard for None).
    pub fn rule(&self, uri: Option<&str>) -> Option<InstanceRule> {
        match uri {
            Some(uri) => self.instances.get(uri).copied(),
            None => self.wildcard,
        }
    }

    /// Effective rule: the instance entry, else the wildcard, else nothing.
    pub fn rule_for(&self, uri: &str) -> InstanceRule {
        self.instances
            .get(uri)
            .copied()
            .or(self.wildcard)
            .unwrap_or_default()
    }

    /// Local configuration derived from the one a peer (`source_uri`) sent us.
    ///
    /// The peer's send-only rules become receive-only here and its own entry
    /// for us is dropped. Entries equal to the wildcard are pruned. The peer
    /// gets an override only if we end up receive-only towards it.
    pub fn merge_remote(remote: &ReplicationConfig, local_uri: &str, source_uri: &str) -> Self {
        let localize = |rule: InstanceRule| InstanceRule {
            level: rule.level,
            direction: match rule.direction {
                Direction::SendOnly => Direction::ReceiveOnly,
                other => other,
            },
        };

        let wildcard = remote.wildcard.map(localize);
        let fallback = wildcard.unwrap_or_default();
        let instances = remote
            .instances
            .iter()
            .filter(|(uri, _)| uri.as_str() != local_uri)
            .map(|(uri, rule)| (uri.clone(), localize(*rule)))
            .filter(|(_, rule)| *rule != fallback)
            .collect();
        let mut merged = Self { wildcard, instances };

        let towards_us = remote.rule_for(local_uri);
        let source_rule = InstanceRule::new(towards_us.level, towards_us.direction.inverted());
        if source_rule.direction == Direction::ReceiveOnly && source_rule != fallback {
            merged.instances.insert(source_uri.to_string(), source_rule);
        }
        merged
    }
}

/// Result of resolving an entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfiguration {
    /// The applicable configuration.
    pub config: Arc<ReplicationConfig>,
    /// True if it came from an ancestor or the built-in fallback.
    pub inherited: bool,
    /// Entity that carries the configuration; None for the fallback.
    pub origin: Option<EntityRef>,
}

impl ResolvedConfiguration {
    /// Effective rule for `uri`.
    pub fn rule_for(&self, uri: &str) -> InstanceRule {
        self.config.rule_for(uri)
    }
}

#[derive(Debug)]
struct CacheNode {
    resolved: ResolvedConfiguration,
    /// Inherited entries resolved through this one.
    children: HashSet<EntityRef>,
}

/// Cached resolver over the configuration store.
///
/// Reads hit a concurrent map. Misses and invalidations run under one mutex,
/// which also serialises store writes, so the cache and its parent/child
/// links never disagree.
pub struct TopologyResolver {
    store: Arc<dyn Table<ReplicationConfig>>,
    fallback: Arc<ReplicationConfig>,
    cache: DashMap<EntityRef, CacheNode>,
    write: Mutex<()>,
}

impl TopologyResolver {
    /// Resolver over `store`, using `fallback` above `global`.
    pub fn new(store: Arc<dyn Table<ReplicationConfig>>, fallback: ReplicationConfig) -> Self {
        Self {
            store,
            fallback: Arc::new(fallback),
            cache: DashMap::new(),
            write: Mutex::new(()),
        }
    }

    /// Resolver over an in-memory store.
    pub fn in_memory(fallback: ReplicationConfig) -> Self {
        Self::new(Arc::new(MemoryTable::new()), fallback)
    }

    /// Applicable configuration for `entity`.
    pub fn resolve(&self, entity: &EntityRef) -> Result<ResolvedConfiguration> {
        if let Some(node) = self.cache.get(entity) {
            return Ok(node.resolved.clone());
        }
        let _write = self.write.lock();
        self.resolve_locked(entity)
    }

    fn resolve_locked(&self, entity: &EntityRef) -> Result<ResolvedConfiguration> {
        if let Some(node) = self.cache.get(entity) {
            return Ok(node.resolved.clone());
        }
        let resolved = match self.store.get(&entity.to_string())? {
            Some(config) => ResolvedConfiguration {
                config: Arc::new(config),
                inherited: false,
                origin: Some(entity.clone()),
            },
            None => match entity.parent() {
                Some(parent) => {
                    let from_parent = self.resolve_locked(&parent)?;
                    if let Some(mut node) = self.cache.get_mut(&parent) {
                        node.children.insert(entity.clone());
                    }
                    ResolvedConfiguration {
                        inherited: true,
                        ..from_parent
                    }
                }
                None => ResolvedConfiguration {
                    config: self.fallback.clone(),
                    inherited: true,
                    origin: None,
                },
            },
        };
        debug!(entity = %entity, inherited = resolved.inherited, "topology resolved");
        self.cache.insert(
            entity.clone(),
            CacheNode {
                resolved: resolved.clone(),
                children: HashSet::new(),
            },
        );
        Ok(resolved)
    }

    /// Evict `entity` and every inherited entry below it.
    pub fn invalidate(&self, entity: &EntityRef) {
        let _write = self.write.lock();
        self.invalidate_locked(entity);
        if let Some(parent) = entity.parent() {
            if let Some(mut node) = self.cache.get_mut(&parent) {
                node.children.remove(entity);
            }
        }
    }

    fn invalidate_locked(&self, entity: &EntityRef) {
        let Some((_, node)) = self.cache.remove(entity) else {
            return;
        };
        debug!(entity = %entity, children = node.children.len(), "topology entry evicted");
        for child in node.children {
            let inherited = self
                .cache
                .get(&child)
                .map(|c| c.resolved.inherited)
                .unwrap_or(false);
            if inherited {
                self.invalidate_locked(&child);
            }
        }
    }

    /// Explicit configuration stored for `entity`.
    pub fn configuration(&self, entity: &EntityRef) -> Result<Option<ReplicationConfig>> {
        self.store.get(&entity.to_string())
    }

    /// Store (or clear, with None) the explicit configuration of `entity`.
    pub fn set_configuration(&self, entity: &EntityRef, config: Option<ReplicationConfig>) -> Result<()> {
        {
            let _write = self.write.lock();
            match config {
                Some(config) => self.store.put(&entity.to_string(), config)?,
                None => {
                    self.store.delete(&entity.to_string())?;
                }
            }
        }
        info!(entity = %entity, "topology configuration changed");
        self.invalidate(entity);
        Ok(())
    }

    /// Candidates we may send `entity` to at `min_level` or above.
    pub fn targets(
        &self,
        entity: &EntityRef,
        candidates: &[String],
        min_level: ReplicationLevel,
    ) -> Result<Vec<String>> {
        let resolved = self.resolve(entity)?;
        Ok(candidates
            .iter()
            .filter(|uri| {
                let rule = resolved.rule_for(uri);
                rule.level > ReplicationLevel::None
                    && rule.level >= min_level
                    && rule.direction.allows_send()
            })
            .cloned()
            .collect())
    }

    /// True if changes to `entity` coming from `uri` should be applied.
    pub fn accepts_from(&self, entity: &EntityRef, uri: &str) -> Result<bool> {
        let rule = self.resolve(entity)?.rule_for(uri);
        Ok(rule.level > ReplicationLevel::None && rule.direction.allows_receive())
    }

    /// Returns true if `entity` has a cache entry.
    pub fn is_cached(&self, entity: &EntityRef) -> bool {
        self.cache.contains_key(entity)
    }

    /// Number of cache entries.
    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}
