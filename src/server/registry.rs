//! Connection identities and group membership.
//!
//! [`Registry`] maps each live peer's [`ConnectionId`] to its engine and
//! keeps named groups of ids. A group disappears when its last member
//! leaves.

use std::{
    collections::HashSet,
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};

use dashmap::{DashMap, mapref::entry::Entry};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, IdAllocator, RandomIds};

/// Identifier assigned to a connected peer, unique among live peers of one
/// server.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl From<u64> for ConnectionId {
    fn from(value: u64) -> Self { Self(value) }
}

impl ConnectionId {
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "ConnectionId({})", self.0) }
}

pub(crate) struct Registry {
    clients: DashMap<ConnectionId, Engine>,
    groups: DashMap<String, HashSet<ConnectionId>>,
    connected: AtomicUsize,
    ids: Box<dyn IdAllocator>,
}

impl Default for Registry {
    fn default() -> Self { Self::with_ids(Box::new(RandomIds::connections())) }
}

impl Registry {
    pub(crate) fn with_ids(ids: Box<dyn IdAllocator>) -> Self {
        Self {
            clients: DashMap::new(),
            groups: DashMap::new(),
            connected: AtomicUsize::new(0),
            ids,
        }
    }

    /// Allocate an id not held by any live peer and register the engine
    /// `build` creates for it.
    pub(crate) fn admit(&self, build: impl Fn(ConnectionId) -> Engine) -> (ConnectionId, Engine) {
        loop {
            let id = ConnectionId(
                self.ids
                    .allocate(&|candidate| self.clients.contains_key(&ConnectionId(candidate))),
            );
            if let Entry::Vacant(slot) = self.clients.entry(id) {
                let engine = build(id);
                slot.insert(engine.clone());
                return (id, engine);
            }
        }
    }

    /// Count a peer as connected. Returns `true` for the first one.
    pub(crate) fn mark_connected(&self) -> bool { self.connected.fetch_add(1, Ordering::AcqRel) == 0 }

    /// Drop a peer from the table and every group. Returns `true` when it
    /// was the last connected peer.
    pub(crate) fn remove(&self, id: ConnectionId, was_connected: bool) -> bool {
        self.clients.remove(&id);
        self.groups.retain(|_, members| {
            members.remove(&id);
            !members.is_empty()
        });
        was_connected && self.connected.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub(crate) fn get(&self, id: ConnectionId) -> Option<Engine> {
        self.clients.get(&id).map(|e| e.value().clone())
    }

    pub(crate) fn all(&self) -> Vec<(ConnectionId, Engine)> {
        let mut all: Vec<_> = self
            .clients
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub(crate) fn len(&self) -> usize { self.clients.len() }

    /// Add `id` to `group`. Adding a present member, or a peer that is not
    /// connected, is a no-op.
    pub(crate) fn subscribe(&self, group: &str, id: ConnectionId) -> bool {
        if !self.clients.contains_key(&id) {
            return false;
        }
        self.groups.entry(group.to_owned()).or_default().insert(id)
    }

    pub(crate) fn unsubscribe(&self, group: &str, id: ConnectionId) -> bool {
        let removed = self
            .groups
            .get_mut(group)
            .is_some_and(|mut members| members.remove(&id));
        self.groups.remove_if(group, |_, members| members.is_empty());
        removed
    }

    pub(crate) fn members(&self, group: &str) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .groups
            .get(group)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub(crate) fn groups(&self) -> Vec<String> {
        let mut names: Vec<_> = self.groups.iter().map(|e| e.key().clone()).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Config, engine::SequentialIds};

    fn engine(id: ConnectionId) -> Engine {
        Engine::builder()
            .id(id.as_u64())
            .config(Config::default())
            .build()
    }

    #[test]
    fn ids_skip_live_peers() {
        let registry = Registry::with_ids(Box::new(SequentialIds::default()));
        let (a, _) = registry.admit(engine);
        let (b, _) = registry.admit(engine);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn group_disappears_with_last_member() {
        let registry = Registry::default();
        let (a, _) = registry.admit(engine);
        let (b, _) = registry.admit(engine);
        assert!(registry.subscribe("g", a));
        assert!(!registry.subscribe("g", a));
        assert!(registry.subscribe("g", b));
        assert!(registry.unsubscribe("g", a));
        assert!(!registry.unsubscribe("g", a));
        assert_eq!(registry.members("g"), [b]);
        registry.remove(b, false);
        assert!(registry.groups().is_empty());
    }

    #[test]
    fn unknown_peer_cannot_join() {
        let registry = Registry::default();
        assert!(!registry.subscribe("g", ConnectionId::new(99)));
        assert!(registry.members("g").is_empty());
    }

    #[test]
    fn first_and_last_are_reported_once() {
        let registry = Registry::default();
        let (a, _) = registry.admit(engine);
        let (b, _) = registry.admit(engine);
        assert!(registry.mark_connected());
        assert!(!registry.mark_connected());
        assert!(!registry.remove(a, true));
        assert!(registry.remove(b, true));
    }
}
