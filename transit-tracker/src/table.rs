//! TrackingTable - watched entities bucketed by destination
//!
//! Lookups go destination first, then identity, so an entity lives in exactly one
//! bucket. The table itself is not synchronized; `CorrelationEngine` wraps it in a
//! single lock.

use crate::entity::{EntityId, WatchedEntity};
use ahash::AHashMap;

#[derive(Debug, Default)]
pub struct TrackingTable {
    buckets: AHashMap<String, AHashMap<EntityId, WatchedEntity>>,
    len: usize,
}

impl TrackingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entity in pre-state; returns false if it is already present
    pub fn register(&mut self, id: EntityId, destination: &str) -> bool {
        let bucket = self.buckets.entry(destination.to_string()).or_default();
        if bucket.contains_key(&id) {
            return false;
        }
        bucket.insert(id.clone(), WatchedEntity::new(id, destination));
        self.len += 1;
        true
    }

    pub fn get(&self, destination: &str, id: &EntityId) -> Option<&WatchedEntity> {
        self.buckets.get(destination)?.get(id)
    }

    pub fn get_mut(&mut self, destination: &str, id: &EntityId) -> Option<&mut WatchedEntity> {
        self.buckets.get_mut(destination)?.get_mut(id)
    }

    /// Whether any entity is watched at `destination`
    pub fn watches(&self, destination: &str) -> bool {
        self.buckets.contains_key(destination)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True iff the table is non-empty and every entity is terminal
    pub fn all_terminal(&self) -> bool {
        !self.is_empty() && self.entities().all(WatchedEntity::is_terminal)
    }

    pub fn destinations(&self) -> impl Iterator<Item = &str> {
        self.buckets.keys().map(String::as_str)
    }

    pub fn bucket(&self, destination: &str) -> impl Iterator<Item = &WatchedEntity> {
        self.buckets.get(destination).into_iter().flat_map(|b| b.values())
    }

    pub fn entities(&self) -> impl Iterator<Item = &WatchedEntity> {
        self.buckets.values().flat_map(|b| b.values())
    }
}
