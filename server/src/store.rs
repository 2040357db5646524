//! Authoritative player state
//!
//! `PlayerStore` is the only place player transforms live. Every mutation
//! takes the write lock for constant-time work, so two updates for the same
//! player can never interleave and a snapshot never sees a half-written
//! record. The store knows player ids only; connection handles stay with the
//! connection manager.

use crate::error::SessionError;
use log::{debug, info};
use shared::{current_timestamp, Attributes, PlayerId, PlayerState, Transform};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

/// Server-side state of one player.
#[derive(Debug, Clone)]
pub struct PlayerRecord {
    pub id: PlayerId,
    /// Latest accepted transform
    pub transform: Transform,
    /// Latest accepted attributes
    pub attributes: Attributes,
    /// Client timestamp of the newest accepted update, used to reject stale ones.
    pub last_client_timestamp: u64,
    /// Server receipt time of the newest accepted update, in ms since the epoch.
    pub last_update: u64,
}

impl PlayerRecord {
    fn new(id: PlayerId, transform: Transform) -> Self {
        Self {
            id,
            transform,
            attributes: Attributes::new(),
            last_client_timestamp: 0,
            last_update: current_timestamp(),
        }
    }

    /// Client-facing view of this record.
    pub fn to_state(&self) -> PlayerState {
        PlayerState {
            id: self.id,
            transform: self.transform.clone(),
            attributes: self.attributes.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    players: HashMap<PlayerId, PlayerRecord>,
    /// Players changed since the last `take_delta`.
    dirty: HashSet<PlayerId>,
}

/// Concurrent map of every connected player, plus the per-tick change set.
#[derive(Debug, Default)]
pub struct PlayerStore {
    inner: RwLock<StoreInner>,
}

impl PlayerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a freshly connected player. Returns false if the id is taken.
    pub async fn insert(&self, id: PlayerId, transform: Transform) -> bool {
        let mut inner = self.inner.write().await;
        if inner.players.contains_key(&id) {
            return false;
        }
        info!(
            "Added player {} at ({}, {}, {})",
            id, transform.position[0], transform.position[1], transform.position[2]
        );
        inner.players.insert(id, PlayerRecord::new(id, transform));
        true
    }

    /// Applies an already validated update.
    ///
    /// Never creates an entry: an update for a player that has been removed is
    /// rejected with `UnknownIdentifier`. Updates with a client timestamp older
    /// than the newest applied one are rejected with `StaleUpdate`.
    pub async fn upsert(
        &self,
        id: PlayerId,
        transform: Transform,
        timestamp: u64,
        attributes: Option<Attributes>,
    ) -> Result<(), SessionError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .players
            .get_mut(&id)
            .ok_or(SessionError::UnknownIdentifier(id))?;

        if timestamp < record.last_client_timestamp {
            return Err(SessionError::StaleUpdate {
                id,
                timestamp,
                last: record.last_client_timestamp,
            });
        }

        record.transform = transform;
        if let Some(attributes) = attributes {
            record.attributes = attributes;
        }
        record.last_client_timestamp = timestamp;
        record.last_update = current_timestamp();
        inner.dirty.insert(id);
        Ok(())
    }

    /// Deletes a player. Returns false if it was already gone.
    pub async fn remove(&self, id: &PlayerId) -> bool {
        let mut inner = self.inner.write().await;
        inner.dirty.remove(id);
        if inner.players.remove(id).is_some() {
            info!("Removed player {}", id);
            true
        } else {
            debug!("Player {} already removed", id);
            false
        }
    }

    /// Point-in-time copy of every player.
    pub async fn snapshot(&self) -> Vec<PlayerState> {
        let inner = self.inner.read().await;
        inner.players.values().map(PlayerRecord::to_state).collect()
    }

    /// Players changed since the previous call, clearing the change set.
    pub async fn take_delta(&self) -> Vec<PlayerState> {
        let mut inner = self.inner.write().await;
        let StoreInner { players, dirty } = &mut *inner;
        dirty
            .drain()
            .filter_map(|id| players.get(&id).map(PlayerRecord::to_state))
            .collect()
    }

    /// Copy of one player's record.
    pub async fn get(&self, id: &PlayerId) -> Option<PlayerRecord> {
        self.inner.read().await.players.get(id).cloned()
    }

    /// Whether `id` is a connected player.
    pub async fn contains(&self, id: &PlayerId) -> bool {
        self.inner.read().await.players.contains_key(id)
    }

    /// Ids of every connected player.
    pub async fn ids(&self) -> HashSet<PlayerId> {
        self.inner.read().await.players.keys().copied().collect()
    }

    /// Number of connected players.
    pub async fn len(&self) -> usize {
        self.inner.read().await.players.len()
    }

    /// True when no player is connected.
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.players.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    async fn store_with_player() -> (PlayerStore, PlayerId) {
        let store = PlayerStore::new();
        let id = PlayerId::generate();
        assert!(store.insert(id, Transform::default()).await);
        (store, id)
    }

    #[tokio::test]
    async fn test_insert_and_duplicate() {
        let (store, id) = store_with_player().await;
        assert!(!store.insert(id, Transform::at(5.0, 0.0, 0.0)).await);
        assert_eq!(store.len().await, 1);
        assert_eq!(store.get(&id).await.unwrap().transform, Transform::default());
    }

    #[tokio::test]
    async fn test_upsert_applies_update() {
        let (store, id) = store_with_player().await;
        store
            .upsert(id, Transform::at(1.0, 2.0, 3.0), 10, None)
            .await
            .unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.transform.position, [1.0, 2.0, 3.0]);
        assert_eq!(record.last_client_timestamp, 10);
        assert!(record.last_update > 0);
    }

    #[tokio::test]
    async fn test_stale_update_rejected() {
        let (store, id) = store_with_player().await;
        store
            .upsert(id, Transform::at(5.0, 0.0, 0.0), 5, None)
            .await
            .unwrap();

        let result = store.upsert(id, Transform::at(3.0, 0.0, 0.0), 3, None).await;
        assert!(matches!(
            result,
            Err(SessionError::StaleUpdate {
                timestamp: 3,
                last: 5,
                ..
            })
        ));
        assert_eq!(store.get(&id).await.unwrap().transform.position, [5.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_equal_timestamp_applies_in_receipt_order() {
        let (store, id) = store_with_player().await;
        store.upsert(id, Transform::at(1.0, 0.0, 0.0), 7, None).await.unwrap();
        store.upsert(id, Transform::at(2.0, 0.0, 0.0), 7, None).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap().transform.position, [2.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn test_update_after_remove_does_not_resurrect() {
        let (store, id) = store_with_player().await;
        assert!(store.remove(&id).await);

        let result = store.upsert(id, Transform::at(1.0, 0.0, 0.0), 99, None).await;
        assert!(matches!(result, Err(SessionError::UnknownIdentifier(_))));
        assert!(!store.contains(&id).await);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (store, id) = store_with_player().await;
        assert!(store.remove(&id).await);
        assert!(!store.remove(&id).await);
        assert_eq!(store.len().await, 0);
    }

    #[tokio::test]
    async fn test_attributes_replaced_only_when_present() {
        let (store, id) = store_with_player().await;
        let mut attributes = Attributes::new();
        attributes.insert("color".into(), json!("blue"));

        store
            .upsert(id, Transform::default(), 1, Some(attributes))
            .await
            .unwrap();
        store.upsert(id, Transform::default(), 2, None).await.unwrap();

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.attributes.get("color"), Some(&json!("blue")));
    }

    #[tokio::test]
    async fn test_take_delta_coalesces_and_clears() {
        let (store, a) = store_with_player().await;
        let b = PlayerId::generate();
        store.insert(b, Transform::default()).await;

        store.upsert(a, Transform::at(1.0, 0.0, 0.0), 1, None).await.unwrap();
        store.upsert(a, Transform::at(2.0, 0.0, 0.0), 2, None).await.unwrap();

        let delta = store.take_delta().await;
        assert_eq!(delta.len(), 1);
        assert_eq!(delta[0].id, a);
        assert_eq!(delta[0].transform.position, [2.0, 0.0, 0.0]);

        assert!(store.take_delta().await.is_empty());
        assert_eq!(store.snapshot().await.len(), 2);
    }

    #[tokio::test]
    async fn test_removed_player_leaves_delta() {
        let (store, id) = store_with_player().await;
        store.upsert(id, Transform::at(1.0, 0.0, 0.0), 1, None).await.unwrap();
        store.remove(&id).await;
        assert!(store.take_delta().await.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_keep_newest() {
        let (store, id) = store_with_player().await;
        let store = Arc::new(store);

        let handles: Vec<_> = (1..=100u64)
            .map(|ts| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    let _ = store
                        .upsert(id, Transform::at(ts as f32, 0.0, 0.0), ts, None)
                        .await;
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let record = store.get(&id).await.unwrap();
        assert_eq!(record.last_client_timestamp, 100);
        assert_eq!(record.transform.position[0], 100.0);
    }
}
