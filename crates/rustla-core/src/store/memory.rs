//! In-memory presence store.
//!
//! Suitable for a single-process server and for tests. Nothing survives a
//! restart, and nothing is shared with other processes.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use rustla_protocol::StreamId;
use std::collections::HashMap;
use tracing::debug;

use super::{sort_listing, BannedStream, PresenceStore, Rustler, StoreError, Stream, User};
use crate::registry::ConnectionId;

/// A presence store backed by concurrent hash maps.
#[derive(Debug, Default)]
pub struct MemoryStore {
    /// Rustler id -> watched stream.
    rustlers: DashMap<ConnectionId, Option<StreamId>>,
    /// Live streams by id.
    streams: DashMap<StreamId, Stream>,
    /// Denylisted pairs.
    banned: DashSet<BannedStream>,
    /// Users by name.
    users: DashMap<String, User>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a user.
    pub fn insert_user(&self, user: User) {
        debug!(user = %user.name, "Stored user");
        self.users.insert(user.name.clone(), user);
    }

    /// Denylist a canonical pair.
    pub fn ban_stream(&self, service: impl Into<String>, channel: impl Into<String>) {
        self.banned.insert(BannedStream::new(service, channel));
    }

    /// Number of rustler records.
    #[must_use]
    pub fn rustler_count(&self) -> usize {
        self.rustlers.len()
    }

    /// Number of stream records.
    #[must_use]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn create_rustler(&self, id: &ConnectionId) -> Result<(), StoreError> {
        self.rustlers.insert(id.clone(), None);
        Ok(())
    }

    async fn find_rustler(&self, id: &ConnectionId) -> Result<Option<Rustler>, StoreError> {
        Ok(self.rustlers.get(id).map(|entry| Rustler {
            id: id.clone(),
            stream_id: *entry.value(),
        }))
    }

    async fn set_rustler_stream(
        &self,
        id: &ConnectionId,
        stream_id: Option<StreamId>,
    ) -> Result<bool, StoreError> {
        match self.rustlers.get_mut(id) {
            Some(mut entry) => {
                *entry.value_mut() = stream_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn destroy_rustler(&self, id: &ConnectionId) -> Result<(), StoreError> {
        self.rustlers.remove(id);
        Ok(())
    }

    async fn find_rustlers_watching_or_idle(
        &self,
        stream_id: StreamId,
    ) -> Result<Vec<Rustler>, StoreError> {
        Ok(self
            .rustlers
            .iter()
            .filter(|entry| entry.value().map_or(true, |watching| watching == stream_id))
            .map(|entry| Rustler {
                id: entry.key().clone(),
                stream_id: *entry.value(),
            })
            .collect())
    }

    async fn count_rustlers(&self, stream_id: StreamId) -> Result<u64, StoreError> {
        Ok(self
            .rustlers
            .iter()
            .filter(|entry| *entry.value() == Some(stream_id))
            .count() as u64)
    }

    async fn find_stream(&self, id: StreamId) -> Result<Option<Stream>, StoreError> {
        Ok(self.streams.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_stream_by_alias(&self, alias: &str) -> Result<Option<Stream>, StoreError> {
        Ok(self
            .streams
            .iter()
            .find(|entry| entry.value().overrustle_id.as_deref() == Some(alias))
            .map(|entry| entry.value().clone()))
    }

    async fn find_or_create_stream(&self, stream: Stream) -> Result<(Stream, bool), StoreError> {
        match self.streams.entry(stream.id) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(slot) => {
                slot.insert(stream.clone());
                Ok((stream, true))
            }
        }
    }

    async fn destroy_empty_stream(&self, id: StreamId) -> Result<bool, StoreError> {
        // The shard lock on `streams` is held while watchers are counted.
        let removed = self.streams.remove_if(&id, |_, _| {
            !self
                .rustlers
                .iter()
                .any(|entry| *entry.value() == Some(id))
        });
        Ok(removed.is_some())
    }

    async fn streams_with_rustlers(&self) -> Result<Vec<(Stream, u64)>, StoreError> {
        let mut counts: HashMap<StreamId, u64> = HashMap::new();
        for entry in self.rustlers.iter() {
            if let Some(stream_id) = *entry.value() {
                *counts.entry(stream_id).or_default() += 1;
            }
        }

        let mut listing: Vec<(Stream, u64)> = self
            .streams
            .iter()
            .filter_map(|entry| {
                counts
                    .get(entry.key())
                    .map(|count| (entry.value().clone(), *count))
            })
            .collect();
        sort_listing(&mut listing);

        Ok(listing)
    }

    async fn is_banned(&self, service: &str, channel: &str) -> Result<bool, StoreError> {
        Ok(self.banned.contains(&BannedStream::new(service, channel)))
    }

    async fn find_user(&self, name: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(name).map(|entry| entry.value().clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(id: u32, channel: &str) -> Stream {
        Stream {
            id: StreamId::new(id),
            service: "twitch".to_string(),
            channel: channel.to_string(),
            overrustle_id: None,
        }
    }

    #[tokio::test]
    async fn test_rustler_lifecycle() {
        let store = MemoryStore::new();
        let id = ConnectionId::new("conn-1");

        store.create_rustler(&id).await.unwrap();
        let rustler = store.find_rustler(&id).await.unwrap().unwrap();
        assert!(rustler.is_idle());

        assert!(store
            .set_rustler_stream(&id, Some(StreamId::new(1)))
            .await
            .unwrap());
        assert_eq!(store.count_rustlers(StreamId::new(1)).await.unwrap(), 1);

        store.destroy_rustler(&id).await.unwrap();
        assert!(store.find_rustler(&id).await.unwrap().is_none());
        assert_eq!(store.count_rustlers(StreamId::new(1)).await.unwrap(), 0);

        // Missing rustlers are reported, not created.
        assert!(!store.set_rustler_stream(&id, None).await.unwrap());
        assert_eq!(store.rustler_count(), 0);
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let store = MemoryStore::new();

        let (first, created) = store
            .find_or_create_stream(stream(7, "destiny"))
            .await
            .unwrap();
        assert!(created);

        let mut duplicate = stream(7, "destiny");
        duplicate.overrustle_id = Some("someone".to_string());
        let (second, created) = store.find_or_create_stream(duplicate).await.unwrap();
        assert!(!created);
        assert_eq!(first, second);
        assert_eq!(store.stream_count(), 1);
    }

    #[tokio::test]
    async fn test_watching_or_idle_filter() {
        let store = MemoryStore::new();
        let watching = ConnectionId::new("watching");
        let idle = ConnectionId::new("idle");
        let elsewhere = ConnectionId::new("elsewhere");

        for id in [&watching, &idle, &elsewhere] {
            store.create_rustler(id).await.unwrap();
        }
        store
            .set_rustler_stream(&watching, Some(StreamId::new(1)))
            .await
            .unwrap();
        store
            .set_rustler_stream(&elsewhere, Some(StreamId::new(2)))
            .await
            .unwrap();

        let mut ids: Vec<String> = store
            .find_rustlers_watching_or_idle(StreamId::new(1))
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id.as_str().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["idle", "watching"]);
    }

    #[tokio::test]
    async fn test_streams_with_rustlers_skips_empty() {
        let store = MemoryStore::new();
        store.find_or_create_stream(stream(1, "one")).await.unwrap();
        store.find_or_create_stream(stream(2, "two")).await.unwrap();

        let id = ConnectionId::new("conn-1");
        store.create_rustler(&id).await.unwrap();
        store
            .set_rustler_stream(&id, Some(StreamId::new(2)))
            .await
            .unwrap();

        let listing = store.streams_with_rustlers().await.unwrap();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].0.channel, "two");
        assert_eq!(listing[0].1, 1);
    }

    #[tokio::test]
    async fn test_alias_lookup_and_bans() {
        let store = MemoryStore::new();
        let mut aliased = stream(9, "foo");
        aliased.overrustle_id = Some("foo_user".to_string());
        store.find_or_create_stream(aliased.clone()).await.unwrap();

        assert_eq!(
            store.find_stream_by_alias("foo_user").await.unwrap(),
            Some(aliased)
        );
        assert!(store.find_stream_by_alias("nobody").await.unwrap().is_none());

        store.ban_stream("twitch", "bad");
        assert!(store.is_banned("twitch", "bad").await.unwrap());
        assert!(!store.is_banned("twitch", "good").await.unwrap());

        assert!(store.destroy_empty_stream(StreamId::new(9)).await.unwrap());
        assert!(!store.destroy_empty_stream(StreamId::new(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_destroy_keeps_watched_stream() {
        let store = MemoryStore::new();
        store.find_or_create_stream(stream(3, "busy")).await.unwrap();

        let id = ConnectionId::new("late-joiner");
        store.create_rustler(&id).await.unwrap();
        store
            .set_rustler_stream(&id, Some(StreamId::new(3)))
            .await
            .unwrap();

        assert!(!store.destroy_empty_stream(StreamId::new(3)).await.unwrap());
        assert!(store.find_stream(StreamId::new(3)).await.unwrap().is_some());

        store.set_rustler_stream(&id, None).await.unwrap();
        assert!(store.destroy_empty_stream(StreamId::new(3)).await.unwrap());
        assert_eq!(store.stream_count(), 0);
    }
}
