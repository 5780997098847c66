//! Redis presence store.
//!
//! Shared by every server process pointed at the same Redis instance.
//!
//! Key layout, under a configurable prefix:
//!
//! ```text
//! {prefix}:rustler:{id}            string  "" in the lobby, else the stream id
//! {prefix}:lobby                   set     ids of idle rustlers
//! {prefix}:stream:{sid}            hash    service, channel, overrustle_id
//! {prefix}:stream:{sid}:rustlers   set     ids of rustlers watching sid
//! {prefix}:streams                 set     ids of live streams
//! {prefix}:alias:{name}            string  stream id linked to an alias
//! {prefix}:banned                  set     "service/channel"
//! {prefix}:user:{name}             hash    service, channel
//! ```

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use rustla_protocol::StreamId;
use std::collections::HashMap;
use tracing::{debug, info};

use super::{sort_listing, PresenceStore, Rustler, StoreError, Stream, User};
use crate::registry::ConnectionId;

/// Default key prefix.
pub const DEFAULT_PREFIX: &str = "rustla";

/// Move a rustler between membership sets.
///
/// KEYS: rustler, lobby, target set. ARGV: id, new assignment, stream key prefix.
const ASSIGN_SCRIPT: &str = r"
local previous = redis.call('GET', KEYS[1])
if not previous then
    return 0
end
if previous == '' then
    redis.call('SREM', KEYS[2], ARGV[1])
else
    redis.call('SREM', ARGV[3] .. previous .. ':rustlers', ARGV[1])
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
return 1
";

/// Delete a rustler and its membership.
///
/// KEYS: rustler, lobby. ARGV: id, stream key prefix.
const REMOVE_SCRIPT: &str = r"
local previous = redis.call('GET', KEYS[1])
if not previous then
    return 0
end
if previous == '' then
    redis.call('SREM', KEYS[2], ARGV[1])
else
    redis.call('SREM', ARGV[2] .. previous .. ':rustlers', ARGV[1])
end
redis.call('DEL', KEYS[1])
return 1
";

/// Delete a stream with no watchers, and the alias pointing at it.
///
/// KEYS: watchers, streams, stream hash. ARGV: stream id, alias key prefix.
const COLLECT_SCRIPT: &str = r"
if redis.call('SCARD', KEYS[1]) > 0 then
    return 0
end
if redis.call('SREM', KEYS[2], ARGV[1]) == 0 then
    return 0
end
local alias = redis.call('HGET', KEYS[3], 'overrustle_id')
redis.call('DEL', KEYS[3])
if alias and alias ~= '' then
    local alias_key = ARGV[2] .. alias
    if redis.call('GET', alias_key) == ARGV[1] then
        redis.call('DEL', alias_key)
    end
end
return 1
";

/// A presence store backed by Redis.
///
/// Operations that read a key and write based on it run as Lua scripts so
/// they cannot interleave with other processes.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    assign: Script,
    remove: Script,
    collect: Script,
}

impl RedisStore {
    /// Connect with the default key prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis is unreachable.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_prefix(url, DEFAULT_PREFIX).await
    }

    /// Connect with a custom key prefix.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is invalid or Redis is unreachable.
    pub async fn connect_with_prefix(
        url: &str,
        prefix: impl Into<String>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        let prefix = prefix.into();

        info!(prefix = %prefix, "Connected to redis store");

        Ok(Self {
            conn,
            prefix,
            assign: Script::new(ASSIGN_SCRIPT),
            remove: Script::new(REMOVE_SCRIPT),
            collect: Script::new(COLLECT_SCRIPT),
        })
    }

    /// Denylist a canonical pair.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis fails.
    pub async fn ban_stream(&self, service: &str, channel: &str) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        conn.sadd::<_, _, ()>(self.banned_key(), ban_member(service, channel))
            .await?;
        Ok(())
    }

    /// Add or replace a user.
    ///
    /// # Errors
    ///
    /// Returns an error if Redis fails.
    pub async fn insert_user(&self, user: &User) -> Result<(), StoreError> {
        let key = self.user_key(&user.name);
        let mut pipe = ::redis::pipe();
        pipe.atomic().del(&key).ignore();
        if let Some(service) = &user.service {
            pipe.hset(&key, "service", service).ignore();
        }
        if let Some(channel) = &user.channel {
            pipe.hset(&key, "channel", channel).ignore();
        }
        // Users without defaults still need a non-empty hash.
        pipe.hset(&key, "name", &user.name).ignore();

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(user = %user.name, "Stored user");
        Ok(())
    }

    fn rustler_key(&self, id: &ConnectionId) -> String {
        format!("{}:rustler:{}", self.prefix, id)
    }

    fn lobby_key(&self) -> String {
        format!("{}:lobby", self.prefix)
    }

    /// Prefix shared by stream hashes and watcher sets.
    fn stream_prefix(&self) -> String {
        format!("{}:stream:", self.prefix)
    }

    fn stream_key(&self, id: StreamId) -> String {
        format!("{}{}", self.stream_prefix(), id)
    }

    fn watchers_key(&self, id: StreamId) -> String {
        format!("{}{}:rustlers", self.stream_prefix(), id)
    }

    fn streams_key(&self) -> String {
        format!("{}:streams", self.prefix)
    }

    fn alias_prefix(&self) -> String {
        format!("{}:alias:", self.prefix)
    }

    fn alias_key(&self, alias: &str) -> String {
        format!("{}{}", self.alias_prefix(), alias)
    }

    fn banned_key(&self) -> String {
        format!("{}:banned", self.prefix)
    }

    fn user_key(&self, name: &str) -> String {
        format!("{}:user:{}", self.prefix, name)
    }

    /// Set holding a rustler with the given assignment.
    fn membership_key(&self, stream_id: Option<StreamId>) -> String {
        match stream_id {
            Some(id) => self.watchers_key(id),
            None => self.lobby_key(),
        }
    }

    /// Read a rustler's assignment. The outer `None` means no such rustler.
    async fn read_assignment(
        &self,
        id: &ConnectionId,
    ) -> Result<Option<Option<StreamId>>, StoreError> {
        let key = self.rustler_key(id);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;

        match raw {
            None => Ok(None),
            Some(raw) if raw.is_empty() => Ok(Some(None)),
            Some(raw) => raw
                .parse::<StreamId>()
                .map(|id| Some(Some(id)))
                .map_err(|e| StoreError::Corrupt {
                    key,
                    reason: e.to_string(),
                }),
        }
    }

    async fn read_members(&self, key: String) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.smembers(key).await?)
    }
}

fn ban_member(service: &str, channel: &str) -> String {
    format!("{}/{}", service, channel)
}

fn encode_assignment(stream_id: Option<StreamId>) -> String {
    stream_id.map(|id| id.to_string()).unwrap_or_default()
}

fn non_empty(fields: &mut HashMap<String, String>, name: &str) -> Option<String> {
    fields.remove(name).filter(|value| !value.is_empty())
}

#[async_trait]
impl PresenceStore for RedisStore {
    async fn create_rustler(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        ::redis::pipe()
            .atomic()
            .set(self.rustler_key(id), "")
            .ignore()
            .sadd(self.lobby_key(), id.as_str())
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_rustler(&self, id: &ConnectionId) -> Result<Option<Rustler>, StoreError> {
        Ok(self.read_assignment(id).await?.map(|stream_id| Rustler {
            id: id.clone(),
            stream_id,
        }))
    }

    async fn set_rustler_stream(
        &self,
        id: &ConnectionId,
        stream_id: Option<StreamId>,
    ) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .assign
            .key(self.rustler_key(id))
            .key(self.lobby_key())
            .key(self.membership_key(stream_id))
            .arg(id.as_str())
            .arg(encode_assignment(stream_id))
            .arg(self.stream_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(moved == 1)
    }

    async fn destroy_rustler(&self, id: &ConnectionId) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        self.remove
            .key(self.rustler_key(id))
            .key(self.lobby_key())
            .arg(id.as_str())
            .arg(self.stream_prefix())
            .invoke_async::<_, i64>(&mut conn)
            .await?;
        Ok(())
    }

    async fn find_rustlers_watching_or_idle(
        &self,
        stream_id: StreamId,
    ) -> Result<Vec<Rustler>, StoreError> {
        let watching = self.read_members(self.watchers_key(stream_id)).await?;
        let idle = self.read_members(self.lobby_key()).await?;

        let mut rustlers = Vec::with_capacity(watching.len() + idle.len());
        rustlers.extend(watching.into_iter().map(|id| Rustler {
            id: ConnectionId::new(id),
            stream_id: Some(stream_id),
        }));
        rustlers.extend(idle.into_iter().map(|id| Rustler {
            id: ConnectionId::new(id),
            stream_id: None,
        }));
        Ok(rustlers)
    }

    async fn count_rustlers(&self, stream_id: StreamId) -> Result<u64, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn.scard(self.watchers_key(stream_id)).await?)
    }

    async fn find_stream(&self, id: StreamId) -> Result<Option<Stream>, StoreError> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, String> = conn.hgetall(self.stream_key(id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let key = self.stream_key(id);
        let service = non_empty(&mut fields, "service").ok_or_else(|| StoreError::Corrupt {
            key: key.clone(),
            reason: "missing service".to_string(),
        })?;
        let channel = non_empty(&mut fields, "channel").ok_or_else(|| StoreError::Corrupt {
            key,
            reason: "missing channel".to_string(),
        })?;

        Ok(Some(Stream {
            id,
            service,
            channel,
            overrustle_id: non_empty(&mut fields, "overrustle_id"),
        }))
    }

    async fn find_stream_by_alias(&self, alias: &str) -> Result<Option<Stream>, StoreError> {
        let key = self.alias_key(alias);
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&key).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let id = raw.parse::<StreamId>().map_err(|e| StoreError::Corrupt {
            key,
            reason: e.to_string(),
        })?;
        self.find_stream(id).await
    }

    async fn find_or_create_stream(&self, stream: Stream) -> Result<(Stream, bool), StoreError> {
        let mut conn = self.conn.clone();

        // SADD decides which caller owns creation.
        let added: u64 = conn.sadd(self.streams_key(), stream.id.get()).await?;
        if added == 0 {
            // The winner may not have written the hash yet; its fields are
            // identical apart from the alias.
            let existing = self.find_stream(stream.id).await?;
            return Ok((existing.unwrap_or(stream), false));
        }

        let key = self.stream_key(stream.id);
        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .hset(&key, "service", &stream.service)
            .ignore()
            .hset(&key, "channel", &stream.channel)
            .ignore();
        if let Some(alias) = &stream.overrustle_id {
            pipe.hset(&key, "overrustle_id", alias)
                .ignore()
                .set(self.alias_key(alias), stream.id.get())
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        debug!(stream = %stream.id, "Created stream record");
        Ok((stream, true))
    }

    async fn destroy_empty_stream(&self, id: StreamId) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .collect
            .key(self.watchers_key(id))
            .key(self.streams_key())
            .key(self.stream_key(id))
            .arg(id.get())
            .arg(self.alias_prefix())
            .invoke_async(&mut conn)
            .await?;
        Ok(removed == 1)
    }

    async fn streams_with_rustlers(&self) -> Result<Vec<(Stream, u64)>, StoreError> {
        let members = self.read_members(self.streams_key()).await?;

        let mut listing = Vec::new();
        for member in members {
            let Ok(id) = member.parse::<StreamId>() else {
                continue;
            };
            let count = self.count_rustlers(id).await?;
            if count == 0 {
                continue;
            }
            if let Some(stream) = self.find_stream(id).await? {
                listing.push((stream, count));
            }
        }
        sort_listing(&mut listing);

        Ok(listing)
    }

    async fn is_banned(&self, service: &str, channel: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn.clone();
        Ok(conn
            .sismember(self.banned_key(), ban_member(service, channel))
            .await?)
    }

    async fn find_user(&self, name: &str) -> Result<Option<User>, StoreError> {
        let mut conn = self.conn.clone();
        let mut fields: HashMap<String, String> = conn.hgetall(self.user_key(name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        Ok(Some(User {
            name: name.to_string(),
            service: non_empty(&mut fields, "service"),
            channel: non_empty(&mut fields, "channel"),
        }))
    }
}
