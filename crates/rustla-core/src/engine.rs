//! The presence engine.
//!
//! Drives each connection through `Lobby ⇄ Watching(stream)`, keeps watcher
//! counts fresh for every local connection that can see them, and tells other
//! processes to do the same through the relay.

use rustla_protocol::{ClientEvent, RelayCommand, ServerEvent, StreamId, StreamView};
use rustla_relay::Relay;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::identity::{resolve, resolve_alias, AliasResolution};
use crate::registry::{ConnectionId, ConnectionRegistry, Outbox};
use crate::store::{PresenceStore, StoreError, Stream};

/// Engine errors.
///
/// Rejected stream requests are not errors; they move the viewer to the lobby.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Store error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Presence engine shared by every connection task of a process.
pub struct PresenceEngine {
    store: Arc<dyn PresenceStore>,
    registry: Arc<ConnectionRegistry>,
    relay: Arc<dyn Relay>,
}

impl PresenceEngine {
    /// Create a new engine.
    #[must_use]
    pub fn new(
        store: Arc<dyn PresenceStore>,
        registry: Arc<ConnectionRegistry>,
        relay: Arc<dyn Relay>,
    ) -> Self {
        info!(relay = relay.name(), "Creating presence engine");
        Self {
            store,
            registry,
            relay,
        }
    }

    /// Get the store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PresenceStore> {
        &self.store
    }

    /// Get the connection registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Name of the relay in use.
    #[must_use]
    pub fn relay_name(&self) -> &'static str {
        self.relay.name()
    }

    /// Accept a new connection into the lobby.
    ///
    /// Nothing is broadcast; the viewer is silent until it picks a stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the rustler cannot be persisted. The connection is
    /// unregistered again in that case.
    pub async fn connect(&self, outbox: Outbox) -> Result<ConnectionId, EngineError> {
        let id = ConnectionId::generate();
        self.registry.register(id.clone(), outbox);

        if let Err(e) = self.store.create_rustler(&id).await {
            self.registry.unregister(&id);
            return Err(e.into());
        }

        debug!(connection = %id, "Rustler connected");
        Ok(id)
    }

    /// Remove a connection and recompute the stream it was watching.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn disconnect(&self, id: &ConnectionId) -> Result<(), EngineError> {
        self.registry.unregister(id);

        let Some(rustler) = self.store.find_rustler(id).await? else {
            debug!(connection = %id, "Disconnect for unknown rustler");
            return Ok(());
        };
        self.store.destroy_rustler(id).await?;

        debug!(connection = %id, stream = ?rustler.stream_id, "Rustler disconnected");

        if let Some(stream_id) = rustler.stream_id {
            self.recompute(stream_id).await?;
        }
        Ok(())
    }

    /// Dispatch an inbound event.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn handle(&self, id: &ConnectionId, event: ClientEvent) -> Result<(), EngineError> {
        trace!(connection = %id, event = event.name(), "Handling event");

        match event {
            ClientEvent::GetStream { stream_id } => self.get_stream(id, stream_id).await,
            ClientEvent::SetStream { channel, service } => {
                self.set_stream(id, channel.as_deref(), service.as_deref())
                    .await
            }
        }
    }

    /// Point a connection at a stream.
    ///
    /// A channel without a service is an alias. Both absent, an unresolvable
    /// request, or a banned stream all move the viewer to the lobby.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_stream(
        &self,
        id: &ConnectionId,
        channel: Option<&str>,
        service: Option<&str>,
    ) -> Result<(), EngineError> {
        let channel = channel.filter(|channel| !channel.is_empty());
        let service = service.filter(|service| !service.is_empty());

        let candidate = match (channel, service) {
            (None, None) => return self.set_lobby(id).await,
            (None, Some(service)) => {
                debug!(connection = %id, service, "Service without channel");
                return self.set_lobby(id).await;
            }
            (Some(alias), None) => match resolve_alias(self.store.as_ref(), alias).await? {
                AliasResolution::Linked(stream) => stream,
                AliasResolution::Resolved(canonical) => canonical.into_stream(),
                AliasResolution::Rejected(rejection) => {
                    debug!(connection = %id, alias, reason = %rejection, "Alias rejected");
                    return self.set_lobby(id).await;
                }
            },
            (Some(channel), Some(service)) => match resolve(service, channel) {
                Ok(canonical) => canonical.into_stream(),
                Err(rejection) => {
                    debug!(connection = %id, reason = %rejection, "Stream rejected");
                    return self.set_lobby(id).await;
                }
            },
        };

        if self
            .store
            .is_banned(&candidate.service, &candidate.channel)
            .await?
        {
            debug!(connection = %id, stream = %candidate.id, "Stream is banned");
            return self.set_lobby(id).await;
        }

        self.watch(id, candidate).await
    }

    /// Move a connection into an accepted stream.
    async fn watch(&self, id: &ConnectionId, candidate: Stream) -> Result<(), EngineError> {
        let Some(previous) = self.store.find_rustler(id).await? else {
            debug!(connection = %id, "Rustler vanished before stream change");
            return Ok(());
        };

        // Seat the watcher before the record exists: a concurrent collection
        // either counts it, or runs first and the record is created again below.
        if !self.store.set_rustler_stream(id, Some(candidate.id)).await? {
            debug!(connection = %id, "Rustler vanished during stream change");
            return Ok(());
        }

        let (stream, created) = self.store.find_or_create_stream(candidate).await?;
        if created {
            debug!(stream = %stream.id, service = %stream.service, channel = %stream.channel, "Created stream");
        }

        let rustlers = self.store.count_rustlers(stream.id).await?;
        self.registry
            .send(id, ServerEvent::StreamSet(Some(stream.view(rustlers))));

        self.recompute(stream.id).await?;
        if created {
            self.lobby_broadcast().await?;
        }
        if let Some(previous) = previous.stream_id.filter(|previous| *previous != stream.id) {
            self.recompute(previous).await?;
        }
        Ok(())
    }

    /// Move a connection to the lobby and send it the listing.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn set_lobby(&self, id: &ConnectionId) -> Result<(), EngineError> {
        let Some(previous) = self.store.find_rustler(id).await? else {
            debug!(connection = %id, "Rustler vanished before lobby change");
            return Ok(());
        };
        if !self.store.set_rustler_stream(id, None).await? {
            debug!(connection = %id, "Rustler vanished during lobby change");
            return Ok(());
        }

        self.registry.send(id, ServerEvent::StreamSet(None));

        if let Some(previous) = previous.stream_id {
            self.recompute(previous).await?;
        }

        let listing = self.lobby_listing().await?;
        self.registry.send(id, ServerEvent::StreamsSet(listing));
        Ok(())
    }

    /// Reply with a stream and its count, or `null` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn get_stream(
        &self,
        id: &ConnectionId,
        stream_id: StreamId,
    ) -> Result<(), EngineError> {
        let view = match self.store.find_stream(stream_id).await? {
            Some(stream) => {
                let rustlers = self.store.count_rustlers(stream_id).await?;
                Some(stream.view(rustlers))
            }
            None => None,
        };

        self.registry.send(id, ServerEvent::StreamGet(view));
        Ok(())
    }

    /// Push a stream's fresh count, collect it if empty, and relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn recompute(&self, stream_id: StreamId) -> Result<(), EngineError> {
        let rustlers = self.push_count(stream_id).await?;

        let destroyed = rustlers == 0 && self.store.destroy_empty_stream(stream_id).await?;
        if destroyed {
            debug!(stream = %stream_id, "Destroyed empty stream");
        }

        self.publish(RelayCommand::UpdateRustlers(stream_id)).await;

        if destroyed {
            self.lobby_broadcast().await?;
        }
        Ok(())
    }

    /// Send `RUSTLERS_SET` to local connections watching the stream or idle.
    async fn push_count(&self, stream_id: StreamId) -> Result<u64, EngineError> {
        let (rustlers, audience) = tokio::try_join!(
            self.store.count_rustlers(stream_id),
            self.store.find_rustlers_watching_or_idle(stream_id),
        )?;

        let event = Arc::new(ServerEvent::RustlersSet {
            stream_id,
            rustlers,
        });
        let delivered = audience
            .iter()
            .filter(|rustler| self.registry.send_shared(&rustler.id, Arc::clone(&event)))
            .count();

        trace!(stream = %stream_id, rustlers, recipients = delivered, "Pushed count");
        Ok(rustlers)
    }

    /// Push the lobby listing to every local connection and relay.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn lobby_broadcast(&self) -> Result<(), EngineError> {
        self.push_listing().await?;
        self.publish(RelayCommand::UpdateLobby).await;
        Ok(())
    }

    async fn push_listing(&self) -> Result<usize, EngineError> {
        let listing = self.lobby_listing().await?;
        Ok(self.registry.broadcast(ServerEvent::StreamsSet(listing)))
    }

    /// Streams with watchers, busiest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn lobby_listing(&self) -> Result<Vec<StreamView>, EngineError> {
        Ok(self
            .store
            .streams_with_rustlers()
            .await?
            .into_iter()
            .map(|(stream, rustlers)| stream.view(rustlers))
            .collect())
    }

    /// Run the local half of a command published by another process.
    ///
    /// Never re-relays, and never collects streams; the publishing process
    /// already did.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub async fn apply_relay(&self, command: RelayCommand) -> Result<(), EngineError> {
        trace!(command = command.name(), "Applying relay command");

        match command {
            RelayCommand::UpdateRustlers(stream_id) => {
                self.push_count(stream_id).await?;
            }
            RelayCommand::UpdateLobby => {
                self.push_listing().await?;
            }
        }
        Ok(())
    }

    async fn publish(&self, command: RelayCommand) {
        if let Err(e) = self.relay.publish(command).await {
            warn!(
                relay = self.relay.name(),
                command = command.name(),
                error = %e,
                "Relay publish failed"
            );
        }
    }

    /// Disconnect every local connection.
    ///
    /// Returns the number of connections drained.
    pub async fn shutdown(&self) -> usize {
        let ids = self.registry.drain();
        for id in &ids {
            if let Err(e) = self.disconnect(id).await {
                warn!(connection = %id, error = %e, "Failed to remove rustler on shutdown");
            }
        }

        info!(connections = ids.len(), "Presence engine shut down");
        ids.len()
    }
}
