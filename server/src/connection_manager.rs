//! Connection lifecycle and identity for the session server
//!
//! This module owns every live connection and the player identity bound to it:
//! - Player id assignment on connect, with a welcome snapshot and join broadcast
//! - Inbound event dispatch, resolving identity from the connection only
//! - Malformed-event accounting and the disconnect policy built on it
//! - Idempotent teardown with a departure broadcast
//!
//! Connects and disconnects are serialised by the registry write lock, and the
//! registry lock is always taken before the store lock.

use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::store::PlayerStore;
use log::{debug, info, warn};
use rand::Rng;
use shared::{
    validate_attributes, ClientMessage, PlayerId, PlayerLeft, PlayerState, ServerMessage,
    Transform, TransformLimits, UpdatePayload, SPAWN_POSITION,
};
use std::collections::HashMap;
use std::f32::consts::TAU;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{RwLock, RwLockReadGuard};
use tokio_tungstenite::tungstenite::Message;

/// Server-local handle for one transport connection, never sent to clients.
pub type ConnectionId = u64;

/// Sending half of a connection's bounded outbound queue.
pub type Outbound = mpsc::Sender<Message>;

/// Per-connection lifecycle. Only forward transitions exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Handshake done, player not yet announced.
    Connecting,
    /// Welcomed and receiving broadcasts.
    Active,
    /// Being torn down; inbound events are ignored.
    Disconnecting,
    Closed,
}

impl ConnectionState {
    /// Whether `next` is the single forward step from this state.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Connecting, ConnectionState::Active)
                | (ConnectionState::Active, ConnectionState::Disconnecting)
                | (ConnectionState::Disconnecting, ConnectionState::Closed)
        )
    }
}

/// What the transport should do with a connection after an inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Keep reading.
    Continue,
    /// Close the connection with a policy-violation code.
    Disconnect,
}

/// Sliding count of malformed events for one connection.
#[derive(Debug)]
struct MalformedTracker {
    window_start: Instant,
    count: u32,
}

impl MalformedTracker {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            count: 0,
        }
    }

    /// Records one malformed event and reports whether `max` was exceeded.
    fn record(&mut self, window: Duration, max: u32) -> bool {
        if self.window_start.elapsed() > window {
            self.window_start = Instant::now();
            self.count = 0;
        }
        self.count += 1;
        max > 0 && self.count > max
    }
}

/// A registered connection.
#[derive(Debug)]
pub(crate) struct Peer {
    pub(crate) player_id: PlayerId,
    addr: SocketAddr,
    state: ConnectionState,
    outbound: Outbound,
    malformed: MalformedTracker,
}

impl Peer {
    fn transition(&mut self, next: ConnectionState) -> Result<(), SessionError> {
        if !self.state.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Player {}: {:?} -> {:?}", self.player_id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Best-effort enqueue. A full queue drops this message for this peer only.
    pub(crate) fn send(&self, message: Message) -> bool {
        match self.outbound.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    "Outbound queue full for player {} ({}), dropping message",
                    self.player_id, self.addr
                );
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Outbound queue closed for player {}", self.player_id);
                false
            }
        }
    }
}

pub(crate) fn encode(message: &ServerMessage) -> Option<Message> {
    match message.encode() {
        Ok(text) => Some(Message::text(text)),
        Err(e) => {
            warn!("Failed to encode server message: {}", e);
            None
        }
    }
}

/// Tracks live connections and routes their events into the player store.
pub struct ConnectionManager {
    store: Arc<PlayerStore>,
    peers: RwLock<HashMap<ConnectionId, Peer>>,
    next_connection_id: AtomicU64,
    max_clients: usize,
    limits: TransformLimits,
    spawn_radius: f32,
    max_malformed: u32,
    malformed_window: Duration,
}

impl ConnectionManager {
    /// Creates an empty registry over `store`, taking limits and the
    /// malformed-event policy from `config`.
    pub fn new(store: Arc<PlayerStore>, config: &ServerConfig) -> Self {
        Self {
            store,
            peers: RwLock::new(HashMap::new()),
            next_connection_id: AtomicU64::new(1),
            max_clients: config.max_clients,
            limits: config.limits,
            spawn_radius: config.spawn_radius,
            max_malformed: config.max_malformed,
            malformed_window: config.malformed_window,
        }
    }

    /// The player store this manager writes to.
    pub fn store(&self) -> &Arc<PlayerStore> {
        &self.store
    }

    /// Registers a new connection and gives it a player.
    ///
    /// The newcomer receives `welcome` with every other player; everyone else
    /// receives `playerJoined`. Fails with `ServerFull` at capacity.
    pub async fn on_connect(
        &self,
        addr: SocketAddr,
        outbound: Outbound,
    ) -> Result<(ConnectionId, PlayerId), SessionError> {
        let mut peers = self.peers.write().await;
        if peers.len() >= self.max_clients {
            return Err(SessionError::ServerFull(self.max_clients));
        }

        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let transform = self.spawn_transform();

        // Fresh ids are checked against every active identity before use.
        let player_id = loop {
            let candidate = PlayerId::generate();
            if peers.values().any(|peer| peer.player_id == candidate) {
                continue;
            }
            if self.store.insert(candidate, transform.clone()).await {
                break candidate;
            }
        };

        let mut peer = Peer {
            player_id,
            addr,
            state: ConnectionState::Connecting,
            outbound,
            malformed: MalformedTracker::new(),
        };

        let others: Vec<PlayerState> = self
            .store
            .snapshot()
            .await
            .into_iter()
            .filter(|state| state.id != player_id)
            .collect();

        let welcome = ServerMessage::Welcome(shared::Welcome {
            self_id: player_id,
            snapshot: others,
        });
        if let Some(message) = encode(&welcome) {
            peer.send(message);
        }

        let joined = ServerMessage::PlayerJoined(PlayerState::new(player_id, transform));
        if let Some(message) = encode(&joined) {
            for other in peers.values() {
                other.send(message.clone());
            }
        }

        peer.transition(ConnectionState::Active)?;
        peers.insert(connection_id, peer);
        info!(
            "Client {} connected from {} as player {}",
            connection_id, addr, player_id
        );

        Ok((connection_id, player_id))
    }

    /// Tears a connection down, removing its player and announcing departure.
    ///
    /// Returns the departed player, or `None` if the connection was already
    /// cleaned up.
    pub async fn on_disconnect(&self, connection_id: ConnectionId) -> Option<PlayerId> {
        let mut peers = self.peers.write().await;
        let mut peer = peers.remove(&connection_id)?;

        if let Err(e) = peer.transition(ConnectionState::Disconnecting) {
            warn!("{}", e);
        }

        let player_id = peer.player_id;
        self.store.remove(&player_id).await;

        let left = ServerMessage::PlayerLeft(PlayerLeft { id: player_id });
        if let Some(message) = encode(&left) {
            for other in peers.values() {
                other.send(message.clone());
            }
        }

        if let Err(e) = peer.transition(ConnectionState::Closed) {
            warn!("{}", e);
        }
        info!(
            "Client {} ({}) disconnected, player {} removed",
            connection_id, peer.addr, player_id
        );

        // Dropping the peer drops its outbound sender, ending its writer task.
        Some(player_id)
    }

    /// Handles one inbound text frame from `connection_id`.
    pub async fn on_message(&self, connection_id: ConnectionId, text: &str) -> MessageOutcome {
        let player_id = match self.active_player(connection_id).await {
            Some(id) => id,
            None => {
                debug!("Message from closed connection {} dropped", connection_id);
                return MessageOutcome::Disconnect;
            }
        };

        let message = match ClientMessage::decode(text) {
            Ok(message) => message,
            Err(e) => return self.on_malformed(connection_id, e.into()).await,
        };

        match message {
            ClientMessage::Update(update) => {
                let (transform, timestamp, attributes) = match self.validate_update(update) {
                    Ok(parts) => parts,
                    Err(e) => return self.on_malformed(connection_id, e).await,
                };
                if let Err(e) = self
                    .store
                    .upsert(player_id, transform, timestamp, attributes)
                    .await
                {
                    if e.is_droppable() {
                        debug!("Dropped update from player {}: {}", player_id, e);
                    } else {
                        warn!("Failed to apply update from player {}: {}", player_id, e);
                    }
                }
            }
            ClientMessage::RequestSnapshot => self.send_snapshot(connection_id).await,
        }

        MessageOutcome::Continue
    }

    fn validate_update(
        &self,
        update: UpdatePayload,
    ) -> Result<(Transform, u64, Option<shared::Attributes>), SessionError> {
        let transform = update.transform.validate(&self.limits)?;
        if let Some(attributes) = &update.attributes {
            validate_attributes(attributes)?;
        }
        Ok((transform, update.timestamp, update.attributes))
    }

    /// Drops a malformed event and applies the malformed-rate policy.
    pub async fn on_malformed(
        &self,
        connection_id: ConnectionId,
        error: SessionError,
    ) -> MessageOutcome {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&connection_id) else {
            return MessageOutcome::Disconnect;
        };

        debug!("Dropped event from player {}: {}", peer.player_id, error);
        if peer
            .malformed
            .record(self.malformed_window, self.max_malformed)
        {
            warn!(
                "Player {} exceeded {} malformed events per {:?}, disconnecting",
                peer.player_id, self.max_malformed, self.malformed_window
            );
            MessageOutcome::Disconnect
        } else {
            MessageOutcome::Continue
        }
    }

    async fn active_player(&self, connection_id: ConnectionId) -> Option<PlayerId> {
        let peers = self.peers.read().await;
        peers
            .get(&connection_id)
            .filter(|peer| peer.state == ConnectionState::Active)
            .map(|peer| peer.player_id)
    }

    /// Replies with the full player set.
    ///
    /// The registry guard is held across the store read and the enqueue, so a
    /// concurrent teardown either lands before the snapshot is taken or after
    /// it is queued, never in between.
    async fn send_snapshot(&self, connection_id: ConnectionId) {
        let peers = self.peers.read().await;
        let Some(peer) = peers.get(&connection_id) else {
            return;
        };
        let snapshot = ServerMessage::Snapshot(self.store.snapshot().await);
        if let Some(message) = encode(&snapshot) {
            peer.send(message);
        }
    }

    /// Read access to the registry for tick fan-out.
    pub(crate) async fn peers(&self) -> RwLockReadGuard<'_, HashMap<ConnectionId, Peer>> {
        self.peers.read().await
    }

    /// Lifecycle state of a connection. Unknown connections report `Closed`.
    pub async fn state(&self, connection_id: ConnectionId) -> ConnectionState {
        self.peers
            .read()
            .await
            .get(&connection_id)
            .map(|peer| peer.state)
            .unwrap_or(ConnectionState::Closed)
    }

    /// Number of registered connections.
    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    /// True when no connection is registered.
    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    fn spawn_transform(&self) -> Transform {
        let [x, y, z] = SPAWN_POSITION;
        if self.spawn_radius <= 0.0 {
            return Transform::at(x, y, z);
        }
        let mut rng = rand::thread_rng();
        let angle = rng.gen_range(0.0..TAU);
        let distance = self.spawn_radius * rng.gen::<f32>().sqrt();
        Transform::at(x + distance * angle.cos(), y, z + distance * angle.sin())
    }
}
