//! Fixed-cadence state broadcast
//!
//! Each tick gathers either the delta since the previous tick or a full
//! snapshot and fans it out to every connection. Fan-out uses the
//! per-connection bounded queues, so one slow client never delays the rest.

use crate::config::{ServerConfig, SyncMode};
use crate::connection_manager::{encode, ConnectionManager};
use log::debug;
use shared::{PlayerState, ServerMessage};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Outcome of one tick, used for periodic monitoring.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    /// Player entries broadcast this tick
    pub players: usize,
    /// Connections a message was queued for
    pub recipients: usize,
    /// Connections whose queue was full or closed
    pub dropped: usize,
}

/// Fixed-rate broadcaster of player state to every active connection.
pub struct SyncEngine {
    connections: Arc<ConnectionManager>,
    mode: SyncMode,
    echo_self: bool,
    tick_duration: Duration,
    tick: u64,
}

impl SyncEngine {
    /// Creates an engine over `connections` using the configured mode and echo policy.
    pub fn new(connections: Arc<ConnectionManager>, config: &ServerConfig) -> Self {
        Self {
            connections,
            mode: config.sync_mode,
            echo_self: config.echo_self,
            tick_duration: config.tick_duration,
            tick: 0,
        }
    }

    /// Ticks completed so far.
    pub fn tick_count(&self) -> u64 {
        self.tick
    }

    /// Runs one broadcast cycle.
    ///
    /// The registry read lock is held across the store read and the fan-out so
    /// a disconnect cannot slip between them: a `playerLeft` is never followed
    /// by a tick entry for the same player.
    pub async fn tick(&mut self) -> TickReport {
        self.tick += 1;

        let peers = self.connections.peers().await;
        let store = self.connections.store();
        let states: Vec<PlayerState> = match self.mode {
            SyncMode::Delta => store.take_delta().await,
            SyncMode::Snapshot => store.snapshot().await,
        };

        let mut report = TickReport {
            players: states.len(),
            ..Default::default()
        };
        if states.is_empty() || peers.is_empty() {
            return report;
        }

        if self.echo_self {
            let Some(message) = encode(&ServerMessage::StateUpdate(states)) else {
                return report;
            };
            for peer in peers.values() {
                if peer.send(message.clone()) {
                    report.recipients += 1;
                } else {
                    report.dropped += 1;
                }
            }
        } else {
            for peer in peers.values() {
                let others: Vec<PlayerState> = states
                    .iter()
                    .filter(|state| state.id != peer.player_id)
                    .cloned()
                    .collect();
                if others.is_empty() {
                    continue;
                }
                let Some(message) = encode(&ServerMessage::StateUpdate(others)) else {
                    continue;
                };
                if peer.send(message) {
                    report.recipients += 1;
                } else {
                    report.dropped += 1;
                }
            }
        }

        report
    }

    /// Ticks forever at the configured cadence.
    pub async fn run(mut self) {
        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        // The first tick fires immediately.
        tick_interval.tick().await;

        loop {
            tick_interval.tick().await;
            let now = Instant::now();
            let dt = now.duration_since(last_tick).as_secs_f32();
            last_tick = now;

            let report = self.tick().await;

            // Periodic monitoring
            if self.tick % 100 == 0 && report.players > 0 {
                debug!(
                    "Tick {}: {} players sent to {} clients ({} dropped), {:.1}Hz",
                    self.tick,
                    report.players,
                    report.recipients,
                    report.dropped,
                    1.0 / dt
                );
            }
        }
    }
}
