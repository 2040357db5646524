//! Runtime configuration for the session server

use clap::ValueEnum;
use shared::{TransformLimits, DEFAULT_WORLD_BOUND};
use std::time::Duration;

/// What the tick broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    /// Only players whose state changed since the previous tick.
    Delta,
    /// Every player, every tick.
    Snapshot,
}

/// Everything the server needs to start, with defaults matching the CLI.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// `host:port` for the WebSocket listener
    pub bind_address: String,
    /// Interval between broadcasts
    pub tick_duration: Duration,
    /// Connections beyond this are turned away with "Server full"
    pub max_clients: usize,
    pub sync_mode: SyncMode,
    /// Include a recipient's own entry in its `stateUpdate`.
    pub echo_self: bool,
    /// Close connections that stay silent this long. `None` relies on the
    /// transport keepalive alone.
    pub idle_timeout: Option<Duration>,
    /// Per-connection outbound queue length. Messages beyond it are dropped.
    pub outbound_queue: usize,
    /// Bounds applied to submitted transforms
    pub limits: TransformLimits,
    /// Horizontal jitter applied around the spawn point.
    pub spawn_radius: f32,
    /// Malformed events tolerated per window before disconnecting. 0 disables.
    pub max_malformed: u32,
    /// Window over which malformed events are counted
    pub malformed_window: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            tick_duration: tick_duration_for(20),
            max_clients: 64,
            sync_mode: SyncMode::Delta,
            echo_self: false,
            idle_timeout: None,
            outbound_queue: 256,
            limits: TransformLimits {
                world_bound: DEFAULT_WORLD_BOUND,
            },
            spawn_radius: 0.0,
            max_malformed: 10,
            malformed_window: Duration::from_secs(5),
        }
    }
}

/// Converts a tick rate in Hz into an interval, clamping nonsense rates to 1Hz.
pub fn tick_duration_for(tick_rate: u32) -> Duration {
    Duration::from_nanos(1_000_000_000 / tick_rate.max(1) as u64)
}
