//! Runtime configuration for the hub server.
//!
//! `ServerConfig` groups every tunable the broker reads. The binary fills it
//! from command-line flags; tests build it from `Default` and override the
//! handful of fields they care about.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the WebSocket listener binds to
    pub bind_addr: String,
    /// Maximum number of concurrently registered connections
    pub max_connections: usize,
    /// Largest accepted inbound frame, in bytes
    pub max_message_size: usize,
    /// Interval between liveness probes; a connection is evicted after two
    /// intervals without a pong
    pub ping_interval: Duration,
    /// Interval between idle session / room sweeps
    pub cleanup_interval: Duration,
    /// Interval between periodic stats log lines
    pub stats_interval: Duration,
    /// Fixed rate-limit window length
    pub rate_limit_window: Duration,
    /// Messages allowed per connection inside one window
    pub rate_limit_max_messages: u32,
    /// Shared secret required to identify as `admin`; admin is refused when unset
    pub admin_token: Option<String>,
    pub sessions: SessionConfig,
    pub rooms: RoomConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_connections: 1000,
            max_message_size: 64 * 1024,
            ping_interval: Duration::from_secs(10),
            cleanup_interval: Duration::from_secs(60),
            stats_interval: Duration::from_secs(300),
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max_messages: 200,
            admin_token: None,
            sessions: SessionConfig::default(),
            rooms: RoomConfig::default(),
        }
    }
}

/// Session table limits and code-generation policy.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Number of digits in a session code
    pub code_length: u32,
    /// How long a released code stays out of circulation
    pub code_cooldown: Duration,
    /// Generation attempts before giving up with `CODE_SPACE_EXHAUSTED`
    pub max_code_attempts: u32,
    pub max_sessions: usize,
    /// Sessions without activity for this long are ended by the sweep
    pub session_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            code_length: 4,
            code_cooldown: Duration::from_secs(300),
            max_code_attempts: 100,
            max_sessions: 500,
            session_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RoomConfig {
    pub max_rooms: usize,
    pub default_max_players: usize,
    /// Settle window between STARTING and PLAYING
    pub start_delay: Duration,
    /// Players without activity for this long are dropped by the sweep
    pub player_timeout: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            max_rooms: 200,
            default_max_players: 8,
            start_delay: Duration::from_secs(3),
            player_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Rooms need at least two players and never more than a multiplayer
/// session's sensor budget.
pub const MIN_ROOM_PLAYERS: usize = 2;
pub const MAX_ROOM_PLAYERS: usize = shared::MAX_MULTIPLAYER_SENSORS;
