//! # Sensor Hub Server Library
//!
//! This library implements a real-time hub that pairs display screens with
//! phone sensors over WebSocket. A display opens a session and receives a
//! short numeric code; phones join with that code and stream motion data,
//! which the hub forwards to the display with minimal latency.
//!
//! ## Core Responsibilities
//!
//! ### Session Pairing
//! Each session belongs to one display and accepts a fixed number of sensor
//! slots depending on its game mode (`solo`, `dual`, `multiplayer`). Session
//! codes are unique among live sessions and stay out of circulation for a
//! cooldown period after release.
//!
//! ### Multiplayer Rooms
//! Displays running a multiplayer session can open rooms, gather players,
//! mark them ready and drive a room-wide game lifecycle. State updates from
//! one player are relayed to the others.
//!
//! ### Connection Health
//! Every connection is rate limited, pinged periodically and evicted after
//! two missed pongs. All teardown goes through one disconnect path so that
//! sessions and rooms are cleaned up exactly once.
//!
//! ## Architecture Design
//!
//! ### Shared State Behind Async Locks
//! Three managers hold the mutable state: connections, sessions and rooms.
//! The router takes their locks in a fixed order and never delivers a
//! message while a session or room lock is held.
//!
//! ### Task Per Connection
//! The listener spawns a reader task and a writer task per socket. Outbound
//! traffic goes through an unbounded channel owned by the connection table,
//! so dropping a connection also finishes its writer.
//!
//! ## Module Organization
//!
//! ### Connection Manager (`connection_manager`)
//! Connection table, roles, rate windows, liveness probing and fan-out.
//!
//! ### Session Manager (`session_manager`)
//! Session codes, sensor slots and the per-session state machine.
//!
//! ### Game State (`game_state`)
//! Multiplayer rooms, players, readiness and the room state machine.
//!
//! ### Router (`router`)
//! Envelope validation, role-based dispatch and disconnect handling.
//!
//! ### Network (`network`)
//! WebSocket listener, per-connection tasks and background timers.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::{Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ServerConfig {
//!         bind_addr: "0.0.0.0:3000".to_string(),
//!         ..ServerConfig::default()
//!     };
//!
//!     let server = Server::bind(config).await?;
//!     let shutdown = server.shutdown_handle();
//!
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.shutdown();
//!     });
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Extra behaviour can be attached through [`hooks::Hooks`] and passed to
//! [`Server::bind_with_hooks`]; handlers run after the state change they
//! observe and outside every manager lock.

pub mod config;
pub mod connection;
pub mod connection_manager;
pub mod error;
pub mod game_state;
pub mod hooks;
pub mod metrics;
pub mod network;
pub mod router;
pub mod session_manager;
pub mod utils;

pub use config::ServerConfig;
pub use error::BrokerError;
pub use network::{Server, ServerError, ShutdownHandle};
