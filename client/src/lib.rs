//! # Sensor Hub Client Library
//!
//! A headless client for the sensor hub. It connects over WebSocket, speaks
//! the JSON protocol from the `shared` crate and can play either side of a
//! pairing: a display that opens sessions, or a phone that joins one and
//! streams motion data.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! [`HubClient`]: connect, send typed or raw frames, receive with a deadline,
//! wait for a specific message type. Server pings are answered automatically.
//!
//! ### Sensor Module (`sensor`)
//! [`SensorSimulator`]: a seeded generator of orientation, acceleration and
//! rotation-rate readings shaped like a phone's motion events.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{HubClient, SensorSimulator};
//! use shared::{ClientMessage, ClientRole};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut phone = HubClient::connect("ws://127.0.0.1:3000").await?;
//!     phone.identify(ClientRole::Sensor).await?;
//!     phone
//!         .send(&ClientMessage::JoinSession {
//!             session_code: "4821".to_string(),
//!             sensor_id: None,
//!         })
//!         .await?;
//!     phone.recv_until("session:joined", Duration::from_secs(5)).await?;
//!
//!     let mut sim = SensorSimulator::new();
//!     phone
//!         .send(&ClientMessage::SensorData { data: sim.next_frame() })
//!         .await?;
//!     Ok(())
//! }
//! ```

pub mod network;
pub mod sensor;

pub use network::{ClientError, HubClient};
pub use sensor::SensorSimulator;
