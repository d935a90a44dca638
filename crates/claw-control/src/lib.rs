//! Control client for the OpenClaw gateway.
//!
//! [`GatewayClient`] keeps one WebSocket to the gateway open, proves the
//! local device identity during the handshake, caches the device tokens the
//! gateway issues, and correlates request/response frames. It reconnects
//! with capped exponential backoff until stopped.
//!
//! ```no_run
//! use std::sync::Arc;
//! use claw_control::{GatewayClient, GatewayClientOptions};
//! use claw_persist::FileStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(FileStore::new("/var/lib/claw-control"));
//! let client = GatewayClient::new(GatewayClientOptions::new("ws://127.0.0.1:18789"), store, ());
//! client.start();
//! let health = client.request("health", serde_json::json!({})).await?;
//! println!("{health}");
//! client.stop();
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod events;
pub mod options;
pub mod protocol;
pub mod reconnect;
pub mod state;

pub use client::GatewayClient;
pub use config::ControlConfig;
pub use error::GatewayError;
pub use events::{
    ChannelHandler, CloseInfo, GatewayHandler, GatewayNotification, SequenceGap, SequenceTracker,
};
pub use options::GatewayClientOptions;
pub use protocol::{EventFrame, GatewayFrame, PROTOCOL_VERSION};
pub use reconnect::{Backoff, ReconnectPolicy};
pub use state::ConnectionState;
