//! Request/response transport between the orchestrator and a sandboxed script.
//!
//! The script side runs a [`BridgeServer`] on the port and mount path it was
//! given; the orchestrator polls it with a [`BridgeClient`] until it answers,
//! then sends exactly one `start` event and receives the reply as a
//! [`BridgeMessage`].

pub mod client;
pub mod server;

pub use client::{BridgeClient, BridgeError, BridgeEvents, BridgeMessage};
pub use server::{BridgeServer, EventHandler};
