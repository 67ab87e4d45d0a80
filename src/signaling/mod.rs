//! Signaling Module - Nachrichtenvertrag und Transport zum Rendezvous-Server
//!
//! Dieses Modul enthält:
//! - Den Wire-Vertrag (`SignalingMessage`)
//! - Den `SignalingChannel` Trait und einen In-Memory Kanal
//! - Einen WebSocket Client als Produktions-Transport
//!

mod channel;
mod client;
mod messages;

pub use channel::{memory_pair, MemoryEndpoint, MemorySignaling, SignalingChannel, SignalingError};
pub use client::{SignalingClient, SignalingEvent};
pub use messages::*;
