//! statewire - Real-time state synchronization
//!
//! A server holds one authoritative state tree and streams minimal diffs of
//! it to every connected client over WebSockets or data channels. Clients
//! keep a mirror of the tree and exchange events and requests with the
//! server.

pub mod config;
pub mod negotiation;
pub mod network;
pub mod protocol;
pub mod state;
