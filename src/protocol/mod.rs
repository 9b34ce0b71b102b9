//! Protocol module - Defines the wire protocol for statewire communication
//!
//! Every transport message carries one event:
//! - 2 magic bytes
//! - 1 byte protocol version
//! - the bincode encoded `(name, args)` tuple

mod codec;
mod event;

pub use codec::*;
pub use event::*;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u8 = 1;

/// Default port for the socket listener
pub const DEFAULT_PORT: u16 = 3000;

/// Default path prefix for socket upgrades and signaling calls
pub const DEFAULT_ROUTE: &str = "/statewire";

/// Magic bytes for protocol identification
pub const MAGIC_BYTES: [u8; 2] = [0x53, 0x57]; // "SW"
