//! Byte-stream multiplexer for a shared UART.
//!
//! The link carries several logical subchannels, each tagged with a DLCI
//! (data link connection identifier). Frames are flag-delimited with byte
//! transparency; see [`frame`] for the wire format.

/// Frame encoding and decoding, one byte at a time in both directions.
pub mod frame;
pub use frame::{FrameError, Mux, RxFrame};

/// TPU debug output channel.
pub const DLCI_DEBUG: u8 = 4;
/// L1A <-> L23 signalling channel.
pub const DLCI_L1A_L23: u8 = 5;
/// Image loader control channel.
pub const DLCI_LOADER: u8 = 9;
/// Raw console text channel.
pub const DLCI_CONSOLE: u8 = 10;

/// Longest payload a single frame may carry, in either direction.
pub const MAX_PAYLOAD: usize = 512;
