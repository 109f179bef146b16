//! Post-handover traffic routing: one mux over the UART, fanned out per
//! DLCI to stdout, the debug log, or a tool server.

use linkmux::{Mux, RxFrame};
use std::collections::HashMap;

/// Where frames received on a DLCI go.
#[derive(Debug, Clone, Copy)]
pub enum Sink {
    /// Raw payload bytes to stdout.
    Console,
    /// Hexdump to the debug log.
    Debug,
    /// Length-prefixed envelope to every client of the tool server at this
    /// index.
    Tool(usize),
}

/// The host's end of the multiplexed link.
pub struct LinkEndpoint {
    mux: Mux,
    sinks: HashMap<u8, Sink>,
}

impl LinkEndpoint {
    pub fn new() -> Self {
        Self {
            mux: Mux::new(),
            sinks: HashMap::new(),
        }
    }

    /// Install the consumer for a DLCI, replacing any prior one. Frames for
    /// DLCIs without a consumer are discarded.
    pub fn register(&mut self, dlci: u8, sink: Sink) {
        self.sinks.insert(dlci, sink);
    }

    pub fn sink_for(&self, dlci: u8) -> Option<Sink> {
        self.sinks.get(&dlci).copied()
    }

    /// Absorb one byte from the UART; framing errors are logged and the
    /// decoder resynchronizes on its own.
    pub fn feed(&mut self, byte: u8) -> Option<RxFrame> {
        match self.mux.feed(byte) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("link decode error: {e}");
                None
            }
        }
    }

    /// Queue a frame towards the phone. Returns whether anything was queued
    /// so the caller knows to raise write interest on the UART.
    pub fn send_to_phone(&mut self, dlci: u8, payload: &[u8]) -> bool {
        log::debug!("sending {} bytes to phone on dlci {dlci}", payload.len());
        match self.mux.enqueue(dlci, payload) {
            Ok(()) => true,
            Err(e) => {
                log::error!("dropping frame for dlci {dlci}: {e}");
                false
            }
        }
    }

    pub fn pull(&mut self) -> Option<u8> {
        self.mux.pull()
    }

    pub fn has_pending(&self) -> bool {
        self.mux.has_pending()
    }
}

pub fn hexdump(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_replaces_sink() {
        let mut link = LinkEndpoint::new();
        link.register(linkmux::DLCI_LOADER, Sink::Tool(0));
        link.register(linkmux::DLCI_LOADER, Sink::Tool(1));
        assert!(matches!(
            link.sink_for(linkmux::DLCI_LOADER),
            Some(Sink::Tool(1))
        ));
        assert!(link.sink_for(linkmux::DLCI_CONSOLE).is_none());
    }

    #[test]
    fn test_oversize_send_dropped() {
        let mut link = LinkEndpoint::new();
        assert!(!link.send_to_phone(linkmux::DLCI_L1A_L23, &[0u8; 513]));
        assert!(!link.has_pending());
        assert!(link.send_to_phone(linkmux::DLCI_L1A_L23, &[0u8; 512]));
        assert!(link.has_pending());
    }

    #[test]
    fn test_hexdump_format() {
        assert_eq!(hexdump(&[0x00, 0x41, 0xff]), "00 41 ff");
    }
}
