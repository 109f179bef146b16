//! Frame format:
//! ```txt
//! | FLAG | ADDR | CTRL | payload ...          | FLAG |
//! | 7e   | dlci | 03   | 0..=512 bytes        | 7e   |
//! ```
//! `0x7e` and `0x7d` inside ADDR/CTRL/payload are sent as `0x7d, byte ^ 0x20`.
//! A closing flag may double as the next frame's opening flag.

use std::collections::VecDeque;
use thiserror::Error;

const FLAG: u8 = 0x7e;
const ESCAPE: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;
/// Unnumbered-information control field; the only one the link uses.
const CTRL_UI: u8 = 0x03;

#[derive(Debug, Clone, Copy, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {max} byte frame limit", max = crate::MAX_PAYLOAD)]
    Oversize(usize),
    #[error("incoming frame on dlci {0} exceeds {max} payload bytes, resynchronizing", max = crate::MAX_PAYLOAD)]
    RxOverrun(u8),
    #[error("flag inside an escape sequence, resynchronizing")]
    DanglingEscape,
}

/// A fully reassembled incoming frame.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RxFrame {
    pub dlci: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum RxState {
    /// No opening flag seen yet; discard until one arrives.
    Hunt,
    /// Between frames; repeated flags are idle fill.
    Addr,
    Ctrl,
    Data,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TxState {
    Idle,
    Addr,
    Ctrl,
    Data(usize),
}

struct TxFrame {
    dlci: u8,
    payload: Vec<u8>,
}

/// De/multiplexer state for one serial link.
///
/// RX side: push received bytes through [`feed`](Mux::feed) and collect
/// completed frames. TX side: queue frames with [`enqueue`](Mux::enqueue) and
/// drain the encoded byte stream with [`pull`](Mux::pull).
pub struct Mux {
    rx_state: RxState,
    rx_escaped: bool,
    rx_dlci: u8,
    rx_payload: Vec<u8>,

    tx_queue: VecDeque<TxFrame>,
    tx_state: TxState,
    tx_current: Option<TxFrame>,
    /// Second half of an escape sequence, still to be transmitted.
    tx_stuffed: Option<u8>,
}

impl Default for Mux {
    fn default() -> Self {
        Self::new()
    }
}

impl Mux {
    pub fn new() -> Self {
        Self {
            rx_state: RxState::Hunt,
            rx_escaped: false,
            rx_dlci: 0,
            rx_payload: Vec::new(),
            tx_queue: VecDeque::new(),
            tx_state: TxState::Idle,
            tx_current: None,
            tx_stuffed: None,
        }
    }

    /// Absorb one received byte. Returns a frame once its closing flag has
    /// been seen. On error the decoder has already reset itself and the
    /// caller may keep feeding.
    pub fn feed(&mut self, byte: u8) -> Result<Option<RxFrame>, FrameError> {
        if byte == FLAG {
            if self.rx_escaped {
                self.rx_escaped = false;
                self.rx_state = RxState::Addr;
                self.rx_payload.clear();
                return Err(FrameError::DanglingEscape);
            }
            return Ok(match self.rx_state {
                RxState::Hunt | RxState::Addr => {
                    self.rx_state = RxState::Addr;
                    None
                }
                // A flag before the control byte means the frame was cut
                // short; treat it as a fresh opening flag.
                RxState::Ctrl => {
                    self.rx_state = RxState::Addr;
                    None
                }
                RxState::Data => {
                    self.rx_state = RxState::Addr;
                    Some(RxFrame {
                        dlci: self.rx_dlci,
                        payload: std::mem::take(&mut self.rx_payload),
                    })
                }
            });
        }

        if byte == ESCAPE && !self.rx_escaped {
            self.rx_escaped = true;
            return Ok(None);
        }
        let byte = if self.rx_escaped {
            self.rx_escaped = false;
            byte ^ ESCAPE_XOR
        } else {
            byte
        };

        match self.rx_state {
            RxState::Hunt => {}
            RxState::Addr => {
                self.rx_dlci = byte;
                self.rx_payload.clear();
                self.rx_state = RxState::Ctrl;
            }
            RxState::Ctrl => {
                // CTRL is always UI; nothing worth keeping.
                self.rx_state = RxState::Data;
            }
            RxState::Data => {
                if self.rx_payload.len() == crate::MAX_PAYLOAD {
                    let dlci = self.rx_dlci;
                    self.rx_state = RxState::Hunt;
                    self.rx_payload.clear();
                    return Err(FrameError::RxOverrun(dlci));
                }
                self.rx_payload.push(byte);
            }
        }
        Ok(None)
    }

    /// Queue a frame for transmission. The caller is responsible for raising
    /// write interest on the underlying fd.
    pub fn enqueue(&mut self, dlci: u8, payload: &[u8]) -> Result<(), FrameError> {
        if payload.len() > crate::MAX_PAYLOAD {
            return Err(FrameError::Oversize(payload.len()));
        }
        self.tx_queue.push_back(TxFrame {
            dlci,
            payload: payload.to_vec(),
        });
        Ok(())
    }

    /// Produce the next byte of the encoded transmit stream, or `None` when
    /// the queue is drained (at which point the caller clears write
    /// interest).
    pub fn pull(&mut self) -> Option<u8> {
        if let Some(b) = self.tx_stuffed.take() {
            return Some(b ^ ESCAPE_XOR);
        }
        match self.tx_state {
            TxState::Idle => {
                self.tx_current = Some(self.tx_queue.pop_front()?);
                self.tx_state = TxState::Addr;
                Some(FLAG)
            }
            TxState::Addr => {
                let dlci = self.tx_current.as_ref().unwrap().dlci;
                self.tx_state = TxState::Ctrl;
                Some(self.stuff(dlci))
            }
            TxState::Ctrl => {
                self.tx_state = TxState::Data(0);
                Some(self.stuff(CTRL_UI))
            }
            TxState::Data(i) => {
                let frame = self.tx_current.as_ref().unwrap();
                if i < frame.payload.len() {
                    let byte = frame.payload[i];
                    self.tx_state = TxState::Data(i + 1);
                    return Some(self.stuff(byte));
                }
                self.tx_current = None;
                self.tx_state = TxState::Idle;
                Some(FLAG)
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.tx_stuffed.is_some() || self.tx_current.is_some() || !self.tx_queue.is_empty()
    }

    fn stuff(&mut self, byte: u8) -> u8 {
        if byte == FLAG || byte == ESCAPE {
            self.tx_stuffed = Some(byte);
            ESCAPE
        } else {
            byte
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn drain(mux: &mut Mux) -> Vec<u8> {
        let mut out = vec![];
        while let Some(b) = mux.pull() {
            out.push(b);
        }
        out
    }

    fn feed_all(mux: &mut Mux, bytes: &[u8]) -> Vec<RxFrame> {
        let mut frames = vec![];
        for &b in bytes {
            if let Ok(Some(f)) = mux.feed(b) {
                frames.push(f);
            }
        }
        frames
    }

    #[test]
    fn test_encoded_frame_layout() {
        let mut mux = Mux::new();
        mux.enqueue(crate::DLCI_L1A_L23, &[0xaa, 0xbb, 0xcc]).unwrap();
        assert!(mux.has_pending());
        let wire = drain(&mut mux);
        assert_eq!(wire, [0x7e, 0x05, 0x03, 0xaa, 0xbb, 0xcc, 0x7e]);
        assert!(!mux.has_pending());
    }

    #[test]
    fn test_stuffing_round_trip() {
        let payload = [0x7e, 0x00, 0x7d, 0x7e, 0x5e, 0x5d];
        let mut tx = Mux::new();
        tx.enqueue(0x7e, &payload).unwrap();
        let wire = drain(&mut tx);
        // no bare flags except the two delimiters
        assert_eq!(wire.iter().filter(|&&b| b == 0x7e).count(), 2);

        let mut rx = Mux::new();
        let frames = feed_all(&mut rx, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].dlci, 0x7e);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn test_garbage_between_frames() {
        let mut tx = Mux::new();
        tx.enqueue(crate::DLCI_CONSOLE, b"hello").unwrap();
        let mut wire = vec![0x41, 0x42, 0x43];
        wire.extend(drain(&mut tx));
        wire.extend([0x00, 0x51]);

        let mut rx = Mux::new();
        let frames = feed_all(&mut rx, &wire);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hello");
    }

    #[test]
    fn test_shared_flag_between_frames() {
        // two frames with a single flag separating them
        let wire = [0x7e, 10, 0x03, 0x31, 0x7e, 10, 0x03, 0x32, 0x7e];
        let mut rx = Mux::new();
        let frames = feed_all(&mut rx, &wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload, [0x31]);
        assert_eq!(frames[1].payload, [0x32]);
    }

    #[test]
    fn test_oversize_enqueue_rejected() {
        let mut mux = Mux::new();
        let payload = vec![0u8; crate::MAX_PAYLOAD + 1];
        assert!(matches!(
            mux.enqueue(crate::DLCI_LOADER, &payload),
            Err(FrameError::Oversize(513))
        ));
        assert!(!mux.has_pending());

        let payload = vec![0u8; crate::MAX_PAYLOAD];
        mux.enqueue(crate::DLCI_LOADER, &payload).unwrap();
        assert!(mux.has_pending());
    }

    #[test]
    fn test_rx_overrun_resynchronizes() {
        let mut rx = Mux::new();
        let mut overrun = false;
        // 513 payload bytes of 0x20 and no closing flag
        let mut wire = vec![0x7e, 10, 0x03];
        wire.extend(std::iter::repeat(0x20).take(crate::MAX_PAYLOAD + 1));
        for &b in &wire {
            match rx.feed(b) {
                Err(FrameError::RxOverrun(10)) => overrun = true,
                Err(e) => panic!("unexpected error: {e}"),
                Ok(Some(_)) => panic!("frame out of an overrun"),
                Ok(None) => {}
            }
        }
        assert!(overrun);

        // a well-formed frame afterwards still decodes
        let mut tx = Mux::new();
        let mut payload = vec![0u8; 64];
        rand::thread_rng().fill_bytes(&mut payload);
        tx.enqueue(crate::DLCI_DEBUG, &payload).unwrap();
        let frames = feed_all(&mut rx, &drain(&mut tx));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, payload);
    }

    #[test]
    fn test_empty_payload_frame() {
        let mut tx = Mux::new();
        tx.enqueue(crate::DLCI_CONSOLE, &[]).unwrap();
        let wire = drain(&mut tx);
        assert_eq!(wire, [0x7e, 10, 0x03, 0x7e]);
        let mut rx = Mux::new();
        let frames = feed_all(&mut rx, &wire);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }
}
