//! Driver for the Calypso mask-ROM loader. The ROM code says nothing on its
//! own; the host beacons `<i` until the phone answers, negotiates transfer
//! parameters, streams the image in checksummed blocks and finally branches
//! into it.

use crate::image::{self, Mode, UploadImage};
use crate::loader::{write_ctl, Event, Window};
use crate::serial::SerialLink;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const IDENT_CMD: &[u8] = b"<i";
const CHECKSUM_CMD: &[u8] = b"<c";
const BRANCH_CMD: &[u8] = b"<b";

const IDENT_ACK: &[u8] = b">i";
const PARAM_ACK: &[u8] = b">p";
const PARAM_NACK: &[u8] = b">P";
const BLOCK_ACK: &[u8] = b">w";
const BLOCK_NACK: &[u8] = b">W";
const CHECKSUM_ACK: &[u8] = b">c";
const CHECKSUM_NACK: &[u8] = b">C";
const BRANCH_ACK: &[u8] = b">b";
const BRANCH_NACK: &[u8] = b">B";

/// `<p`, baudrate, dpll, memory config (be16), strobe af, uart timeout (be32).
const PARAM_CMD: [u8; 11] = [
    0x3c, 0x70, 0x00, 0x00, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00,
];

const BLOCK_HDR_LEN: usize = 10;
/// Download and branch target in the Calypso's internal RAM.
const LOAD_ADDRESS: u32 = 0x0082_0000;

pub const INIT_BAUD: u32 = 19200;
const DL_BAUD: u32 = 115_200;
/// Cadence of `<i` probes, and (doubled) the settle delay after baud changes.
pub const BEACON_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    WaitingIdentification,
    WaitingParamAck,
    SendingBlocks,
    SendingLastBlock,
    WaitingBlockAck,
    LastBlockSent,
    WaitingChecksumAck,
    WaitingBranchAck,
    Finished,
}

pub struct CalypsoLoader {
    state: State,
    file: PathBuf,
    image: Option<UploadImage>,
    window: Window,

    block: Vec<u8>,
    block_cursor: usize,
    block_number: u32,
    block_payload_size: usize,
    /// Running sum of the per-block checksum bytes.
    dl_checksum: u32,
}

impl CalypsoLoader {
    pub fn new(file: PathBuf) -> Self {
        Self {
            state: State::WaitingIdentification,
            file,
            image: None,
            window: Window::new(),
            block: Vec::new(),
            block_cursor: 0,
            block_number: 0,
            block_payload_size: 0,
            dl_checksum: 0,
        }
    }

    pub fn wants_write(&self) -> bool {
        matches!(self.state, State::SendingBlocks | State::SendingLastBlock)
    }

    /// Timer tick: probe for the ROM loader while nothing has answered yet.
    pub fn on_beacon<S: SerialLink>(&mut self, serial: &mut S) -> io::Result<()> {
        if self.state == State::WaitingIdentification {
            log::debug!("sending beacon");
            write_ctl(serial, IDENT_CMD)?;
        }
        Ok(())
    }

    /// The ROM loader's replies vary in length by state; keeping the window
    /// this short stops later bytes being mistaken for part of the current
    /// ack.
    fn window_limit(&self) -> usize {
        match self.state {
            State::WaitingParamAck => 4,
            State::WaitingChecksumAck => 3,
            State::Finished => Window::CAP,
            _ => 2,
        }
    }

    pub fn feed<S: SerialLink>(&mut self, byte: u8, serial: &mut S) -> io::Result<Event> {
        self.window.push(byte, self.window_limit());
        // every reply starts with '>'; drop leading noise
        while !self.window.bytes().is_empty() && self.window.bytes()[0] != b'>' {
            self.window.slide();
        }
        self.try_match(serial)
    }

    fn try_match<S: SerialLink>(&mut self, serial: &mut S) -> io::Result<Event> {
        let window = self.window.bytes();
        match self.state {
            State::WaitingIdentification => {
                if window.starts_with(IDENT_ACK) {
                    log::info!("received ident ack from phone, sending parameter sequence");
                    write_ctl(serial, &PARAM_CMD)?;
                    self.reload_image();
                    // a failed rebuild keeps the beacon going
                    if self.image.is_some() {
                        self.state = State::WaitingParamAck;
                    }
                    self.window.clear();
                }
            }
            State::WaitingParamAck => {
                if window.starts_with(PARAM_ACK) && window.len() >= 4 {
                    let advertised = u16::from_le_bytes([window[2], window[3]]) as usize;
                    self.window.clear();
                    self.begin_download(advertised, serial)?;
                } else if window.starts_with(PARAM_NACK) {
                    log::warn!("received parameter nack from phone");
                    self.window.clear();
                }
            }
            State::WaitingBlockAck | State::LastBlockSent => {
                if window.starts_with(BLOCK_ACK) {
                    log::debug!("received block ack from phone");
                    self.window.clear();
                    if self.state == State::LastBlockSent {
                        let final_checksum = self.final_checksum();
                        log::info!("sending checksum 0x{final_checksum:02x}");
                        write_ctl(serial, CHECKSUM_CMD)?;
                        write_ctl(serial, &[final_checksum])?;
                        self.state = State::WaitingChecksumAck;
                    } else {
                        self.prepare_block();
                    }
                } else if window.starts_with(BLOCK_NACK) {
                    log::error!("received block nack from phone, aborting transfer");
                    self.window.clear();
                    self.reset_to_beacon(serial)?;
                }
            }
            State::WaitingChecksumAck => {
                if window.starts_with(CHECKSUM_ACK) {
                    log::info!(
                        "checksum on phone side matches, branching to 0x{LOAD_ADDRESS:08x}"
                    );
                    self.window.clear();
                    write_ctl(serial, BRANCH_CMD)?;
                    write_ctl(serial, &LOAD_ADDRESS.to_be_bytes())?;
                    self.state = State::WaitingBranchAck;
                } else if window.starts_with(CHECKSUM_NACK) && window.len() >= 3 {
                    log::error!(
                        "checksum on phone side (0x{:02x}) does not match ours, aborting",
                        window[2]
                    );
                    self.window.clear();
                    self.reset_to_beacon(serial)?;
                }
            }
            State::WaitingBranchAck => {
                if window.starts_with(BRANCH_ACK) {
                    log::info!("received branch ack, your code is running now");
                    self.window.clear();
                    self.state = State::Finished;
                    return Ok(Event::Handover);
                } else if window.starts_with(BRANCH_NACK) {
                    log::error!("received branch nack, aborting");
                    self.window.clear();
                    self.reset_to_beacon(serial)?;
                }
            }
            // blocks are pushed from handle_writable; the finished link
            // carries mux traffic that is no concern of ours
            State::SendingBlocks | State::SendingLastBlock | State::Finished => {}
        }
        Ok(Event::Nothing)
    }

    /// Param ack in hand: speed the link up, honor the advertised block size
    /// and start pushing blocks.
    fn begin_download<S: SerialLink>(&mut self, advertised: usize, serial: &mut S) -> io::Result<()> {
        if advertised <= BLOCK_HDR_LEN {
            log::error!("phone advertised unusable block size {advertised}");
            return self.reset_to_beacon(serial);
        }
        if self.image.is_none() {
            log::error!("no image loaded, restarting identification");
            return self.reset_to_beacon(serial);
        }
        log::info!("received parameter ack from phone, starting download");
        serial.set_baud(DL_BAUD)?;
        // let the phone's UART settle on the new speed
        thread::sleep(BEACON_INTERVAL * 2);
        log::info!("used blocksize for download is {advertised} bytes");
        self.block_payload_size = advertised - BLOCK_HDR_LEN;
        self.block_number = 0;
        self.dl_checksum = 0;
        self.prepare_block();
        Ok(())
    }

    /// Assemble the next `<w` block: 10-byte header, then a payload-sized
    /// slice of the image body, zero-filled at the tail.
    fn prepare_block(&mut self) {
        let body = self
            .image
            .as_ref()
            .expect("block preparation without an image")
            .body();
        let offset = self.block_number as usize * self.block_payload_size;
        let remaining = body.len().saturating_sub(offset);
        let block_address = LOAD_ADDRESS + self.block_number * self.block_payload_size as u32;

        let mut block = Vec::with_capacity(BLOCK_HDR_LEN + self.block_payload_size);
        block.extend_from_slice(b"<w");
        // both index fields are pinned to 0x01: the ROM loader hangs when
        // given the true block number
        block.push(0x01);
        block.push(0x01);
        block.extend_from_slice(&(self.block_payload_size as u16).to_be_bytes());
        block.extend_from_slice(&block_address.to_be_bytes());

        let take = remaining.min(self.block_payload_size);
        block.extend_from_slice(&body[offset..offset + take]);
        block.resize(BLOCK_HDR_LEN + self.block_payload_size, 0x00);

        if remaining <= self.block_payload_size {
            log::info!(
                "preparing the last block, filling {} bytes",
                self.block_payload_size - remaining
            );
            self.state = State::SendingLastBlock;
        } else {
            log::debug!("preparing block {}", self.block_number + 1);
            self.state = State::SendingBlocks;
        }

        // lsb of !(5 + size lsb + address + data)
        let mut block_checksum: u32 = 5;
        for &b in &block[5..] {
            block_checksum += b as u32;
        }
        let block_checksum = !block_checksum as u8;
        log::debug!("block checksum is 0x{block_checksum:02x}");
        self.dl_checksum = self.dl_checksum.wrapping_add(block_checksum as u32);

        self.block = block;
        self.block_cursor = 0;
        self.block_number += 1;
    }

    /// lsb of the complement of the summed block checksums; the double
    /// complement looks odd but is what a real phone accepts.
    fn final_checksum(&self) -> u8 {
        !(self.dl_checksum as u8)
    }

    pub fn handle_writable<S: SerialLink>(&mut self, serial: &mut S) -> io::Result<()> {
        if self.block_cursor >= self.block.len() {
            log::debug!("block {} finished", self.block_number);
            if self.state == State::SendingLastBlock {
                log::info!("finished, sent {} blocks in total", self.block_number);
                self.state = State::LastBlockSent;
            } else {
                self.state = State::WaitingBlockAck;
            }
            return Ok(());
        }
        match serial.write(&self.block[self.block_cursor..]) {
            Ok(n) => {
                self.block_cursor += n;
                log::trace!("wrote {n} bytes ({}/{})", self.block_cursor, self.block.len());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn reload_image(&mut self) {
        self.image = match image::build(&self.file, Mode::Romload) {
            Ok(image) => Some(image),
            Err(e) => {
                log::error!("failed to rebuild {}: {e:#}", self.file.display());
                None
            }
        };
    }

    /// Any nack drops the link back to the slow initial baud and the beacon
    /// takes over again; the periodic timer is still running.
    fn reset_to_beacon<S: SerialLink>(&mut self, serial: &mut S) -> io::Result<()> {
        serial.set_baud(INIT_BAUD)?;
        thread::sleep(BEACON_INTERVAL * 2);
        self.state = State::WaitingIdentification;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::testutil::{temp_image, FakeSerial};

    fn feed_all(l: &mut CalypsoLoader, serial: &mut FakeSerial, bytes: &[u8]) -> Event {
        let mut last = Event::Nothing;
        for &b in bytes {
            last = l.feed(b, serial).unwrap();
        }
        last
    }

    fn drive_block(l: &mut CalypsoLoader, serial: &mut FakeSerial) {
        while l.wants_write() {
            l.handle_writable(serial).unwrap();
        }
    }

    #[test]
    fn test_romload_happy_path() {
        let contents: Vec<u8> = (0..3072u32).map(|i| (i * 7) as u8).collect();
        let path = temp_image("romload-happy", &contents);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        l.on_beacon(&mut serial).unwrap();
        assert_eq!(serial.written, b"<i");

        serial.written.clear();
        feed_all(&mut l, &mut serial, b">i");
        assert_eq!(serial.written, PARAM_CMD);
        assert!(l.image.is_some());

        // phone advertises 0x020a bytes per block, little-endian
        serial.written.clear();
        feed_all(&mut l, &mut serial, &[b'>', b'p', 0x0a, 0x02]);
        assert_eq!(serial.bauds, vec![115_200]);
        assert_eq!(l.block_payload_size, 0x200);
        assert!(l.wants_write());

        // body is 3072 bytes: five full blocks, then a final full block
        let mut block_checksums = Vec::new();
        for k in 0..6u32 {
            drive_block(&mut l, &mut serial);
            let block = &serial.written;
            assert_eq!(block.len(), 10 + 0x200);
            let addr = 0x0082_0000u32 + k * 0x200;
            let mut expected_hdr = vec![0x3c, 0x77, 0x01, 0x01, 0x02, 0x00];
            expected_hdr.extend_from_slice(&addr.to_be_bytes());
            assert_eq!(&block[..10], &expected_hdr[..]);
            assert_eq!(&block[10..], &contents[k as usize * 0x200..][..0x200]);

            let mut sum: u32 = 5;
            for &b in &block[5..] {
                sum += b as u32;
            }
            block_checksums.push(!sum as u8);

            serial.written.clear();
            if k < 5 {
                feed_all(&mut l, &mut serial, b">w");
                assert!(l.wants_write());
            }
        }

        assert_eq!(l.state, State::LastBlockSent);
        feed_all(&mut l, &mut serial, b">w");
        let acc: u32 = block_checksums.iter().map(|&c| c as u32).sum();
        let expected_checksum = !(acc as u8);
        assert_eq!(serial.written, [b'<', b'c', expected_checksum]);
        assert_eq!(l.state, State::WaitingChecksumAck);

        serial.written.clear();
        feed_all(&mut l, &mut serial, b">c");
        assert_eq!(serial.written, [b'<', b'b', 0x00, 0x82, 0x00, 0x00]);

        assert_eq!(feed_all(&mut l, &mut serial, b">b"), Event::Handover);
        assert_eq!(l.state, State::Finished);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_last_block_zero_fill() {
        let contents = vec![0xffu8; 700];
        let path = temp_image("romload-fill", &contents);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        feed_all(&mut l, &mut serial, b">i");
        serial.written.clear();
        feed_all(&mut l, &mut serial, &[b'>', b'p', 0x0a, 0x02]);
        drive_block(&mut l, &mut serial);
        serial.written.clear();
        feed_all(&mut l, &mut serial, b">w");

        // 700 - 512 = 188 payload bytes, the rest zero fill
        drive_block(&mut l, &mut serial);
        assert_eq!(l.state, State::LastBlockSent);
        let block = &serial.written;
        assert_eq!(&block[10..10 + 188], &contents[512..]);
        assert!(block[10 + 188..].iter().all(|&b| b == 0));
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_block_nack_restarts_identification() {
        let contents = vec![0x21u8; 2048];
        let path = temp_image("romload-nack", &contents);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        feed_all(&mut l, &mut serial, b">i");
        feed_all(&mut l, &mut serial, &[b'>', b'p', 0x0a, 0x02]);
        drive_block(&mut l, &mut serial);
        assert_eq!(l.state, State::WaitingBlockAck);

        serial.bauds.clear();
        feed_all(&mut l, &mut serial, b">W");
        assert_eq!(l.state, State::WaitingIdentification);
        assert_eq!(serial.bauds, vec![INIT_BAUD]);
        assert!(!l.wants_write());

        // no blocks move until a fresh ident ack
        serial.written.clear();
        l.on_beacon(&mut serial).unwrap();
        assert_eq!(serial.written, b"<i");
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_checksum_nack_reports_phone_sum() {
        let contents = vec![0x42u8; 256];
        let path = temp_image("romload-badsum", &contents);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        feed_all(&mut l, &mut serial, b">i");
        feed_all(&mut l, &mut serial, &[b'>', b'p', 0x0a, 0x02]);
        drive_block(&mut l, &mut serial);
        feed_all(&mut l, &mut serial, b">w");
        assert_eq!(l.state, State::WaitingChecksumAck);

        serial.bauds.clear();
        // nack carries the phone's own checksum byte
        feed_all(&mut l, &mut serial, &[b'>', b'C', 0x5e]);
        assert_eq!(l.state, State::WaitingIdentification);
        assert_eq!(serial.bauds, vec![INIT_BAUD]);
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_param_nack_is_consumed_and_keeps_waiting() {
        let path = temp_image("romload-pnack", &[0x66u8; 64]);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        feed_all(&mut l, &mut serial, b">i");
        assert_eq!(l.state, State::WaitingParamAck);

        serial.written.clear();
        feed_all(&mut l, &mut serial, b">P");
        // logged and ignored: nothing sent, no state change, window consumed
        assert_eq!(l.state, State::WaitingParamAck);
        assert!(serial.written.is_empty());
        assert!(l.window.bytes().is_empty());
        assert!(!l.wants_write());

        // a later param ack still starts the download
        feed_all(&mut l, &mut serial, &[b'>', b'p', 0x0a, 0x02]);
        assert_eq!(serial.bauds, vec![115_200]);
        assert!(l.wants_write());
        std::fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_beacon_only_fires_while_identifying() {
        let path = temp_image("romload-beacon", &[0u8; 64]);
        let mut serial = FakeSerial::default();
        let mut l = CalypsoLoader::new(path.clone());

        l.on_beacon(&mut serial).unwrap();
        assert_eq!(serial.written, b"<i");
        feed_all(&mut l, &mut serial, b">i");
        serial.written.clear();
        l.on_beacon(&mut serial).unwrap();
        assert!(serial.written.is_empty());
        std::fs::remove_file(path).unwrap();
    }
}
