//! Driver for the compal-brand ramloader found in C1xx phones. The phone
//! opens the conversation with an unsolicited prompt; the host answers, the
//! phone prompts again, and the image is streamed in the clear followed by a
//! seeded XOR sum byte that is already part of the prepared image.

use crate::image::{self, Mode, UploadImage};
use crate::loader::{write_ctl, Event, Window};
use crate::serial::SerialLink;
use std::io::{self, ErrorKind};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

const PROMPT1: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x41, 0x01, 0x40];
const DNLOAD_CMD: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x52, 0x01, 0x53];
const PROMPT2: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x41, 0x02, 0x43];
const ACK: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x41, 0x03, 0x42];
const NACK: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x45, 0x53, 0x16];
const NACK_MAGIC: [u8; 7] = [0x1b, 0xf6, 0x02, 0x00, 0x41, 0x03, 0x57];
const FTMTOOL: [u8; 7] = *b"ftmtool";

/// Phone-side XOR sum is seeded with this; C155/C123xor variants expect it
/// on the wire before the image.
const XOR_SEED: u8 = 0x02;

/// Upper bound on a single UART write during the stream phase.
const WRITE_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum State {
    WaitingPrompt1,
    WaitingPrompt2,
    Downloading,
}

pub struct CompalLoader {
    state: State,
    mode: Mode,
    file: PathBuf,
    image: Option<UploadImage>,
    cursor: usize,
    window: Window,
}

impl CompalLoader {
    pub fn new(mode: Mode, file: PathBuf) -> Self {
        Self {
            state: State::WaitingPrompt1,
            mode,
            file,
            image: None,
            cursor: 0,
            window: Window::new(),
        }
    }

    pub fn wants_write(&self) -> bool {
        self.state == State::Downloading
    }

    /// Absorb one received byte; prompts and acks are recognized anywhere in
    /// the stream, so a phone reset mid-session simply restarts the upload.
    pub fn feed<S: SerialLink>(&mut self, byte: u8, serial: &mut S) -> io::Result<Event> {
        self.window.push(byte, Window::CAP);
        let Ok(window) = <[u8; 7]>::try_from(self.window.bytes()) else {
            return Ok(Event::Nothing);
        };

        let event = match window {
            PROMPT1 => {
                log::info!("received PROMPT1 from phone, responding with download command");
                write_ctl(serial, &DNLOAD_CMD)?;
                self.reload_image();
                self.cursor = 0;
                // a failed rebuild aborts the attempt and waits for the
                // next prompt
                self.state = if self.image.is_some() {
                    State::WaitingPrompt2
                } else {
                    State::WaitingPrompt1
                };
                Event::Nothing
            }
            PROMPT2 => {
                if self.image.is_some() {
                    log::info!("received PROMPT2 from phone, starting download");
                    self.state = State::Downloading;
                } else {
                    log::error!("received PROMPT2 but no image is loaded, staying put");
                }
                Event::Nothing
            }
            ACK => {
                log::info!("received download ACK from phone, your code is running now");
                self.cursor = 0;
                self.state = State::WaitingPrompt1;
                Event::Handover
            }
            NACK => {
                log::error!("received download NACK from phone, something went wrong");
                self.abort_attempt();
                Event::Nothing
            }
            NACK_MAGIC => {
                log::error!(
                    "received MAGIC NACK from phone, you need to have \"1003\" at 0x803ce0"
                );
                self.abort_attempt();
                Event::Nothing
            }
            FTMTOOL => {
                log::error!("received FTMTOOL from phone, the ramloader has aborted");
                self.abort_attempt();
                Event::Nothing
            }
            _ => return Ok(Event::Nothing),
        };
        self.window.clear();
        Ok(event)
    }

    /// Push the next slice of the image out; called whenever the UART is
    /// writable and [`wants_write`](Self::wants_write) holds.
    pub fn handle_writable<S: SerialLink>(&mut self, serial: &mut S) -> io::Result<()> {
        let Some(image) = &self.image else {
            self.state = State::WaitingPrompt1;
            return Ok(());
        };
        let data = image.as_bytes();

        if self.cursor == 0 {
            if self.mode.sends_xor_seed() {
                match serial.write(&[XOR_SEED]) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                    Err(e) => return Err(e),
                }
            } else {
                thread::sleep(Duration::from_micros(1));
            }
        } else if self.cursor >= data.len() {
            log::info!("upload finished, {} bytes sent", data.len());
            self.cursor = 0;
            self.state = State::WaitingPrompt1;
            return Ok(());
        }

        let end = (self.cursor + WRITE_CHUNK).min(data.len());
        match serial.write(&data[self.cursor..end]) {
            Ok(n) => {
                self.cursor += n;
                log::trace!("wrote {n} bytes ({}/{})", self.cursor, data.len());
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn reload_image(&mut self) {
        self.image = match image::build(&self.file, self.mode) {
            Ok(image) => Some(image),
            Err(e) => {
                log::error!("failed to rebuild {}: {e:#}", self.file.display());
                None
            }
        };
    }

    fn abort_attempt(&mut self) {
        self.cursor = 0;
        self.image = None;
        self.state = State::WaitingPrompt1;
    }
}
