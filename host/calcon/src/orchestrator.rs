//! Wires the serial port, the loaders, the link endpoint and the tool
//! servers onto one poll loop, and owns the top-level state transitions.

use crate::args::Args;
use crate::calypso::{self, CalypsoLoader};
use crate::compal::CompalLoader;
use crate::event::{EventLoop, Interest, IntervalTimer, Readiness};
use crate::link::{hexdump, LinkEndpoint, Sink};
use crate::loader::Event;
use crate::serial::{SerialLink, SerialPort};
use crate::tools::{SessionRead, ToolServer};
use color_eyre::eyre::{Result, WrapErr};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::exit;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Serial,
    Beacon,
    Listener(usize),
    Session(usize, u32),
}

enum Loader {
    Compal(CompalLoader),
    Calypso(CalypsoLoader),
}

pub struct Orchestrator<S = SerialPort> {
    serial: S,
    evloop: EventLoop<Token>,
    loader: Loader,
    link: LinkEndpoint,
    servers: Vec<ToolServer>,
    beacon: Option<IntervalTimer>,
    /// Console payload sink; stdout outside of tests.
    console: Box<dyn Write>,
    /// Once the uploaded image runs, received bytes carry mux frames.
    hdlc_active: bool,
    /// Byte pulled from the mux that the UART would not take yet.
    tx_stalled: Option<u8>,
}

impl Orchestrator<SerialPort> {
    pub fn new(args: &Args, image: PathBuf) -> Result<Self> {
        let mut serial = SerialPort::open(&args.port)
            .wrap_err_with(|| format!("cannot open serial device {}", args.port.display()))?;
        if args.mode.is_romload() {
            serial
                .set_baud(calypso::INIT_BAUD)
                .wrap_err("failed to drop to romload baud rate")?;
        }
        Self::with_serial(serial, args, image)
    }
}

impl<S: SerialLink> Orchestrator<S> {
    /// All the wiring that does not need a real UART; tests hand in an
    /// in-memory serial double here.
    fn with_serial(serial: S, args: &Args, image: PathBuf) -> Result<Self> {
        let mut link = LinkEndpoint::new();
        link.register(linkmux::DLCI_CONSOLE, Sink::Console);
        link.register(linkmux::DLCI_DEBUG, Sink::Debug);

        let mut servers = Vec::new();
        for (path, dlci) in [
            (&args.l2_socket, linkmux::DLCI_L1A_L23),
            (&args.loader_socket, linkmux::DLCI_LOADER),
        ] {
            link.register(dlci, Sink::Tool(servers.len()));
            servers.push(ToolServer::bind(path, dlci)?);
        }

        let (loader, beacon) = if args.mode.is_romload() {
            let beacon = IntervalTimer::every(calypso::BEACON_INTERVAL)?;
            (Loader::Calypso(CalypsoLoader::new(image)), Some(beacon))
        } else {
            (Loader::Compal(CompalLoader::new(args.mode, image)), None)
        };

        Ok(Self {
            serial,
            evloop: EventLoop::new(),
            loader,
            link,
            servers,
            beacon,
            console: Box::new(std::io::stdout()),
            hdlc_active: false,
            tx_stalled: None,
        })
    }

    fn wants_tx(&self) -> bool {
        let loader_tx = match &self.loader {
            Loader::Compal(l) => l.wants_write(),
            Loader::Calypso(l) => l.wants_write(),
        };
        loader_tx || self.tx_stalled.is_some() || self.link.has_pending()
    }

    fn dispatch(&mut self, token: Token, readiness: Readiness) -> Result<()> {
        match token {
            Token::Serial => {
                if readiness.readable {
                    self.serial_readable()?;
                }
                if readiness.writable {
                    self.serial_writable()?;
                }
            }
            Token::Beacon => {
                let ticks = self.beacon.as_mut().map(|b| b.drain()).unwrap_or(0);
                if ticks > 0 {
                    if let Loader::Calypso(l) = &mut self.loader {
                        if let Err(e) = l.on_beacon(&mut self.serial) {
                            log::error!("error sending identification beacon: {e}");
                        }
                    }
                }
            }
            Token::Listener(i) => {
                for id in self.servers[i].accept_pending() {
                    let fd = self.servers[i].session(id).unwrap().as_raw_fd();
                    self.evloop.register(Token::Session(i, id), fd, Interest::READ);
                }
            }
            Token::Session(i, id) => match self.servers[i].session_readable(id) {
                SessionRead::Messages(messages) => {
                    let dlci = self.servers[i].dlci();
                    for msg in messages {
                        self.link.send_to_phone(dlci, &msg);
                    }
                }
                SessionRead::Closed => {
                    self.evloop.unregister(Token::Session(i, id));
                    self.servers[i].remove_session(id);
                }
            },
        }
        Ok(())
    }

    fn serial_readable(&mut self) -> Result<()> {
        let mut buf = [0u8; 256];
        let n = match self.serial.read(&mut buf) {
            Ok(0) => {
                log::error!("EOF on the serial port, phone disconnected");
                exit(2);
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e).wrap_err("failed to read from serial port"),
        };
        if !self.hdlc_active {
            log::trace!("got {n} bytes from phone: {}", hexdump(&buf[..n]));
        }
        for &byte in &buf[..n] {
            self.process_serial_byte(byte);
        }
        Ok(())
    }

    /// One received byte: the mux sees it once the image runs, the loader
    /// window always does (a phone reset restarts the upload).
    fn process_serial_byte(&mut self, byte: u8) {
        if self.hdlc_active {
            if let Some(frame) = self.link.feed(byte) {
                self.deliver_frame(frame.dlci, &frame.payload);
            }
        }
        let event = match &mut self.loader {
            Loader::Compal(l) => l.feed(byte, &mut self.serial),
            Loader::Calypso(l) => l.feed(byte, &mut self.serial),
        };
        match event {
            Ok(Event::Handover) if !self.hdlc_active => {
                log::info!("switching the link to multiplexed console mode");
                self.hdlc_active = true;
            }
            Ok(_) => {}
            Err(e) => log::error!("error during protocol write: {e}"),
        }
    }

    fn serial_writable(&mut self) -> Result<()> {
        let loader_tx = match &mut self.loader {
            Loader::Compal(l) if l.wants_write() => {
                if let Err(e) = l.handle_writable(&mut self.serial) {
                    log::error!("error during write: {e}");
                }
                true
            }
            Loader::Calypso(l) if l.wants_write() => {
                if let Err(e) = l.handle_writable(&mut self.serial) {
                    log::error!("error during write: {e}");
                }
                true
            }
            _ => false,
        };
        if loader_tx {
            return Ok(());
        }

        // drain the mux one byte at a time, like the console traffic it is
        loop {
            let byte = match self.tx_stalled.take() {
                Some(b) => b,
                None => match self.link.pull() {
                    Some(b) => b,
                    None => break,
                },
            };
            match self.serial.write(&[byte]) {
                Ok(1) => {}
                Ok(_) => {
                    self.tx_stalled = Some(byte);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.tx_stalled = Some(byte);
                    break;
                }
                Err(e) => {
                    log::error!("failed to write to serial port: {e}");
                    self.tx_stalled = Some(byte);
                    break;
                }
            }
        }
        Ok(())
    }

    fn deliver_frame(&mut self, dlci: u8, payload: &[u8]) {
        match self.link.sink_for(dlci) {
            Some(Sink::Console) => {
                let result = self
                    .console
                    .write_all(payload)
                    .and_then(|()| self.console.flush());
                if let Err(e) = result {
                    log::error!("failed to write console output: {e}");
                }
            }
            Some(Sink::Debug) => {
                log::debug!("dlci {dlci}: {}", hexdump(payload));
            }
            Some(Sink::Tool(i)) => {
                self.servers[i].broadcast(payload);
            }
            None => {
                log::trace!("dropping {} bytes for unbound dlci {dlci}", payload.len());
            }
        }
    }
}

impl<S: SerialLink + AsRawFd> Orchestrator<S> {
    pub fn run(&mut self) -> Result<()> {
        self.evloop
            .register(Token::Serial, self.serial.as_raw_fd(), Interest::READ);
        if let Some(beacon) = &self.beacon {
            self.evloop
                .register(Token::Beacon, beacon.as_raw_fd(), Interest::READ);
        }
        for (i, server) in self.servers.iter().enumerate() {
            self.evloop
                .register(Token::Listener(i), server.listener_fd(), Interest::READ);
        }

        let mut events = Vec::new();
        loop {
            self.evloop
                .set_interest(Token::Serial, Interest::READ.with_write(self.wants_tx()));
            self.evloop.wait(&mut events)?;
            for &(token, readiness) in events.iter() {
                self.dispatch(token, readiness)?;
            }
        }
    }
}
