//! Unix-socket servers that export one DLCI each to external tools. Both
//! directions carry a 2-byte big-endian length prefix in front of the opaque
//! payload.

use color_eyre::eyre::{Result, WrapErr};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

/// Reassembly of one length-prefixed message across partial reads.
#[derive(Debug)]
enum RecvState {
    Header { buf: [u8; 2], got: usize },
    Body { len: usize, buf: Vec<u8> },
}

impl RecvState {
    fn new() -> Self {
        RecvState::Header {
            buf: [0; 2],
            got: 0,
        }
    }

    /// How many more bytes the current stage needs.
    fn wanted(&self) -> usize {
        match self {
            RecvState::Header { got, .. } => 2 - got,
            RecvState::Body { len, buf } => len - buf.len(),
        }
    }

    /// Absorb `bytes` (all of them); returns a finished message when the
    /// body completes.
    fn advance(&mut self, bytes: &[u8]) -> Option<Vec<u8>> {
        match self {
            RecvState::Header { buf, got } => {
                buf[*got..*got + bytes.len()].copy_from_slice(bytes);
                *got += bytes.len();
                if *got == 2 {
                    let len = u16::from_be_bytes(*buf) as usize;
                    *self = RecvState::Body {
                        len,
                        buf: Vec::with_capacity(len),
                    };
                    // zero-length messages complete immediately
                    if len == 0 {
                        *self = RecvState::new();
                        return Some(Vec::new());
                    }
                }
                None
            }
            RecvState::Body { len, buf } => {
                buf.extend_from_slice(bytes);
                if buf.len() == *len {
                    let msg = std::mem::take(buf);
                    *self = RecvState::new();
                    Some(msg)
                } else {
                    None
                }
            }
        }
    }
}

/// One connected tool client.
pub struct ToolSession {
    id: u32,
    stream: UnixStream,
    recv: RecvState,
}

impl AsRawFd for ToolSession {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// Result of draining a readable session.
pub enum SessionRead {
    /// Complete messages assembled so far; the session stays up.
    Messages(Vec<Vec<u8>>),
    /// EOF or a hard error; the caller reaps the session.
    Closed,
}

/// A listener on a filesystem socket, bound to one DLCI.
pub struct ToolServer {
    listener: UnixListener,
    path: PathBuf,
    dlci: u8,
    sessions: Vec<ToolSession>,
    next_id: u32,
}

impl ToolServer {
    pub fn bind<P: AsRef<Path>>(path: P, dlci: u8) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // a stale socket from a previous run would make bind fail
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).wrap_err_with(|| format!("failed to unlink {}", path.display()))
            }
        }
        let listener = UnixListener::bind(&path)
            .wrap_err_with(|| format!("failed to bind {}", path.display()))?;
        listener
            .set_nonblocking(true)
            .wrap_err("failed to set listener non-blocking")?;
        Ok(Self {
            listener,
            path,
            dlci,
            sessions: Vec::new(),
            next_id: 0,
        })
    }

    pub fn dlci(&self) -> u8 {
        self.dlci
    }

    pub fn listener_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn session(&self, id: u32) -> Option<&ToolSession> {
        self.sessions.iter().find(|s| s.id == id)
    }

    /// Accept every pending connection; returns the new session ids so the
    /// caller can register their fds.
    pub fn accept_pending(&mut self) -> Vec<u32> {
        let mut new = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    if let Err(e) = stream.set_nonblocking(true) {
                        log::error!("failed to set tool client non-blocking: {e}");
                        continue;
                    }
                    let id = self.next_id;
                    self.next_id += 1;
                    log::info!(
                        "tool client {id} connected on {} (dlci {})",
                        self.path.display(),
                        self.dlci
                    );
                    self.sessions.push(ToolSession {
                        id,
                        stream,
                        recv: RecvState::new(),
                    });
                    new.push(id);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::error!("failed to accept tool client: {e}");
                    break;
                }
            }
        }
        new
    }

    /// Drain a readable session, assembling as many envelope messages as the
    /// socket yields right now.
    pub fn session_readable(&mut self, id: u32) -> SessionRead {
        let Some(session) = self.sessions.iter_mut().find(|s| s.id == id) else {
            return SessionRead::Closed;
        };
        let mut messages = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            let want = session.recv.wanted().min(chunk.len());
            match session.stream.read(&mut chunk[..want]) {
                Ok(0) => {
                    log::info!("tool client {id} disconnected");
                    return SessionRead::Closed;
                }
                Ok(n) => {
                    if let Some(msg) = session.recv.advance(&chunk[..n]) {
                        messages.push(msg);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::error!("error on tool client {id}: {e}");
                    return SessionRead::Closed;
                }
            }
        }
        SessionRead::Messages(messages)
    }

    pub fn remove_session(&mut self, id: u32) {
        self.sessions.retain(|s| s.id != id);
    }

    /// Push one received frame to every connected client under the length
    /// envelope. A failing client is logged and skipped; the rest still get
    /// the frame.
    pub fn broadcast(&mut self, payload: &[u8]) {
        let mut envelope = Vec::with_capacity(2 + payload.len());
        envelope.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        envelope.extend_from_slice(payload);
        for session in &mut self.sessions {
            if let Err(e) = session.stream.write_all(&envelope) {
                log::error!("failed to write to tool client {}: {e}", session.id);
                continue;
            }
        }
    }
}
