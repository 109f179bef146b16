use color_eyre::{eyre, Result};
use nix::ioctl_write_ptr_bad;
use std::ffi::CString;
use std::io::{self, Read, Write};
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

ioctl_write_ptr_bad!(tiocmbis, libc::TIOCMBIS, libc::c_int);

/// The seam between the loader state machines and the UART. Tests drive the
/// machines against an in-memory implementation of this.
pub trait SerialLink: io::Read + io::Write {
    fn set_baud(&mut self, baud: u32) -> io::Result<()>;
}

/// A raw, non-blocking UART fd in 8N1 with no flow control.
pub struct SerialPort {
    fd: libc::c_int,
    path: PathBuf,
}

fn speed_constant(baud: u32) -> io::Result<libc::speed_t> {
    match baud {
        19200 => Ok(libc::B19200),
        115200 => Ok(libc::B115200),
        other => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported baud rate {other}"),
        )),
    }
}

impl SerialPort {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_cstr = CString::new(path.as_ref().as_os_str().as_bytes()).unwrap();
        let fd = unsafe {
            libc::open(
                path_cstr.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            )
        };
        if fd < 0 {
            return Err(eyre::eyre!(
                "failed to open {}: {}",
                path.as_ref().display(),
                io::Error::last_os_error()
            ));
        }
        let mut this = Self {
            fd,
            path: path.as_ref().to_path_buf(),
        };
        this.configure_raw()?;
        this.assert_dtr_rts()?;
        this.set_baud(115200)
            .map_err(|e| eyre::eyre!("failed to set initial baud rate: {e}"))?;
        Ok(this)
    }

    /// Raw 8N1: no parity, one stop bit, no hardware or software flow
    /// control, no canonical processing, no echo, no signal characters.
    fn configure_raw(&mut self) -> Result<()> {
        let mut tios = MaybeUninit::uninit();
        let rc = unsafe { libc::tcgetattr(self.fd, tios.as_mut_ptr()) };
        if rc != 0 {
            eyre::bail!("tcgetattr({}): {}", self.path.display(), io::Error::last_os_error());
        }
        let mut tios: libc::termios = unsafe { tios.assume_init() };

        tios.c_iflag |= libc::IGNBRK;
        tios.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
        tios.c_iflag &= !(libc::ISTRIP | libc::INLCR | libc::ICRNL | libc::IGNCR);
        tios.c_oflag = 0;
        tios.c_cflag &= !(libc::CSIZE);
        tios.c_cflag |= libc::CS8;
        tios.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CRTSCTS);
        tios.c_cflag |= libc::CREAD | libc::CLOCAL;
        tios.c_lflag = 0;
        // MIN=0 TIME=0: read returns whatever is available, without waiting
        tios.c_cc[libc::VMIN] = 0;
        tios.c_cc[libc::VTIME] = 0;

        let rc = unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &tios) };
        if rc != 0 {
            eyre::bail!("tcsetattr({}): {}", self.path.display(), io::Error::last_os_error());
        }
        Ok(())
    }

    /// Raise DTR and RTS so the phone sees a ready host.
    fn assert_dtr_rts(&mut self) -> Result<()> {
        let bits: libc::c_int = libc::TIOCM_DTR | libc::TIOCM_RTS;
        unsafe { tiocmbis(self.fd, &bits) }
            .map_err(|e| eyre::eyre!("ioctl(TIOCMBIS) on {}: {e}", self.path.display()))?;
        Ok(())
    }
}

impl SerialLink for SerialPort {
    /// Switch both input and output speed immediately, without draining.
    fn set_baud(&mut self, baud: u32) -> io::Result<()> {
        let speed = speed_constant(baud)?;
        let mut tios = MaybeUninit::uninit();
        if unsafe { libc::tcgetattr(self.fd, tios.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        let mut tios: libc::termios = unsafe { tios.assume_init() };
        unsafe {
            libc::cfsetispeed(&mut tios, speed);
            libc::cfsetospeed(&mut tios, speed);
        }
        if unsafe { libc::tcsetattr(self.fd, libc::TCSANOW, &tios) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EAGAIN) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "no data on UART"))
            } else {
                Err(e)
            }
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n == -1 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EAGAIN) {
                Err(io::Error::new(io::ErrorKind::WouldBlock, "write() would block"))
            } else {
                Err(e)
            }
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        if unsafe { libc::tcdrain(self.fd) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl AsRawFd for SerialPort {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
