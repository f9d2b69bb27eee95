/// Pseudo-terminal between the caller's terminal and the sandboxed command
use crate::config::PtyConfig;
use crate::types::{Degradable, RootboxError, Result, Tolerate, Warning};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, IntoRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

#[cfg(unix)]
use nix::pty::{openpty, Winsize};
#[cfg(unix)]
use nix::sys::signal::{
    sigaction, signal, sigprocmask, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};
#[cfg(unix)]
use nix::sys::termios::{cfmakeraw, tcgetattr, tcsetattr, SetArg, SpecialCharacterIndices, Termios};
#[cfg(unix)]
use nix::unistd::{isatty, setsid};

/// Consecutive interrupted waits tolerated before the bridge gives up
const MAX_INTERRUPTS: u32 = 32;

const BUFFER_SIZE: usize = 4096;

/// ^D, used when the slave's termios cannot be read
const DEFAULT_VEOF: u8 = 0x04;

/// Bytes that tell the slave's canonical line discipline the input is over.
///
/// VEOF only reports end-of-input at the start of a line; after a partial
/// line it just hands that line to the reader. A second VEOF is needed then.
pub fn eof_sequence(last_sent: Option<u8>, veof: u8, line_ends: &[u8]) -> Vec<u8> {
    match last_sent {
        Some(byte) if byte != veof && !line_ends.contains(&byte) => vec![veof, veof],
        _ => vec![veof],
    }
}

static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);
static WINDOW_CHANGED: AtomicBool = AtomicBool::new(false);

extern "C" fn record_signal(signal: libc::c_int) {
    if signal == libc::SIGWINCH {
        WINDOW_CHANGED.store(true, Ordering::SeqCst);
    } else {
        PENDING_SIGNAL.store(signal, Ordering::SeqCst);
    }
}

/// Route SIGINT, SIGTERM, SIGHUP and SIGWINCH to the bridge loop.
/// No SA_RESTART: the readiness wait must return EINTR.
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for signal in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP, Signal::SIGWINCH] {
        unsafe { sigaction(signal, &action) }.map_err(|e| {
            RootboxError::Pty(format!("failed to install {} handler: {}", signal, e))
        })?;
    }
    Ok(())
}

/// Give the command a clean signal state: SIGPIPE back to default (the Rust
/// runtime ignores it, and an ignored disposition survives exec) and nothing
/// blocked. Caught signals are reset by exec itself.
pub fn reset_signals_for_exec() -> Result<()> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }
        .map_err(|e| RootboxError::Exec(format!("failed to reset SIGPIPE: {}", e)))?;
    sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None)
        .map_err(|e| RootboxError::Exec(format!("failed to clear signal mask: {}", e)))?;
    Ok(())
}

/// Signal recorded by the handlers, if any, clearing it
pub fn take_pending_signal() -> Option<Signal> {
    match PENDING_SIGNAL.swap(0, Ordering::SeqCst) {
        0 => None,
        raw => Signal::try_from(raw).ok(),
    }
}

fn stdin_is_tty() -> bool {
    isatty(libc::STDIN_FILENO).unwrap_or(false)
}

fn window_size(fd: RawFd) -> Option<Winsize> {
    let mut ws: Winsize = unsafe { std::mem::zeroed() };
    if unsafe { libc::ioctl(fd, libc::TIOCGWINSZ, &mut ws) } == 0 && ws.ws_row > 0 {
        Some(ws)
    } else {
        None
    }
}

/// Copy the caller's window size onto the PTY
fn propagate_window_size(master: RawFd) -> Degradable {
    let Some(ws) = window_size(libc::STDIN_FILENO) else {
        return Ok(());
    };
    if unsafe { libc::ioctl(master, libc::TIOCSWINSZ, &ws) } != 0 {
        return Err(Warning(RootboxError::Pty(format!(
            "failed to resize pty: {}",
            std::io::Error::last_os_error()
        ))));
    }
    log::debug!("pty resized to {}x{}", ws.ws_col, ws.ws_row);
    Ok(())
}

/// Master and slave ends of a freshly allocated PTY
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

impl PtyPair {
    /// Open a PTY that mirrors the caller's terminal, or a default-sized one
    /// when stdin is not a terminal.
    pub fn allocate(config: &PtyConfig) -> Result<Self> {
        let stdin = std::io::stdin();
        let termios = if stdin_is_tty() {
            match tcgetattr(stdin.as_fd()) {
                Ok(t) => Some(t),
                Err(e) => {
                    log::warn!("failed to read terminal attributes: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let winsize = window_size(libc::STDIN_FILENO).unwrap_or(Winsize {
            ws_row: config.default_rows,
            ws_col: config.default_cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        });

        let pty = openpty(&winsize, termios.as_ref())
            .map_err(|e| RootboxError::Pty(format!("failed to open pty: {}", e)))?;
        log::debug!(
            "pty allocated: master={}, slave={}, {}x{}",
            pty.master.as_raw_fd(),
            pty.slave.as_raw_fd(),
            winsize.ws_col,
            winsize.ws_row
        );

        Ok(Self {
            master: pty.master,
            slave: pty.slave,
        })
    }
}

/// Puts the caller's terminal in raw mode and restores the saved
/// attributes when dropped. Does nothing when stdin is not a terminal.
pub struct RawModeGuard {
    saved: Option<Termios>,
}

impl RawModeGuard {
    pub fn enter() -> Self {
        if !stdin_is_tty() {
            return Self { saved: None };
        }
        let stdin = std::io::stdin();
        let saved = match tcgetattr(stdin.as_fd()) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("failed to read terminal attributes: {}", e);
                return Self { saved: None };
            }
        };

        let mut raw = saved.clone();
        cfmakeraw(&mut raw);
        if let Err(e) = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw) {
            log::warn!("failed to enter raw mode: {}", e);
            return Self { saved: None };
        }
        log::debug!("terminal in raw mode");
        Self { saved: Some(saved) }
    }

    pub fn is_active(&self) -> bool {
        self.saved.is_some()
    }

    /// Restore now instead of at drop
    pub fn restore(&mut self) {
        if let Some(saved) = self.saved.take() {
            if let Err(e) = tcsetattr(std::io::stdin().as_fd(), SetArg::TCSANOW, &saved) {
                log::warn!("failed to restore terminal: {}", e);
            } else {
                log::debug!("terminal restored");
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Make the slave the controlling terminal and standard streams of the
/// calling process. Runs in the child.
pub fn attach_slave(slave: OwnedFd) -> Result<()> {
    setsid().map_err(|e| RootboxError::Pty(format!("setsid failed: {}", e)))?;

    let fd = slave.as_raw_fd();
    for target in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if unsafe { libc::dup2(fd, target) } < 0 {
            return Err(RootboxError::Pty(format!(
                "dup2 onto fd {} failed: {}",
                target,
                std::io::Error::last_os_error()
            )));
        }
    }
    if fd > libc::STDERR_FILENO {
        drop(slave);
    } else {
        // Already one of the standard streams
        let _ = slave.into_raw_fd();
    }

    if unsafe { libc::ioctl(libc::STDIN_FILENO, libc::TIOCSCTTY, 0) } != 0 {
        log::warn!(
            "failed to set controlling terminal: {}",
            std::io::Error::last_os_error()
        );
    }
    Ok(())
}

/// Why the copy loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The PTY reported end-of-stream: every slave descriptor is closed
    Closed,
    /// The runtime received a terminating signal
    Signaled(Signal),
    TooManyInterrupts,
    /// An unrecoverable read, write or poll error (already logged)
    Failed,
}

/// Bidirectional copy between the caller's stdin/stdout and the PTY master
pub struct Bridge {
    master: File,
    input: Option<File>,
    output: File,
    veof: u8,
    /// `\n`, VEOL and VEOL2: bytes that complete a canonical line
    line_ends: Vec<u8>,
    /// Last byte forwarded to the master
    last_sent: Option<u8>,
}

impl Bridge {
    /// Takes the master end. stdin and stdout are duplicated so reads
    /// bypass std's buffering.
    pub fn new(master: OwnedFd) -> Result<Self> {
        let (veof, line_ends) = match tcgetattr(master.as_fd()) {
            Ok(t) => {
                let cc = |index: SpecialCharacterIndices| t.control_chars[index as usize];
                let mut ends = vec![b'\n'];
                // 0 marks a disabled control character
                ends.extend(
                    [cc(SpecialCharacterIndices::VEOL), cc(SpecialCharacterIndices::VEOL2)]
                        .into_iter()
                        .filter(|&c| c != 0),
                );
                (cc(SpecialCharacterIndices::VEOF), ends)
            }
            Err(_) => (DEFAULT_VEOF, vec![b'\n']),
        };

        let input = match std::io::stdin().as_fd().try_clone_to_owned() {
            Ok(fd) => Some(File::from(fd)),
            Err(e) => {
                log::warn!("stdin unavailable: {}", e);
                None
            }
        };
        let output = File::from(std::io::stdout().as_fd().try_clone_to_owned()?);

        Ok(Self {
            master: File::from(master),
            input,
            output,
            veof,
            line_ends,
            last_sent: None,
        })
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    /// Shuttle bytes until the PTY closes or a terminating signal arrives
    pub fn run(&mut self) -> BridgeExit {
        log::debug!("bridge started");
        let mut buf = [0u8; BUFFER_SIZE];
        let mut interrupts = 0u32;

        if self.input.is_none() {
            self.send_eof();
        }
        propagate_window_size(self.master_fd()).tolerate();

        loop {
            if let Some(signal) = take_pending_signal() {
                log::debug!("bridge interrupted by {}", signal);
                return BridgeExit::Signaled(signal);
            }
            if WINDOW_CHANGED.swap(false, Ordering::SeqCst) {
                propagate_window_size(self.master_fd()).tolerate();
            }

            let mut fds = [
                libc::pollfd {
                    fd: self.master_fd(),
                    events: libc::POLLIN,
                    revents: 0,
                },
                libc::pollfd {
                    fd: self.input.as_ref().map_or(-1, |f| f.as_raw_fd()),
                    events: libc::POLLIN,
                    revents: 0,
                },
            ];

            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    interrupts += 1;
                    if interrupts > MAX_INTERRUPTS {
                        log::warn!("bridge interrupted {} times in a row, stopping", interrupts);
                        return BridgeExit::TooManyInterrupts;
                    }
                    continue;
                }
                log::warn!("poll failed: {}", err);
                return BridgeExit::Failed;
            }
            interrupts = 0;

            if fds[1].revents != 0 {
                if let Some(exit) = self.pump_input(&mut buf) {
                    return exit;
                }
            }

            if fds[0].revents != 0 {
                if let Some(exit) = self.pump_output(&mut buf) {
                    return exit;
                }
            }
        }
    }

    /// stdin -> master. End of input is forwarded as the slave's EOF
    /// character; the session keeps running until the PTY closes.
    fn pump_input(&mut self, buf: &mut [u8]) -> Option<BridgeExit> {
        let input = self.input.as_mut()?;
        match input.read(buf) {
            Ok(0) => {
                log::debug!("stdin closed");
                self.input = None;
                self.send_eof();
                None
            }
            Ok(n) => match self.master.write_all(&buf[..n]) {
                Ok(()) => {
                    self.last_sent = buf[..n].last().copied();
                    None
                }
                Err(e) if is_pty_closed(&e) => Some(BridgeExit::Closed),
                Err(e) => {
                    log::warn!("failed to write to pty: {}", e);
                    Some(BridgeExit::Failed)
                }
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => None,
            Err(e) => {
                log::warn!("failed to read stdin: {}", e);
                self.input = None;
                self.send_eof();
                None
            }
        }
    }

    /// master -> stdout
    fn pump_output(&mut self, buf: &mut [u8]) -> Option<BridgeExit> {
        match self.master.read(buf) {
            Ok(0) => Some(BridgeExit::Closed),
            Ok(n) => {
                let written = self
                    .output
                    .write_all(&buf[..n])
                    .and_then(|()| self.output.flush());
                match written {
                    Ok(()) => None,
                    Err(e) => {
                        log::warn!("failed to write stdout: {}", e);
                        Some(BridgeExit::Failed)
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => None,
            Err(e) if is_pty_closed(&e) => Some(BridgeExit::Closed),
            Err(e) => {
                log::warn!("failed to read from pty: {}", e);
                Some(BridgeExit::Failed)
            }
        }
    }

    fn send_eof(&mut self) {
        let eof = eof_sequence(self.last_sent, self.veof, &self.line_ends);
        match self.master.write_all(&eof) {
            Ok(()) => self.last_sent = Some(self.veof),
            Err(e) => log::debug!("could not forward end of input: {}", e),
        }
    }
}

/// EIO on the master means the slave side is gone
fn is_pty_closed(err: &std::io::Error) -> bool {
    err.raw_os_error() == Some(libc::EIO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_allocate_uses_default_geometry_without_tty() {
        if stdin_is_tty() {
            return;
        }
        let config = PtyConfig {
            default_rows: 33,
            default_cols: 101,
        };
        let pty = PtyPair::allocate(&config).unwrap();
        let ws = window_size(pty.master.as_raw_fd()).unwrap();
        assert_eq!((ws.ws_row, ws.ws_col), (33, 101));
    }

    #[test]
    fn test_slave_output_reaches_master() {
        let pty = PtyPair::allocate(&PtyConfig::default()).unwrap();
        let mut slave = File::from(pty.slave);
        let mut master = File::from(pty.master);

        slave.write_all(b"hello\n").unwrap();
        let mut buf = [0u8; 64];
        let n = master.read(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("hello"));
    }

    #[test]
    fn test_closed_slave_reads_as_eio() {
        let pty = PtyPair::allocate(&PtyConfig::default()).unwrap();
        drop(pty.slave);
        let mut master = File::from(pty.master);
        let mut buf = [0u8; 16];
        match master.read(&mut buf) {
            Ok(0) => {}
            Err(e) => assert!(is_pty_closed(&e)),
            Ok(n) => panic!("unexpected {} bytes", n),
        }
    }

    #[test]
    fn test_eof_sequence_after_partial_line() {
        let ends = [b'\n'];
        assert_eq!(eof_sequence(None, 0x04, &ends), vec![0x04]);
        assert_eq!(eof_sequence(Some(b'\n'), 0x04, &ends), vec![0x04]);
        assert_eq!(eof_sequence(Some(0x04), 0x04, &ends), vec![0x04]);
        assert_eq!(eof_sequence(Some(b'e'), 0x04, &ends), vec![0x04, 0x04]);
    }

    #[test]
    fn test_partial_line_then_eof_reaches_reader_as_end_of_input() {
        let pty = PtyPair::allocate(&PtyConfig::default()).unwrap();
        let mut master = File::from(pty.master);
        let mut slave = File::from(pty.slave);

        master.write_all(b"no-newline").unwrap();
        master
            .write_all(&eof_sequence(Some(b'e'), DEFAULT_VEOF, &[b'\n']))
            .unwrap();

        let mut buf = [0u8; 64];
        let n = slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"no-newline");
        assert_eq!(slave.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_raw_mode_guard_noop_without_tty() {
        if stdin_is_tty() {
            return;
        }
        let guard = RawModeGuard::enter();
        assert!(!guard.is_active());
    }

    #[test]
    #[serial]
    fn test_pending_signal_is_taken_once() {
        record_signal(libc::SIGTERM);
        assert_eq!(take_pending_signal(), Some(Signal::SIGTERM));
        assert_eq!(take_pending_signal(), None);

        record_signal(libc::SIGWINCH);
        assert_eq!(take_pending_signal(), None);
        assert!(WINDOW_CHANGED.swap(false, Ordering::SeqCst));
    }
}
