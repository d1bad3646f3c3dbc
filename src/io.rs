//! Transport binding for the kernel RPC router.
//!
//! The runtime never touches the device directly.  It goes through two traits:
//!
//! - [`Router`] - opens endpoints by name, creates the wakeup pair used to
//!   kick the receive thread, and waits for readiness across a set of ports
//! - [`RouterPort`] - one open endpoint.  A read returns exactly one whole
//!   message and a write sends exactly one whole message.  Kernel router
//!   control operations go through [`RouterPort::control()`].
//!
//! # Possible implementations
//!
//! - [`DeviceRouter`] - the real character device, `/dev/oncrpc/<name>` or
//!   `/dev/<name>`
//! - An in-memory router simulating the modem side, for tests
//!
//! # Subsystem reset
//!
//! When the modem restarts the router reports read hang-up
//! ([`Interest::READ_HUP`]) on every client port, and writes fail with
//! `ENETRESET`.  Once the modem is back the port becomes writable again and
//! the reset condition must be cleared with [`Control::ClearNetReset`].

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use bitflags::bitflags;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::RouterConfig;

/// One open router endpoint.
pub trait RouterPort: Send + Sync + fmt::Debug {
    /// Endpoint name this port was opened with
    fn name(&self) -> &str;

    /// Read one whole message into `buf`, returning its length.  Zero means
    /// the endpoint has been closed.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one whole message, returning the number of bytes accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Issue a router control operation.  Returns the value read back for
    /// the query operations, 0 otherwise.
    fn control(&self, op: Control) -> io::Result<u32>;

    /// Underlying descriptor, if there is one
    fn raw_fd(&self) -> Option<RawFd> {
        None
    }
}

/// Opens endpoints and waits on them.
pub trait Router: Send + Sync + 'static {
    /// Open the endpoint called `name`.
    ///
    /// Client endpoints are named `pppppppp:vvvvvvvv` after the program and
    /// version.  Server endpoints, and the shared router endpoint, use the
    /// router name from [`RouterConfig::router_name`].
    fn open(&self, name: &str) -> io::Result<Arc<dyn RouterPort>>;

    /// Create a connected (read end, write end) pair.  Anything written to the
    /// write end makes the read end readable, which is used to interrupt
    /// [`Router::poll()`].
    fn wakeup(&self) -> io::Result<(Arc<dyn RouterPort>, Arc<dyn RouterPort>)>;

    /// Wait until at least one entry is ready or `timeout` expires.  `None`
    /// waits forever.  Fills in [`PollEntry::ready`] and returns the number of
    /// ready entries.
    fn poll(&self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize>;
}

bitflags! {
    /// Readiness conditions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Interest: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Peer hung up its side, used by the router to signal a reset
        const READ_HUP = 1 << 2;
        const HUP = 1 << 3;
        const ERROR = 1 << 4;
    }
}

/// One port to wait on, with what to wait for and what was found.
#[derive(Debug, Clone)]
pub struct PollEntry {
    pub port: Arc<dyn RouterPort>,
    pub interest: Interest,
    pub ready: Interest,
}

impl PollEntry {
    pub fn new(port: Arc<dyn RouterPort>, interest: Interest) -> Self {
        Self {
            port,
            interest,
            ready: Interest::empty(),
        }
    }
}

// Hold-off doubles at most this many times
const BACKOFF_MAX_SHIFT: u32 = 5;

#[derive(Debug, Default)]
struct BackoffState {
    failures: u32,
    until: Option<Instant>,
}

/// Hold-off for a port whose reads keep failing.  A port in hold-off is left
/// out of the poll set, so one dead port cannot spin the thread polling it.
#[derive(Debug, Default)]
pub(crate) struct PortBackoff {
    state: Mutex<BackoffState>,
}

impl PortBackoff {
    /// Record a failure and start a hold-off of `base` doubled for every
    /// earlier failure in a row.  Returns the hold-off and the failure count.
    pub(crate) fn failed(&self, base: Duration) -> (Duration, u32) {
        let mut state = crate::lock(&self.state);
        let delay = base * (1u32 << state.failures.min(BACKOFF_MAX_SHIFT));
        state.failures = state.failures.saturating_add(1);
        state.until = Some(Instant::now() + delay);
        (delay, state.failures)
    }

    pub(crate) fn succeeded(&self) {
        let mut state = crate::lock(&self.state);
        if state.failures != 0 {
            *state = BackoffState::default();
        }
    }

    /// Time left before the port may be polled again.  `None` once it may.
    pub(crate) fn remaining(&self, now: Instant) -> Option<Duration> {
        crate::lock(&self.state)
            .until
            .map(|until| until.saturating_duration_since(now))
            .filter(|left| !left.is_zero())
    }
}

/// The shortest of the hold-offs still running, capped at `limit`.
pub(crate) fn next_wake(
    holds: impl Iterator<Item = Duration>,
    limit: Option<Duration>,
) -> Option<Duration> {
    holds.chain(limit).min()
}

/// Kernel router control operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// Router protocol version
    GetVersion,
    /// Largest message the router will carry
    GetMtu,
    /// Route calls for this program/version to the port
    RegisterServer { prog: u32, vers: u32 },
    UnregisterServer { prog: u32, vers: u32 },
    /// Acknowledge that a subsystem reset has completed
    ClearNetReset,
}

const IOCTL_MAGIC: u32 = 0xC1;
const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: u32) -> u32 {
    (dir << 30) | (size << 16) | (IOCTL_MAGIC << 8) | nr
}

impl Control {
    /// ioctl request code for this operation.
    pub const fn request(&self) -> u32 {
        let size = core::mem::size_of::<u32>() as u32;
        match self {
            Control::GetVersion => ioc(IOC_READ, 0, size),
            Control::GetMtu => ioc(IOC_READ, 1, size),
            Control::RegisterServer { .. } => ioc(IOC_READ | IOC_WRITE, 2, size),
            Control::UnregisterServer { .. } => ioc(IOC_READ | IOC_WRITE, 3, size),
            Control::ClearNetReset => ioc(IOC_READ | IOC_WRITE, 4, size),
        }
    }
}

#[repr(C)]
struct ServerArgs {
    prog: u32,
    vers: u32,
}

/// The real router character device.
#[derive(Debug, Clone, Default)]
pub struct DeviceRouter {
    config: RouterConfig,
}

impl DeviceRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self { config }
    }

    /// Path of the device node for endpoint `name`.
    pub fn device_path(&self, name: &str) -> PathBuf {
        if self.config.oncrpc_dir.exists() {
            self.config.oncrpc_dir.join(name)
        } else {
            self.config.dev_root.join(name)
        }
    }

    // The node for a server endpoint may not exist until the modem side has
    // started, so poll for it for a bounded time.
    fn wait_for_node(&self, path: &Path) {
        let deadline = self.config.server_wait.map(|wait| Instant::now() + wait);
        while !path.exists() {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return;
                }
            }
            std::thread::sleep(self.config.poll_interval);
        }
    }
}

impl Router for DeviceRouter {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RouterPort>> {
        let path = self.device_path(name);
        self.wait_for_node(&path);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .inspect_err(|e| error!("error opening {}: {e}", path.display()))?;
        debug!("Opened {} fd {}", path.display(), file.as_raw_fd());

        Ok(Arc::new(DevicePort {
            name: name.to_string(),
            file,
            dump: self.config.dump_packets,
        }))
    }

    fn wakeup(&self) -> io::Result<(Arc<dyn RouterPort>, Arc<dyn RouterPort>)> {
        let (rx, tx) = UnixStream::pair()?;
        let port = |stream: UnixStream, name: &str| -> Arc<dyn RouterPort> {
            Arc::new(DevicePort {
                name: name.to_string(),
                file: File::from(OwnedFd::from(stream)),
                dump: false,
            })
        };
        Ok((port(rx, "wakeup-rx"), port(tx, "wakeup-tx")))
    }

    fn poll(&self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
        let mut fds = Vec::with_capacity(entries.len());
        for entry in entries.iter() {
            let fd = entry.port.raw_fd().ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} has no descriptor", entry.port.name()),
                )
            })?;
            fds.push(libc::pollfd {
                fd,
                events: to_poll_events(entry.interest),
                revents: 0,
            });
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        // SAFETY: fds is a live, correctly sized array of pollfd.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(0);
            }
            error!("poll error: {err}");
            return Err(err);
        }

        for (entry, fd) in entries.iter_mut().zip(fds.iter()) {
            entry.ready = from_poll_events(fd.revents);
        }
        Ok(rc as usize)
    }
}

fn to_poll_events(interest: Interest) -> libc::c_short {
    let mut events = 0;
    if interest.contains(Interest::READABLE) {
        events |= libc::POLLIN;
    }
    if interest.contains(Interest::WRITABLE) {
        events |= libc::POLLOUT;
    }
    if interest.contains(Interest::READ_HUP) {
        events |= libc::POLLRDHUP;
    }
    events
}

fn from_poll_events(revents: libc::c_short) -> Interest {
    let mut ready = Interest::empty();
    if revents & libc::POLLIN != 0 {
        ready |= Interest::READABLE;
    }
    if revents & libc::POLLOUT != 0 {
        ready |= Interest::WRITABLE;
    }
    if revents & libc::POLLRDHUP != 0 {
        ready |= Interest::READ_HUP;
    }
    if revents & libc::POLLHUP != 0 {
        ready |= Interest::HUP;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        ready |= Interest::ERROR;
    }
    ready
}

/// An open descriptor on the router device.
#[derive(Debug)]
pub struct DevicePort {
    name: String,
    file: File,
    dump: bool,
}

impl RouterPort for DevicePort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let len = (&self.file)
            .read(buf)
            .inspect_err(|e| error!("error reading RPC packet on {}: {e}", self.name))?;
        if self.dump {
            trace!("RPC in  {len:02}:{}", hex_words(&buf[..len]));
        }
        Ok(len)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let len = (&self.file)
            .write(buf)
            .inspect_err(|e| error!("error writing RPC packet on {}: {e}", self.name))?;
        if self.dump {
            trace!("RPC out {len:02}:{}", hex_words(&buf[..len]));
        }
        Ok(len)
    }

    fn control(&self, op: Control) -> io::Result<u32> {
        let fd = self.file.as_raw_fd();
        let mut value = 0u32;
        let mut args = ServerArgs { prog: 0, vers: 0 };
        let arg: *mut libc::c_void = match op {
            Control::GetVersion | Control::GetMtu => (&raw mut value).cast(),
            Control::RegisterServer { prog, vers } | Control::UnregisterServer { prog, vers } => {
                args = ServerArgs { prog, vers };
                (&raw mut args).cast()
            }
            Control::ClearNetReset => std::ptr::null_mut(),
        };

        // SAFETY: arg is null or points at a live value of the size the
        // request code declares.
        let rc = unsafe { libc::ioctl(fd, op.request() as _, arg) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(value)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.file.as_raw_fd())
    }
}

fn hex_words(data: &[u8]) -> String {
    data.chunks(4)
        .map(|chunk| {
            let mut word = [0u8; 4];
            word[..chunk.len()].copy_from_slice(chunk);
            format!(" {:08x}", u32::from_be_bytes(word))
        })
        .collect()
}
