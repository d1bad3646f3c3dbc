//! Common test utilities: an in-memory router with a modem-side peer API.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use oncrpc_router::io::{Control, Interest, PollEntry, Router, RouterPort};
use oncrpc_router::message::{self, OpaqueAuth, ReplyHeader};
use oncrpc_router::wakelock::WakeLock;
use oncrpc_router::xdr::{Xdr, XdrOp, XdrType};
use oncrpc_router::{RouterConfig, RpcContext};

/// How long the peer waits for the runtime before failing a test
pub const WAIT: Duration = Duration::from_secs(5);

pub const PROG: u32 = 0x3000_0000;
pub const VERS: u32 = 0x0001_0000;
pub const CB_PROG: u32 = 0x3100_0000;
pub const CLIENT_NAME: &str = "30000000:00010000";

#[derive(Default)]
struct PortState {
    name: String,
    // Peer to runtime
    to_app: VecDeque<Vec<u8>>,
    // Runtime to peer
    from_app: VecDeque<Vec<u8>>,
    server: Option<(u32, u32)>,
    wakeup: bool,
    // Every read fails, and the port always looks readable
    failing: bool,
    failed_reads: usize,
    // Reports hang-up whatever it is polled for
    hung_up: bool,
    hang_up_reports: usize,
}

#[derive(Default)]
struct State {
    ports: HashMap<u64, PortState>,
    next_id: u64,
    in_reset: bool,
    controls: Vec<(String, Control)>,
    refuse: HashSet<String>,
}

struct Shared {
    state: Mutex<State>,
    cv: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }
}

struct LoopPort {
    id: u64,
    name: String,
    // Write end of a wakeup pair: the read end's id
    peer: Option<u64>,
    shared: Arc<Shared>,
}

impl fmt::Debug for LoopPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoopPort({} {})", self.id, self.name)
    }
}

impl RouterPort for LoopPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        loop {
            let Some(port) = state.ports.get_mut(&self.id) else {
                return Ok(0);
            };
            if port.failing {
                port.failed_reads += 1;
                return Err(io::Error::from_raw_os_error(libc::EIO));
            }
            if let Some(msg) = port.to_app.pop_front() {
                let len = msg.len().min(buf.len());
                buf[..len].copy_from_slice(&msg[..len]);
                self.shared.cv.notify_all();
                return Ok(len);
            }
            state = self.shared.cv.wait(state).unwrap();
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        let target = match self.peer {
            Some(rx) => rx,
            None => {
                if state.in_reset {
                    return Err(io::Error::from_raw_os_error(libc::ENETRESET));
                }
                self.id
            }
        };
        let Some(port) = state.ports.get_mut(&target) else {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        };
        if self.peer.is_some() {
            port.to_app.push_back(buf.to_vec());
        } else {
            port.from_app.push_back(buf.to_vec());
        }
        self.shared.cv.notify_all();
        Ok(buf.len())
    }

    fn control(&self, op: Control) -> io::Result<u32> {
        let mut state = self.shared.lock();
        state.controls.push((self.name.clone(), op));
        if let Some(port) = state.ports.get_mut(&self.id) {
            match op {
                Control::RegisterServer { prog, vers } => port.server = Some((prog, vers)),
                Control::UnregisterServer { .. } => port.server = None,
                _ => {}
            }
        }
        self.shared.cv.notify_all();
        Ok(match op {
            Control::GetVersion => 0x0001_0000,
            Control::GetMtu => 18432,
            _ => 0,
        })
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.id as RawFd)
    }
}

impl Drop for LoopPort {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.ports.remove(&self.id);
        self.shared.cv.notify_all();
    }
}

/// In-memory router.  The test drives the modem side through the peer
/// methods.
#[derive(Clone)]
pub struct LoopbackRouter {
    shared: Arc<Shared>,
    router_name: String,
}

impl Default for LoopbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackRouter {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                cv: Condvar::new(),
            }),
            router_name: RouterConfig::default().router_name,
        }
    }

    fn add_port(&self, state: &mut State, name: &str, wakeup: bool) -> u64 {
        let id = state.next_id;
        state.next_id += 1;
        state.ports.insert(
            id,
            PortState {
                name: name.to_string(),
                wakeup,
                ..Default::default()
            },
        );
        id
    }

    fn readiness(&self, state: &mut State, entry: &PollEntry) -> Interest {
        let id = entry.port.raw_fd().unwrap_or(-1) as u64;
        let in_reset = state.in_reset;
        let Some(port) = state.ports.get_mut(&id) else {
            return Interest::HUP;
        };
        let mut ready = Interest::empty();
        if !port.to_app.is_empty() || port.failing {
            ready |= Interest::READABLE;
        }
        let client = !port.wakeup && port.server.is_none() && port.name != self.router_name;
        if client {
            if in_reset {
                ready |= Interest::READ_HUP;
            } else {
                ready |= Interest::WRITABLE;
            }
        }
        ready &= entry.interest;
        if port.hung_up {
            port.hang_up_reports += 1;
            ready |= Interest::HUP;
        }
        ready
    }

    /// Make opening `name` fail with a permission error.  `"wakeup"` makes
    /// creating wakeup pairs fail.
    pub fn refuse(&self, name: &str) {
        self.shared.lock().refuse.insert(name.to_string());
    }

    /// Undo [`refuse()`](Self::refuse).
    pub fn allow(&self, name: &str) {
        self.shared.lock().refuse.remove(name);
    }

    fn with_port<T>(&self, id: u64, f: impl FnOnce(&mut PortState) -> T) -> T {
        let mut state = self.shared.lock();
        let value = f(state.ports.get_mut(&id).expect("port is open"));
        self.shared.cv.notify_all();
        value
    }

    /// Make every read on port `id` fail.
    pub fn fail_reads(&self, id: u64) {
        self.with_port(id, |p| p.failing = true);
    }

    pub fn failed_reads(&self, id: u64) -> usize {
        self.with_port(id, |p| p.failed_reads)
    }

    /// Make port `id` report hang-up on every poll, or stop doing so.
    pub fn set_hung_up(&self, id: u64, hung_up: bool) {
        self.with_port(id, |p| p.hung_up = hung_up);
    }

    /// How many polls have reported hang-up on port `id`.
    pub fn hang_up_reports(&self, id: u64) -> usize {
        self.with_port(id, |p| p.hang_up_reports)
    }

    fn wait_for<T>(&self, what: &str, mut f: impl FnMut(&mut State) -> Option<T>) -> T {
        let deadline = Instant::now() + WAIT;
        let mut state = self.shared.lock();
        loop {
            if let Some(value) = f(&mut state) {
                return value;
            }
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for {what}");
            state = self.shared.cv.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Id of the open client port called `name`.
    pub fn client_port(&self, name: &str) -> u64 {
        self.wait_for(name, |state| {
            state
                .ports
                .iter()
                .find(|(_, p)| p.name == name && !p.wakeup)
                .map(|(id, _)| *id)
        })
    }

    /// Id of the port registered as server for `prog`/`vers`.
    pub fn server_port(&self, prog: u32, vers: u32) -> u64 {
        self.wait_for("server registration", |state| {
            state
                .ports
                .iter()
                .find(|(_, p)| p.server == Some((prog, vers)))
                .map(|(id, _)| *id)
        })
    }

    /// Next message the runtime wrote to port `id`.
    pub fn recv(&self, id: u64) -> Vec<u8> {
        self.wait_for("message from runtime", |state| {
            state.ports.get_mut(&id).and_then(|p| p.from_app.pop_front())
        })
    }

    /// Next message written to port `id`, if one arrives within `timeout`.
    pub fn try_recv(&self, id: u64, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.lock();
        loop {
            if let Some(msg) = state.ports.get_mut(&id).and_then(|p| p.from_app.pop_front()) {
                return Some(msg);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self.shared.cv.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Deliver `msg` to the runtime on port `id`.
    pub fn send(&self, id: u64, msg: Vec<u8>) {
        let mut state = self.shared.lock();
        state
            .ports
            .get_mut(&id)
            .expect("port is open")
            .to_app
            .push_back(msg);
        self.shared.cv.notify_all();
    }

    /// Modem goes down.
    pub fn reset_begin(&self) {
        self.shared.lock().in_reset = true;
        self.shared.cv.notify_all();
    }

    /// Modem is back.
    pub fn reset_end(&self) {
        self.shared.lock().in_reset = false;
        self.shared.cv.notify_all();
    }

    pub fn controls(&self) -> Vec<(String, Control)> {
        self.shared.lock().controls.clone()
    }

    /// Wait until `op` has been issued on some port.
    pub fn wait_control(&self, op: Control) {
        self.wait_for("control", |state| {
            state.controls.iter().any(|(_, c)| *c == op).then_some(())
        })
    }

    /// Whether any non-wakeup port called `name` is open.
    pub fn is_open(&self, name: &str) -> bool {
        self.shared
            .lock()
            .ports
            .values()
            .any(|p| p.name == name && !p.wakeup)
    }

    /// Wait until no port called `name` is open.
    pub fn wait_closed(&self, name: &str) {
        self.wait_for("port close", |state| {
            (!state.ports.values().any(|p| p.name == name && !p.wakeup)).then_some(())
        })
    }
}

impl Router for LoopbackRouter {
    fn open(&self, name: &str) -> io::Result<Arc<dyn RouterPort>> {
        let mut state = self.shared.lock();
        if state.refuse.contains(name) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        let id = self.add_port(&mut state, name, false);
        self.shared.cv.notify_all();
        Ok(Arc::new(LoopPort {
            id,
            name: name.to_string(),
            peer: None,
            shared: self.shared.clone(),
        }))
    }

    fn wakeup(&self) -> io::Result<(Arc<dyn RouterPort>, Arc<dyn RouterPort>)> {
        let mut state = self.shared.lock();
        if state.refuse.contains("wakeup") {
            return Err(io::Error::from_raw_os_error(libc::EMFILE));
        }
        let rx = self.add_port(&mut state, "wakeup", true);
        // Never inserted, so dropping it removes nothing.
        let tx = u64::MAX - rx;
        let rx_port = Arc::new(LoopPort {
            id: rx,
            name: "wakeup".to_string(),
            peer: None,
            shared: self.shared.clone(),
        });
        let tx_port = Arc::new(LoopPort {
            id: tx,
            name: "wakeup".to_string(),
            peer: Some(rx),
            shared: self.shared.clone(),
        });
        Ok((rx_port, tx_port))
    }

    fn poll(&self, entries: &mut [PollEntry], timeout: Option<Duration>) -> io::Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        loop {
            let mut count = 0;
            for entry in entries.iter_mut() {
                entry.ready = self.readiness(&mut state, entry);
                if !entry.ready.is_empty() {
                    count += 1;
                }
            }
            if count > 0 {
                return Ok(count);
            }
            state = match deadline {
                None => self.shared.cv.wait(state).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(0);
                    }
                    self.shared.cv.wait_timeout(state, deadline - now).unwrap().0
                }
            };
        }
    }
}

/// Wake lock that counts.
#[derive(Debug, Default)]
pub struct CountingWakeLock {
    pub acquired: AtomicUsize,
    pub released: AtomicUsize,
}

impl WakeLock for CountingWakeLock {
    fn acquire(&self) {
        self.acquired.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// A context over a fresh loopback router.
pub fn context() -> (RpcContext, LoopbackRouter) {
    let router = LoopbackRouter::new();
    let config = RouterConfig::default().with_svc_poll_period(Duration::from_millis(50));
    (RpcContext::new(Arc::new(router.clone()), config), router)
}

/// Encode a call message.
pub fn call_msg<A: XdrType + ?Sized>(xid: u32, prog: u32, vers: u32, proc: u32, args: &mut A) -> Vec<u8> {
    let mut xdr = Xdr::new();
    let none = OpaqueAuth::none();
    message::call_msg_start(&mut xdr, xid, prog, vers, proc, &none, &none).unwrap();
    args.xdr(&mut xdr).unwrap();
    xdr.out_msg().to_vec()
}

/// Encode a reply message.
pub fn reply_msg<R: XdrType + ?Sized>(xid: u32, header: &ReplyHeader, results: &mut R) -> Vec<u8> {
    let mut xdr = Xdr::new();
    message::send_reply_header(&mut xdr, xid, header).unwrap();
    results.xdr(&mut xdr).unwrap();
    xdr.out_msg().to_vec()
}

/// Decode a reply message, returning xid, header and the reader positioned on
/// the results.
pub fn parse_reply(msg: Vec<u8>) -> (u32, ReplyHeader, Xdr) {
    let mut xdr = Xdr::from_inbound(msg);
    let (xid, header) = message::recv_reply_header(&mut xdr).unwrap();
    xdr.set_op(XdrOp::Decode);
    (xid, header, xdr)
}

/// Decode a call message, returning xid, proc and the first u32 argument.
pub fn parse_call(msg: Vec<u8>) -> (u32, u32, u32) {
    let mut xdr = Xdr::from_inbound(msg);
    let header = message::CallHeader::decode(&mut xdr).unwrap();
    let arg = xdr.recv_u32().unwrap_or(0);
    (header.xid, header.proc, arg)
}
