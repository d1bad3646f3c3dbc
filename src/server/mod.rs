//! RPC services.
//!
//! A context has at most one server transport, shared by every
//! [`SvcTransport`] handle obtained from [`RpcContext::svc_create()`].  It
//! holds the registry of services, each identified by program and version:
//!
//! - A real service opens its own port on the router and registers its
//!   program/version with the kernel.  The transport's dispatch thread
//!   watches these ports.
//! - A callback service (program number with bit `0x01000000` set) has no
//!   port.  Its calls arrive on the port of the client for the matching
//!   program and are dispatched from that client's callback thread.
//!
//! Either way the registered dispatch function gets a [`SvcRequest`] to
//! decode arguments from and reply through.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oncrpc_router::{RpcContext, RouterConfig, SvcRequest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = RpcContext::device(RouterConfig::default());
//! let xprt = ctx.svc_create();
//! xprt.svc_register(0x3000_0066, 0x0001_0000, Arc::new(|req: &mut SvcRequest<'_>| {
//!     let mut value = 0u32;
//!     if req.getargs(&mut value).is_err() {
//!         let _ = req.svcerr_decode();
//!         return;
//!     }
//!     let _ = req.sendreply(&mut value);
//! }))?;
//! # Ok(())
//! # }
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

mod dispatch;
mod request;

pub use request::SvcRequest;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::channel::{MessageChannel, XidAllocator};
use crate::config::RouterConfig;
use crate::context::RpcContext;
use crate::io::{Control, PortBackoff, Router, RouterPort};
use crate::wakelock::WakeLock;
use crate::{CALLBACK_PROG_BIT, Error, ResetCallback, ResetEvent, Result, lock};

/// Service dispatch function
pub type DispatchFn = Arc<dyn Fn(&mut SvcRequest<'_>) + Send + Sync>;

/// What the dispatch thread does when reading a service port fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadFailurePolicy {
    /// Log the failure and keep serving, holding the failing port off for a
    /// doubling interval
    #[default]
    Continue,
    /// Unregister the service whose port failed
    Unregister,
    /// Abort the process
    Abort,
}

pub(crate) enum ServerKind {
    Real {
        port: Arc<dyn RouterPort>,
        channel: Mutex<MessageChannel>,
    },
    CallbackClient,
}

/// One registry entry.
pub(crate) struct RegisteredServer {
    prog: u32,
    vers: u32,
    dispatch: DispatchFn,
    kind: ServerKind,
    // Set only while the dispatch function runs
    active: AtomicBool,
    backoff: PortBackoff,
}

impl RegisteredServer {
    fn is_real(&self) -> bool {
        matches!(self.kind, ServerKind::Real { .. })
    }
}

impl fmt::Debug for RegisteredServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_real() { "real" } else { "callback" };
        write!(f, "{:08x}:{:08x} ({kind})", self.prog, self.vers)
    }
}

#[derive(Default)]
struct Registry {
    servers: Vec<Arc<RegisteredServer>>,
    num_servers: usize,
    num_cb_servers: usize,
    // Bumped every time a dispatch thread is started; an older thread exits
    // when it sees a newer generation.
    generation: u64,
    thread: Option<JoinHandle<()>>,
}

/// The transport shared by all [`SvcTransport`] handles of a context.
pub(crate) struct XprtShared {
    router: Arc<dyn Router>,
    config: RouterConfig,
    xids: XidAllocator,
    wake_lock: Arc<dyn WakeLock>,
    registry: Mutex<Registry>,
    in_reset: AtomicBool,
    reset_cb: Mutex<Option<ResetCallback>>,
    read_failure: Mutex<ReadFailurePolicy>,
}

impl fmt::Debug for XprtShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = lock(&self.registry);
        write!(
            f,
            "xprt({} servers, {} cb servers)",
            registry.num_servers, registry.num_cb_servers
        )
    }
}

impl XprtShared {
    pub(crate) fn new(
        router: Arc<dyn Router>,
        config: RouterConfig,
        xids: XidAllocator,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            router,
            config,
            xids,
            wake_lock,
            registry: Mutex::new(Registry::default()),
            in_reset: AtomicBool::new(false),
            reset_cb: Mutex::new(None),
            read_failure: Mutex::new(ReadFailurePolicy::default()),
        }
    }

    pub(crate) fn in_reset(&self) -> bool {
        self.in_reset.load(Ordering::SeqCst)
    }

    pub(crate) fn set_in_reset(&self, in_reset: bool) {
        self.in_reset.store(in_reset, Ordering::SeqCst);
    }

    pub(crate) fn notify_reset(&self, event: ResetEvent) {
        let cb = lock(&self.reset_cb).clone();
        debug!("Calling svc reset cb with event {event:?}");
        if let Some(cb) = cb {
            cb(event);
        }
    }

    pub(crate) fn find(&self, prog: u32, vers: u32) -> Option<Arc<RegisteredServer>> {
        lock(&self.registry)
            .servers
            .iter()
            .find(|s| s.prog == prog && s.vers == vers)
            .cloned()
    }

    fn register(self: &Arc<Self>, prog: u32, vers: u32, dispatch: DispatchFn) -> Result<()> {
        let mut registry = lock(&self.registry);
        debug!("registering for service {prog:08x}:{vers:08x}");

        if let Some(existing) = registry
            .servers
            .iter()
            .find(|s| s.prog == prog && s.vers == vers)
        {
            error!("service {prog:08x}:{vers:08x} is already registered");
            return if Arc::ptr_eq(&existing.dispatch, &dispatch) {
                Ok(())
            } else {
                Err(Error::AlreadyRegistered { prog, vers })
            };
        }

        let kind = if prog & CALLBACK_PROG_BIT != 0 {
            debug!("RPC server {prog:08x}:{vers:08x} is a callback client");
            ServerKind::CallbackClient
        } else {
            trace!("RPC server {prog:08x}:{vers:08x} is a real server");
            let port = self.router.open(&self.config.router_name).inspect_err(|_| {
                error!("failed to initialize service {prog:08x}:{vers:08x} (permissions?)")
            })?;
            trace!("RPC server {prog:08x}:{vers:08x}: registering with kernel");
            port.control(Control::RegisterServer { prog, vers })
                .inspect_err(|e| error!("register server {prog:08x}:{vers:08x} failed: {e}"))?;
            ServerKind::Real {
                channel: Mutex::new(MessageChannel::new(
                    port.clone(),
                    prog,
                    vers,
                    self.xids.clone(),
                )),
                port,
            }
        };

        let real = matches!(kind, ServerKind::Real { .. });
        registry.servers.push(Arc::new(RegisteredServer {
            prog,
            vers,
            dispatch,
            kind,
            active: AtomicBool::new(false),
            backoff: PortBackoff::default(),
        }));
        if real {
            registry.num_servers += 1;
        } else {
            registry.num_cb_servers += 1;
        }
        trace!(
            "RPC server {prog:08x}:{vers:08x}: after registering, total {} servers, {} cb servers",
            registry.num_servers,
            registry.num_cb_servers
        );

        if real && registry.num_servers == 1 {
            registry.generation += 1;
            let generation = registry.generation;
            let xprt = self.clone();
            debug!("creating RPC-server thread");
            let handle = thread::Builder::new()
                .name("rpc-svc".to_string())
                .spawn(move || dispatch::run(xprt, generation))
                .map_err(|source| Error::Spawn {
                    name: "dispatch",
                    source,
                });
            match handle {
                // Any previous thread sees the new generation and exits on
                // its own.
                Ok(handle) => registry.thread = Some(handle),
                Err(e) => {
                    error!("failed to start RPC-server thread: {e}");
                    if let Some(server) = registry.servers.pop() {
                        Self::release(&server);
                    }
                    registry.num_servers -= 1;
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn unregister(&self, prog: u32, vers: u32) {
        let mut registry = lock(&self.registry);
        debug!("unregistering RPC server {prog:08x}:{vers:08x}");
        let Some(index) = registry
            .servers
            .iter()
            .position(|s| s.prog == prog && s.vers == vers)
        else {
            return;
        };
        let found = registry.servers.remove(index);
        Self::release(&found);
        if found.is_real() {
            registry.num_servers -= 1;
        } else {
            registry.num_cb_servers -= 1;
        }
        trace!(
            "RPC server {prog:08x}:{vers:08x}: after unregistering, {} servers, {} cb servers left",
            registry.num_servers,
            registry.num_cb_servers
        );
    }

    fn release(server: &RegisteredServer) {
        if let ServerKind::Real { port, .. } = &server.kind {
            let (prog, vers) = (server.prog, server.vers);
            if let Err(e) = port.control(Control::UnregisterServer { prog, vers }) {
                error!("unregister server {prog:08x}:{vers:08x} failed: {e}");
            }
        }
    }

    /// Unregister everything and stop the dispatch thread.
    pub(crate) fn shutdown(&self) {
        let handle = {
            let mut registry = lock(&self.registry);
            debug!(
                "Destroying RPC transport (servers {}, cb servers {})",
                registry.num_servers, registry.num_cb_servers
            );
            for server in registry.servers.drain(..) {
                Self::release(&server);
            }
            registry.num_servers = 0;
            registry.num_cb_servers = 0;
            registry.generation += 1;
            registry.thread.take()
        };
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("RPC-server thread panicked");
            }
        }
    }

    /// Dispatch a callback call, already copied out of the owning client's
    /// port, to `server`.
    pub(crate) fn dispatch_callback(&self, server: &RegisteredServer, mut channel: MessageChannel) {
        dispatch::dispatch(server, &mut channel);
    }

    fn read_failure_policy(&self) -> ReadFailurePolicy {
        *lock(&self.read_failure)
    }
}

/// Handle on a context's server transport.
///
/// Cloning takes another reference.  When the last handle is dropped every
/// service is unregistered and the dispatch thread is stopped.
pub struct SvcTransport {
    pub(crate) xprt: Arc<XprtShared>,
    pub(crate) ctx: RpcContext,
}

impl fmt::Debug for SvcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.xprt, f)
    }
}

impl Clone for SvcTransport {
    fn clone(&self) -> Self {
        self.ctx.svc_create()
    }
}

impl Drop for SvcTransport {
    fn drop(&mut self) {
        self.ctx.release_transport();
    }
}

impl SvcTransport {
    /// Register `dispatch` for `prog`/`vers`.
    ///
    /// Registering the same program and version again succeeds only with the
    /// same dispatch function.
    pub fn svc_register(&self, prog: u32, vers: u32, dispatch: DispatchFn) -> Result<()> {
        self.xprt.register(prog, vers, dispatch)
    }

    /// Remove the service for `prog`/`vers`, if registered.
    pub fn svc_unregister(&self, prog: u32, vers: u32) {
        self.xprt.unregister(prog, vers)
    }

    /// Whether a service is registered for `prog`/`vers`.
    pub fn is_registered(&self, prog: u32, vers: u32) -> bool {
        self.xprt.find(prog, vers).is_some()
    }

    pub fn in_reset(&self) -> bool {
        self.xprt.in_reset()
    }

    /// Install `cb` to be told when the modem subsystem restarts.
    pub fn register_reset_notification_cb<F>(&self, cb: F)
    where
        F: Fn(ResetEvent) + Send + Sync + 'static,
    {
        *lock(&self.xprt.reset_cb) = Some(Arc::new(cb));
    }

    /// Remove the reset callback, returning it.
    pub fn unregister_reset_notification_cb(&self) -> Option<ResetCallback> {
        lock(&self.xprt.reset_cb).take()
    }

    /// Set what happens when reading a service port fails.
    pub fn set_read_failure_policy(&self, policy: ReadFailurePolicy) {
        *lock(&self.xprt.read_failure) = policy;
    }
}
