//! Runtime context.
//!
//! An [`RpcContext`] owns everything the clients and services created from
//! it share: the router binding, the transaction id counter, the wake lock,
//! the list of live clients with the receive thread serving them, and the
//! server transport.  Cloning a context is cheap and every clone refers to
//! the same state.
//!
//! The receive thread is started with the first client and stopped when the
//! last client is destroyed.  The router's own control endpoint is held open
//! for the same span.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crate::channel::XidAllocator;
use crate::client::{ClientShared, RpcClient, normalize_vers, rx};
use crate::config::RouterConfig;
use crate::io::{Control, DeviceRouter, Router, RouterPort};
use crate::server::{SvcTransport, XprtShared};
use crate::wakelock::{NoWakeLock, SysfsWakeLock, WakeLock};
use crate::{Error, Result, lock};

struct RxThread {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct ClientList {
    pub(crate) clients: Vec<Arc<ClientShared>>,
    // Bumped on every change to `clients`
    pub(crate) version: u64,
    router_port: Option<Arc<dyn RouterPort>>,
    wakeup: Option<(Arc<dyn RouterPort>, Arc<dyn RouterPort>)>,
    rx: Option<RxThread>,
}

#[derive(Default)]
struct TransportSlot {
    xprt: Option<Arc<XprtShared>>,
    refcount: usize,
}

pub(crate) struct ContextInner {
    pub(crate) router: Arc<dyn Router>,
    pub(crate) config: RouterConfig,
    pub(crate) wake_lock: Arc<dyn WakeLock>,
    pub(crate) xids: XidAllocator,
    pub(crate) clients: Mutex<ClientList>,
    transport: Mutex<TransportSlot>,
}

impl ContextInner {
    /// The server transport, if any handle to it is alive
    pub(crate) fn transport(&self) -> Option<Arc<XprtShared>> {
        lock(&self.transport).xprt.clone()
    }
}

/// Shared runtime state for clients and services.
#[derive(Clone)]
pub struct RpcContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl fmt::Debug for RpcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clients = lock(&self.inner.clients).clients.len();
        write!(f, "RpcContext({clients} clients)")
    }
}

impl RpcContext {
    /// Create a context over `router`, without a wake lock.
    pub fn new(router: Arc<dyn Router>, config: RouterConfig) -> Self {
        Self::with_wake_lock(router, config, Arc::new(NoWakeLock))
    }

    /// Create a context over `router`, holding `wake_lock` while messages
    /// are in flight.
    pub fn with_wake_lock(
        router: Arc<dyn Router>,
        config: RouterConfig,
        wake_lock: Arc<dyn WakeLock>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                router,
                config,
                wake_lock,
                xids: XidAllocator::default(),
                clients: Mutex::new(ClientList::default()),
                transport: Mutex::new(TransportSlot::default()),
            }),
        }
    }

    /// Create a context over the router character device, using the sysfs
    /// wake lock.
    pub fn device(config: RouterConfig) -> Self {
        let router = Arc::new(DeviceRouter::new(config.clone()));
        Self::with_wake_lock(router, config, Arc::new(SysfsWakeLock::default()))
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    /// Create a client for `prog`/`vers`.
    ///
    /// `host` and `proto` are accepted for compatibility and ignored: every
    /// call goes through the router.  The version's minor half is dropped
    /// unless bit 31 is set.
    pub fn clnt_create(&self, host: &str, prog: u32, vers: u32, proto: &str) -> Result<RpcClient> {
        let vers = normalize_vers(vers);
        debug!("Creating client {prog:08x}:{vers:08x} (host {host}, proto {proto})");

        let inner = &self.inner;
        let mut list = lock(&inner.clients);

        if list.router_port.is_none() {
            let router = inner.router.open(&inner.config.router_name)?;
            match router.control(Control::GetVersion) {
                Ok(version) => debug!("RPC router version {version:08x}"),
                Err(e) => debug!("failed to read RPC router version: {e}"),
            }
            list.router_port = Some(router);
        }

        let name = format!("{prog:08x}:{vers:08x}");
        let port = match inner.router.open(&name) {
            Ok(port) => port,
            Err(e) => {
                error!("failed to initialize client {name} (permissions?)");
                if list.clients.is_empty() {
                    list.router_port = None;
                }
                return Err(e.into());
            }
        };

        if list.wakeup.is_none() {
            match inner.router.wakeup() {
                Ok(pair) => list.wakeup = Some(pair),
                Err(e) => {
                    error!("failed to create wakeup pipe: {e}");
                    if list.clients.is_empty() {
                        list.router_port = None;
                    }
                    return Err(e.into());
                }
            }
        }

        let shared = Arc::new(ClientShared::new(port, prog, vers, inner.xids.clone()));
        list.clients.push(shared.clone());
        list.version += 1;

        if list.rx.is_none() {
            if let Err(e) = self.start_receiver(&mut list) {
                list.clients.pop();
                list.version += 1;
                if list.clients.is_empty() {
                    list.router_port = None;
                    list.wakeup = None;
                }
                return Err(e);
            }
        } else {
            Self::kick(&list);
        }

        debug!("Client {name} created");
        Ok(RpcClient {
            shared,
            ctx: self.clone(),
        })
    }

    fn start_receiver(&self, list: &mut ClientList) -> Result<()> {
        let Some((rx_port, _)) = &list.wakeup else {
            return Ok(());
        };
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let thread_ctx = self.inner.clone();
        let wakeup = rx_port.clone();
        debug!("Starting RPC-client RX thread");
        let handle = thread::Builder::new()
            .name("rpc-rx".to_string())
            .spawn(move || rx::run(thread_ctx, wakeup, thread_stop))
            .map_err(|source| Error::Spawn {
                name: "receive",
                source,
            })?;
        list.rx = Some(RxThread { stop, handle });
        Ok(())
    }

    fn kick(list: &ClientList) {
        if let Some((_, tx)) = &list.wakeup {
            if let Err(e) = tx.write(&[1]) {
                error!("error kicking RPC-client RX thread: {e}");
            }
        }
    }

    /// Wake the receive thread so it rebuilds its poll set.
    pub(crate) fn kick_receiver(&self) {
        Self::kick(&lock(&self.inner.clients));
    }

    /// Remove `shared` from the client list, stopping the receive thread if
    /// it was the last client.
    pub(crate) fn remove_client(&self, shared: &Arc<ClientShared>) {
        let (rx, wakeup, router) = {
            let mut list = lock(&self.inner.clients);
            list.clients.retain(|c| !Arc::ptr_eq(c, shared));
            list.version += 1;
            if !list.clients.is_empty() {
                Self::kick(&list);
                return;
            }
            (list.rx.take(), list.wakeup.take(), list.router_port.take())
        };

        if let Some(rx) = rx {
            rx.stop.store(true, Ordering::SeqCst);
            if let Some((_, tx)) = &wakeup {
                if let Err(e) = tx.write(&[1]) {
                    error!("error stopping RPC-client RX thread: {e}");
                }
            }
            if rx.handle.thread().id() != thread::current().id() {
                debug!("Joining RPC-client RX thread");
                if rx.handle.join().is_err() {
                    error!("RPC-client RX thread panicked");
                }
            }
        }
        drop(wakeup);
        drop(router);
        debug!("Last client destroyed, router closed");
    }

    /// Get a handle on the server transport, creating it if there is none.
    pub fn svc_create(&self) -> SvcTransport {
        let inner = &self.inner;
        let mut slot = lock(&inner.transport);
        let xprt = match &slot.xprt {
            Some(xprt) => xprt.clone(),
            None => {
                debug!("Creating RPC transport");
                let xprt = Arc::new(XprtShared::new(
                    inner.router.clone(),
                    inner.config.clone(),
                    inner.xids.clone(),
                    inner.wake_lock.clone(),
                ));
                slot.xprt = Some(xprt.clone());
                xprt
            }
        };
        slot.refcount += 1;
        trace!("RPC transport refcount {}", slot.refcount);
        SvcTransport {
            xprt,
            ctx: self.clone(),
        }
    }

    pub(crate) fn release_transport(&self) {
        let xprt = {
            let mut slot = lock(&self.inner.transport);
            slot.refcount = slot.refcount.saturating_sub(1);
            trace!("RPC transport refcount {}", slot.refcount);
            if slot.refcount > 0 {
                return;
            }
            slot.xprt.take()
        };
        if let Some(xprt) = xprt {
            xprt.shutdown();
        }
    }
}
