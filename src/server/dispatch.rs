//! Server dispatch thread.
//!
//! Runs while at least one real service is registered, waiting on every real
//! service port at once.  Each ready port has one call read off it, checked
//! against the service and handed to the dispatch function.  The thread
//! rebuilds its poll set every round, so services registered or removed
//! while it is waiting are picked up within one poll period.
//!
//! What happens when a port fails is up to the transport's
//! [`ReadFailurePolicy`].  Under the default a failing port is held off for
//! a doubling interval before it is polled again.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Instant;

use crate::channel::MessageChannel;
use crate::io::{Interest, PollEntry, next_wake};
use crate::lock;
use crate::message::CallHeader;
use crate::server::{ReadFailurePolicy, RegisteredServer, ServerKind, SvcRequest, XprtShared};
use crate::wakelock::WakeHold;

pub(crate) fn run(xprt: Arc<XprtShared>, generation: u64) {
    debug!("RPC-server thread starting");

    loop {
        let servers: Vec<Arc<RegisteredServer>> = {
            let registry = lock(&xprt.registry);
            if registry.num_servers == 0 || registry.generation != generation {
                break;
            }
            registry
                .servers
                .iter()
                .filter(|s| s.is_real())
                .cloned()
                .collect()
        };

        // Ports in hold-off after failed reads sit this round out
        let now = Instant::now();
        let mut holds = Vec::new();
        let mut polled = Vec::with_capacity(servers.len());
        let mut entries = Vec::with_capacity(servers.len());
        for server in servers {
            let ServerKind::Real { port, .. } = &server.kind else {
                continue;
            };
            match server.backoff.remaining(now) {
                Some(left) => holds.push(left),
                None => {
                    entries.push(PollEntry::new(port.clone(), Interest::READABLE));
                    polled.push(server);
                }
            }
        }

        let period = xprt.config.svc_poll_period;
        let timeout = next_wake(holds.into_iter(), Some(period)).unwrap_or(period);
        if entries.is_empty() {
            thread::sleep(timeout);
            continue;
        }

        match xprt.router.poll(&mut entries, Some(timeout)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
                error!("poll() error {e}");
                thread::sleep(period);
                continue;
            }
        }

        let _wake = WakeHold::new(xprt.wake_lock.clone());
        for (server, entry) in polled.iter().zip(entries.iter()) {
            if entry.ready.contains(Interest::READABLE) {
                service(&xprt, server);
            } else if entry.ready.intersects(Interest::HUP | Interest::ERROR) {
                read_failed(&xprt, server, format_args!("port reported {:?}", entry.ready));
            }
        }
    }

    debug!("RPC-server thread exiting");
}

fn service(xprt: &XprtShared, server: &RegisteredServer) {
    let ServerKind::Real { channel, .. } = &server.kind else {
        return;
    };
    let mut channel = lock(channel);
    trace!("{server:?} reading message");
    if let Err(e) = channel.read() {
        drop(channel);
        read_failed(xprt, server, e);
        return;
    }
    server.backoff.succeeded();
    dispatch(server, &mut channel);
}

fn read_failed(xprt: &XprtShared, server: &RegisteredServer, reason: impl fmt::Display) {
    match xprt.read_failure_policy() {
        ReadFailurePolicy::Continue => {
            let (delay, failures) = server.backoff.failed(xprt.config.read_retry_delay);
            error!("{server:?} read error: {reason} ({failures} in a row, retrying in {delay:?})");
        }
        ReadFailurePolicy::Unregister => {
            error!("{server:?} read error: {reason}");
            warn!("{server:?} unregistering after read failure");
            xprt.unregister(server.prog, server.vers);
        }
        ReadFailurePolicy::Abort => {
            error!("{server:?} read error: {reason}, aborting");
            std::process::abort();
        }
    }
}

/// Check the inbound message on `channel` is a call for `server` and run
/// the service's dispatch function on it.
pub(crate) fn dispatch(server: &RegisteredServer, channel: &mut MessageChannel) {
    let header = match CallHeader::decode(channel.xdr_mut()) {
        Ok(header) => header,
        Err(e) => {
            error!("{server:?} expecting an RPC call: {e}");
            channel.msg_done();
            return;
        }
    };
    if header.prog != server.prog {
        error!(
            "{server:?} server received a call for program {:08x}, dropping",
            header.prog
        );
        channel.msg_done();
        return;
    }
    if header.vers != server.vers {
        error!(
            "{server:?} server received a call for version {:08x}, dropping",
            header.vers
        );
        channel.msg_done();
        return;
    }

    trace!(
        "{server:?} dispatching RPC call (XID {}, proc {})",
        header.xid, header.proc
    );
    server.active.store(true, Ordering::SeqCst);
    {
        let mut request = SvcRequest::new(server, channel, header.xid, header.proc, header.cred);
        (server.dispatch)(&mut request);
    }
    server.active.store(false, Ordering::SeqCst);
    channel.msg_done();
}
