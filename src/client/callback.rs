//! Per-client callback thread.
//!
//! A CALL arriving on a client's port is addressed to the callback program
//! for that client (`prog | 0x01000000`).  The receive thread parks it in the
//! client's callback state and this thread, started on the first such call,
//! dispatches it to the callback service registered with the context's
//! server transport.  The reply goes back out on the client's port.
//!
//! The thread also carries reset transitions over to the server transport, so
//! that services see the same reset state as the client.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::{Arc, Weak};
use std::thread;

use crate::CALLBACK_PROG_BIT;
use crate::channel::{InboundMessage, MessageChannel};
use crate::client::ClientShared;
use crate::context::ContextInner;
use crate::message;
use crate::{ResetEvent, lock, wait};

/// Queue an inbound call for `shared`, starting its callback thread if this
/// is the first.
pub(crate) fn deliver_call(shared: &Arc<ClientShared>, ctx: &Arc<ContextInner>, msg: InboundMessage) {
    let mut state = lock(&shared.cb);
    debug!("{:08x}:{:08x} received CALL", shared.prog, shared.vers);
    if state.stop {
        return;
    }
    if state.pending.is_some() {
        warn!(
            "{:08x}:{:08x} CALL arrived before the previous one was taken",
            shared.prog, shared.vers
        );
    }
    state.pending = Some(msg);

    if state.thread.is_none() {
        debug!(
            "{:08x}:{:08x} starting callback thread",
            shared.prog, shared.vers
        );
        let thread_shared = shared.clone();
        let thread_ctx = Arc::downgrade(ctx);
        match thread::Builder::new()
            .name(format!("rpc-cb-{:08x}", shared.prog | CALLBACK_PROG_BIT))
            .spawn(move || run(thread_shared, thread_ctx))
        {
            Ok(handle) => state.thread = Some(handle),
            Err(e) => {
                error!(
                    "{:08x}:{:08x} failed to start callback thread: {e}",
                    shared.prog, shared.vers
                );
                state.pending = None;
                return;
            }
        }
    }
    shared.cb_cv.notify_all();
}

/// Stop and join the callback thread, if it was started.
pub(crate) fn stop(shared: &ClientShared) {
    let handle = {
        let mut state = lock(&shared.cb);
        state.stop = true;
        state.pending = None;
        shared.cb_cv.notify_all();
        state.thread.take()
    };
    if let Some(handle) = handle {
        if handle.thread().id() == thread::current().id() {
            // Destroyed from inside a callback, the thread exits on its own.
            return;
        }
        debug!(
            "{:08x}:{:08x} joining callback thread",
            shared.prog, shared.vers
        );
        if handle.join().is_err() {
            error!(
                "{:08x}:{:08x} callback thread panicked",
                shared.prog, shared.vers
            );
        }
    }
}

fn run(shared: Arc<ClientShared>, ctx: Weak<ContextInner>) {
    debug!(
        "RPC-callback thread for {:08x}:{:08x} starting",
        shared.prog | CALLBACK_PROG_BIT,
        shared.vers
    );

    let mut state = lock(&shared.cb);
    while !state.stop {
        if let Some(event) = reset_transition(&shared, &ctx) {
            drop(state);
            if let Some(xprt) = ctx.upgrade().and_then(|ctx| ctx.transport()) {
                debug!("{xprt:?} - {event:?}");
                xprt.set_in_reset(event == ResetEvent::RestartBegin);
                xprt.notify_reset(event);
            }
            state = lock(&shared.cb);
            continue;
        }

        let Some(msg) = state.pending.take() else {
            state = wait(&shared.cb_cv, state);
            continue;
        };
        drop(state);
        dispatch(&shared, &ctx, msg);
        state = lock(&shared.cb);
    }
    drop(state);

    debug!(
        "RPC-callback thread for {:08x}:{:08x} terminating",
        shared.prog | CALLBACK_PROG_BIT,
        shared.vers
    );
}

// The event to pass on if the client's reset state differs from the server
// transport's.
fn reset_transition(shared: &ClientShared, ctx: &Weak<ContextInner>) -> Option<ResetEvent> {
    let xprt = ctx.upgrade()?.transport()?;
    let in_reset = shared.in_reset();
    if in_reset == xprt.in_reset() {
        return None;
    }
    Some(if in_reset {
        ResetEvent::RestartBegin
    } else {
        ResetEvent::RestartEnd
    })
}

fn dispatch(shared: &ClientShared, ctx: &Weak<ContextInner>, msg: InboundMessage) {
    let InboundMessage { bytes, lease, wake } = msg;

    let Some((prog, vers)) = message::peek_prog_vers(&bytes) else {
        error!(
            "{:08x}:{:08x} CALL too short to carry a header",
            shared.prog, shared.vers
        );
        return;
    };
    let Some(ctx) = ctx.upgrade() else {
        return;
    };
    let Some(xprt) = ctx.transport() else {
        error!(
            "{:08x}:{:08x} call packet arrived, but there's no RPC transport",
            shared.prog, shared.vers
        );
        return;
    };
    let Some(server) = xprt.find(prog, vers) else {
        error!(
            "{:08x}:{:08x} call packet arrived, but there's no RPC server registered for {prog:08x}:{vers:08x}",
            shared.prog, shared.vers
        );
        return;
    };

    debug!(
        "{:08x}:{:08x} dispatching RPC call (XID {:?}) for callback client {prog:08x}:{vers:08x}",
        shared.prog,
        shared.vers,
        message::peek_xid(&bytes)
    );

    // Owned copy: the client's inbound slot is free again as soon as the
    // snapshot exists.
    let channel = MessageChannel::with_inbound(
        shared.port().clone(),
        prog,
        vers,
        ctx.xids.clone(),
        bytes,
    );
    drop(lease);
    xprt.dispatch_callback(&server, channel);
    drop(wake);
}
