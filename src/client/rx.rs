//! Shared receive thread.
//!
//! One thread per context watches every client port plus the wakeup pair.
//! The wakeup pair is written whenever the set of clients changes, so the
//! thread can rebuild its poll set.
//!
//! A client not in reset is watched for input and read hang-up.  Read hang-up
//! means the modem went down.  A client in reset is watched for writability
//! instead, which means the modem is back.
//!
//! A port whose reads fail, or which reports hang-up or error with nothing
//! to read, is left out of the poll set for a doubling interval.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::channel::{InboundMessage, read_message};
use crate::client::{ClientShared, callback};
use crate::context::ContextInner;
use crate::io::{Interest, PollEntry, RouterPort, next_wake};
use crate::lock;
use crate::message::{self, MsgType};
use crate::wakelock::WakeHold;

pub(crate) fn run(ctx: Arc<ContextInner>, wakeup: Arc<dyn RouterPort>, stop: Arc<AtomicBool>) {
    debug!("RPC-client RX thread starting");

    while !stop.load(Ordering::SeqCst) {
        let (clients, version) = {
            let list = lock(&ctx.clients);
            (list.clients.clone(), list.version)
        };

        // Ports in hold-off after failed reads sit this round out
        let now = Instant::now();
        let mut holds = Vec::new();
        let mut polled = Vec::with_capacity(clients.len());
        let mut entries = Vec::with_capacity(clients.len() + 1);
        entries.push(PollEntry::new(wakeup.clone(), Interest::READABLE));
        for client in clients {
            if let Some(left) = client.backoff.remaining(now) {
                holds.push(left);
                continue;
            }
            let interest = if client.in_reset() {
                Interest::WRITABLE
            } else {
                Interest::READABLE | Interest::READ_HUP
            };
            entries.push(PollEntry::new(client.port().clone(), interest));
            polled.push(client);
        }

        let ready = ctx.router.poll(&mut entries, next_wake(holds.into_iter(), None));

        if !entries[0].ready.is_empty() {
            let mut buf = [0u8; 64];
            if let Err(e) = wakeup.read(&mut buf) {
                error!("error draining wakeup pipe: {e}");
            }
            trace!("wakeup={:?}", entries[0].ready);
        }

        if stop.load(Ordering::SeqCst) {
            break;
        }

        if let Err(e) = ready {
            error!("poll() error {e}");
            continue;
        }

        let current = lock(&ctx.clients).version;
        if current != version {
            debug!("Client set changed, rebuilding poll set");
            continue;
        }

        for (client, entry) in polled.iter().zip(entries[1..].iter()) {
            service(&ctx, client, entry.ready);
        }
    }

    debug!("RPC-client RX thread exiting");
}

fn service(ctx: &Arc<ContextInner>, client: &Arc<ClientShared>, ready: Interest) {
    if ready.is_empty() {
        return;
    }
    trace!(
        "{client:?} poll events IN={} OUT={} RDHUP={} in_reset={}",
        ready.contains(Interest::READABLE),
        ready.contains(Interest::WRITABLE),
        ready.contains(Interest::READ_HUP),
        client.in_reset()
    );

    if !client.in_reset() {
        if ready.contains(Interest::READ_HUP) {
            client.enter_reset();
            return;
        }
    } else if ready.contains(Interest::WRITABLE) {
        client.leave_reset();
    }

    if !ready.contains(Interest::READABLE) {
        if ready.intersects(Interest::HUP | Interest::ERROR) {
            read_failed(ctx, client, format_args!("port reported {ready:?}"));
        }
        return;
    }

    // Wait for the previous message on this port to be consumed.
    let lease = client.slot.acquire();
    let wake = WakeHold::new(ctx.wake_lock.clone());
    let bytes = match read_message(client.port().as_ref()) {
        Ok(bytes) => bytes,
        Err(e) => {
            read_failed(ctx, client, e);
            return;
        }
    };
    client.backoff.succeeded();
    let msg = InboundMessage {
        bytes,
        lease,
        wake: Some(wake),
    };

    match message::peek_msg_type(&msg.bytes) {
        Some(MsgType::Reply) => client.deliver_reply(msg),
        Some(MsgType::Call) => callback::deliver_call(client, ctx, msg),
        None => warn!("{client:?} dropping message of unknown type"),
    }
}

fn read_failed(ctx: &ContextInner, client: &ClientShared, reason: impl fmt::Display) {
    let (delay, failures) = client.backoff.failed(ctx.config.read_retry_delay);
    error!("{client:?} read error: {reason} ({failures} in a row, retrying in {delay:?})");
}
