//! Single-slot inbound mailbox.
//!
//! Each client port has exactly one inbound message in flight.  The receive
//! thread must take the slot's token before reading, and the token only comes
//! back when whoever consumes the message (the caller waiting for a reply, or
//! the callback thread) drops its [`SlotLease`].  This keeps replies and
//! inbound calls on one port strictly ordered.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::Mutex;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};

use crate::wakelock::WakeHold;

/// Capacity-1 token channel guarding one inbound buffer.
#[derive(Debug)]
pub struct InboundSlot {
    tx: SyncSender<()>,
    rx: Mutex<Receiver<()>>,
}

impl Default for InboundSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundSlot {
    /// Create a free slot.
    pub fn new() -> Self {
        let (tx, rx) = sync_channel(1);
        // Cannot fail, the channel is empty and its receiver is alive.
        let _ = tx.try_send(());
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Wait for the slot to be free and take it.
    pub fn acquire(&self) -> SlotLease {
        let rx = crate::lock(&self.rx);
        // We hold a sender ourselves, so recv only returns once a token is
        // back.
        let _ = rx.recv();
        SlotLease {
            tx: self.tx.clone(),
        }
    }

    #[cfg(test)]
    fn try_acquire(&self) -> Option<SlotLease> {
        let rx = crate::lock(&self.rx);
        rx.try_recv().ok().map(|()| SlotLease {
            tx: self.tx.clone(),
        })
    }
}

/// Ownership of the inbound slot.  Frees the slot on drop.
#[derive(Debug)]
pub struct SlotLease {
    tx: SyncSender<()>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        let _ = self.tx.try_send(());
    }
}

/// A message read by the receive thread, with the slot it occupies.
#[derive(Debug)]
pub struct InboundMessage {
    pub bytes: Vec<u8>,
    pub lease: SlotLease,
    pub wake: Option<WakeHold>,
}
