//! ONC RPC runtime for talking to a modem processor through a kernel RPC router.
//!
//! The kernel exposes the router as a character device.  Every open descriptor on
//! that device is one endpoint: a client endpoint is named after the program and
//! version it talks to (`30000000:00010000`), while server endpoints are opened
//! on the router itself (`00000000:0`) and then registered for a program/version
//! pair with an ioctl.  One read returns one whole RPC message, one write sends
//! one whole RPC message.
//!
//! On top of that this crate provides:
//!
//! - [`xdr`] - big-endian, 4-byte aligned XDR primitives and composite
//!   traversals (encode, decode and free with the same type description)
//! - [`message`] - RPC call and reply headers, accept/reject statuses
//! - [`io`] - the transport binding traits ([`io::Router`], [`io::RouterPort`])
//!   and [`io::DeviceRouter`], the implementation backed by the real device
//! - [`channel`] - a [`channel::MessageChannel`] turning XDR primitives into whole
//!   messages over one port
//! - [`client`] - blocking clients multiplexed over one shared receive thread,
//!   with callback delivery and modem subsystem-reset handling
//! - [`server`] - the service registry and its dispatch thread
//! - [`context`] - [`RpcContext`], the object that owns all of the above
//!
//! ## Architecture
//!
//! ```text
//!  caller ──call()──► MessageChannel ──write──► port ──► router ──► modem
//!                                                           │
//!  caller ◄─reply──── receive thread ◄──poll/read── ports ◄──┘
//!                          │
//!                          └─call──► callback thread ──► server registry
//!                                                         (callback clients)
//!
//!  dispatch thread ◄──poll/read── registered service ports
//!        └──► dispatch fn ──sendreply()──► port
//! ```
//!
//! A program number with bit `0x01000000` set is a callback program: calls for
//! `0x31000000` arrive on the descriptor of the client for `0x30000000`, and are
//! dispatched to whatever service was registered for `0x31000000`.
//!
//! ## Getting Started
//!
//! ```no_run
//! use oncrpc_router::{RpcContext, RouterConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let ctx = RpcContext::device(RouterConfig::default());
//! let client = ctx.clnt_create("localhost", 0x3000_0000, 0x0001_0000, "rs300000")?;
//! let mut arg = 42u32;
//! let mut result = 0u32;
//! client.call(1, &mut arg, &mut result, None)?;
//! client.destroy();
//! # Ok(())
//! # }
//! ```

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod channel;
pub mod client;
pub mod config;
pub mod context;
pub mod io;
pub mod message;
pub mod server;
pub mod wakelock;
pub mod xdr;

pub use client::{CallError, ClntStat, RpcClient};
pub use config::RouterConfig;
pub use context::RpcContext;
pub use server::{DispatchFn, ReadFailurePolicy, SvcRequest, SvcTransport};

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Program number bit marking a callback program.
pub const CALLBACK_PROG_BIT: u32 = 0x0100_0000;

/// Reset events reported when the modem subsystem restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetEvent {
    /// The modem went down.  Pending calls have been failed.
    RestartBegin,
    /// The modem is back.  New calls will be accepted.
    RestartEnd,
}

/// Reset notification callback.  Runs on a runtime thread, so must not block.
pub type ResetCallback = Arc<dyn Fn(ResetEvent) + Send + Sync>;

/// RPC runtime errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the router device
    #[error("router I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Message channel failure
    #[error(transparent)]
    Channel(#[from] channel::ChannelError),
    /// XDR encode/decode failure
    #[error(transparent)]
    Xdr(#[from] xdr::XdrError),
    /// Service already registered with a different dispatch function
    #[error("service {prog:08x}:{vers:08x} is already registered")]
    AlreadyRegistered { prog: u32, vers: u32 },
    /// Failed to start one of the runtime threads
    #[error("failed to start {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
    /// Request is no longer being dispatched
    #[error("request is not active")]
    NotActive,
}

/// Type to represent the result of an RPC runtime operation
pub type Result<T> = core::result::Result<T, Error>;

// Every piece of state behind these locks is left consistent at each point a
// panic could unwind through, so poisoning is ignored.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait<'a, T>(cv: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn wait_timeout<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> (MutexGuard<'a, T>, bool) {
    let (guard, result) = cv
        .wait_timeout(guard, timeout)
        .unwrap_or_else(PoisonError::into_inner);
    (guard, result.timed_out())
}
