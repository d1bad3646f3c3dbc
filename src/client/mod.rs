//! RPC clients.
//!
//! Every [`RpcClient`] owns one router port, named after the program and
//! version it talks to.  Calls are blocking and a client has at most one call
//! outstanding: concurrent callers on the same client queue up behind the
//! call mutex.
//!
//! Nothing reads a client's port except the context's shared receive thread
//! (see [`rx`]).  It hands a REPLY to the caller waiting in
//! [`RpcClient::call()`] and a CALL to the client's callback thread (see
//! [`callback`]), which dispatches it to the callback service registered for
//! `prog | 0x01000000`.
//!
//! When the modem subsystem restarts every client is flagged as in reset:
//! blocked calls return [`ClntStat::SubsystemRestart`] straight away and new
//! calls fail fast until the router reports the modem is back.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub(crate) mod callback;
pub(crate) mod rx;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::channel::{ChannelError, InboundMessage, InboundSlot, MessageChannel, XidAllocator};
use crate::context::RpcContext;
use crate::io::{Control, PortBackoff, RouterPort};
use crate::message::{self, AcceptedReply, AuthStat, RejectedReply, ReplyHeader};
use crate::xdr::{XdrError, XdrType};
use crate::{ResetCallback, ResetEvent, lock, wait, wait_timeout};

/// Call status codes, numbered as the classic `clnt_stat`.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClntStat {
    Success = 0,
    CantEncodeArgs = 1,
    CantDecodeRes = 2,
    CantSend = 3,
    CantRecv = 4,
    TimedOut = 5,
    // Denied replies, reject status + 6
    VersMismatch = 6,
    AuthError = 7,
    // Accepted but failed, accept status + 7
    ProgUnavail = 8,
    ProgVersMismatch = 9,
    ProcUnavail = 10,
    CantDecodeArgs = 11,
    SystemError = 12,
    /// Program locked.  Takes the slot of the classic unknown-host code,
    /// which a router transport never reports.
    ProgLocked = 13,
    /// The modem subsystem is restarting
    SubsystemRestart = 26,
}

impl ClntStat {
    pub const fn code(&self) -> u32 {
        *self as u32
    }
}

/// Why a call failed
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("can't encode arguments: {0}")]
    CantEncodeArgs(#[source] XdrError),
    #[error("can't decode results: {0}")]
    CantDecodeRes(#[source] XdrError),
    #[error("can't send call: {0}")]
    CantSend(#[source] ChannelError),
    #[error("can't decode reply header: {0}")]
    CantRecv(#[source] XdrError),
    #[error("reply xid {got} does not match call xid {expected}")]
    XidMismatch { expected: u32, got: u32 },
    #[error("call timed out")]
    TimedOut,
    #[error("RPC version mismatch, server supports {low}..={high}")]
    VersMismatch { low: u32, high: u32 },
    #[error("authentication error: {0:?}")]
    AuthError(AuthStat),
    #[error("program unavailable")]
    ProgUnavail,
    #[error("program version mismatch, server supports {low}..={high}")]
    ProgVersMismatch { low: u32, high: u32 },
    #[error("procedure unavailable")]
    ProcUnavail,
    #[error("server could not decode arguments")]
    CantDecodeArgs,
    #[error("server system error")]
    SystemError,
    #[error("program locked")]
    ProgLocked,
    #[error("subsystem restart")]
    SubsystemRestart,
}

impl CallError {
    /// Status code for this failure.  Distinct reply statuses always map to
    /// distinct codes.
    pub fn stat(&self) -> ClntStat {
        match self {
            CallError::CantEncodeArgs(_) => ClntStat::CantEncodeArgs,
            CallError::CantDecodeRes(_) => ClntStat::CantDecodeRes,
            CallError::CantSend(_) => ClntStat::CantSend,
            CallError::CantRecv(_) | CallError::XidMismatch { .. } => ClntStat::CantRecv,
            CallError::TimedOut => ClntStat::TimedOut,
            CallError::VersMismatch { .. } => ClntStat::VersMismatch,
            CallError::AuthError(_) => ClntStat::AuthError,
            CallError::ProgUnavail => ClntStat::ProgUnavail,
            CallError::ProgVersMismatch { .. } => ClntStat::ProgVersMismatch,
            CallError::ProcUnavail => ClntStat::ProcUnavail,
            CallError::CantDecodeArgs => ClntStat::CantDecodeArgs,
            CallError::SystemError => ClntStat::SystemError,
            CallError::ProgLocked => ClntStat::ProgLocked,
            CallError::SubsystemRestart => ClntStat::SubsystemRestart,
        }
    }

    /// Error for a reply the server did not accept or could not run.
    /// `None` for an accepted, successful reply.
    pub fn from_reply(header: &ReplyHeader) -> Option<Self> {
        match header {
            ReplyHeader::Denied(RejectedReply::Mismatch { low, high }) => {
                Some(CallError::VersMismatch {
                    low: *low,
                    high: *high,
                })
            }
            ReplyHeader::Denied(RejectedReply::AuthError(why)) => Some(CallError::AuthError(*why)),
            ReplyHeader::Accepted { stat, .. } => match stat {
                AcceptedReply::Success => None,
                AcceptedReply::ProgUnavail => Some(CallError::ProgUnavail),
                AcceptedReply::ProgMismatch { low, high } => Some(CallError::ProgVersMismatch {
                    low: *low,
                    high: *high,
                }),
                AcceptedReply::ProcUnavail => Some(CallError::ProcUnavail),
                AcceptedReply::GarbageArgs => Some(CallError::CantDecodeArgs),
                AcceptedReply::SystemErr => Some(CallError::SystemError),
                AcceptedReply::ProgLocked => Some(CallError::ProgLocked),
            },
        }
    }
}

/// Version compatibility rule: only the major version (top 16 bits) is
/// significant, unless bit 31 marks the version as exact.
pub const fn normalize_vers(vers: u32) -> u32 {
    if vers & 0x8000_0000 != 0 {
        vers
    } else {
        vers & 0xFFFF_0000
    }
}

#[derive(Debug, Default)]
pub(crate) struct ReplyState {
    waiting: bool,
    reply: Option<InboundMessage>,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackState {
    pending: Option<InboundMessage>,
    stop: bool,
    thread: Option<JoinHandle<()>>,
}

/// State shared between a client handle and the runtime threads.
pub(crate) struct ClientShared {
    prog: u32,
    vers: u32,
    port: Arc<dyn RouterPort>,
    // Held for the whole of a call
    channel: Mutex<MessageChannel>,
    reply: Mutex<ReplyState>,
    reply_cv: Condvar,
    slot: InboundSlot,
    cb: Mutex<CallbackState>,
    cb_cv: Condvar,
    in_reset: AtomicBool,
    reset_cb: Mutex<Option<ResetCallback>>,
    // Read failures on the port
    backoff: PortBackoff,
}

impl std::fmt::Debug for ClientShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Client({:08x}:{:08x})", self.prog, self.vers)
    }
}

impl ClientShared {
    pub(crate) fn new(port: Arc<dyn RouterPort>, prog: u32, vers: u32, xids: XidAllocator) -> Self {
        Self {
            prog,
            vers,
            channel: Mutex::new(MessageChannel::new(port.clone(), prog, vers, xids)),
            port,
            reply: Mutex::new(ReplyState::default()),
            reply_cv: Condvar::new(),
            slot: InboundSlot::new(),
            cb: Mutex::new(CallbackState::default()),
            cb_cv: Condvar::new(),
            in_reset: AtomicBool::new(false),
            reset_cb: Mutex::new(None),
            backoff: PortBackoff::default(),
        }
    }

    pub(crate) fn port(&self) -> &Arc<dyn RouterPort> {
        &self.port
    }

    pub(crate) fn in_reset(&self) -> bool {
        self.in_reset.load(Ordering::SeqCst)
    }

    fn notify_reset(&self, event: ResetEvent) {
        let cb = lock(&self.reset_cb).clone();
        if let Some(cb) = cb {
            cb(event);
        }
    }

    fn wake_callback_thread(&self) {
        let _state = lock(&self.cb);
        self.cb_cv.notify_all();
    }

    /// The modem went down: read hang-up on the port, or a write refused.
    /// Both can report the same reset, only the first counts.
    pub(crate) fn enter_reset(&self) {
        {
            let mut state = lock(&self.reply);
            if self.in_reset.swap(true, Ordering::SeqCst) {
                trace!("{:08x}:{:08x} already in reset", self.prog, self.vers);
                return;
            }
            debug!("{:08x}:{:08x} modem entered reset", self.prog, self.vers);
            // Any reply still sitting in the slot belongs to a call that is
            // about to fail.
            state.reply = None;
            self.reply_cv.notify_all();
        }
        self.wake_callback_thread();
        self.notify_reset(ResetEvent::RestartBegin);
    }

    /// Port writable again while in reset: the modem is back.
    pub(crate) fn leave_reset(&self) {
        debug!("{:08x}:{:08x} modem exited reset", self.prog, self.vers);
        {
            let _state = lock(&self.reply);
            if let Err(e) = self.port.control(Control::ClearNetReset) {
                error!(
                    "{:08x}:{:08x} failed to clear net reset: {e}",
                    self.prog, self.vers
                );
            }
            self.in_reset.store(false, Ordering::SeqCst);
        }
        self.wake_callback_thread();
        self.notify_reset(ResetEvent::RestartEnd);
    }

    /// Hand a reply to the waiting caller, or drop it if nobody is waiting.
    pub(crate) fn deliver_reply(&self, mut msg: InboundMessage) {
        trace!(
            "{:08x}:{:08x} received REPLY (XID {:?})",
            self.prog,
            self.vers,
            message::peek_xid(&msg.bytes)
        );
        msg.wake = None;
        let mut state = lock(&self.reply);
        if state.waiting {
            state.reply = Some(msg);
            self.reply_cv.notify_all();
        } else {
            warn!(
                "{:08x}:{:08x} dropping REPLY with no call waiting",
                self.prog, self.vers
            );
        }
    }
}

/// A client for one program/version.
///
/// Created by [`RpcContext::clnt_create()`].  Destroy with
/// [`RpcClient::destroy()`], or just drop it.
///
/// `destroy` takes the client by value and [`RpcClient::call()`] borrows it,
/// so a client cannot be destroyed while a call on it is in flight.
pub struct RpcClient {
    pub(crate) shared: Arc<ClientShared>,
    pub(crate) ctx: RpcContext,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("prog", &format_args!("{:08x}", self.shared.prog))
            .field("vers", &format_args!("{:08x}", self.shared.vers))
            .field("in_reset", &self.shared.in_reset())
            .finish()
    }
}

impl RpcClient {
    pub fn prog(&self) -> u32 {
        self.shared.prog
    }

    /// Version after normalization
    pub fn vers(&self) -> u32 {
        self.shared.vers
    }

    /// Whether the modem subsystem is currently restarting
    pub fn in_reset(&self) -> bool {
        self.shared.in_reset()
    }

    /// Call procedure `proc`.
    ///
    /// Arguments:
    /// - `proc` - procedure number
    /// - `args` - encoded after the call header
    /// - `results` - decoded from the reply on success
    /// - `timeout` - how long to wait for the reply, `None` to wait forever
    ///
    /// Blocks other callers on this client until the reply arrives, the call
    /// fails, or the modem resets.
    pub fn call<A, R>(
        &self,
        proc: u32,
        args: &mut A,
        results: &mut R,
        timeout: Option<Duration>,
    ) -> Result<(), CallError>
    where
        A: XdrType + ?Sized,
        R: XdrType + ?Sized,
    {
        let shared = &self.shared;
        let mut channel = lock(&shared.channel);
        if shared.in_reset() {
            return Err(CallError::SubsystemRestart);
        }

        let xid = match channel.start_call(proc) {
            Ok(xid) => xid,
            Err(e) => {
                channel.abort();
                error!(
                    "{:08x}:{:08x} error starting call message: {e}",
                    shared.prog, shared.vers
                );
                return Err(match e {
                    ChannelError::Xdr(e) => CallError::CantEncodeArgs(e),
                    e => CallError::CantSend(e),
                });
            }
        };
        if let Err(e) = args.xdr(channel.xdr_mut()) {
            channel.abort();
            error!(
                "{:08x}:{:08x} error encoding arguments: {e}",
                shared.prog, shared.vers
            );
            return Err(CallError::CantEncodeArgs(e));
        }

        let msg = {
            let mut state = lock(&shared.reply);
            if shared.in_reset() {
                return Err(CallError::SubsystemRestart);
            }
            state.reply = None;
            state.waiting = true;

            debug!(
                "{:08x}:{:08x} sending call (XID {xid})",
                shared.prog, shared.vers
            );
            if let Err(e) = channel.send() {
                state.waiting = false;
                error!("{:08x}:{:08x} error sending call: {e}", shared.prog, shared.vers);
                if let ChannelError::NetReset = e {
                    drop(state);
                    shared.enter_reset();
                    // The receive thread now has to watch for writability.
                    self.ctx.kick_receiver();
                    return Err(CallError::SubsystemRestart);
                }
                return Err(CallError::CantSend(e));
            }

            let deadline = timeout.map(|t| Instant::now() + t);
            loop {
                if shared.in_reset() {
                    state.waiting = false;
                    return Err(CallError::SubsystemRestart);
                }
                if let Some(msg) = state.reply.take() {
                    state.waiting = false;
                    break msg;
                }
                match deadline {
                    None => state = wait(&shared.reply_cv, state),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            state.waiting = false;
                            warn!(
                                "{:08x}:{:08x} call (XID {xid}) timed out",
                                shared.prog, shared.vers
                            );
                            return Err(CallError::TimedOut);
                        }
                        state = wait_timeout(&shared.reply_cv, state, deadline - now).0;
                    }
                }
            }
        };

        // The lease keeps the receive thread off this port until the reply
        // has been decoded, whichever way this returns.
        let InboundMessage { bytes, lease: _lease, wake: _ } = msg;
        channel.load(bytes);
        let result = Self::decode_reply(&mut channel, xid, results);
        channel.msg_done();
        if result.is_ok() {
            debug!("{:08x}:{:08x} call success", shared.prog, shared.vers);
        }
        result
    }

    fn decode_reply<R: XdrType + ?Sized>(
        channel: &mut MessageChannel,
        xid: u32,
        results: &mut R,
    ) -> Result<(), CallError> {
        let (prog, vers) = (channel.prog(), channel.vers());
        let got = message::peek_xid(channel.xdr().in_msg()).unwrap_or(!xid);
        if got != xid {
            error!("{prog:08x}:{vers:08x} XID mismatch: got {got}, expecting {xid}");
            return Err(CallError::XidMismatch { expected: xid, got });
        }

        let (_, header) = message::recv_reply_header(channel.xdr_mut()).map_err(|e| {
            error!("{prog:08x}:{vers:08x} error reading reply header: {e}");
            CallError::CantRecv(e)
        })?;
        if let Some(e) = CallError::from_reply(&header) {
            error!("{prog:08x}:{vers:08x} call failed: {e}");
            return Err(e);
        }

        results.xdr(channel.xdr_mut()).map_err(|e| {
            error!("{prog:08x}:{vers:08x} error decoding results: {e}");
            CallError::CantDecodeRes(e)
        })
    }

    /// Install `cb` to be told when the modem subsystem restarts.  Replaces
    /// any callback already installed.
    pub fn register_reset_notification_cb<F>(&self, cb: F)
    where
        F: Fn(ResetEvent) + Send + Sync + 'static,
    {
        *lock(&self.shared.reset_cb) = Some(Arc::new(cb));
    }

    /// Remove the reset callback, returning it.
    pub fn unregister_reset_notification_cb(&self) -> Option<ResetCallback> {
        lock(&self.shared.reset_cb).take()
    }

    /// Destroy the client, stopping its callback thread.  The last client in
    /// a context also stops the receive thread and closes the router device.
    pub fn destroy(self) {
        drop(self);
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        debug!(
            "{:08x}:{:08x} destroying client",
            self.shared.prog, self.shared.vers
        );
        callback::stop(&self.shared);
        self.ctx.remove_client(&self.shared);
    }
}
