//! Message channel: whole RPC messages over one router port.
//!
//! A [`MessageChannel`] pairs a [`RouterPort`] with the [`Xdr`] state used to
//! build outbound messages and pick apart inbound ones.  At most one outbound
//! message is under construction at a time, and the inbound buffer holds the
//! last message received until the next one replaces it.
//!
//! See [`slot`] for the single-slot mailbox that hands inbound messages from
//! the receive thread to their consumer.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

pub mod slot;

pub use slot::{InboundMessage, InboundSlot, SlotLease};

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::io::RouterPort;
use crate::message::{self, MsgType, OpaqueAuth, ReplyHeader};
use crate::xdr::{RPCROUTER_MSGSIZE_MAX, Xdr, XdrError, XdrOp};

/// Message channel errors
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Xdr(#[from] XdrError),
    /// Port read or write failed
    #[error("I/O error on {port}: {source}")]
    Io { port: String, source: io::Error },
    /// The router reported a subsystem reset on write
    #[error("subsystem restart in progress")]
    NetReset,
    /// Router accepted only part of a message
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
    /// Port returned end of file
    #[error("port closed")]
    Closed,
}

/// Transaction id source, shared by every channel in a context.
#[derive(Debug, Clone)]
pub struct XidAllocator(Arc<AtomicU32>);

impl Default for XidAllocator {
    fn default() -> Self {
        Self(Arc::new(AtomicU32::new(1)))
    }
}

impl XidAllocator {
    pub fn next(&self) -> u32 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Read one whole message from `port`.
pub fn read_message(port: &dyn RouterPort) -> Result<Vec<u8>, ChannelError> {
    let mut buf = vec![0u8; RPCROUTER_MSGSIZE_MAX];
    let len = port.read(&mut buf).map_err(|source| ChannelError::Io {
        port: port.name().to_string(),
        source,
    })?;
    if len == 0 {
        return Err(ChannelError::Closed);
    }
    buf.truncate(len);
    Ok(buf)
}

/// One endpoint's message state.
pub struct MessageChannel {
    port: Arc<dyn RouterPort>,
    prog: u32,
    vers: u32,
    xid: u32,
    xids: XidAllocator,
    xdr: Xdr,
    last_error: Option<i32>,
}

impl fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageChannel")
            .field("port", &self.port.name())
            .field("prog", &format_args!("{:08x}", self.prog))
            .field("vers", &format_args!("{:08x}", self.vers))
            .field("xid", &self.xid)
            .finish()
    }
}

impl MessageChannel {
    /// Create a channel for `prog`/`vers` over `port`.
    pub fn new(port: Arc<dyn RouterPort>, prog: u32, vers: u32, xids: XidAllocator) -> Self {
        Self {
            port,
            prog,
            vers,
            xid: 0,
            xids,
            xdr: Xdr::new(),
            last_error: None,
        }
    }

    /// Owned copy of an inbound message, detached from the channel it arrived
    /// on.  Replies built on it go out through `port`.
    pub fn with_inbound(
        port: Arc<dyn RouterPort>,
        prog: u32,
        vers: u32,
        xids: XidAllocator,
        msg: Vec<u8>,
    ) -> Self {
        let mut channel = Self::new(port, prog, vers, xids);
        channel.load(msg);
        channel
    }

    pub fn port(&self) -> &Arc<dyn RouterPort> {
        &self.port
    }

    pub fn prog(&self) -> u32 {
        self.prog
    }

    pub fn vers(&self) -> u32 {
        self.vers
    }

    /// Transaction id of the message under construction
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// OS error code of the last failed read or write
    pub fn last_error(&self) -> Option<i32> {
        self.last_error
    }

    pub fn xdr(&self) -> &Xdr {
        &self.xdr
    }

    pub fn xdr_mut(&mut self) -> &mut Xdr {
        &mut self.xdr
    }

    /// Start a new outbound message of type `kind`.
    ///
    /// A call gets a fresh transaction id.  A reply reuses the id of the
    /// inbound message it answers.
    pub fn start(&mut self, kind: MsgType) -> Result<u32, ChannelError> {
        let xid = self.next_xid(kind);
        message::msg_start(&mut self.xdr, xid, kind)?;
        Ok(xid)
    }

    fn next_xid(&mut self, kind: MsgType) -> u32 {
        self.xid = match kind {
            MsgType::Call => self.xids.next(),
            MsgType::Reply => message::peek_xid(self.xdr.in_msg()).unwrap_or(0),
        };
        self.xdr.set_op(XdrOp::Encode);
        self.xid
    }

    /// Start a call to procedure `proc` with null credentials.  Arguments
    /// follow.
    pub fn start_call(&mut self, proc: u32) -> Result<u32, ChannelError> {
        let xid = self.next_xid(MsgType::Call);
        let none = OpaqueAuth::none();
        message::call_msg_start(&mut self.xdr, xid, self.prog, self.vers, proc, &none, &none)?;
        Ok(xid)
    }

    /// Start a reply to the inbound call.  Results, if any, follow.
    pub fn start_reply(&mut self, header: &ReplyHeader) -> Result<u32, ChannelError> {
        let xid = self.next_xid(MsgType::Reply);
        message::send_reply_header(&mut self.xdr, xid, header)?;
        Ok(xid)
    }

    /// Flush the outbound message to the port.
    pub fn send(&mut self) -> Result<(), ChannelError> {
        let msg = self.xdr.out_msg();
        let len = msg.len();
        match self.port.write(msg) {
            Ok(written) if written == len => {
                self.last_error = None;
                Ok(())
            }
            Ok(written) => {
                error!(
                    "{:08x}:{:08x} short write {written} of {len}",
                    self.prog, self.vers
                );
                Err(ChannelError::ShortWrite { written, len })
            }
            Err(e) => {
                self.last_error = e.raw_os_error();
                if e.raw_os_error() == Some(libc::ENETRESET) {
                    debug!("{:08x}:{:08x} send hit net reset", self.prog, self.vers);
                    Err(ChannelError::NetReset)
                } else {
                    Err(ChannelError::Io {
                        port: self.port.name().to_string(),
                        source: e,
                    })
                }
            }
        }
    }

    /// Blocking read of one message into the inbound buffer.
    pub fn read(&mut self) -> Result<usize, ChannelError> {
        match read_message(self.port.as_ref()) {
            Ok(msg) => {
                let len = msg.len();
                self.load(msg);
                Ok(len)
            }
            Err(e) => {
                if let ChannelError::Io { source, .. } = &e {
                    self.last_error = source.raw_os_error();
                }
                Err(e)
            }
        }
    }

    /// Replace the inbound buffer with `msg` and rewind for decoding.
    pub fn load(&mut self, msg: Vec<u8>) {
        self.xdr.set_inbound(msg);
        self.xdr.set_in_pos(0);
        self.xdr.set_op(XdrOp::Decode);
    }

    /// Drop the outbound message under construction.
    pub fn abort(&mut self) {
        self.xdr.reset_out();
        self.xdr.set_op(XdrOp::Encode);
    }

    /// Finish with the inbound message.
    pub fn msg_done(&mut self) {
        self.xdr.set_inbound(Vec::new());
        self.xdr.set_op(XdrOp::Encode);
    }
}
