//! XDR wire codec.
//!
//! Everything on the wire is big-endian and laid out in 4-byte units.  Values
//! narrower than 32 bits still occupy a whole unit, and opaque byte runs are
//! zero-padded up to the next unit boundary.
//!
//! [`Xdr`] holds the codec state for one endpoint: the direction of the current
//! traversal ([`XdrOp`]), the outbound message under construction and the last
//! inbound message.  The primitives in this module move single values in and
//! out of those buffers; [`types`] builds composite traversals on top of them
//! which work in all three directions with the same type description.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

pub mod types;

pub use types::{
    XdrFn, XdrType, xdr_array, xdr_bytes, xdr_enum, xdr_opaque, xdr_pointer, xdr_reference,
    xdr_string, xdr_vector,
};

/// Largest message the router accepts, in either direction.
pub const RPCROUTER_MSGSIZE_MAX: usize = 18432;

/// Size of one XDR unit in bytes.
pub const BYTES_PER_XDR_UNIT: usize = 4;

/// Direction of an XDR traversal
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum XdrOp {
    /// Serialize values into the outbound buffer
    #[default]
    Encode,
    /// Deserialize values from the inbound buffer
    Decode,
    /// Release storage a previous decode allocated
    Free,
}

/// XDR codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum XdrError {
    /// Outbound message would exceed the maximum message size
    #[error("message overflow: {need} bytes needed, {avail} available")]
    Overflow { need: usize, avail: usize },
    /// Inbound message ended early
    #[error("message truncated: {need} bytes needed, {avail} left")]
    Underflow { need: usize, avail: usize },
    /// Counted length above the declared maximum
    #[error("length {len} exceeds maximum {max}")]
    TooLong { len: u32, max: u32 },
    /// Enum encoded with a width other than 1, 2 or 4 bytes
    #[error("invalid enum width {0}")]
    EnumWidth(usize),
    /// Encoding a string that is not there
    #[error("no string to encode")]
    NullString,
    /// Decoded string is not valid UTF-8
    #[error("string is not valid UTF-8")]
    Utf8,
    /// Value outside the range of the type being decoded
    #[error("invalid {what} value {value}")]
    InvalidValue { what: &'static str, value: u32 },
}

/// Type to represent the result of an XDR operation
pub type Result<T> = core::result::Result<T, XdrError>;

/// Round `len` up to a whole number of XDR units.
pub const fn padded_len(len: usize) -> usize {
    len.div_ceil(BYTES_PER_XDR_UNIT) * BYTES_PER_XDR_UNIT
}

/// Codec state for one endpoint.
#[derive(Debug, Clone)]
pub struct Xdr {
    op: XdrOp,
    out_msg: Vec<u8>,
    in_msg: Vec<u8>,
    in_next: usize,
}

impl Default for Xdr {
    fn default() -> Self {
        Self::new()
    }
}

impl Xdr {
    /// Create a new codec in encode mode with empty buffers.
    pub fn new() -> Self {
        Self {
            op: XdrOp::Encode,
            out_msg: Vec::with_capacity(RPCROUTER_MSGSIZE_MAX),
            in_msg: Vec::new(),
            in_next: 0,
        }
    }

    /// Create a decoder positioned at the start of `msg`.
    pub fn from_inbound(msg: Vec<u8>) -> Self {
        let mut xdr = Self::new();
        xdr.op = XdrOp::Decode;
        xdr.set_inbound(msg);
        xdr
    }

    pub fn op(&self) -> XdrOp {
        self.op
    }

    pub fn set_op(&mut self, op: XdrOp) {
        self.op = op;
    }

    /// Outbound bytes written so far.
    pub fn out_msg(&self) -> &[u8] {
        &self.out_msg
    }

    /// Discard the outbound message.
    pub fn reset_out(&mut self) {
        self.out_msg.clear();
    }

    /// Overwrite an already-written outbound word.
    pub fn patch_out_u32(&mut self, word: usize, value: u32) -> Result<()> {
        let start = word * BYTES_PER_XDR_UNIT;
        let end = start + BYTES_PER_XDR_UNIT;
        if end > self.out_msg.len() {
            return Err(XdrError::Underflow {
                need: end,
                avail: self.out_msg.len(),
            });
        }
        self.out_msg[start..end].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// The last message received.
    pub fn in_msg(&self) -> &[u8] {
        &self.in_msg
    }

    /// Replace the inbound message and rewind the read cursor.
    pub fn set_inbound(&mut self, msg: Vec<u8>) -> Vec<u8> {
        self.in_next = 0;
        core::mem::replace(&mut self.in_msg, msg)
    }

    pub fn in_pos(&self) -> usize {
        self.in_next
    }

    /// Move the read cursor.  Positions past the end are clamped.
    pub fn set_in_pos(&mut self, pos: usize) {
        self.in_next = pos.min(self.in_msg.len());
    }

    /// Bytes of the inbound message not yet decoded.
    pub fn in_remaining(&self) -> usize {
        self.in_msg.len() - self.in_next
    }

    /// Read one big-endian word of the inbound message without moving the cursor.
    pub fn peek_in_u32(&self, word: usize) -> Option<u32> {
        peek_u32(&self.in_msg, word)
    }

    pub fn send_u32(&mut self, value: u32) -> Result<()> {
        self.reserve(BYTES_PER_XDR_UNIT)?;
        self.out_msg.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }

    pub fn send_i32(&mut self, value: i32) -> Result<()> {
        self.send_u32(value as u32)
    }

    pub fn send_u16(&mut self, value: u16) -> Result<()> {
        self.send_u32(u32::from(value))
    }

    pub fn send_i16(&mut self, value: i16) -> Result<()> {
        self.send_i32(i32::from(value))
    }

    pub fn send_u8(&mut self, value: u8) -> Result<()> {
        self.send_u32(u32::from(value))
    }

    pub fn send_i8(&mut self, value: i8) -> Result<()> {
        self.send_i32(i32::from(value))
    }

    /// Send raw bytes followed by zero padding to the next unit boundary.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<()> {
        let padded = padded_len(data.len());
        self.reserve(padded)?;
        self.out_msg.extend_from_slice(data);
        self.out_msg.resize(self.out_msg.len() + padded - data.len(), 0);
        Ok(())
    }

    pub fn recv_u32(&mut self) -> Result<u32> {
        let bytes = self.take(BYTES_PER_XDR_UNIT)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn recv_i32(&mut self) -> Result<i32> {
        Ok(self.recv_u32()? as i32)
    }

    pub fn recv_u16(&mut self) -> Result<u16> {
        Ok(self.recv_u32()? as u16)
    }

    pub fn recv_i16(&mut self) -> Result<i16> {
        Ok(self.recv_i32()? as i16)
    }

    pub fn recv_u8(&mut self) -> Result<u8> {
        Ok(self.recv_u32()? as u8)
    }

    pub fn recv_i8(&mut self) -> Result<i8> {
        Ok(self.recv_i32()? as i8)
    }

    /// Fill `buf` from the inbound message and skip the padding after it.
    pub fn recv_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        let bytes = self.take(padded_len(len))?;
        buf.copy_from_slice(&bytes[..len]);
        Ok(())
    }

    /// Skip `len` bytes of opaque data plus padding.
    pub fn skip_bytes(&mut self, len: usize) -> Result<()> {
        self.take(padded_len(len)).map(|_| ())
    }

    /// Send an enum value that occupies `width` bytes in memory.
    pub fn send_enum(&mut self, value: i32, width: usize) -> Result<()> {
        match width {
            4 => self.send_i32(value),
            2 => self.send_i16(value as i16),
            1 => self.send_i8(value as i8),
            _ => Err(XdrError::EnumWidth(width)),
        }
    }

    /// Receive an enum value that occupies `width` bytes in memory.
    pub fn recv_enum(&mut self, width: usize) -> Result<i32> {
        match width {
            4 => self.recv_i32(),
            2 => self.recv_i16().map(i32::from),
            1 => self.recv_i8().map(i32::from),
            _ => Err(XdrError::EnumWidth(width)),
        }
    }

    fn reserve(&self, len: usize) -> Result<()> {
        let avail = RPCROUTER_MSGSIZE_MAX - self.out_msg.len();
        if len > avail {
            Err(XdrError::Overflow { need: len, avail })
        } else {
            Ok(())
        }
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let avail = self.in_remaining();
        if len > avail {
            return Err(XdrError::Underflow { need: len, avail });
        }
        let start = self.in_next;
        self.in_next += len;
        Ok(&self.in_msg[start..start + len])
    }
}

/// Read big-endian word `word` of a raw message.
pub fn peek_u32(msg: &[u8], word: usize) -> Option<u32> {
    let start = word * BYTES_PER_XDR_UNIT;
    let bytes = msg.get(start..start + BYTES_PER_XDR_UNIT)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
