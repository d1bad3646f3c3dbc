//! RPC message headers.
//!
//! Call layout, in 4-byte words:
//!
//! ```text
//! 0 xid | 1 msg type (0) | 2 rpc version (2) | 3 prog | 4 vers | 5 proc |
//! cred flavor | cred len | [cred body] | verf flavor | verf len | [verf body] | args...
//! ```
//!
//! Reply layout:
//!
//! ```text
//! 0 xid | 1 msg type (1) | 2 reply stat | accepted or denied body | results...
//! ```
//!
//! With empty credentials a call's arguments start at word 10.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use crate::xdr::{self, Result, Xdr, XdrError};

/// RPC protocol version carried in every call.
pub const RPC_MSG_VERSION: u32 = 2;

/// Largest credential or verifier body accepted.
pub const MAX_AUTH_BYTES: u32 = 400;

pub const XID_WORD: usize = 0;
pub const MSG_TYPE_WORD: usize = 1;
pub const PROG_WORD: usize = 3;
pub const VERS_WORD: usize = 4;
pub const PROC_WORD: usize = 5;

/// Word offset of the first argument in a call with empty credentials.
pub const CALL_ARGS_WORD: usize = 10;

/// Message direction
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MsgType {
    Call = 0,
    Reply = 1,
}

impl TryFrom<u32> for MsgType {
    type Error = XdrError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(MsgType::Call),
            1 => Ok(MsgType::Reply),
            _ => Err(XdrError::InvalidValue {
                what: "message type",
                value,
            }),
        }
    }
}

/// Authentication flavors understood by the peer
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFlavor {
    None = 0,
    Sys = 1,
    Short = 2,
}

/// Top-level reply status
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStat {
    Accepted = 0,
    Denied = 1,
}

/// Status of a call the server accepted
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptStat {
    Success = 0,
    ProgUnavail = 1,
    ProgMismatch = 2,
    ProcUnavail = 3,
    GarbageArgs = 4,
    SystemErr = 5,
    ProgLocked = 6,
}

impl TryFrom<u32> for AcceptStat {
    type Error = XdrError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => AcceptStat::Success,
            1 => AcceptStat::ProgUnavail,
            2 => AcceptStat::ProgMismatch,
            3 => AcceptStat::ProcUnavail,
            4 => AcceptStat::GarbageArgs,
            5 => AcceptStat::SystemErr,
            6 => AcceptStat::ProgLocked,
            _ => {
                return Err(XdrError::InvalidValue {
                    what: "accept status",
                    value,
                });
            }
        })
    }
}

/// Reason a call was denied
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectStat {
    Mismatch = 0,
    AuthError = 1,
}

/// Reason an authentication check failed
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStat {
    Ok = 0,
    /// Bogus credentials
    BadCred = 1,
    /// Client should begin a new session
    RejectedCred = 2,
    /// Bogus verifier
    BadVerf = 3,
    /// Verifier expired or replayed
    RejectedVerf = 4,
    /// Rejected for security reasons
    TooWeak = 5,
    /// Bogus response verifier
    InvalidResp = 6,
    /// Unknown reason
    Failed = 7,
}

impl TryFrom<u32> for AuthStat {
    type Error = XdrError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            0 => AuthStat::Ok,
            1 => AuthStat::BadCred,
            2 => AuthStat::RejectedCred,
            3 => AuthStat::BadVerf,
            4 => AuthStat::RejectedVerf,
            5 => AuthStat::TooWeak,
            6 => AuthStat::InvalidResp,
            7 => AuthStat::Failed,
            _ => {
                return Err(XdrError::InvalidValue {
                    what: "auth status",
                    value,
                });
            }
        })
    }
}

/// Credential or verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpaqueAuth {
    pub flavor: u32,
    pub body: Vec<u8>,
}

impl OpaqueAuth {
    /// `AUTH_NONE` with an empty body.
    pub const fn none() -> Self {
        Self {
            flavor: AuthFlavor::None as u32,
            body: Vec::new(),
        }
    }
}

pub fn send_auth(xdrs: &mut Xdr, auth: &OpaqueAuth) -> Result<()> {
    let len = u32::try_from(auth.body.len()).unwrap_or(u32::MAX);
    if len > MAX_AUTH_BYTES {
        return Err(XdrError::TooLong {
            len,
            max: MAX_AUTH_BYTES,
        });
    }
    xdrs.send_u32(auth.flavor)?;
    xdrs.send_u32(len)?;
    xdrs.send_bytes(&auth.body)
}

pub fn recv_auth(xdrs: &mut Xdr) -> Result<OpaqueAuth> {
    let flavor = xdrs.recv_u32()?;
    let len = xdrs.recv_u32()?;
    if len > MAX_AUTH_BYTES {
        return Err(XdrError::TooLong {
            len,
            max: MAX_AUTH_BYTES,
        });
    }
    let mut body = vec![0u8; len as usize];
    xdrs.recv_bytes(&mut body)?;
    Ok(OpaqueAuth { flavor, body })
}

/// Start a new outbound message: rewind the buffer, then write xid and type.
pub fn msg_start(xdrs: &mut Xdr, xid: u32, kind: MsgType) -> Result<()> {
    xdrs.reset_out();
    xdrs.send_u32(xid)?;
    xdrs.send_u32(kind as u32)
}

/// Everything in a call before the arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallHeader {
    pub xid: u32,
    pub prog: u32,
    pub vers: u32,
    pub proc: u32,
    pub cred: OpaqueAuth,
    pub verf: OpaqueAuth,
}

impl CallHeader {
    /// Start a call message with this header.
    pub fn encode(&self, xdrs: &mut Xdr) -> Result<()> {
        call_msg_start(
            xdrs, self.xid, self.prog, self.vers, self.proc, &self.cred, &self.verf,
        )
    }

    /// Decode from the start of the inbound message.  Leaves the read cursor
    /// on the first argument.
    pub fn decode(xdrs: &mut Xdr) -> Result<Self> {
        xdrs.set_in_pos(0);
        let xid = xdrs.recv_u32()?;
        let kind = MsgType::try_from(xdrs.recv_u32()?)?;
        if kind != MsgType::Call {
            return Err(XdrError::InvalidValue {
                what: "call message type",
                value: kind as u32,
            });
        }
        let _rpcvers = xdrs.recv_u32()?;
        let prog = xdrs.recv_u32()?;
        let vers = xdrs.recv_u32()?;
        let proc = xdrs.recv_u32()?;
        let cred = recv_auth(xdrs)?;
        let verf = recv_auth(xdrs)?;
        Ok(Self {
            xid,
            prog,
            vers,
            proc,
            cred,
            verf,
        })
    }
}

/// Start a call message: everything up to the first argument.
pub fn call_msg_start(
    xdrs: &mut Xdr,
    xid: u32,
    prog: u32,
    vers: u32,
    proc: u32,
    cred: &OpaqueAuth,
    verf: &OpaqueAuth,
) -> Result<()> {
    msg_start(xdrs, xid, MsgType::Call)?;
    xdrs.send_u32(RPC_MSG_VERSION)?;
    xdrs.send_u32(prog)?;
    xdrs.send_u32(vers)?;
    xdrs.send_u32(proc)?;
    send_auth(xdrs, cred)?;
    send_auth(xdrs, verf)
}

/// Body of an accepted reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptedReply {
    Success,
    ProgUnavail,
    ProgMismatch { low: u32, high: u32 },
    ProcUnavail,
    GarbageArgs,
    SystemErr,
    ProgLocked,
}

impl AcceptedReply {
    pub const fn stat(&self) -> AcceptStat {
        match self {
            AcceptedReply::Success => AcceptStat::Success,
            AcceptedReply::ProgUnavail => AcceptStat::ProgUnavail,
            AcceptedReply::ProgMismatch { .. } => AcceptStat::ProgMismatch,
            AcceptedReply::ProcUnavail => AcceptStat::ProcUnavail,
            AcceptedReply::GarbageArgs => AcceptStat::GarbageArgs,
            AcceptedReply::SystemErr => AcceptStat::SystemErr,
            AcceptedReply::ProgLocked => AcceptStat::ProgLocked,
        }
    }
}

/// Body of a denied reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectedReply {
    /// RPC version not supported
    Mismatch { low: u32, high: u32 },
    AuthError(AuthStat),
}

impl RejectedReply {
    pub const fn stat(&self) -> RejectStat {
        match self {
            RejectedReply::Mismatch { .. } => RejectStat::Mismatch,
            RejectedReply::AuthError(_) => RejectStat::AuthError,
        }
    }
}

/// Reply status and its body, everything between the message type and the
/// results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyHeader {
    Accepted {
        verf: OpaqueAuth,
        stat: AcceptedReply,
    },
    Denied(RejectedReply),
}

impl ReplyHeader {
    /// Accepted, successful, with a null verifier.
    pub const fn success() -> Self {
        ReplyHeader::Accepted {
            verf: OpaqueAuth::none(),
            stat: AcceptedReply::Success,
        }
    }

    pub fn accepted(stat: AcceptedReply) -> Self {
        ReplyHeader::Accepted {
            verf: OpaqueAuth::none(),
            stat,
        }
    }

    pub fn encode(&self, xdrs: &mut Xdr) -> Result<()> {
        match self {
            ReplyHeader::Accepted { verf, stat } => {
                xdrs.send_u32(ReplyStat::Accepted as u32)?;
                send_auth(xdrs, verf)?;
                xdrs.send_u32(stat.stat() as u32)?;
                if let AcceptedReply::ProgMismatch { low, high } = stat {
                    xdrs.send_u32(*low)?;
                    xdrs.send_u32(*high)?;
                }
                Ok(())
            }
            ReplyHeader::Denied(rejected) => {
                xdrs.send_u32(ReplyStat::Denied as u32)?;
                xdrs.send_u32(rejected.stat() as u32)?;
                match rejected {
                    RejectedReply::Mismatch { low, high } => {
                        xdrs.send_u32(*low)?;
                        xdrs.send_u32(*high)
                    }
                    RejectedReply::AuthError(why) => xdrs.send_u32(*why as u32),
                }
            }
        }
    }

    /// Decode from the current read position, which must be just after the
    /// message type.
    pub fn decode(xdrs: &mut Xdr) -> Result<Self> {
        match xdrs.recv_u32()? {
            0 => {
                let verf = recv_auth(xdrs)?;
                let stat = match AcceptStat::try_from(xdrs.recv_u32()?)? {
                    AcceptStat::Success => AcceptedReply::Success,
                    AcceptStat::ProgUnavail => AcceptedReply::ProgUnavail,
                    AcceptStat::ProgMismatch => AcceptedReply::ProgMismatch {
                        low: xdrs.recv_u32()?,
                        high: xdrs.recv_u32()?,
                    },
                    AcceptStat::ProcUnavail => AcceptedReply::ProcUnavail,
                    AcceptStat::GarbageArgs => AcceptedReply::GarbageArgs,
                    AcceptStat::SystemErr => AcceptedReply::SystemErr,
                    AcceptStat::ProgLocked => AcceptedReply::ProgLocked,
                };
                Ok(ReplyHeader::Accepted { verf, stat })
            }
            1 => {
                let rejected = match xdrs.recv_u32()? {
                    0 => RejectedReply::Mismatch {
                        low: xdrs.recv_u32()?,
                        high: xdrs.recv_u32()?,
                    },
                    1 => RejectedReply::AuthError(AuthStat::try_from(xdrs.recv_u32()?)?),
                    value => {
                        return Err(XdrError::InvalidValue {
                            what: "reject status",
                            value,
                        });
                    }
                };
                Ok(ReplyHeader::Denied(rejected))
            }
            value => Err(XdrError::InvalidValue {
                what: "reply status",
                value,
            }),
        }
    }
}

/// Start a successful reply with verifier `verf`.
pub fn reply_msg_start(xdrs: &mut Xdr, xid: u32, verf: &OpaqueAuth) -> Result<()> {
    msg_start(xdrs, xid, MsgType::Reply)?;
    ReplyHeader::Accepted {
        verf: verf.clone(),
        stat: AcceptedReply::Success,
    }
    .encode(xdrs)
}

/// Start a reply carrying `header`.
pub fn send_reply_header(xdrs: &mut Xdr, xid: u32, header: &ReplyHeader) -> Result<()> {
    msg_start(xdrs, xid, MsgType::Reply)?;
    header.encode(xdrs)
}

/// Decode a reply from the start of the inbound message, returning its xid
/// and header.  Leaves the read cursor on the first result.
pub fn recv_reply_header(xdrs: &mut Xdr) -> Result<(u32, ReplyHeader)> {
    xdrs.set_in_pos(0);
    let xid = xdrs.recv_u32()?;
    let kind = MsgType::try_from(xdrs.recv_u32()?)?;
    if kind != MsgType::Reply {
        return Err(XdrError::InvalidValue {
            what: "reply message type",
            value: kind as u32,
        });
    }
    Ok((xid, ReplyHeader::decode(xdrs)?))
}

/// Transaction id of a raw message.
pub fn peek_xid(msg: &[u8]) -> Option<u32> {
    xdr::peek_u32(msg, XID_WORD)
}

/// Message type of a raw message.
pub fn peek_msg_type(msg: &[u8]) -> Option<MsgType> {
    xdr::peek_u32(msg, MSG_TYPE_WORD).and_then(|t| MsgType::try_from(t).ok())
}

/// Program and version of a raw call.
pub fn peek_prog_vers(msg: &[u8]) -> Option<(u32, u32)> {
    Some((
        xdr::peek_u32(msg, PROG_WORD)?,
        xdr::peek_u32(msg, VERS_WORD)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_bytes(header: &ReplyHeader) -> Vec<u8> {
        let mut xdr = Xdr::new();
        send_reply_header(&mut xdr, 9, header).unwrap();
        xdr.out_msg().to_vec()
    }

    fn decode_reply(bytes: Vec<u8>) -> ReplyHeader {
        let mut xdr = Xdr::from_inbound(bytes);
        let (xid, header) = recv_reply_header(&mut xdr).unwrap();
        assert_eq!(xid, 9);
        header
    }

    #[test]
    fn call_header_layout() {
        let header = CallHeader {
            xid: 0x11,
            prog: 0x3000_005D,
            vers: 0,
            proc: 1,
            cred: OpaqueAuth::none(),
            verf: OpaqueAuth::none(),
        };
        let mut xdr = Xdr::new();
        header.encode(&mut xdr).unwrap();
        let words: Vec<u32> = (0..10)
            .map(|w| xdr::peek_u32(xdr.out_msg(), w).unwrap())
            .collect();
        assert_eq!(words, vec![0x11, 0, 2, 0x3000_005D, 0, 1, 0, 0, 0, 0]);
        assert_eq!(xdr.out_msg().len(), CALL_ARGS_WORD * 4);
    }

    #[test]
    fn call_header_round_trips_with_credentials() {
        let header = CallHeader {
            xid: 0xFFFF_FFFF,
            prog: 0x3100_0000,
            vers: 0x0001_0001,
            proc: 42,
            cred: OpaqueAuth {
                flavor: 1,
                body: vec![1, 2, 3, 4, 5],
            },
            verf: OpaqueAuth {
                flavor: 2,
                body: vec![9; 8],
            },
        };
        let mut xdr = Xdr::new();
        header.encode(&mut xdr).unwrap();
        xdr.send_u32(0xA5A5_A5A5).unwrap();

        let mut rx = Xdr::from_inbound(xdr.out_msg().to_vec());
        assert_eq!(CallHeader::decode(&mut rx).unwrap(), header);
        assert_eq!(rx.recv_u32().unwrap(), 0xA5A5_A5A5);
    }

    #[test]
    fn reply_is_not_a_call() {
        let mut rx = Xdr::from_inbound(reply_bytes(&ReplyHeader::success()));
        assert!(CallHeader::decode(&mut rx).is_err());
    }

    #[test]
    fn every_reply_variant_decodes_to_itself() {
        let headers = [
            ReplyHeader::success(),
            ReplyHeader::accepted(AcceptedReply::ProgUnavail),
            ReplyHeader::accepted(AcceptedReply::ProgMismatch { low: 1, high: 3 }),
            ReplyHeader::accepted(AcceptedReply::ProcUnavail),
            ReplyHeader::accepted(AcceptedReply::GarbageArgs),
            ReplyHeader::accepted(AcceptedReply::SystemErr),
            ReplyHeader::accepted(AcceptedReply::ProgLocked),
            ReplyHeader::Denied(RejectedReply::Mismatch { low: 1, high: 2 }),
            ReplyHeader::Denied(RejectedReply::AuthError(AuthStat::TooWeak)),
        ];
        for header in headers {
            assert_eq!(decode_reply(reply_bytes(&header)), header);
        }
    }

    #[test]
    fn unknown_accept_status_rejected() {
        let mut bytes = reply_bytes(&ReplyHeader::success());
        // stat word follows xid, type, reply stat, verf flavor, verf len
        bytes[23] = 9;
        let mut xdr = Xdr::from_inbound(bytes);
        xdr.set_in_pos(8);
        assert_eq!(
            ReplyHeader::decode(&mut xdr),
            Err(XdrError::InvalidValue {
                what: "accept status",
                value: 9
            })
        );
    }

    #[test]
    fn call_is_not_a_reply() {
        let mut xdr = Xdr::new();
        call_msg_start(&mut xdr, 1, 2, 3, 4, &OpaqueAuth::none(), &OpaqueAuth::none()).unwrap();
        let mut rx = Xdr::from_inbound(xdr.out_msg().to_vec());
        assert!(recv_reply_header(&mut rx).is_err());
    }

    #[test]
    fn reply_msg_start_is_accepted_success() {
        let mut xdr = Xdr::new();
        reply_msg_start(&mut xdr, 77, &OpaqueAuth::none()).unwrap();
        xdr.send_u32(42).unwrap();
        let mut rx = Xdr::from_inbound(xdr.out_msg().to_vec());
        assert_eq!(recv_reply_header(&mut rx).unwrap(), (77, ReplyHeader::success()));
        assert_eq!(rx.recv_u32().unwrap(), 42);
    }

    #[test]
    fn oversized_auth_rejected() {
        let mut xdr = Xdr::new();
        let auth = OpaqueAuth {
            flavor: 1,
            body: vec![0; MAX_AUTH_BYTES as usize + 1],
        };
        assert!(send_auth(&mut xdr, &auth).is_err());
    }

    #[test]
    fn peeks() {
        let mut xdr = Xdr::new();
        CallHeader {
            xid: 5,
            prog: 0x3000_0000,
            vers: 0x0001_0000,
            proc: 3,
            cred: OpaqueAuth::none(),
            verf: OpaqueAuth::none(),
        }
        .encode(&mut xdr)
        .unwrap();
        let msg = xdr.out_msg();
        assert_eq!(peek_xid(msg), Some(5));
        assert_eq!(peek_msg_type(msg), Some(MsgType::Call));
        assert_eq!(peek_prog_vers(msg), Some((0x3000_0000, 0x0001_0000)));
        assert_eq!(peek_msg_type(&[0, 0, 0, 1]), None);
    }
}
