//! The call being dispatched, as seen by a dispatch function.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

#[allow(unused_imports)]
use log::{debug, error, info, trace, warn};

use std::sync::atomic::Ordering;

use crate::channel::MessageChannel;
use crate::message::{AcceptedReply, AuthStat, OpaqueAuth, RejectedReply, ReplyHeader};
use crate::server::RegisteredServer;
use crate::xdr::{XdrOp, XdrType};
use crate::{Error, Result};

/// An inbound call, handed to the service's dispatch function.
///
/// Arguments are decoded with [`getargs()`](Self::getargs) and the call is
/// answered with [`sendreply()`](Self::sendreply) or one of the `svcerr_*`
/// methods.
pub struct SvcRequest<'a> {
    server: &'a RegisteredServer,
    channel: &'a mut MessageChannel,
    xid: u32,
    proc: u32,
    cred: OpaqueAuth,
    args_pos: usize,
}

impl<'a> SvcRequest<'a> {
    pub(crate) fn new(
        server: &'a RegisteredServer,
        channel: &'a mut MessageChannel,
        xid: u32,
        proc: u32,
        cred: OpaqueAuth,
    ) -> Self {
        let args_pos = channel.xdr().in_pos();
        Self {
            server,
            channel,
            xid,
            proc,
            cred,
            args_pos,
        }
    }

    pub fn prog(&self) -> u32 {
        self.server.prog
    }

    pub fn vers(&self) -> u32 {
        self.server.vers
    }

    /// Procedure number called
    pub fn proc(&self) -> u32 {
        self.proc
    }

    /// Transaction id of the call
    pub fn xid(&self) -> u32 {
        self.xid
    }

    /// Caller's credentials
    pub fn cred(&self) -> &OpaqueAuth {
        &self.cred
    }

    fn check_active(&self) -> Result<()> {
        if self.server.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            error!("{:?} is not active", self.server);
            Err(Error::NotActive)
        }
    }

    /// Decode the call's arguments into `args`.
    pub fn getargs<A: XdrType + ?Sized>(&mut self, args: &mut A) -> Result<()> {
        self.check_active()?;
        let xdrs = self.channel.xdr_mut();
        xdrs.set_in_pos(self.args_pos);
        xdrs.set_op(XdrOp::Decode);
        args.xdr(xdrs).inspect_err(|e| {
            error!("{:?} failed to decode arguments: {e}", self.server)
        })?;
        Ok(())
    }

    /// Release anything [`getargs()`](Self::getargs) allocated in `args`.
    pub fn freeargs<A: XdrType + ?Sized>(&mut self, args: &mut A) -> Result<()> {
        self.check_active()?;
        let xdrs = self.channel.xdr_mut();
        let op = xdrs.op();
        xdrs.set_op(XdrOp::Free);
        let result = args.xdr(xdrs);
        xdrs.set_op(op);
        Ok(result?)
    }

    /// Send a successful reply carrying `results`.
    pub fn sendreply<R: XdrType + ?Sized>(&mut self, results: &mut R) -> Result<()> {
        self.check_active()?;
        let header = ReplyHeader::Accepted {
            verf: OpaqueAuth::none(),
            stat: AcceptedReply::Success,
        };
        let outcome = self.start_reply(&header).and_then(|()| {
            self.channel.xdr_mut().set_op(XdrOp::Encode);
            results.xdr(self.channel.xdr_mut()).map_err(Error::from)
        });
        if let Err(e) = outcome {
            error!("{:?} failed to encode reply: {e}", self.server);
            self.channel.abort();
            return Err(e);
        }
        self.send()
    }

    /// Reply that the arguments could not be decoded.
    pub fn svcerr_decode(&mut self) -> Result<()> {
        self.send_error(AcceptedReply::GarbageArgs)
    }

    /// Reply that the service hit a system error.
    pub fn svcerr_systemerr(&mut self) -> Result<()> {
        self.send_error(AcceptedReply::SystemErr)
    }

    /// Reply that the procedure is not supported.
    pub fn svcerr_noproc(&mut self) -> Result<()> {
        self.send_error(AcceptedReply::ProcUnavail)
    }

    /// Reply that the program is not available.
    pub fn svcerr_noprog(&mut self) -> Result<()> {
        self.send_error(AcceptedReply::ProgUnavail)
    }

    /// Reply that only versions `low` through `high` are supported.
    pub fn svcerr_progvers(&mut self, low: u32, high: u32) -> Result<()> {
        self.send_error(AcceptedReply::ProgMismatch { low, high })
    }

    /// Deny the call for authentication reason `why`.
    pub fn svcerr_auth(&mut self, why: AuthStat) -> Result<()> {
        self.reply_with(ReplyHeader::Denied(RejectedReply::AuthError(why)))
    }

    /// Deny the call because its credentials are too weak.
    pub fn svcerr_weakauth(&mut self) -> Result<()> {
        self.svcerr_auth(AuthStat::TooWeak)
    }

    fn send_error(&mut self, stat: AcceptedReply) -> Result<()> {
        let header = ReplyHeader::Accepted {
            verf: OpaqueAuth::none(),
            stat,
        };
        self.reply_with(header)
    }

    fn reply_with(&mut self, header: ReplyHeader) -> Result<()> {
        self.check_active()?;
        if let Err(e) = self.start_reply(&header) {
            error!("{:?} failed to encode error reply: {e}", self.server);
            self.channel.abort();
            return Err(e);
        }
        self.send()
    }

    fn start_reply(&mut self, header: &ReplyHeader) -> Result<()> {
        self.channel.start_reply(header)?;
        // The reply carries the call's transaction id whatever happened to the
        // inbound buffer since.
        self.channel.xdr_mut().patch_out_u32(0, self.xid)?;
        Ok(())
    }

    fn send(&mut self) -> Result<()> {
        self.channel.send().map_err(|e| {
            error!("{:?} failed to send reply: {e}", self.server);
            self.channel.abort();
            Error::from(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use crate::channel::XidAllocator;
    use crate::io::{Control, PortBackoff, RouterPort};
    use crate::message::{self, CallHeader};
    use crate::server::ServerKind;
    use crate::xdr::Xdr;

    #[derive(Debug, Default)]
    struct SinkPort {
        written: Mutex<Vec<Vec<u8>>>,
    }

    impl RouterPort for SinkPort {
        fn name(&self) -> &str {
            "sink"
        }
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }
        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            self.written.lock().unwrap().push(buf.to_vec());
            Ok(buf.len())
        }
        fn control(&self, _op: Control) -> io::Result<u32> {
            Ok(0)
        }
    }

    const PROG: u32 = 0x3000_0066;
    const VERS: u32 = 0x0001_0000;

    fn server(active: bool) -> RegisteredServer {
        RegisteredServer {
            prog: PROG,
            vers: VERS,
            dispatch: Arc::new(|_req: &mut SvcRequest<'_>| {}),
            kind: ServerKind::CallbackClient,
            active: AtomicBool::new(active),
            backoff: PortBackoff::default(),
        }
    }

    fn inbound_call(port: Arc<SinkPort>, xid: u32, arg: u32) -> (MessageChannel, CallHeader) {
        let mut xdr = Xdr::new();
        let none = OpaqueAuth::none();
        message::call_msg_start(&mut xdr, xid, PROG, VERS, 1, &none, &none).unwrap();
        xdr.send_u32(arg).unwrap();
        let mut channel = MessageChannel::with_inbound(
            port,
            PROG,
            VERS,
            XidAllocator::default(),
            xdr.out_msg().to_vec(),
        );
        let header = CallHeader::decode(channel.xdr_mut()).unwrap();
        (channel, header)
    }

    #[test]
    fn inactive_request_refuses_everything() {
        let port = Arc::new(SinkPort::default());
        let server = server(false);
        let (mut channel, header) = inbound_call(port.clone(), 7, 41);
        let mut request =
            SvcRequest::new(&server, &mut channel, header.xid, header.proc, header.cred);

        let mut value = 0u32;
        assert!(matches!(request.getargs(&mut value), Err(Error::NotActive)));
        assert!(matches!(request.freeargs(&mut value), Err(Error::NotActive)));
        assert!(matches!(request.sendreply(&mut value), Err(Error::NotActive)));
        assert!(matches!(request.svcerr_noproc(), Err(Error::NotActive)));
        assert!(matches!(request.svcerr_decode(), Err(Error::NotActive)));
        assert!(matches!(request.svcerr_weakauth(), Err(Error::NotActive)));
        assert!(port.written.lock().unwrap().is_empty());
    }

    #[test]
    fn active_request_replies_with_call_xid() {
        let port = Arc::new(SinkPort::default());
        let server = server(true);
        let (mut channel, header) = inbound_call(port.clone(), 7, 41);
        let mut request =
            SvcRequest::new(&server, &mut channel, header.xid, header.proc, header.cred);

        let mut value = 0u32;
        request.getargs(&mut value).unwrap();
        assert_eq!(value, 41);
        request.freeargs(&mut value).unwrap();
        request.svcerr_noproc().unwrap();

        let written = port.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        let mut xdr = Xdr::from_inbound(written[0].clone());
        let (xid, reply) = message::recv_reply_header(&mut xdr).unwrap();
        assert_eq!(xid, 7);
        assert_eq!(reply, ReplyHeader::accepted(AcceptedReply::ProcUnavail));
    }
}
