// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §17 transaction layer.
//!
//! The four transaction flavors are pure state machines in [`fsm`]; the
//! timer-driven runtime that owns the transaction tables lives in [`layer`].
//! Matching follows §17.2.3: a server transaction is identified by the top
//! Via branch plus sent-by plus method (with ACK and CANCEL matching the
//! INVITE transaction they target), a client transaction by branch plus the
//! CSeq method.

use myna_core::{Method, Request, Response};
use myna_parse::{branch_from_via, parse_cseq, sent_by_from_via, top_via};
use smol_str::SmolStr;

pub mod fsm;
pub mod layer;
pub mod reply;

pub use fsm::{
    ClientInviteAction, ClientInviteEvent, ClientInviteFsm, ClientNonInviteAction,
    ClientNonInviteEvent, ClientNonInviteFsm, ServerInviteAction, ServerInviteEvent,
    ServerInviteFsm, ServerNonInviteAction, ServerNonInviteEvent, ServerNonInviteFsm,
};
pub use layer::{
    ClientTransactionUser, ServerMatch, ServerTransactionUser, TransactionLayer,
    TransportDispatcher,
};
pub use reply::reply_to;

/// Client INVITE transaction states (RFC 3261 Figure 5 + RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientInviteState {
    Calling,
    Proceeding,
    Completed,
    Accepted,
    Terminated,
}

/// Server INVITE transaction states (RFC 3261 Figure 7 + RFC 6026).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerInviteState {
    Proceeding,
    Completed,
    Accepted,
    Confirmed,
    Terminated,
}

/// Client non-INVITE transaction states (RFC 3261 Figure 6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Server non-INVITE transaction states (RFC 3261 Figure 8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerNonInviteState {
    Trying,
    Proceeding,
    Completed,
    Terminated,
}

/// Unique transaction identity: branch, sent-by and method, split by
/// direction so a UA acting as both ends of a spiral cannot collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub branch: SmolStr,
    pub sent_by: SmolStr,
    pub method: Method,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn client(branch: impl Into<SmolStr>, sent_by: impl Into<SmolStr>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            sent_by: sent_by.into(),
            method,
            is_server: false,
        }
    }

    pub fn server(branch: impl Into<SmolStr>, sent_by: impl Into<SmolStr>, method: Method) -> Self {
        Self {
            branch: branch.into(),
            sent_by: sent_by.into(),
            method,
            is_server: true,
        }
    }

    /// Key under which an inbound request matches a server transaction.
    ///
    /// ACK and CANCEL match the INVITE transaction they refer to.
    pub fn for_inbound_request(req: &Request) -> Option<Self> {
        let via = top_via(&req.headers)?;
        let branch = SmolStr::new(branch_from_via(via)?);
        let sent_by = SmolStr::new(sent_by_from_via(via)?);
        let method = match req.start.method {
            Method::Ack | Method::Cancel => Method::Invite,
            ref other => other.clone(),
        };
        Some(Self::server(branch, sent_by, method))
    }

    /// Key under which an inbound response matches a client transaction:
    /// top Via branch plus the CSeq method.
    pub fn for_inbound_response(res: &Response) -> Option<Self> {
        let via = top_via(&res.headers)?;
        let branch = SmolStr::new(branch_from_via(via)?);
        let sent_by = SmolStr::new(sent_by_from_via(via)?);
        let (_, method) = parse_cseq(&res.headers)?;
        Some(Self::client(branch, sent_by, method))
    }

    /// Key for an outbound request whose Via has already been pushed.
    pub fn for_outbound_request(req: &Request) -> Option<Self> {
        let via = top_via(&req.headers)?;
        let branch = SmolStr::new(branch_from_via(via)?);
        let sent_by = SmolStr::new(sent_by_from_via(via)?);
        Some(Self::client(branch, sent_by, req.start.method.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use myna_core::{Headers, RequestLine, SipUri, StatusLine};

    fn request(method: Method, via: &str, cseq: &str) -> Request {
        let mut headers = Headers::new();
        headers.push("Via", via);
        headers.push("CSeq", cseq);
        Request::new(
            RequestLine::new(method, SipUri::parse("sip:example.com").expect("uri")),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn inbound_request_key_uses_branch_sent_by_method() {
        let req = request(
            Method::Invite,
            "SIP/2.0/WSS client.example.com;branch=z9hG4bKabc",
            "1 INVITE",
        );
        let key = TransactionKey::for_inbound_request(&req).expect("key");
        assert_eq!(key.branch.as_str(), "z9hG4bKabc");
        assert_eq!(key.sent_by.as_str(), "client.example.com");
        assert_eq!(key.method, Method::Invite);
        assert!(key.is_server);
    }

    #[test]
    fn ack_and_cancel_match_the_invite_transaction() {
        let ack = request(
            Method::Ack,
            "SIP/2.0/WSS client.example.com;branch=z9hG4bKabc",
            "1 ACK",
        );
        let cancel = request(
            Method::Cancel,
            "SIP/2.0/WSS client.example.com;branch=z9hG4bKabc",
            "1 CANCEL",
        );
        let invite = request(
            Method::Invite,
            "SIP/2.0/WSS client.example.com;branch=z9hG4bKabc",
            "1 INVITE",
        );
        let invite_key = TransactionKey::for_inbound_request(&invite).expect("key");
        assert_eq!(
            TransactionKey::for_inbound_request(&ack).expect("key"),
            invite_key
        );
        assert_eq!(
            TransactionKey::for_inbound_request(&cancel).expect("key"),
            invite_key
        );
    }

    #[test]
    fn response_key_uses_cseq_method() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/WSS ua.example.com;branch=z9hG4bKxyz");
        headers.push("CSeq", "2 REGISTER");
        let res = Response::new(
            StatusLine::new(200, "OK").expect("status"),
            headers,
            Bytes::new(),
        );
        let key = TransactionKey::for_inbound_response(&res).expect("key");
        assert_eq!(key.method, Method::Register);
        assert!(!key.is_server);
    }

    #[test]
    fn missing_branch_yields_no_key() {
        let req = request(Method::Invite, "SIP/2.0/WSS host.example.com", "1 INVITE");
        assert!(TransactionKey::for_inbound_request(&req).is_none());
    }
}
