// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! RFC 3261 §12 dialog state management.
//!
//! A dialog is identified by Call-ID plus local and remote tag, carries the
//! route set and remote target, and orders requests through the CSeq spaces.
//! Usages (the INVITE session, subscriptions) share one dialog; the dialog is
//! destroyed when its last usage ends.

use dashmap::DashMap;
use myna_core::{Method, NameAddr, Request, Response, SipUri};
use myna_parse::{extract_tag, header, parse_cseq};
use smol_str::SmolStr;
use tracing::debug;

/// Dialog state: Early from a provisional with a to-tag, Confirmed from 2xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Early,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialogError {
    MissingHeader(&'static str),
    /// Remote CSeq did not advance; the request must be dropped or rejected.
    StaleCSeq { current: u32, received: u32 },
}

impl std::fmt::Display for DialogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingHeader(name) => write!(f, "missing header: {}", name),
            Self::StaleCSeq { current, received } => {
                write!(f, "stale CSeq {} (current {})", received, current)
            }
        }
    }
}

impl std::error::Error for DialogError {}

/// Unique dialog identity (RFC 3261 §12): Call-ID + local tag + remote tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId {
    pub call_id: SmolStr,
    pub local_tag: SmolStr,
    pub remote_tag: SmolStr,
}

impl DialogId {
    pub fn new(
        call_id: impl Into<SmolStr>,
        local_tag: impl Into<SmolStr>,
        remote_tag: impl Into<SmolStr>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            local_tag: local_tag.into(),
            remote_tag: remote_tag.into(),
        }
    }

    /// Identity seen by the UAC: From tag is local, To tag is remote.
    pub fn from_response_uac(response: &Response) -> Option<Self> {
        let call_id = header(&response.headers, "Call-ID")?.clone();
        let local = extract_tag(header(&response.headers, "From")?)?;
        let remote = extract_tag(header(&response.headers, "To")?)?;
        Some(Self::new(call_id, local, remote))
    }

    /// Identity seen by the UAS: To tag is local, From tag is remote.
    pub fn from_request_uas(request: &Request, local_tag: &str) -> Option<Self> {
        let call_id = header(&request.headers, "Call-ID")?.clone();
        let remote = extract_tag(header(&request.headers, "From")?)?;
        Some(Self::new(call_id, SmolStr::new(local_tag), remote))
    }

    /// Identity of an in-dialog request as seen by the receiving UAS.
    pub fn from_in_dialog_request(request: &Request) -> Option<Self> {
        let call_id = header(&request.headers, "Call-ID")?.clone();
        let remote = extract_tag(header(&request.headers, "From")?)?;
        let local = extract_tag(header(&request.headers, "To")?)?;
        Some(Self::new(call_id, local, remote))
    }
}

/// One end-to-end peer relationship and its shared request-routing state.
#[derive(Debug, Clone)]
pub struct Dialog {
    pub id: DialogId,
    pub state: DialogState,
    pub local_uri: SipUri,
    pub remote_uri: SipUri,
    /// Where in-dialog requests go (remote Contact).
    pub remote_target: SipUri,
    /// Route set; already ordered for outbound use.
    pub route_set: Vec<SipUri>,
    pub local_cseq: u32,
    pub remote_cseq: u32,
    pub secure: bool,
    usages: Vec<SmolStr>,
}

impl Dialog {
    /// Creates the UAC side of a dialog from the INVITE/SUBSCRIBE request and
    /// the first dialog-forming response. The route set is the Record-Route
    /// list reversed (RFC 3261 §12.1.2).
    pub fn new_uac(request: &Request, response: &Response) -> Option<Self> {
        let id = DialogId::from_response_uac(response)?;
        let state = state_for_code(response.start.code)?;
        let local_uri = uri_from_header(&request.headers, "From")?;
        let remote_uri = uri_from_header(&request.headers, "To")?;
        let remote_target =
            uri_from_header(&response.headers, "Contact").unwrap_or_else(|| remote_uri.clone());
        let mut route_set = route_set_from(&response.headers);
        route_set.reverse();
        let (local_cseq, _) = parse_cseq(&request.headers)?;
        let secure = request.start.uri.secure;
        Some(Self {
            id,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set,
            local_cseq,
            remote_cseq: 0,
            secure,
            usages: Vec::new(),
        })
    }

    /// Creates the UAS side of a dialog from the inbound request and the
    /// dialog-forming response this side sent. The route set keeps the
    /// Record-Route order of the request (RFC 3261 §12.1.1).
    pub fn new_uas(request: &Request, response: &Response) -> Option<Self> {
        let local_tag = extract_tag(header(&response.headers, "To")?)?;
        let id = DialogId::from_request_uas(request, local_tag.as_str())?;
        let state = state_for_code(response.start.code)?;
        let local_uri = uri_from_header(&request.headers, "To")?;
        let remote_uri = uri_from_header(&request.headers, "From")?;
        let remote_target =
            uri_from_header(&request.headers, "Contact").unwrap_or_else(|| remote_uri.clone());
        let route_set = route_set_from(&request.headers);
        let (remote_cseq, _) = parse_cseq(&request.headers)?;
        let secure = request.start.uri.secure;
        Some(Self {
            id,
            state,
            local_uri,
            remote_uri,
            remote_target,
            route_set,
            local_cseq: 0,
            remote_cseq,
            secure,
            usages: Vec::new(),
        })
    }

    pub fn confirm(&mut self) {
        self.state = DialogState::Confirmed;
    }

    /// Next CSeq for an outgoing in-dialog request; strictly increasing.
    pub fn next_local_cseq(&mut self) -> u32 {
        self.local_cseq += 1;
        self.local_cseq
    }

    /// Validates and records the CSeq of an inbound in-dialog request. ACK
    /// and CANCEL echo the CSeq of the request they refer to and never
    /// advance the space.
    pub fn check_remote_cseq(&mut self, request: &Request) -> Result<(), DialogError> {
        let (cseq, method) = parse_cseq(&request.headers).ok_or(DialogError::MissingHeader("CSeq"))?;
        if matches!(method, Method::Ack | Method::Cancel) {
            return Ok(());
        }
        if self.remote_cseq != 0 && cseq <= self.remote_cseq {
            return Err(DialogError::StaleCSeq {
                current: self.remote_cseq,
                received: cseq,
            });
        }
        self.remote_cseq = cseq;
        Ok(())
    }

    /// Target refresh (re-INVITE / UPDATE / SUBSCRIBE refresh with Contact).
    pub fn refresh_remote_target(&mut self, contact: SipUri) {
        self.remote_target = contact;
    }

    pub fn register_usage(&mut self, usage: impl Into<SmolStr>) {
        let usage = usage.into();
        if !self.usages.contains(&usage) {
            self.usages.push(usage);
        }
    }

    /// Removes a usage; returns true when no usages remain.
    pub fn deregister_usage(&mut self, usage: &str) -> bool {
        self.usages.retain(|u| u != usage);
        self.usages.is_empty()
    }

    pub fn usage_count(&self) -> usize {
        self.usages.len()
    }
}

fn state_for_code(code: u16) -> Option<DialogState> {
    match code {
        101..=199 => Some(DialogState::Early),
        200..=299 => Some(DialogState::Confirmed),
        _ => None,
    }
}

fn uri_from_header(headers: &myna_core::Headers, name: &str) -> Option<SipUri> {
    NameAddr::parse(headers.get(name)?).map(|addr| addr.uri)
}

fn route_set_from(headers: &myna_core::Headers) -> Vec<SipUri> {
    headers
        .get_all("Record-Route")
        .filter_map(|value| NameAddr::parse(value).map(|addr| addr.uri))
        .collect()
}

/// Table of active dialogs, keyed by dialog identity.
#[derive(Default)]
pub struct DialogSet {
    dialogs: DashMap<DialogId, Dialog>,
}

impl DialogSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, dialog: Dialog) {
        debug!(call_id = %dialog.id.call_id, "dialog created");
        self.dialogs.insert(dialog.id.clone(), dialog);
    }

    pub fn contains(&self, id: &DialogId) -> bool {
        self.dialogs.contains_key(id)
    }

    pub fn get(&self, id: &DialogId) -> Option<Dialog> {
        self.dialogs.get(id).map(|d| d.value().clone())
    }

    pub fn len(&self) -> usize {
        self.dialogs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dialogs.is_empty()
    }

    /// Runs `f` against the dialog, if present.
    pub fn with<R>(&self, id: &DialogId, f: impl FnOnce(&mut Dialog) -> R) -> Option<R> {
        self.dialogs.get_mut(id).map(|mut d| f(&mut d))
    }

    /// Deregisters a usage, destroying the dialog when it was the last one.
    /// Returns true when the dialog was destroyed.
    pub fn release_usage(&self, id: &DialogId, usage: &str) -> bool {
        let destroy = self
            .dialogs
            .get_mut(id)
            .map(|mut d| d.deregister_usage(usage))
            .unwrap_or(false);
        if destroy {
            debug!(call_id = %id.call_id, "last usage gone, destroying dialog");
            self.dialogs.remove(id);
        }
        destroy
    }

    pub fn remove(&self, id: &DialogId) {
        self.dialogs.remove(id);
    }

    pub fn clear(&self) {
        self.dialogs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use myna_core::{Headers, RequestLine, StatusLine};

    fn invite() -> Request {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/WSS ua.example.com;branch=z9hG4bKd1");
        headers.push("From", "\"Alice\" <sip:alice@atlanta.com>;tag=ltag");
        headers.push("To", "<sip:bob@biloxi.com>");
        headers.push("Call-ID", "dlg-call-id");
        headers.push("CSeq", "4 INVITE");
        headers.push("Contact", "<sip:alice@pc.atlanta.com>");
        headers.push("Record-Route", "<sip:p1.example.com;lr>");
        headers.push("Record-Route", "<sip:p2.example.com;lr>");
        Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@biloxi.com").expect("uri")),
            headers,
            Bytes::new(),
        )
    }

    fn ok_response() -> Response {
        let mut headers = Headers::new();
        headers.push("From", "\"Alice\" <sip:alice@atlanta.com>;tag=ltag");
        headers.push("To", "<sip:bob@biloxi.com>;tag=rtag");
        headers.push("Call-ID", "dlg-call-id");
        headers.push("CSeq", "4 INVITE");
        headers.push("Contact", "<sip:bob@client.biloxi.com>");
        headers.push("Record-Route", "<sip:p1.example.com;lr>");
        headers.push("Record-Route", "<sip:p2.example.com;lr>");
        Response::new(
            StatusLine::new(200, "OK").expect("status"),
            headers,
            Bytes::new(),
        )
    }

    #[test]
    fn uac_dialog_reverses_route_set() {
        let dialog = Dialog::new_uac(&invite(), &ok_response()).expect("dialog");
        assert_eq!(dialog.state, DialogState::Confirmed);
        assert_eq!(dialog.id.local_tag.as_str(), "ltag");
        assert_eq!(dialog.id.remote_tag.as_str(), "rtag");
        assert_eq!(dialog.remote_target.host.as_str(), "client.biloxi.com");
        let hosts: Vec<&str> = dialog.route_set.iter().map(|u| u.host.as_str()).collect();
        assert_eq!(hosts, vec!["p2.example.com", "p1.example.com"]);
        assert_eq!(dialog.local_cseq, 4);
    }

    #[test]
    fn uas_dialog_keeps_route_set_order() {
        let dialog = Dialog::new_uas(&invite(), &ok_response()).expect("dialog");
        assert_eq!(dialog.id.local_tag.as_str(), "rtag");
        assert_eq!(dialog.id.remote_tag.as_str(), "ltag");
        let hosts: Vec<&str> = dialog.route_set.iter().map(|u| u.host.as_str()).collect();
        assert_eq!(hosts, vec!["p1.example.com", "p2.example.com"]);
        assert_eq!(dialog.remote_cseq, 4);
        assert_eq!(dialog.remote_target.host.as_str(), "pc.atlanta.com");
    }

    #[test]
    fn early_dialog_from_provisional() {
        let mut res = ok_response();
        res.start = StatusLine::new(180, "Ringing").expect("status");
        let dialog = Dialog::new_uac(&invite(), &res).expect("dialog");
        assert_eq!(dialog.state, DialogState::Early);
    }

    #[test]
    fn no_dialog_from_100_or_failure() {
        let mut res = ok_response();
        res.start = StatusLine::new(100, "Trying").expect("status");
        assert!(Dialog::new_uac(&invite(), &res).is_none());
        res.start = StatusLine::new(486, "Busy Here").expect("status");
        assert!(Dialog::new_uac(&invite(), &res).is_none());
    }

    #[test]
    fn local_cseq_is_strictly_increasing() {
        let mut dialog = Dialog::new_uac(&invite(), &ok_response()).expect("dialog");
        let first = dialog.next_local_cseq();
        let second = dialog.next_local_cseq();
        assert_eq!(first, 5);
        assert_eq!(second, 6);
    }

    #[test]
    fn stale_remote_cseq_is_rejected() {
        let mut dialog = Dialog::new_uas(&invite(), &ok_response()).expect("dialog");
        let mut bye = invite();
        bye.headers.replace("CSeq", "3 BYE");
        assert!(matches!(
            dialog.check_remote_cseq(&bye),
            Err(DialogError::StaleCSeq { current: 4, received: 3 })
        ));
        bye.headers.replace("CSeq", "5 BYE");
        assert!(dialog.check_remote_cseq(&bye).is_ok());
        assert_eq!(dialog.remote_cseq, 5);
    }

    #[test]
    fn ack_does_not_advance_remote_cseq() {
        let mut dialog = Dialog::new_uas(&invite(), &ok_response()).expect("dialog");
        let mut ack = invite();
        ack.headers.replace("CSeq", "4 ACK");
        assert!(dialog.check_remote_cseq(&ack).is_ok());
        assert_eq!(dialog.remote_cseq, 4);
    }

    #[test]
    fn dialog_lives_while_usages_remain() {
        let set = DialogSet::new();
        let mut dialog = Dialog::new_uac(&invite(), &ok_response()).expect("dialog");
        dialog.register_usage("session");
        dialog.register_usage("subscription:presence");
        let id = dialog.id.clone();
        set.insert(dialog);

        assert!(!set.release_usage(&id, "session"));
        assert!(set.contains(&id));
        assert!(set.release_usage(&id, "subscription:presence"));
        assert!(!set.contains(&id));
    }
}
