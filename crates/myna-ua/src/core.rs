// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use myna_auth::{Challenge, DigestContext};
use myna_core::{generate_branch, Body, Method, OutgoingRequestBuilder, Request, Response, SipUri};
use myna_dialog::{DialogId, DialogSet};
use myna_parse::{
    extract_tag, header, parse_cseq, parse_message, sent_by_from_via, serialize_request,
    serialize_response, top_via,
};
use myna_timer::TimerTable;
use myna_transaction::{
    reply_to, ClientTransactionUser, ServerMatch, TransactionKey, TransactionLayer,
    TransportDispatcher,
};
use myna_transport::Transport;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::delegate::{OutgoingRequestDelegate, UserAgentDelegate};

/// A dialog usage handling in-dialog requests (the INVITE session).
#[async_trait]
pub trait SessionUsage: Send + Sync + 'static {
    /// An in-dialog request arrived. `key` is None for ACK (no transaction).
    async fn on_request(&self, request: Request, key: Option<TransactionKey>);
    /// A 2xx retransmission for the INVITE arrived; the usage re-sends ACK.
    async fn on_retransmitted_2xx(&self, response: Response);
}

/// A dialog usage handling in-dialog NOTIFY (the subscription).
#[async_trait]
pub trait NotifyTarget: Send + Sync + 'static {
    async fn on_notify(&self, request: Request, key: TransactionKey);
}

/// An invitation reachable by CANCEL through its INVITE transaction key.
#[async_trait]
pub trait CancelTarget: Send + Sync + 'static {
    async fn on_cancel(&self, request: Request);
}

/// Static configuration the core needs from the user agent.
#[derive(Clone)]
pub struct CoreConfig {
    pub aor: SipUri,
    pub display_name: Option<SmolStr>,
    pub contact: SipUri,
    pub via_host: SmolStr,
    pub via_transport: SmolStr,
    pub force_rport: bool,
    pub user_agent: SmolStr,
    pub supported: Vec<SmolStr>,
    /// Instance-unique Call-ID prefix; also the §8.2.2.2 loop-detection key.
    pub call_id_prefix: SmolStr,
    pub preloaded_route_set: Vec<SipUri>,
    pub credentials: Option<(SmolStr, SmolStr)>,
    pub allow_out_of_dialog_refer: bool,
    pub allow_out_of_dialog_notify: bool,
}

struct TransportSender(Transport);

#[async_trait]
impl TransportDispatcher for TransportSender {
    async fn dispatch(&self, frame: String) -> Result<()> {
        self.0.send(&frame).await.map_err(anyhow::Error::from)
    }
}

/// Routes inbound messages to transactions, dialogs and transaction users;
/// creates outbound transactions; replies statelessly where the RFC says to.
pub struct UserAgentCore {
    config: CoreConfig,
    transport: Transport,
    layer: TransactionLayer,
    pub dialogs: DialogSet,
    digest: Mutex<Option<DigestContext>>,
    session_usages: DashMap<DialogId, Arc<dyn SessionUsage>>,
    notify_targets: DashMap<DialogId, Arc<dyn NotifyTarget>>,
    /// Subscriptions whose dialog has not formed yet, keyed by
    /// (Call-ID, local tag): RFC 6665 lets the NOTIFY beat the 2xx.
    pending_subscriptions: DashMap<(SmolStr, SmolStr), Arc<dyn NotifyTarget>>,
    cancel_targets: DashMap<TransactionKey, Arc<dyn CancelTarget>>,
    delegate: Mutex<Option<Arc<dyn UserAgentDelegate>>>,
    invitation_factory: Mutex<Option<Arc<dyn Fn(Request, TransactionKey) + Send + Sync>>>,
}

impl UserAgentCore {
    pub fn new(transport: Transport, config: CoreConfig) -> Arc<Self> {
        let digest = config
            .credentials
            .clone()
            .map(|(user, password)| DigestContext::new(user, password));
        let layer = TransactionLayer::new(
            Arc::new(TransportSender(transport.clone())),
            TimerTable::new(true),
        );
        Arc::new(Self {
            config,
            transport,
            layer,
            dialogs: DialogSet::new(),
            digest: Mutex::new(digest),
            session_usages: DashMap::new(),
            notify_targets: DashMap::new(),
            pending_subscriptions: DashMap::new(),
            cancel_targets: DashMap::new(),
            delegate: Mutex::new(None),
            invitation_factory: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn transaction_layer(&self) -> &TransactionLayer {
        &self.layer
    }

    pub fn set_delegate(&self, delegate: Option<Arc<dyn UserAgentDelegate>>) {
        *self.delegate.lock() = delegate;
    }

    /// The user agent installs this so inbound INVITE can build invitations
    /// without the core depending on the TU types.
    pub fn set_invitation_factory(
        &self,
        factory: impl Fn(Request, TransactionKey) + Send + Sync + 'static,
    ) {
        *self.invitation_factory.lock() = Some(Arc::new(factory));
    }

    /// Methods this agent is willing to receive, for Allow headers.
    pub fn allow_value(&self) -> &'static str {
        "INVITE, ACK, CANCEL, BYE, OPTIONS, MESSAGE, INFO, NOTIFY, SUBSCRIBE, REFER"
    }

    /// Builds an out-of-dialog request envelope with this agent's identity.
    pub fn make_request(&self, method: Method, request_uri: SipUri, to_uri: SipUri) -> OutgoingRequestBuilder {
        let mut builder = OutgoingRequestBuilder::new(
            method,
            request_uri,
            self.config.aor.clone(),
            to_uri,
        )
        .route_set(self.config.preloaded_route_set.clone())
        .supported(self.config.supported.clone())
        .user_agent(self.config.user_agent.clone());
        if let Some(name) = &self.config.display_name {
            builder = builder.from_display_name(name.clone());
        }
        builder
    }

    /// Finalizes an outgoing request: the builder output gains its Via (and
    /// with it the transaction branch).
    pub fn finalize(&self, mut request: Request) -> Request {
        let branch = generate_branch();
        let rport = if self.config.force_rport { ";rport" } else { "" };
        request.headers.push_front(
            "Via",
            SmolStr::new(format!(
                "SIP/2.0/{} {};branch={}{}",
                self.config.via_transport, self.config.via_host, branch, rport
            )),
        );
        request
    }

    /// Creates a client transaction for `request` and transmits it. Returns
    /// the request as sent (Via included) so callers can CANCEL it later.
    pub async fn send_request(
        self: Arc<Self>,
        request: Request,
        delegate: Arc<dyn OutgoingRequestDelegate>,
    ) -> Result<Request, crate::UaError> {
        self.send_request_attempt(request, delegate, false).await
    }

    async fn send_request_attempt(
        self: Arc<Self>,
        request: Request,
        delegate: Arc<dyn OutgoingRequestDelegate>,
        auth_attempted: bool,
    ) -> Result<Request, crate::UaError> {
        let sent = self.finalize(request);
        sent.check_mandatory_headers()
            .map_err(|err| crate::UaError::Validation(SmolStr::new(err.to_string())))?;
        let key = TransactionKey::for_outbound_request(&sent)
            .ok_or_else(|| crate::UaError::Validation(SmolStr::new("unparseable Via")))?;
        let tu = Arc::new(CoreClientTu {
            core: self.clone(),
            original: sent.clone(),
            delegate,
            auth_attempted,
        });
        self.layer.start_client(key, sent.clone(), tu).await;
        Ok(sent)
    }

    /// Builds and sends the CANCEL for a previously sent INVITE. The CANCEL
    /// copies the INVITE's top Via so the peer matches it to the right
    /// transaction (RFC 3261 §9.1).
    pub async fn send_cancel(
        self: Arc<Self>,
        invite_as_sent: &Request,
        delegate: Arc<dyn OutgoingRequestDelegate>,
    ) -> Result<(), crate::UaError> {
        let mut headers = myna_core::Headers::new();
        for name in ["Via", "From", "To", "Call-ID"] {
            if let Some(value) = invite_as_sent.headers.get(name) {
                headers.push(name, value.clone());
            }
        }
        let cseq_number = invite_as_sent
            .headers
            .get("CSeq")
            .and_then(|v| v.split_whitespace().next().map(str::to_owned))
            .unwrap_or_else(|| "1".to_owned());
        headers.push("CSeq", SmolStr::new(format!("{} CANCEL", cseq_number)));
        headers.push("Max-Forwards", "70");
        let cancel = Request::new(
            myna_core::RequestLine::new(Method::Cancel, invite_as_sent.start.uri.clone()),
            headers,
            bytes::Bytes::new(),
        );
        let key = TransactionKey::for_outbound_request(&cancel)
            .ok_or_else(|| crate::UaError::Validation(SmolStr::new("INVITE missing Via")))?;
        let tu = Arc::new(CoreClientTu {
            core: self.clone(),
            original: cancel.clone(),
            delegate,
            auth_attempted: true,
        });
        self.layer.start_client(key, cancel, tu).await;
        Ok(())
    }

    /// Sends an ACK. ACK for a 2xx belongs to no transaction and goes out
    /// directly through the transport.
    pub async fn send_ack(&self, ack: Request) -> Result<(), crate::UaError> {
        self.transport
            .send(&serialize_request(&ack))
            .await
            .map_err(crate::UaError::from)
    }

    /// Builds an in-dialog request, consuming the dialog's next local CSeq.
    pub fn make_in_dialog_request(
        &self,
        id: &DialogId,
        method: Method,
        body: Option<Body>,
        extra_headers: Vec<(SmolStr, SmolStr)>,
    ) -> Option<Request> {
        self.dialogs.with(id, |dialog| {
            let cseq = if method == Method::Ack {
                dialog.local_cseq
            } else {
                dialog.next_local_cseq()
            };
            let mut builder = OutgoingRequestBuilder::new(
                method.clone(),
                dialog.remote_target.clone(),
                dialog.local_uri.clone(),
                dialog.remote_uri.clone(),
            )
            .from_tag(id.local_tag.clone())
            .to_tag(id.remote_tag.clone())
            .call_id(id.call_id.clone())
            .cseq(cseq)
            .route_set(dialog.route_set.clone())
            .user_agent(self.config.user_agent.clone());
            for (name, value) in extra_headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = body {
                builder = builder.body(body);
            }
            builder.build(self.config.call_id_prefix.as_str())
        })
    }

    /// Sends a response through the owning server transaction.
    pub async fn respond(&self, key: &TransactionKey, response: Response) -> Result<(), crate::UaError> {
        self.layer
            .respond(key, response)
            .await
            .map_err(|err| crate::UaError::Validation(SmolStr::new(err.to_string())))
    }

    /// Replies without creating any transaction state (RFC 3261 §8.2.6).
    pub async fn reply_statelessly(&self, request: &Request, code: u16) {
        let response = reply_to(request, code);
        if let Err(err) = self.transport.send(&serialize_response(&response)).await {
            warn!(%err, code, "stateless reply failed");
        }
    }

    pub fn register_session_usage(&self, id: DialogId, usage: Arc<dyn SessionUsage>) {
        self.session_usages.insert(id, usage);
    }

    pub fn release_session_usage(&self, id: &DialogId) {
        self.session_usages.remove(id);
        self.dialogs.release_usage(id, "session");
    }

    pub fn register_notify_target(&self, id: DialogId, target: Arc<dyn NotifyTarget>) {
        self.notify_targets.insert(id, target);
    }

    pub fn release_notify_target(&self, id: &DialogId) {
        self.notify_targets.remove(id);
        self.dialogs.release_usage(id, "subscription");
    }

    /// Registers a subscription that is still waiting for its dialog.
    pub fn register_pending_subscription(
        &self,
        call_id: SmolStr,
        local_tag: SmolStr,
        target: Arc<dyn NotifyTarget>,
    ) {
        self.pending_subscriptions
            .insert((call_id, local_tag), target);
    }

    pub fn release_pending_subscription(&self, call_id: &str, local_tag: &str) {
        self.pending_subscriptions
            .remove(&(SmolStr::new(call_id), SmolStr::new(local_tag)));
    }

    /// Attaches a server-transaction user after the fact (invitations are
    /// created once their INVITE transaction already exists).
    pub fn attach_server_tu(
        &self,
        key: &TransactionKey,
        tu: Arc<dyn myna_transaction::ServerTransactionUser>,
    ) {
        self.layer.set_server_tu(key, tu);
    }

    pub fn register_cancel_target(&self, key: TransactionKey, target: Arc<dyn CancelTarget>) {
        self.cancel_targets.insert(key, target);
    }

    pub fn release_cancel_target(&self, key: &TransactionKey) {
        self.cancel_targets.remove(key);
    }

    /// Drops every table; the user agent calls this at the end of `stop()`.
    pub fn reset(&self) {
        self.layer.reset();
        self.dialogs.clear();
        self.session_usages.clear();
        self.notify_targets.clear();
        self.pending_subscriptions.clear();
        self.cancel_targets.clear();
    }

    /// Entry point for every frame the transport delivers.
    pub async fn receive_message(&self, frame: &str) {
        match parse_message(frame) {
            Some(myna_core::SipMessage::Request(request)) => self.receive_request(request).await,
            Some(myna_core::SipMessage::Response(response)) => {
                self.receive_response(response).await
            }
            None => {
                debug!("dropping unparseable frame");
            }
        }
    }

    async fn receive_request(&self, request: Request) {
        // Sanity: inbound requests are dropped when the identity header set
        // is incomplete. This is narrower than the six-header set compliant
        // requests carry; a missing Max-Forwards alone is not grounds to
        // drop a message we can still route.
        const IDENTITY_HEADERS: [&str; 5] = ["From", "To", "Call-ID", "CSeq", "Via"];
        if let Some(missing) = IDENTITY_HEADERS
            .iter()
            .find(|name| request.headers.get(name).is_none())
        {
            debug!(header = *missing, "dropping request");
            return;
        }
        let to_tag = request.headers.get("To").and_then(|v| extract_tag(v));

        // Loop detection: our own out-of-dialog request came back to us.
        if to_tag.is_none() {
            if let Some(call_id) = request.headers.get("Call-ID") {
                if call_id.starts_with(self.config.call_id_prefix.as_str()) {
                    self.reply_statelessly(&request, 482).await;
                    return;
                }
            }
        }

        // Content-Length overrun means a truncated message.
        if let Some(declared) = request
            .headers
            .get("Content-Length")
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            if declared > request.body.len() {
                self.reply_statelessly(&request, 400).await;
                return;
            }
        }

        // An existing server transaction absorbs retransmissions and ACKs
        // for non-2xx finals. CANCEL is matched below instead.
        if request.start.method != Method::Cancel
            && self.layer.receive_request(request.clone()).await == ServerMatch::Handled
        {
            return;
        }

        match request.start.method.clone() {
            Method::Cancel => self.receive_cancel(request).await,
            Method::Ack => self.receive_ack(request).await,
            method if to_tag.is_some() => self.receive_in_dialog(request, method).await,
            Method::Invite => self.receive_invite(request).await,
            Method::Message => self.receive_message_request(request).await,
            Method::Options => self.receive_options(request).await,
            Method::Notify => {
                if self.config.allow_out_of_dialog_notify {
                    let delegate = self.delegate.lock().clone();
                    self.respond_new_transaction(request.clone(), 200).await;
                    if let Some(delegate) = delegate {
                        delegate.on_notify(request).await;
                    }
                } else {
                    self.respond_new_transaction(request, 481).await;
                }
            }
            Method::Refer => {
                if self.config.allow_out_of_dialog_refer {
                    let delegate = self.delegate.lock().clone();
                    self.respond_new_transaction(request.clone(), 202).await;
                    if let Some(delegate) = delegate {
                        delegate.on_refer(request).await;
                    }
                } else {
                    self.respond_new_transaction(request, 405).await;
                }
            }
            Method::Register => {
                let delegate = self.delegate.lock().clone();
                match delegate {
                    Some(delegate) => delegate.on_register(request).await,
                    None => self.respond_new_transaction(request, 405).await,
                }
            }
            Method::Subscribe => {
                let delegate = self.delegate.lock().clone();
                match delegate {
                    Some(delegate) => delegate.on_subscribe(request).await,
                    None => self.respond_new_transaction(request, 405).await,
                }
            }
            // Dialog-only methods arriving without a to-tag, and PUBLISH,
            // which this agent only ever originates.
            Method::Bye | Method::Info => {
                self.respond_new_transaction(request, 481).await;
            }
            Method::Publish => self.respond_new_transaction(request, 405).await,
            Method::Unknown(_) => self.respond_new_transaction(request, 501).await,
        }
    }

    async fn receive_invite(&self, request: Request) {
        let Some(key) = TransactionKey::for_inbound_request(&request) else {
            debug!("INVITE without usable Via");
            return;
        };
        // Replaces must point at a dialog we actually own (RFC 3891).
        if let Some(replaces) = request.headers.get("Replaces") {
            match self.find_replaces_dialog(replaces.as_str()) {
                ReplacesMatch::NotFound => {
                    self.respond_new_transaction(request, 481).await;
                    return;
                }
                ReplacesMatch::EarlyOnlyButConfirmed => {
                    self.respond_new_transaction(request, 486).await;
                    return;
                }
                ReplacesMatch::Ok => {}
            }
        }
        let factory = self.invitation_factory.lock().clone();
        match factory {
            Some(factory) => {
                self.layer.start_server(key.clone(), request.clone(), None);
                factory(request, key);
            }
            None => {
                self.respond_new_transaction(request, 486).await;
            }
        }
    }

    async fn receive_cancel(&self, request: Request) {
        let Some(invite_key) = TransactionKey::for_inbound_request(&request) else {
            return;
        };
        let cancel_key = TransactionKey::server(
            invite_key.branch.clone(),
            invite_key.sent_by.clone(),
            Method::Cancel,
        );
        // A retransmitted CANCEL is absorbed by its own transaction.
        if self
            .layer
            .receive_request_as(cancel_key.clone(), request.clone())
            .await
            == ServerMatch::Handled
        {
            return;
        }
        let target = self.cancel_targets.get(&invite_key).map(|t| t.value().clone());
        match target {
            Some(target) => {
                // The CANCEL gets its own transaction and an immediate 200.
                self.layer
                    .start_server(cancel_key.clone(), request.clone(), None);
                let ok = reply_to(&request, 200);
                if let Err(err) = self.layer.respond(&cancel_key, ok).await {
                    warn!(%err, "200 to CANCEL failed");
                }
                target.on_cancel(request).await;
            }
            None => {
                self.layer
                    .start_server(cancel_key.clone(), request.clone(), None);
                let response = reply_to(&request, 481);
                let _ = self.layer.respond(&cancel_key, response).await;
            }
        }
    }

    async fn receive_ack(&self, request: Request) {
        // ACK for a 2xx: no transaction, absorbed by the session usage.
        if let Some(id) = DialogId::from_in_dialog_request(&request) {
            if let Some(usage) = self.session_usages.get(&id).map(|u| u.value().clone()) {
                usage.on_request(request, None).await;
                return;
            }
        }
        debug!("dropping stray ACK");
    }

    async fn receive_in_dialog(&self, request: Request, method: Method) {
        let Some(id) = DialogId::from_in_dialog_request(&request) else {
            self.respond_new_transaction(request, 481).await;
            return;
        };
        if !self.dialogs.contains(&id) {
            // A NOTIFY may legally beat the 2xx that forms the dialog
            // (RFC 6665 §4.4.1); hand it to the waiting subscription.
            if method == Method::Notify {
                let pending = self
                    .pending_subscriptions
                    .get(&(id.call_id.clone(), id.local_tag.clone()))
                    .map(|t| t.value().clone());
                if let Some(target) = pending {
                    if let Some(key) = TransactionKey::for_inbound_request(&request) {
                        self.layer.start_server(key.clone(), request.clone(), None);
                        target.on_notify(request, key).await;
                        return;
                    }
                }
            }
            self.respond_new_transaction(request, 481).await;
            return;
        }
        let fresh = self
            .dialogs
            .with(&id, |dialog| dialog.check_remote_cseq(&request))
            .unwrap_or(Err(myna_dialog::DialogError::MissingHeader("CSeq")));
        if let Err(err) = fresh {
            debug!(%err, "dropping out-of-order in-dialog request");
            return;
        }

        match method {
            Method::Notify => {
                let Some(key) = TransactionKey::for_inbound_request(&request) else {
                    return;
                };
                self.layer.start_server(key.clone(), request.clone(), None);
                let target = self.notify_targets.get(&id).map(|t| t.value().clone());
                match target {
                    Some(target) => target.on_notify(request, key).await,
                    None => {
                        let response = reply_to(&request, 481);
                        let _ = self.layer.respond(&key, response).await;
                    }
                }
            }
            _ => {
                let Some(key) = TransactionKey::for_inbound_request(&request) else {
                    return;
                };
                self.layer.start_server(key.clone(), request.clone(), None);
                let usage = self.session_usages.get(&id).map(|u| u.value().clone());
                match usage {
                    Some(usage) => usage.on_request(request, Some(key)).await,
                    None => {
                        let response = reply_to(&request, 481);
                        let _ = self.layer.respond(&key, response).await;
                    }
                }
            }
        }
    }

    async fn receive_message_request(&self, request: Request) {
        let delegate = self.delegate.lock().clone();
        self.respond_new_transaction(request.clone(), 200).await;
        if let Some(delegate) = delegate {
            delegate.on_message(request).await;
        }
    }

    async fn receive_options(&self, request: Request) {
        let Some(key) = TransactionKey::for_inbound_request(&request) else {
            return;
        };
        self.layer.start_server(key.clone(), request.clone(), None);
        let mut response = reply_to(&request, 200);
        response.headers.push("Allow", self.allow_value());
        if !self.config.supported.is_empty() {
            let joined = self
                .config
                .supported
                .iter()
                .map(SmolStr::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            response.headers.push("Supported", SmolStr::new(joined));
        }
        response.headers.push("Accept", "application/sdp");
        if let Err(err) = self.layer.respond(&key, response).await {
            warn!(%err, "OPTIONS reply failed");
        }
    }

    /// Creates a server transaction and immediately answers with `code`.
    async fn respond_new_transaction(&self, request: Request, code: u16) {
        let Some(key) = TransactionKey::for_inbound_request(&request) else {
            return;
        };
        self.layer.start_server(key.clone(), request.clone(), None);
        let response = reply_to(&request, code);
        if let Err(err) = self.layer.respond(&key, response).await {
            warn!(%err, code, "reply failed");
        }
    }

    async fn receive_response(&self, response: Response) {
        // Sanity per §8.1.3.3: multiple Vias mean a misrouted response.
        if response.headers.count("Via") > 1 {
            debug!("dropping response with multiple Vias");
            return;
        }
        let sent_by_ok = top_via(&response.headers)
            .and_then(|via| sent_by_from_via(via))
            .map(|sent_by| {
                sent_by == self.config.via_host.as_str()
                    || sent_by
                        .split(':')
                        .next()
                        .map(|host| host == self.config.via_host.as_str())
                        .unwrap_or(false)
            })
            .unwrap_or(false);
        if !sent_by_ok {
            debug!("dropping response whose Via is not ours");
            return;
        }

        if self.layer.receive_response(response.clone()).await {
            return;
        }

        // A 2xx retransmission for an INVITE whose transaction is gone: the
        // session re-sends the ACK (RFC 3261 §13.2.2.4).
        if response.start.is_success() {
            if let Some((_, Method::Invite)) = parse_cseq(&response.headers) {
                if let Some(id) = DialogId::from_response_uac(&response) {
                    if let Some(usage) = self.session_usages.get(&id).map(|u| u.value().clone()) {
                        usage.on_retransmitted_2xx(response).await;
                        return;
                    }
                }
            }
        }
        debug!("dropping response matching no transaction");
    }

    /// Builds the credentialed retry for a 401/407, or None when the
    /// challenge cannot be satisfied.
    fn build_auth_retry(&self, original: &Request, response: &Response) -> Option<Request> {
        let (challenge_header, authorization_header) = if response.start.code == 401 {
            ("WWW-Authenticate", "Authorization")
        } else {
            ("Proxy-Authenticate", "Proxy-Authorization")
        };
        let challenge = Challenge::parse(header(&response.headers, challenge_header)?)?;
        let mut digest = self.digest.lock();
        let context = digest.as_mut()?;
        let uri = original.start.uri.to_string();
        let authorization = context.authenticate(
            &challenge,
            &original.start.method,
            &uri,
            Some(original.body.as_ref()),
        )?;

        let mut retry = original.clone();
        // New attempt, new transaction: replace the Via and bump the CSeq.
        retry.headers.remove_all("Via");
        retry.headers.remove_all(authorization_header);
        if let Some((number, method)) = parse_cseq(&retry.headers) {
            retry
                .headers
                .replace("CSeq", SmolStr::new(format!("{} {}", number + 1, method.as_str())));
        }
        retry
            .headers
            .push(SmolStr::new(authorization_header), SmolStr::new(authorization.value()));
        Some(retry)
    }
}

enum ReplacesMatch {
    Ok,
    NotFound,
    EarlyOnlyButConfirmed,
}

impl UserAgentCore {
    /// Matches a Replaces header (`call-id;to-tag=x;from-tag=y`) against the
    /// dialog table. The to-tag is ours, the from-tag is theirs.
    fn find_replaces_dialog(&self, replaces: &str) -> ReplacesMatch {
        let mut parts = replaces.split(';');
        let Some(call_id) = parts.next().map(str::trim) else {
            return ReplacesMatch::NotFound;
        };
        let mut to_tag = None;
        let mut from_tag = None;
        let mut early_only = false;
        for part in parts {
            let part = part.trim();
            if let Some((name, value)) = part.split_once('=') {
                match name.trim().to_ascii_lowercase().as_str() {
                    "to-tag" => to_tag = Some(value.trim().to_owned()),
                    "from-tag" => from_tag = Some(value.trim().to_owned()),
                    _ => {}
                }
            } else if part.eq_ignore_ascii_case("early-only") {
                early_only = true;
            }
        }
        let (Some(to_tag), Some(from_tag)) = (to_tag, from_tag) else {
            return ReplacesMatch::NotFound;
        };
        let id = DialogId::new(call_id, to_tag, from_tag);
        match self.dialogs.get(&id) {
            None => ReplacesMatch::NotFound,
            Some(dialog) => {
                if early_only && dialog.state == myna_dialog::DialogState::Confirmed {
                    ReplacesMatch::EarlyOnlyButConfirmed
                } else {
                    ReplacesMatch::Ok
                }
            }
        }
    }
}

/// Adapter between the transaction layer and a per-request delegate, with
/// the single credentialed retry for 401/407.
struct CoreClientTu {
    core: Arc<UserAgentCore>,
    original: Request,
    delegate: Arc<dyn OutgoingRequestDelegate>,
    auth_attempted: bool,
}

#[async_trait]
impl ClientTransactionUser for CoreClientTu {
    async fn on_provisional(&self, _key: &TransactionKey, response: Response) {
        if response.start.code == 100 {
            self.delegate.on_trying(response).await;
        } else {
            self.delegate.on_progress(response).await;
        }
    }

    async fn on_final(&self, _key: &TransactionKey, response: Response) {
        let code = response.start.code;
        if (code == 401 || code == 407) && !self.auth_attempted {
            // One retry with credentials; a second challenge is a failure.
            if let Some(retry) = self.core.build_auth_retry(&self.original, &response) {
                let result = self
                    .core
                    .clone()
                    .send_request_attempt(retry, self.delegate.clone(), true)
                    .await;
                if result.is_ok() {
                    return;
                }
            } else {
                warn!(code, "challenge could not be satisfied");
            }
        }
        match code {
            200..=299 => self.delegate.on_accept(response).await,
            300..=399 => self.delegate.on_redirect(response).await,
            _ => self.delegate.on_reject(response).await,
        }
    }

    async fn on_timeout(&self, _key: &TransactionKey) {
        self.delegate.on_timeout().await;
    }

    async fn on_transport_error(&self, _key: &TransactionKey) {
        self.delegate.on_transport_error().await;
    }
}
