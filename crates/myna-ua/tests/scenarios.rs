// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios against an in-memory link: the "server" side of each
//! test plays registrar/peer by answering the frames the agent emits.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use myna_core::{Request, SipUri};
use myna_parse::{parse_request, serialize_response};
use myna_transaction::reply_to;
use myna_transport::{Connector, Link, LinkEvent, TransportError, TransportOptions};
use myna_ua::sdh::{SdhFactory, SessionDescription, SessionDescriptionHandler};
use myna_ua::{
    Invitation, PublisherOptions, PublisherState, RegistererOptions, RegistererState,
    SessionState, SubscriberOptions, SubscriberState, UaError, UserAgent, UserAgentDelegate,
    UserAgentOptions,
};
use smol_str::SmolStr;
use tokio::sync::mpsc;

const SDP_OFFER: &str = "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 4000 RTP/AVP 0\r\n";
const SDP_ANSWER: &str = "v=0\r\no=- 2 2 IN IP4 127.0.0.1\r\ns=-\r\nm=audio 4002 RTP/AVP 0\r\n";

/// Server end of the in-memory link.
struct Peer {
    to_client: mpsc::Sender<LinkEvent>,
    from_client: mpsc::Receiver<String>,
}

impl Peer {
    /// Next non-keep-alive frame the agent sent.
    async fn recv_frame(&mut self) -> String {
        loop {
            let frame = self.from_client.recv().await.expect("agent frame");
            if frame != "\r\n\r\n" {
                return frame;
            }
        }
    }

    async fn recv_request(&mut self) -> Request {
        let frame = self.recv_frame().await;
        parse_request(&frame).unwrap_or_else(|| panic!("expected request, got: {}", frame))
    }

    /// Next response frame (requests are unexpected here).
    async fn recv_response_code(&mut self) -> u16 {
        let frame = self.recv_frame().await;
        assert!(frame.starts_with("SIP/2.0 "), "expected response: {}", frame);
        frame["SIP/2.0 ".len().."SIP/2.0 ".len() + 3].parse().expect("code")
    }

    async fn send_frame(&self, frame: String) {
        self.to_client
            .send(LinkEvent::Message(frame))
            .await
            .expect("link open");
    }

    /// Replies to `request`, echoing identity headers the way a compliant
    /// peer would.
    async fn reply(
        &self,
        request: &Request,
        code: u16,
        to_tag: Option<&str>,
        extra: &[(&str, &str)],
        body: Option<(&str, &str)>,
    ) {
        let mut response = reply_to(request, code);
        if let Some(tag) = to_tag {
            if let Some(to) = request.headers.get("To") {
                if !to.contains("tag=") {
                    response
                        .headers
                        .replace("To", SmolStr::new(format!("{};tag={}", to, tag)));
                }
            }
        }
        for (name, value) in extra {
            response.headers.push(SmolStr::new(*name), SmolStr::new(*value));
        }
        if let Some((content_type, content)) = body {
            response.headers.push("Content-Type", SmolStr::new(content_type));
            response.body = bytes::Bytes::from(content.to_owned());
        }
        self.send_frame(serialize_response(&response)).await;
    }

    async fn close_with_error(&self) {
        let _ = self
            .to_client
            .send(LinkEvent::Closed(Some("connection reset".into())))
            .await;
    }
}

struct PeerConnector {
    fail_times: AtomicUsize,
    peers: StdMutex<Vec<Peer>>,
}

impl PeerConnector {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            fail_times: AtomicUsize::new(0),
            peers: StdMutex::new(Vec::new()),
        })
    }

    fn fail_next(&self, times: usize) {
        self.fail_times.store(times, Ordering::SeqCst);
    }

    fn take_peer(&self) -> Peer {
        self.peers.lock().expect("lock").pop().expect("open link")
    }
}

#[async_trait]
impl Connector for PeerConnector {
    async fn open(&self, _server: &str) -> Result<Link, TransportError> {
        if self
            .fail_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectionLost("refused".into()));
        }
        let (out_tx, out_rx) = mpsc::channel(64);
        let (in_tx, in_rx) = mpsc::channel(64);
        self.peers.lock().expect("lock").push(Peer {
            to_client: in_tx,
            from_client: out_rx,
        });
        Ok(Link {
            tx: out_tx,
            rx: in_rx,
        })
    }
}

/// Scripted SDH standing in for a media stack.
struct MockSdh {
    descriptions_set: StdMutex<Vec<String>>,
    closed: StdMutex<bool>,
}

impl MockSdh {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            descriptions_set: StdMutex::new(Vec::new()),
            closed: StdMutex::new(false),
        })
    }
}

#[async_trait]
impl SessionDescriptionHandler for MockSdh {
    async fn get_description(&self) -> Result<SessionDescription, UaError> {
        Ok(SessionDescription {
            content_type: SmolStr::new("application/sdp"),
            content: SmolStr::new(SDP_OFFER),
        })
    }

    async fn set_description(&self, content: &str, _content_type: &str) -> Result<(), UaError> {
        self.descriptions_set
            .lock()
            .expect("lock")
            .push(content.to_owned());
        Ok(())
    }

    fn has_description(&self, content_type: &str) -> bool {
        content_type == "application/sdp"
    }

    async fn rollback_description(&self) -> Result<(), UaError> {
        Ok(())
    }

    async fn send_dtmf(&self, _tones: &str) -> Result<(), UaError> {
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock().expect("lock") = true;
    }
}

struct MockSdhFactory;

impl SdhFactory for MockSdhFactory {
    fn make(&self) -> Arc<dyn SessionDescriptionHandler> {
        MockSdh::new()
    }
}

#[derive(Default)]
struct RecordingDelegate {
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    invitations: StdMutex<Vec<Invitation>>,
}

#[async_trait]
impl UserAgentDelegate for RecordingDelegate {
    async fn on_connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_disconnect(&self, _error: Option<TransportError>) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
    async fn on_invite(&self, invitation: Invitation) {
        self.invitations.lock().expect("lock").push(invitation);
    }
}

fn base_options(tweak: impl FnOnce(&mut UserAgentOptions)) -> UserAgentOptions {
    let uri = SipUri::parse("sip:alice@example.com").expect("uri");
    let mut options =
        UserAgentOptions::new(uri, TransportOptions::new("wss://edge.example.com/ws"));
    options.via_host = Some(SmolStr::new("alice-client.example.com"));
    options.sdh_factory = Some(Arc::new(MockSdhFactory));
    tweak(&mut options);
    options
}

async fn started_ua(tweak: impl FnOnce(&mut UserAgentOptions)) -> (UserAgent, Peer) {
    let connector = PeerConnector::new();
    let ua = UserAgent::new(base_options(tweak), connector.clone());
    ua.start().await.expect("start");
    let peer = connector.take_peer();
    (ua, peer)
}

fn state_recorder<T: Copy + Send + 'static>() -> (Arc<StdMutex<Vec<T>>>, impl Fn(T) + Send + Sync) {
    let states = Arc::new(StdMutex::new(Vec::new()));
    let sink = states.clone();
    (states, move |state: T| sink.lock().expect("lock").push(state))
}

#[tokio::test(start_paused = true)]
async fn register_success_refresh_and_unregister() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let start = tokio::time::Instant::now();

    let registerer = ua.make_registerer(RegistererOptions {
        expires: 3600,
        ..Default::default()
    });
    let (states, record) = state_recorder();
    registerer.on_state(record);

    registerer.register().await.expect("register");
    let request = peer.recv_request().await;
    assert_eq!(request.start.method.as_str(), "REGISTER");
    assert_eq!(
        request.headers.get("CSeq").map(|v| v.as_str()),
        Some("1 REGISTER")
    );
    assert_eq!(
        request.headers.get("Expires").map(|v| v.as_str()),
        Some("3600")
    );
    assert!(request.headers.get("Contact").is_some());
    peer.reply(&request, 200, None, &[("Expires", "3600")], None)
        .await;

    // The refresh fires at 90% of the granted expiry: 3240 seconds.
    let refresh = peer.recv_request().await;
    assert_eq!(
        refresh.headers.get("CSeq").map(|v| v.as_str()),
        Some("2 REGISTER")
    );
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(3240), "elapsed {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3600));
    // Same registration, same Call-ID.
    assert_eq!(
        request.headers.get("Call-ID"),
        refresh.headers.get("Call-ID")
    );
    peer.reply(&refresh, 200, None, &[("Expires", "3600")], None)
        .await;

    registerer.unregister().await.expect("unregister");
    let remove = peer.recv_request().await;
    assert_eq!(remove.headers.get("Expires").map(|v| v.as_str()), Some("0"));
    peer.reply(&remove, 200, None, &[], None).await;

    tokio::task::yield_now().await;
    // The refresh 200 re-enters Registered, which is a same-state no-op.
    let seen = states.lock().expect("lock").clone();
    assert_eq!(
        seen,
        vec![RegistererState::Registered, RegistererState::Unregistered]
    );

    // Unregister on an already-unregistered registerer emits nothing.
    registerer.unregister().await.expect("idempotent");
    assert!(peer.from_client.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn register_recovers_from_423() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let registerer = ua.make_registerer(RegistererOptions {
        expires: 600,
        ..Default::default()
    });
    registerer.register().await.expect("register");

    let first = peer.recv_request().await;
    assert_eq!(first.headers.get("Expires").map(|v| v.as_str()), Some("600"));
    peer.reply(&first, 423, None, &[("Min-Expires", "1800")], None)
        .await;

    let second = peer.recv_request().await;
    assert_eq!(
        second.headers.get("Expires").map(|v| v.as_str()),
        Some("1800")
    );
    assert_eq!(
        second.headers.get("CSeq").map(|v| v.as_str()),
        Some("2 REGISTER")
    );
    peer.reply(&second, 200, None, &[("Expires", "1800")], None)
        .await;
    tokio::task::yield_now().await;
    assert_eq!(registerer.state(), RegistererState::Registered);
}

#[tokio::test(start_paused = true)]
async fn register_retries_once_with_credentials() {
    let (ua, mut peer) = started_ua(|options| {
        options.authorization_username = Some(SmolStr::new("alice"));
        options.authorization_password = Some(SmolStr::new("secret"));
    })
    .await;
    let registerer = ua.make_registerer(RegistererOptions::default());
    registerer.register().await.expect("register");

    let first = peer.recv_request().await;
    assert!(first.headers.get("Authorization").is_none());
    peer.reply(
        &first,
        401,
        None,
        &[(
            "WWW-Authenticate",
            "Digest realm=\"example.com\", nonce=\"abc123\", qop=\"auth\", algorithm=MD5",
        )],
        None,
    )
    .await;

    let second = peer.recv_request().await;
    let authorization = second
        .headers
        .get("Authorization")
        .expect("credentialed retry");
    assert!(authorization.contains("username=\"alice\""));
    assert!(authorization.contains("nc=00000001"));
    assert_eq!(
        second.headers.get("CSeq").map(|v| v.as_str()),
        Some("2 REGISTER")
    );
    peer.reply(&second, 200, None, &[], None).await;
    tokio::task::yield_now().await;
    assert_eq!(registerer.state(), RegistererState::Registered);
}

#[tokio::test(start_paused = true)]
async fn invite_session_establishes_and_ends_with_bye() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let target = SipUri::parse("sip:bob@example.com").expect("uri");
    let inviter = ua.make_inviter(target).expect("inviter");
    let (states, record) = state_recorder();
    inviter.on_state(record);

    inviter.invite().await.expect("invite");
    let invite = peer.recv_request().await;
    assert_eq!(invite.start.method.as_str(), "INVITE");
    assert!(!invite.body.is_empty(), "INVITE carries the offer");
    assert!(invite.headers.get("Contact").is_some());

    peer.reply(&invite, 100, None, &[], None).await;
    peer.reply(
        &invite,
        180,
        Some("bob-tag"),
        &[("Contact", "<sip:bob@bob-client.example.com>")],
        None,
    )
    .await;
    peer.reply(
        &invite,
        200,
        Some("bob-tag"),
        &[("Contact", "<sip:bob@bob-client.example.com>")],
        Some(("application/sdp", SDP_ANSWER)),
    )
    .await;

    let ack = peer.recv_request().await;
    assert_eq!(ack.start.method.as_str(), "ACK");
    assert_eq!(ack.headers.get("CSeq").map(|v| v.as_str()), Some("1 ACK"));
    assert_eq!(ack.start.uri.host.as_str(), "bob-client.example.com");
    tokio::task::yield_now().await;
    assert_eq!(inviter.state(), SessionState::Established);

    inviter.bye().await.expect("bye");
    let bye = peer.recv_request().await;
    assert_eq!(bye.start.method.as_str(), "BYE");
    assert_eq!(bye.headers.get("CSeq").map(|v| v.as_str()), Some("2 BYE"));
    peer.reply(&bye, 200, None, &[], None).await;
    tokio::task::yield_now().await;

    assert_eq!(inviter.state(), SessionState::Terminated);
    let seen = states.lock().expect("lock").clone();
    assert_eq!(
        seen,
        vec![
            SessionState::Establishing,
            SessionState::Established,
            SessionState::Terminating,
            SessionState::Terminated,
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn canceled_invite_terminates_on_487() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let inviter = ua
        .make_inviter(SipUri::parse("sip:bob@example.com").expect("uri"))
        .expect("inviter");
    inviter.invite().await.expect("invite");
    let invite = peer.recv_request().await;
    peer.reply(&invite, 180, Some("bob-tag"), &[], None).await;
    tokio::task::yield_now().await;

    inviter.cancel().await.expect("cancel");
    let cancel = peer.recv_request().await;
    assert_eq!(cancel.start.method.as_str(), "CANCEL");
    // CANCEL reuses the INVITE's branch so the peer can match it.
    assert_eq!(
        cancel.headers.get("Via"),
        invite.headers.get("Via")
    );
    peer.reply(&cancel, 200, None, &[], None).await;
    peer.reply(&invite, 487, Some("bob-tag"), &[], None).await;

    // The transaction ACKs the 487 itself.
    let ack = peer.recv_request().await;
    assert_eq!(ack.start.method.as_str(), "ACK");
    tokio::task::yield_now().await;
    assert_eq!(inviter.state(), SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn inbound_invite_with_unknown_replaces_is_481() {
    let (_ua, mut peer) = started_ua(|_| {}).await;

    let mut headers = myna_core::Headers::new();
    headers.push("Via", "SIP/2.0/WSS peer.example.com;branch=z9hG4bKrepl1");
    headers.push("From", "<sip:bob@example.com>;tag=remote-tag");
    headers.push("To", "<sip:alice@example.com>");
    headers.push("Call-ID", "peer-call-1");
    headers.push("CSeq", "1 INVITE");
    headers.push("Contact", "<sip:bob@peer.example.com>");
    headers.push("Replaces", "no-such-call;to-tag=a;from-tag=b");
    headers.push("Max-Forwards", "70");
    let invite = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Invite,
            SipUri::parse("sip:alice@example.com").expect("uri"),
        ),
        headers,
        bytes::Bytes::new(),
    );
    peer.send_frame(myna_parse::serialize_request(&invite)).await;

    assert_eq!(peer.recv_response_code().await, 481);
}

#[tokio::test(start_paused = true)]
async fn inbound_invite_accept_and_peer_bye() {
    let delegate = Arc::new(RecordingDelegate::default());
    let ua_delegate = delegate.clone();
    let (_ua, mut peer) = started_ua(move |options| {
        options.delegate = Some(ua_delegate);
    })
    .await;

    let mut headers = myna_core::Headers::new();
    headers.push("Via", "SIP/2.0/WSS peer.example.com;branch=z9hG4bKinb1");
    headers.push("From", "<sip:bob@example.com>;tag=bob-tag");
    headers.push("To", "<sip:alice@example.com>");
    headers.push("Call-ID", "peer-call-2");
    headers.push("CSeq", "1 INVITE");
    headers.push("Contact", "<sip:bob@peer.example.com>");
    headers.push("Content-Type", "application/sdp");
    headers.push("Max-Forwards", "70");
    let invite = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Invite,
            SipUri::parse("sip:alice@example.com").expect("uri"),
        ),
        headers,
        bytes::Bytes::from(SDP_OFFER),
    );
    peer.send_frame(myna_parse::serialize_request(&invite)).await;

    // The invitation answers 100 Trying on its own.
    assert_eq!(peer.recv_response_code().await, 100);
    let invitation = loop {
        if let Some(invitation) = delegate.invitations.lock().expect("lock").pop() {
            break invitation;
        }
        tokio::task::yield_now().await;
    };

    invitation.accept().await.expect("accept");
    let frame = peer.recv_frame().await;
    assert!(frame.starts_with("SIP/2.0 200"), "got: {}", frame);
    assert!(frame.contains("tag="), "200 carries a to-tag");
    assert!(frame.contains(SDP_OFFER.split_once("\r\n").expect("sdp").0));
    assert_eq!(invitation.state(), SessionState::Established);

    // Peer ACKs, then hangs up.
    let response = myna_parse::parse_response(&frame).expect("200");
    let to = response.headers.get("To").expect("To").clone();
    let mut ack_headers = myna_core::Headers::new();
    ack_headers.push("Via", "SIP/2.0/WSS peer.example.com;branch=z9hG4bKinb1");
    ack_headers.push("From", "<sip:bob@example.com>;tag=bob-tag");
    ack_headers.push("To", to.clone());
    ack_headers.push("Call-ID", "peer-call-2");
    ack_headers.push("CSeq", "1 ACK");
    ack_headers.push("Max-Forwards", "70");
    let ack = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Ack,
            SipUri::parse("sip:alice@example.com").expect("uri"),
        ),
        ack_headers,
        bytes::Bytes::new(),
    );
    peer.send_frame(myna_parse::serialize_request(&ack)).await;

    let mut bye_headers = myna_core::Headers::new();
    bye_headers.push("Via", "SIP/2.0/WSS peer.example.com;branch=z9hG4bKinb2");
    bye_headers.push("From", "<sip:bob@example.com>;tag=bob-tag");
    bye_headers.push("To", to);
    bye_headers.push("Call-ID", "peer-call-2");
    bye_headers.push("CSeq", "2 BYE");
    bye_headers.push("Max-Forwards", "70");
    let bye = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Bye,
            SipUri::parse("sip:alice@example.com").expect("uri"),
        ),
        bye_headers,
        bytes::Bytes::new(),
    );
    peer.send_frame(myna_parse::serialize_request(&bye)).await;

    assert_eq!(peer.recv_response_code().await, 200);
    tokio::task::yield_now().await;
    assert_eq!(invitation.state(), SessionState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn publish_lifecycle_with_etag_recovery() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let target = SipUri::parse("sip:alice@example.com").expect("uri");
    let publisher = ua.make_publisher(target, PublisherOptions::new("presence", "application/pidf+xml"));

    publisher.publish("<presence/>").await.expect("publish");
    let initial = peer.recv_request().await;
    assert_eq!(initial.start.method.as_str(), "PUBLISH");
    assert_eq!(
        initial.headers.get("Event").map(|v| v.as_str()),
        Some("presence")
    );
    assert_eq!(
        initial.headers.get("Expires").map(|v| v.as_str()),
        Some("3600")
    );
    assert!(initial.headers.get("SIP-If-Match").is_none());
    assert!(!initial.body.is_empty());
    peer.reply(
        &initial,
        200,
        None,
        &[("SIP-ETag", "abc"), ("Expires", "3600")],
        None,
    )
    .await;
    tokio::task::yield_now().await;
    assert_eq!(publisher.state(), PublisherState::Published);

    // Refresh at 90%: SIP-If-Match, no body.
    let refresh = peer.recv_request().await;
    assert_eq!(
        refresh.headers.get("SIP-If-Match").map(|v| v.as_str()),
        Some("abc")
    );
    assert!(refresh.body.is_empty());

    // The server lost our state: 412 makes the publisher start over.
    peer.reply(&refresh, 412, None, &[], None).await;
    let resubmit = peer.recv_request().await;
    assert!(resubmit.headers.get("SIP-If-Match").is_none());
    assert!(!resubmit.body.is_empty(), "resubmission carries the body");
    peer.reply(
        &resubmit,
        200,
        None,
        &[("SIP-ETag", "def"), ("Expires", "3600")],
        None,
    )
    .await;
    tokio::task::yield_now().await;

    publisher.unpublish().await.expect("unpublish");
    let remove = peer.recv_request().await;
    assert_eq!(remove.headers.get("Expires").map(|v| v.as_str()), Some("0"));
    assert_eq!(
        remove.headers.get("SIP-If-Match").map(|v| v.as_str()),
        Some("def")
    );
    assert!(remove.body.is_empty());
    peer.reply(&remove, 200, None, &[], None).await;
    tokio::task::yield_now().await;
    assert_eq!(publisher.state(), PublisherState::Unpublished);
}

#[tokio::test(start_paused = true)]
async fn subscription_activates_on_notify_and_terminates() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let target = SipUri::parse("sip:bob@example.com").expect("uri");
    let subscriber = ua.make_subscriber(target, SubscriberOptions::new("presence"));
    let (notified, on_notify) = state_recorder::<u16>();
    subscriber.on_notify(move |request| {
        on_notify(request.body.len() as u16);
    });

    subscriber.subscribe().await.expect("subscribe");
    assert_eq!(subscriber.state(), SubscriberState::NotifyWait);
    let subscribe = peer.recv_request().await;
    assert_eq!(subscribe.start.method.as_str(), "SUBSCRIBE");
    peer.reply(
        &subscribe,
        200,
        Some("server-tag"),
        &[
            ("Expires", "3600"),
            ("Contact", "<sip:bob@server.example.com>"),
        ],
        None,
    )
    .await;
    tokio::task::yield_now().await;

    // First NOTIFY: Subscription-State active.
    let from_tag = myna_parse::extract_tag(
        subscribe.headers.get("From").expect("From"),
    )
    .expect("from tag");
    let call_id = subscribe.headers.get("Call-ID").expect("Call-ID").clone();
    let mut notify_headers = myna_core::Headers::new();
    notify_headers.push("Via", "SIP/2.0/WSS server.example.com;branch=z9hG4bKntf1");
    notify_headers.push("From", "<sip:bob@example.com>;tag=server-tag");
    notify_headers.push("To", format!("<sip:alice@example.com>;tag={}", from_tag));
    notify_headers.push("Call-ID", call_id.clone());
    notify_headers.push("CSeq", "1 NOTIFY");
    notify_headers.push("Event", "presence");
    notify_headers.push("Subscription-State", "active;expires=3600");
    notify_headers.push("Contact", "<sip:bob@server.example.com>");
    notify_headers.push("Max-Forwards", "70");
    let notify = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Notify,
            SipUri::parse("sip:alice@alice-client.example.com").expect("uri"),
        ),
        notify_headers,
        bytes::Bytes::from("<presence/>"),
    );
    peer.send_frame(myna_parse::serialize_request(&notify)).await;

    assert_eq!(peer.recv_response_code().await, 200);
    tokio::task::yield_now().await;
    assert_eq!(subscriber.state(), SubscriberState::Active);
    assert_eq!(notified.lock().expect("lock").len(), 1);

    subscriber.unsubscribe().await.expect("unsubscribe");
    let unsubscribe = peer.recv_request().await;
    assert_eq!(
        unsubscribe.headers.get("Expires").map(|v| v.as_str()),
        Some("0")
    );
    peer.reply(&unsubscribe, 200, None, &[("Expires", "0")], None)
        .await;

    // Terminal NOTIFY finishes the subscription.
    let mut term_headers = myna_core::Headers::new();
    term_headers.push("Via", "SIP/2.0/WSS server.example.com;branch=z9hG4bKntf2");
    term_headers.push("From", "<sip:bob@example.com>;tag=server-tag");
    term_headers.push("To", format!("<sip:alice@example.com>;tag={}", from_tag));
    term_headers.push("Call-ID", call_id);
    term_headers.push("CSeq", "2 NOTIFY");
    term_headers.push("Event", "presence");
    term_headers.push("Subscription-State", "terminated;reason=timeout");
    term_headers.push("Max-Forwards", "70");
    let terminal = Request::new(
        myna_core::RequestLine::new(
            myna_core::Method::Notify,
            SipUri::parse("sip:alice@alice-client.example.com").expect("uri"),
        ),
        term_headers,
        bytes::Bytes::new(),
    );
    peer.send_frame(myna_parse::serialize_request(&terminal)).await;

    assert_eq!(peer.recv_response_code().await, 200);
    tokio::task::yield_now().await;
    assert_eq!(subscriber.state(), SubscriberState::Terminated);
}

#[tokio::test(start_paused = true)]
async fn message_resolves_with_final_outcome() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let target = SipUri::parse("sip:bob@example.com").expect("uri");
    let messager = ua.make_messager(target, "text/plain");

    let send = tokio::spawn(async move { messager.message("hello bob").await });
    let request = peer.recv_request().await;
    assert_eq!(request.start.method.as_str(), "MESSAGE");
    assert_eq!(request.body.as_ref(), b"hello bob");
    peer.reply(&request, 200, None, &[], None).await;
    send.await.expect("join").expect("delivered");
}

#[tokio::test(start_paused = true)]
async fn transport_reconnects_and_reregisters() {
    let connector = PeerConnector::new();
    let delegate = Arc::new(RecordingDelegate::default());
    let ua_delegate = delegate.clone();
    let ua = UserAgent::new(
        base_options(move |options| {
            options.delegate = Some(ua_delegate);
            options.reconnection_attempts = 3;
            options.reconnection_delay = Duration::from_secs(4);
        }),
        connector.clone(),
    );
    ua.start().await.expect("start");
    let mut peer = connector.take_peer();
    assert_eq!(delegate.connects.load(Ordering::SeqCst), 1);

    let registerer = ua.make_registerer(RegistererOptions::default());
    registerer.register().await.expect("register");
    let request = peer.recv_request().await;
    peer.reply(&request, 200, None, &[("Expires", "600")], None)
        .await;
    tokio::task::yield_now().await;
    assert_eq!(registerer.state(), RegistererState::Registered);

    // Drop the connection; the first two reconnect attempts fail, so the
    // agent retries at 0 s, 4 s and succeeds at 8 s.
    let start = tokio::time::Instant::now();
    connector.fail_next(2);
    peer.close_with_error().await;

    let mut second = loop {
        tokio::task::yield_now().await;
        if let Some(peer) = connector.peers.lock().expect("lock").pop() {
            break peer;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    };
    let reregister = second.recv_request().await;
    assert_eq!(reregister.start.method.as_str(), "REGISTER");
    assert!(start.elapsed() >= Duration::from_secs(8));
    assert_eq!(delegate.disconnects.load(Ordering::SeqCst), 1);
    assert_eq!(delegate.connects.load(Ordering::SeqCst), 2);
    second
        .reply(&reregister, 200, None, &[("Expires", "600")], None)
        .await;
}

#[tokio::test(start_paused = true)]
async fn stop_during_stop_is_a_noop() {
    let (ua, mut peer) = started_ua(|_| {}).await;
    let registerer = ua.make_registerer(RegistererOptions::default());
    registerer.register().await.expect("register");
    let request = peer.recv_request().await;
    peer.reply(&request, 200, None, &[("Expires", "600")], None)
        .await;
    tokio::task::yield_now().await;

    // Stop unregisters first, then disconnects.
    let ua_again = ua.clone();
    let stop = tokio::spawn(async move { ua_again.stop().await });
    let unregister = peer.recv_request().await;
    assert_eq!(
        unregister.headers.get("Expires").map(|v| v.as_str()),
        Some("0")
    );
    peer.reply(&unregister, 200, None, &[], None).await;
    stop.await.expect("join");
    ua.stop().await;
    assert_eq!(ua.state(), myna_ua::UserAgentState::Stopped);
}
