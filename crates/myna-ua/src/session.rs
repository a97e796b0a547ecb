// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use async_trait::async_trait;
use myna_core::{Body, Method, Request, Response};
use myna_dialog::DialogId;
use myna_parse::header;
use myna_timer::TimerHandle;
use myna_transaction::{reply_to, TransactionKey};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{SessionUsage, UserAgentCore};
use crate::delegate::OutgoingRequestDelegate;
use crate::emitter::StateEmitter;
use crate::error::{StateTransitionError, UaError};
use crate::sdh::SessionDescriptionHandler;

/// INVITE dialog usage states, shared by caller and callee sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    Establishing,
    Established,
    Terminating,
    Terminated,
}

type ReferListener = Arc<dyn Fn(Request) + Send + Sync>;

pub(crate) struct SessionShared {
    pub dialog_id: Option<DialogId>,
    pub last_ack: Option<Request>,
    pub disposed: bool,
    pub dispose_waiter: Option<oneshot::Sender<()>>,
    pub timers: Vec<TimerHandle>,
}

/// State common to [`crate::Inviter`] and [`crate::Invitation`]: the dialog
/// reference, the session-description handler, in-dialog request handling
/// and the BYE path.
pub(crate) struct SessionCore {
    pub core: Arc<UserAgentCore>,
    pub sdh: Arc<dyn SessionDescriptionHandler>,
    pub emitter: StateEmitter<SessionState>,
    pub shared: Mutex<SessionShared>,
    pub refer_listeners: Mutex<Vec<ReferListener>>,
}

impl SessionCore {
    pub fn new(core: Arc<UserAgentCore>, sdh: Arc<dyn SessionDescriptionHandler>) -> Arc<Self> {
        Arc::new(Self {
            core,
            sdh,
            emitter: StateEmitter::new(SessionState::Initial),
            shared: Mutex::new(SessionShared {
                dialog_id: None,
                last_ack: None,
                disposed: false,
                dispose_waiter: None,
                timers: Vec::new(),
            }),
            refer_listeners: Mutex::new(Vec::new()),
        })
    }

    pub fn dialog_id(&self) -> Option<DialogId> {
        self.shared.lock().dialog_id.clone()
    }

    /// Registers this session as the dialog's session usage.
    pub fn adopt_dialog(self: Arc<Self>, id: DialogId) {
        {
            let mut shared = self.shared.lock();
            if shared.dialog_id.is_some() {
                return;
            }
            shared.dialog_id = Some(id.clone());
        }
        self.core
            .dialogs
            .with(&id, |dialog| dialog.register_usage("session"));
        let core = self.core.clone();
        core.register_session_usage(id, Arc::new(SessionUsageAdapter(self)));
    }

    /// Sends BYE and moves to Terminating; any final response (or failure)
    /// finishes the teardown.
    pub async fn send_bye(self: Arc<Self>) -> Result<(), UaError> {
        let Some(id) = self.dialog_id() else {
            return Err(UaError::Validation(SmolStr::new("no dialog to BYE")));
        };
        let request = self
            .core
            .make_in_dialog_request(&id, Method::Bye, None, Vec::new())
            .ok_or_else(|| UaError::Validation(SmolStr::new("dialog gone")))?;
        self.emitter.transition(SessionState::Terminating)?;
        self.core
            .clone()
            .send_request(request, Arc::new(ByeDelegate(self)))
            .await
            .map(|_| ())
    }

    /// Sends an in-dialog INFO, e.g. DTMF payloads.
    pub async fn send_info(&self, body: Option<Body>) -> Result<(), UaError> {
        let Some(id) = self.dialog_id() else {
            return Err(UaError::Validation(SmolStr::new("no dialog for INFO")));
        };
        let request = self
            .core
            .make_in_dialog_request(&id, Method::Info, body, Vec::new())
            .ok_or_else(|| UaError::Validation(SmolStr::new("dialog gone")))?;
        self.core
            .clone()
            .send_request(request, Arc::new(NoopDelegate))
            .await
            .map(|_| ())
    }

    /// Sends an in-dialog REFER (blind transfer).
    pub async fn send_refer(&self, refer_to: &str) -> Result<(), UaError> {
        let Some(id) = self.dialog_id() else {
            return Err(UaError::Validation(SmolStr::new("no dialog for REFER")));
        };
        let request = self
            .core
            .make_in_dialog_request(
                &id,
                Method::Refer,
                None,
                vec![
                    (SmolStr::new("Refer-To"), SmolStr::new(refer_to)),
                    (
                        SmolStr::new("Referred-By"),
                        SmolStr::new(format!("<{}>", self.core.config().aor)),
                    ),
                ],
            )
            .ok_or_else(|| UaError::Validation(SmolStr::new("dialog gone")))?;
        self.core
            .clone()
            .send_request(request, Arc::new(NoopDelegate))
            .await
            .map(|_| ())
    }

    pub fn on_refer(&self, listener: impl Fn(Request) + Send + Sync + 'static) {
        self.refer_listeners.lock().push(Arc::new(listener));
    }

    /// Tears the session usage down exactly once.
    pub fn terminate(&self) {
        let dialog_id = {
            let mut shared = self.shared.lock();
            for timer in &mut shared.timers {
                timer.cancel();
            }
            shared.timers.clear();
            if let Some(waiter) = shared.dispose_waiter.take() {
                let _ = waiter.send(());
            }
            shared.dialog_id.take()
        };
        if let Some(id) = &dialog_id {
            self.core.release_session_usage(id);
        }
        self.sdh.close();
        let _ = self.emitter.transition(SessionState::Terminated);
    }

    /// Re-sends the stored ACK for a retransmitted 2xx.
    pub async fn resend_ack(&self) {
        let ack = self.shared.lock().last_ack.clone();
        if let Some(ack) = ack {
            if let Err(err) = self.core.send_ack(ack).await {
                warn!(%err, "ACK retransmission failed");
            }
        }
    }

    /// Handles a request the peer sent inside the dialog.
    async fn handle_peer_request(&self, request: Request, key: Option<TransactionKey>) {
        let method = request.start.method.clone();
        match method {
            Method::Ack => {
                // ACK for our 2xx; nothing left to do.
            }
            Method::Bye => {
                if let Some(key) = key {
                    let response = reply_to(&request, 200);
                    if let Err(err) = self.core.respond(&key, response).await {
                        warn!(%err, "200 to BYE failed");
                    }
                }
                debug!("peer ended the session");
                self.terminate();
            }
            Method::Invite => self.handle_reinvite(request, key).await,
            Method::Info | Method::Message => {
                if let Some(key) = key {
                    let response = reply_to(&request, 200);
                    let _ = self.core.respond(&key, response).await;
                }
            }
            Method::Refer => {
                if let Some(key) = key {
                    let response = reply_to(&request, 202);
                    let _ = self.core.respond(&key, response).await;
                }
                let listeners: Vec<ReferListener> = self.refer_listeners.lock().clone();
                for listener in &listeners {
                    listener(request.clone());
                }
            }
            _ => {
                if let Some(key) = key {
                    let mut response = reply_to(&request, 405);
                    response.headers.push("Allow", self.core.allow_value());
                    let _ = self.core.respond(&key, response).await;
                }
            }
        }
    }

    /// The peer re-negotiates: install their offer, answer with ours.
    async fn handle_reinvite(&self, request: Request, key: Option<TransactionKey>) {
        let Some(key) = key else {
            return;
        };
        if !request.body.is_empty() {
            let content_type = header(&request.headers, "Content-Type")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "application/sdp".to_owned());
            let body_text = String::from_utf8_lossy(&request.body).into_owned();
            if let Err(err) = self.sdh.set_description(&body_text, &content_type).await {
                warn!(%err, "re-INVITE offer rejected");
                let response = reply_to(&request, 488);
                let _ = self.core.respond(&key, response).await;
                return;
            }
        }
        match self.sdh.get_description().await {
            Ok(answer) => {
                let mut response = reply_to(&request, 200);
                response.headers.push(
                    "Contact",
                    SmolStr::new(format!("<{}>", self.core.config().contact)),
                );
                response.headers.push("Content-Type", answer.content_type.clone());
                response.body = bytes::Bytes::from(answer.content.as_str().to_owned());
                // Target refresh per RFC 3261 §12.2.2.
                if let Some(id) = self.dialog_id() {
                    if let Some(contact) = header(&request.headers, "Contact")
                        .and_then(|value| myna_core::NameAddr::parse(value))
                    {
                        self.core
                            .dialogs
                            .with(&id, |dialog| dialog.refresh_remote_target(contact.uri));
                    }
                }
                let _ = self.core.respond(&key, response).await;
            }
            Err(err) => {
                warn!(%err, "cannot answer re-INVITE");
                let response = reply_to(&request, 488);
                let _ = self.core.respond(&key, response).await;
            }
        }
    }
}

/// Adapter registered with the core so in-dialog requests reach the session.
struct SessionUsageAdapter(Arc<SessionCore>);

#[async_trait]
impl SessionUsage for SessionUsageAdapter {
    async fn on_request(&self, request: Request, key: Option<TransactionKey>) {
        self.0.handle_peer_request(request, key).await;
    }

    async fn on_retransmitted_2xx(&self, _response: Response) {
        self.0.resend_ack().await;
    }
}

/// BYE outcome handling: whatever comes back, the session ends.
struct ByeDelegate(Arc<SessionCore>);

#[async_trait]
impl OutgoingRequestDelegate for ByeDelegate {
    async fn on_accept(&self, _response: Response) {
        self.0.terminate();
    }
    async fn on_redirect(&self, _response: Response) {
        self.0.terminate();
    }
    async fn on_reject(&self, _response: Response) {
        self.0.terminate();
    }
    async fn on_timeout(&self) {
        self.0.terminate();
    }
    async fn on_transport_error(&self) {
        self.0.terminate();
    }
}

/// For requests whose outcome nobody waits on (INFO, REFER).
struct NoopDelegate;

#[async_trait]
impl OutgoingRequestDelegate for NoopDelegate {}

/// Guard helper shared by the session types.
pub(crate) fn illegal(from: SessionState, to: &str) -> UaError {
    StateTransitionError::Illegal {
        from: SmolStr::new(format!("{:?}", from)),
        to: SmolStr::new(to),
    }
    .into()
}
