// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use myna_core::{Body, Request, Response};
use myna_dialog::Dialog;
use myna_parse::header;
use myna_timer::schedule;
use myna_transaction::{reply_to, ServerTransactionUser, TransactionKey};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::core::{CancelTarget, UserAgentCore};
use crate::error::UaError;
use crate::sdh::SessionDescriptionHandler;
use crate::session::{illegal, SessionCore, SessionState};

struct InvtData {
    local_tag: SmolStr,
    responded: bool,
}

pub(crate) struct InvitationInner {
    session: Arc<SessionCore>,
    request: Request,
    key: TransactionKey,
    data: Mutex<InvtData>,
}

/// Callee side of an INVITE session: auto-sends 100 Trying, optionally rings
/// automatically, then lets the application accept, progress or reject.
#[derive(Clone)]
pub struct Invitation {
    inner: Arc<InvitationInner>,
}

impl Invitation {
    pub fn new(
        core: Arc<UserAgentCore>,
        sdh: Arc<dyn SessionDescriptionHandler>,
        request: Request,
        key: TransactionKey,
    ) -> Self {
        let invitation = Self {
            inner: Arc::new(InvitationInner {
                session: SessionCore::new(core, sdh),
                request,
                key,
                data: Mutex::new(InvtData {
                    local_tag: myna_core::generate_tag(),
                    responded: false,
                }),
            }),
        };
        let core = &invitation.inner.session.core;
        core.register_cancel_target(
            invitation.inner.key.clone(),
            Arc::new(InvitationCancel(invitation.inner.clone())),
        );
        core.attach_server_tu(
            &invitation.inner.key,
            Arc::new(InvitationServerTu(invitation.inner.clone())),
        );
        invitation
    }

    /// Sends 100 Trying, optionally 180 Ringing, and arms the no-answer
    /// timer. The user agent calls this right after construction.
    pub async fn start(&self, auto_ring: bool, no_answer_timeout: Duration) {
        let trying = reply_to(&self.inner.request, 100);
        if let Err(err) = self.inner.session.core.respond(&self.inner.key, trying).await {
            warn!(%err, "100 Trying failed");
        }
        if auto_ring {
            if let Err(err) = self.progress(180).await {
                warn!(%err, "automatic 180 failed");
            }
        }
        let inner = self.inner.clone();
        let handle = schedule(no_answer_timeout, move || {
            tokio::spawn(async move {
                if !inner.data.lock().responded {
                    debug!("no answer, rejecting invitation");
                    let _ = inner.send_final(480, None).await;
                    inner.session.terminate();
                }
            });
        });
        self.inner.session.shared.lock().timers.push(handle);
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.emitter.state()
    }

    pub fn on_state(&self, listener: impl Fn(SessionState) + Send + Sync + 'static) {
        self.inner.session.emitter.on_change(listener);
    }

    pub fn on_refer(&self, listener: impl Fn(Request) + Send + Sync + 'static) {
        self.inner.session.on_refer(listener);
    }

    /// The inbound INVITE this invitation answers.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Sends a provisional response (18x), forming an early dialog.
    pub async fn progress(&self, code: u16) -> Result<(), UaError> {
        if !(101..200).contains(&code) {
            return Err(UaError::Validation(SmolStr::new("not a provisional code")));
        }
        if self.inner.data.lock().responded {
            return Err(illegal(self.state(), "Establishing"));
        }
        let response = self.inner.tagged_reply(code, None);
        self.inner.adopt_uas_dialog(&response);
        self.inner
            .session
            .core
            .respond(&self.inner.key, response)
            .await?;
        let _ = self
            .inner
            .session
            .emitter
            .transition(SessionState::Establishing);
        Ok(())
    }

    /// Accepts the invitation: the SDH consumes the offer (when the INVITE
    /// carried one) and produces the answer for the 200 OK.
    pub async fn accept(&self) -> Result<(), UaError> {
        if self.inner.data.lock().responded {
            return Err(illegal(self.state(), "Established"));
        }
        if matches!(
            self.state(),
            SessionState::Terminated | SessionState::Terminating
        ) {
            return Err(illegal(self.state(), "Established"));
        }
        let request = &self.inner.request;
        if !request.body.is_empty() {
            let content_type = header(&request.headers, "Content-Type")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "application/sdp".to_owned());
            let offer = String::from_utf8_lossy(&request.body).into_owned();
            self.inner
                .session
                .sdh
                .set_description(&offer, &content_type)
                .await?;
        }
        let answer = self.inner.session.sdh.get_description().await?;
        self.inner.send_final(200, Some(answer_body(answer))).await?;
        let _ = self
            .inner
            .session
            .emitter
            .transition(SessionState::Established);
        Ok(())
    }

    /// Rejects the invitation with a final response code.
    pub async fn reject(&self, code: u16) -> Result<(), UaError> {
        if !(300..700).contains(&code) {
            return Err(UaError::Validation(SmolStr::new("not a failure code")));
        }
        if self.inner.data.lock().responded {
            return Err(illegal(self.state(), "Terminated"));
        }
        self.inner.send_final(code, None).await?;
        self.inner.session.terminate();
        Ok(())
    }

    /// Ends an established session.
    pub async fn bye(&self) -> Result<(), UaError> {
        if self.state() != SessionState::Established {
            return Err(illegal(self.state(), "Terminating"));
        }
        self.inner.session.clone().send_bye().await
    }

    pub async fn send_dtmf(&self, tones: &str) -> Result<(), UaError> {
        self.inner.session.sdh.send_dtmf(tones).await
    }

    pub async fn info(&self, body: Option<Body>) -> Result<(), UaError> {
        self.inner.session.send_info(body).await
    }

    pub async fn refer(&self, refer_to: &str) -> Result<(), UaError> {
        self.inner.session.send_refer(refer_to).await
    }

    /// Rejects an unanswered invitation or tears down the session.
    pub async fn dispose(&self) {
        {
            let mut shared = self.inner.session.shared.lock();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
        }
        if !self.inner.data.lock().responded {
            let _ = self.inner.send_final(480, None).await;
            self.inner.session.terminate();
            return;
        }
        if self.state() == SessionState::Established {
            let (tx, rx) = tokio::sync::oneshot::channel();
            self.inner.session.shared.lock().dispose_waiter = Some(tx);
            if self.inner.session.clone().send_bye().await.is_ok() {
                let _ = rx.await;
            }
        }
        self.inner.session.terminate();
    }
}

fn answer_body(answer: crate::sdh::SessionDescription) -> Body {
    Body::session(answer.content_type, answer.content)
}

impl InvitationInner {
    /// Builds a response with our to-tag and Contact.
    fn tagged_reply(&self, code: u16, body: Option<Body>) -> Response {
        let mut response = reply_to(&self.request, code);
        let tag = self.data.lock().local_tag.clone();
        if let Some(to) = self.request.headers.get("To") {
            response
                .headers
                .replace("To", SmolStr::new(format!("{};tag={}", to, tag)));
        }
        if (101..300).contains(&code) {
            response.headers.push(
                "Contact",
                SmolStr::new(format!("<{}>", self.session.core.config().contact)),
            );
        }
        if let Some(body) = body {
            response
                .headers
                .push("Content-Type", body.content_type.clone());
            response.body = bytes::Bytes::from(body.content.as_str().to_owned());
        }
        response
    }

    /// Forms (or confirms) the UAS dialog for a tagged response.
    fn adopt_uas_dialog(&self, response: &Response) {
        if response.start.code < 101 {
            return;
        }
        match self.session.dialog_id() {
            Some(id) => {
                if response.start.is_success() {
                    self.session.core.dialogs.with(&id, |dialog| dialog.confirm());
                }
            }
            None => {
                if let Some(dialog) = Dialog::new_uas(&self.request, response) {
                    let id = dialog.id.clone();
                    self.session.core.dialogs.insert(dialog);
                    self.session.clone().adopt_dialog(id);
                }
            }
        }
    }

    async fn send_final(&self, code: u16, body: Option<Body>) -> Result<(), UaError> {
        {
            let mut data = self.data.lock();
            if data.responded {
                return Err(UaError::Validation(SmolStr::new("already responded")));
            }
            data.responded = true;
        }
        let response = self.tagged_reply(code, body);
        if response.start.is_success() {
            self.adopt_uas_dialog(&response);
        }
        self.session.core.respond(&self.key, response).await
    }
}

/// CANCEL arrived for the INVITE: answer it with 487 unless already final.
struct InvitationCancel(Arc<InvitationInner>);

#[async_trait]
impl CancelTarget for InvitationCancel {
    async fn on_cancel(&self, _request: Request) {
        let inner = &self.0;
        debug!("invitation canceled by peer");
        let _ = inner.send_final(487, None).await;
        inner.session.terminate();
        inner.session.core.release_cancel_target(&inner.key);
    }
}

/// Transaction-level events for the INVITE server transaction.
struct InvitationServerTu(Arc<InvitationInner>);

#[async_trait]
impl ServerTransactionUser for InvitationServerTu {
    async fn on_ack(&self, _key: &TransactionKey, _ack: Request) {
        // ACK for our 2xx; the session is fully established.
        debug!("ACK received for accepted invitation");
    }

    async fn on_timeout(&self, _key: &TransactionKey) {
        // Timer H: the ACK never arrived.
        warn!("invitation timed out waiting for ACK");
        self.0.session.terminate();
    }

    async fn on_transport_error(&self, _key: &TransactionKey) {
        warn!("transport error on invitation transaction");
    }

    async fn on_terminated(&self, key: &TransactionKey) {
        self.0.session.core.release_cancel_target(key);
    }
}
