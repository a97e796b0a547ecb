// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;

use async_trait::async_trait;
use myna_core::{Body, Method, Request, Response, SipUri};
use myna_dialog::{Dialog, DialogId};
use myna_parse::header;
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::UserAgentCore;
use crate::delegate::OutgoingRequestDelegate;
use crate::error::UaError;
use crate::sdh::SessionDescriptionHandler;
use crate::session::{illegal, SessionCore, SessionState};

struct InvData {
    invite_as_sent: Option<Request>,
    reinvite_in_flight: bool,
    early_answered: bool,
    canceled: bool,
}

pub(crate) struct InviterInner {
    session: Arc<SessionCore>,
    target: SipUri,
    data: Mutex<InvData>,
}

/// Caller side of an INVITE session: sends the INVITE with the SDH's offer,
/// installs the answer from the early dialog or the 2xx, emits the ACK, and
/// runs re-INVITE, CANCEL and BYE.
#[derive(Clone)]
pub struct Inviter {
    inner: Arc<InviterInner>,
}

impl Inviter {
    pub fn new(
        core: Arc<UserAgentCore>,
        sdh: Arc<dyn SessionDescriptionHandler>,
        target: SipUri,
    ) -> Self {
        Self {
            inner: Arc::new(InviterInner {
                session: SessionCore::new(core, sdh),
                target,
                data: Mutex::new(InvData {
                    invite_as_sent: None,
                    reinvite_in_flight: false,
                    early_answered: false,
                    canceled: false,
                }),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.inner.session.emitter.state()
    }

    pub fn on_state(&self, listener: impl Fn(SessionState) + Send + Sync + 'static) {
        self.inner.session.emitter.on_change(listener);
    }

    /// An inbound in-dialog REFER (the peer wants a transfer).
    pub fn on_refer(&self, listener: impl Fn(Request) + Send + Sync + 'static) {
        self.inner.session.on_refer(listener);
    }

    /// Sends the INVITE (Initial) or a re-INVITE (Established).
    pub async fn invite(&self) -> Result<(), UaError> {
        match self.state() {
            SessionState::Initial => self.inner.clone().send_initial_invite().await,
            SessionState::Established => self.inner.clone().send_reinvite().await,
            state => Err(illegal(state, "Establishing")),
        }
    }

    /// Abandons a pending INVITE. The 487 terminates the session.
    pub async fn cancel(&self) -> Result<(), UaError> {
        if self.state() != SessionState::Establishing {
            return Err(illegal(self.state(), "Terminated"));
        }
        let invite = {
            let mut data = self.inner.data.lock();
            data.canceled = true;
            data.invite_as_sent.clone()
        };
        let Some(invite) = invite else {
            return Err(UaError::Validation(SmolStr::new("no INVITE in flight")));
        };
        self.inner
            .session
            .core
            .clone()
            .send_cancel(&invite, Arc::new(CancelOutcome))
            .await
    }

    /// Ends an established session.
    pub async fn bye(&self) -> Result<(), UaError> {
        if self.state() != SessionState::Established {
            return Err(illegal(self.state(), "Terminating"));
        }
        self.inner.session.clone().send_bye().await
    }

    /// Sends DTMF through the session-description handler.
    pub async fn send_dtmf(&self, tones: &str) -> Result<(), UaError> {
        self.inner.session.sdh.send_dtmf(tones).await
    }

    /// Sends an in-dialog INFO request.
    pub async fn info(&self, body: Option<Body>) -> Result<(), UaError> {
        self.inner.session.send_info(body).await
    }

    /// Sends an in-dialog REFER (blind transfer).
    pub async fn refer(&self, refer_to: &str) -> Result<(), UaError> {
        self.inner.session.send_refer(refer_to).await
    }

    /// Cancels or tears down whatever is outstanding and terminates.
    pub async fn dispose(&self) {
        {
            let mut shared = self.inner.session.shared.lock();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
        }
        match self.state() {
            SessionState::Initial | SessionState::Terminated => {
                self.inner.session.terminate();
            }
            SessionState::Establishing => {
                let (tx, rx) = oneshot::channel();
                self.inner.session.shared.lock().dispose_waiter = Some(tx);
                if self.cancel().await.is_ok() {
                    let _ = rx.await;
                }
                self.inner.session.terminate();
            }
            SessionState::Established | SessionState::Terminating => {
                let (tx, rx) = oneshot::channel();
                self.inner.session.shared.lock().dispose_waiter = Some(tx);
                if self.inner.session.clone().send_bye().await.is_ok() {
                    let _ = rx.await;
                }
                self.inner.session.terminate();
            }
        }
    }
}

impl InviterInner {
    async fn send_initial_invite(self: Arc<Self>) -> Result<(), UaError> {
        let offer = self.session.sdh.get_description().await?;
        let core = &self.session.core;
        let request = core
            .make_request(Method::Invite, self.target.clone(), self.target.clone())
            .header(
                "Contact",
                SmolStr::new(format!("<{}>", core.config().contact)),
            )
            .header("Allow", core.allow_value())
            .body(Body::session(offer.content_type, offer.content))
            .build(core.config().call_id_prefix.as_str());
        let sent = core
            .clone()
            .send_request(request, Arc::new(InviterDelegate(self.clone())))
            .await?;
        self.data.lock().invite_as_sent = Some(sent);
        self.session.emitter.transition(SessionState::Establishing)?;
        Ok(())
    }

    async fn send_reinvite(self: Arc<Self>) -> Result<(), UaError> {
        {
            let mut data = self.data.lock();
            if data.reinvite_in_flight {
                return Err(UaError::Validation(SmolStr::new("re-INVITE in flight")));
            }
            data.reinvite_in_flight = true;
        }
        let offer = match self.session.sdh.get_description().await {
            Ok(offer) => offer,
            Err(err) => {
                self.data.lock().reinvite_in_flight = false;
                return Err(err);
            }
        };
        let result = self.clone().try_send_reinvite(offer).await;
        if result.is_err() {
            self.data.lock().reinvite_in_flight = false;
        }
        result
    }

    async fn try_send_reinvite(
        self: Arc<Self>,
        offer: crate::sdh::SessionDescription,
    ) -> Result<(), UaError> {
        let id = self
            .session
            .dialog_id()
            .ok_or_else(|| UaError::Validation(SmolStr::new("no dialog")))?;
        let core = &self.session.core;
        let request = core
            .make_in_dialog_request(
                &id,
                Method::Invite,
                Some(Body::session(offer.content_type, offer.content)),
                vec![(
                    SmolStr::new("Contact"),
                    SmolStr::new(format!("<{}>", core.config().contact)),
                )],
            )
            .ok_or_else(|| UaError::Validation(SmolStr::new("dialog gone")))?;
        let sent = core
            .clone()
            .send_request(request, Arc::new(InviterDelegate(self.clone())))
            .await?;
        self.data.lock().invite_as_sent = Some(sent);
        Ok(())
    }

    async fn apply_answer(&self, response: &Response) -> bool {
        if response.body.is_empty() {
            return true;
        }
        let content_type = header(&response.headers, "Content-Type")
            .map(|v| v.to_string())
            .unwrap_or_else(|| "application/sdp".to_owned());
        let body = String::from_utf8_lossy(&response.body).into_owned();
        match self.session.sdh.set_description(&body, &content_type).await {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "failed to install remote description");
                false
            }
        }
    }

    async fn ack_response(&self, id: &DialogId) {
        let core = &self.session.core;
        let Some(ack) = core.make_in_dialog_request(id, Method::Ack, None, Vec::new()) else {
            return;
        };
        self.session.shared.lock().last_ack = Some(ack.clone());
        if let Err(err) = core.send_ack(ack).await {
            warn!(%err, "ACK failed");
        }
    }
}

struct InviterDelegate(Arc<InviterInner>);

#[async_trait]
impl OutgoingRequestDelegate for InviterDelegate {
    async fn on_progress(&self, response: Response) {
        let inner = &self.0;
        if inner.data.lock().reinvite_in_flight {
            return;
        }
        // A provisional with a to-tag forms an early dialog.
        if let Some(id) = DialogId::from_response_uac(&response) {
            if inner.session.dialog_id().is_none() {
                let invite = inner.data.lock().invite_as_sent.clone();
                if let Some(invite) = invite {
                    if let Some(dialog) = Dialog::new_uac(&invite, &response) {
                        inner.session.core.dialogs.insert(dialog);
                        inner.session.clone().adopt_dialog(id);
                    }
                }
            }
            // An answer may ride on a reliable-ish provisional.
            if !response.body.is_empty() && !inner.data.lock().early_answered {
                if inner.apply_answer(&response).await {
                    inner.data.lock().early_answered = true;
                }
            }
        }
    }

    async fn on_accept(&self, response: Response) {
        let inner = &self.0;
        if inner.data.lock().reinvite_in_flight {
            // Answer to our re-offer; install it and ACK.
            inner.data.lock().reinvite_in_flight = false;
            inner.apply_answer(&response).await;
            if let Some(id) = inner.session.dialog_id() {
                inner.ack_response(&id).await;
            }
            return;
        }
        if inner.session.emitter.state() == SessionState::Established {
            // Retransmitted 2xx; the ACK got lost somewhere.
            inner.session.resend_ack().await;
            return;
        }
        let Some(id) = DialogId::from_response_uac(&response) else {
            warn!("2xx without to-tag, cannot form dialog");
            return;
        };
        match inner.session.dialog_id() {
            Some(existing) if existing == id => {
                inner.session.core.dialogs.with(&id, |dialog| dialog.confirm());
            }
            Some(stale) => {
                // The 2xx came from a different tag than the early dialog.
                inner.session.core.release_session_usage(&stale);
                inner.session.shared.lock().dialog_id = None;
                let invite = inner.data.lock().invite_as_sent.clone();
                if let Some(invite) = invite {
                    if let Some(dialog) = Dialog::new_uac(&invite, &response) {
                        inner.session.core.dialogs.insert(dialog);
                    }
                }
                inner.session.clone().adopt_dialog(id.clone());
            }
            None => {
                let invite = inner.data.lock().invite_as_sent.clone();
                if let Some(invite) = invite {
                    if let Some(dialog) = Dialog::new_uac(&invite, &response) {
                        inner.session.core.dialogs.insert(dialog);
                    }
                }
                inner.session.clone().adopt_dialog(id.clone());
            }
        }

        if !inner.data.lock().early_answered {
            inner.apply_answer(&response).await;
        }
        inner.ack_response(&id).await;

        if inner.data.lock().canceled {
            // The 2xx raced our CANCEL; answer politely, then hang up.
            debug!("2xx beat CANCEL, sending BYE");
            let _ = inner.session.clone().send_bye().await;
            return;
        }
        let _ = inner.session.emitter.transition(SessionState::Established);
    }

    async fn on_redirect(&self, _response: Response) {
        if self.0.data.lock().reinvite_in_flight {
            self.0.data.lock().reinvite_in_flight = false;
            return;
        }
        self.0.session.terminate();
    }

    async fn on_reject(&self, response: Response) {
        let inner = &self.0;
        if inner.data.lock().reinvite_in_flight {
            inner.data.lock().reinvite_in_flight = false;
            // The peer rejected the re-offer; restore the old description.
            if (400..500).contains(&response.start.code) {
                if let Err(err) = inner.session.sdh.rollback_description().await {
                    warn!(%err, "rollback failed");
                }
            }
            return;
        }
        debug!(code = response.start.code, "INVITE rejected");
        inner.session.terminate();
    }

    async fn on_timeout(&self) {
        self.0.session.terminate();
    }

    async fn on_transport_error(&self) {
        self.0.session.terminate();
    }
}

/// The CANCEL's own 200 is uninteresting; the 487 arrives on the INVITE.
struct CancelOutcome;

#[async_trait]
impl OutgoingRequestDelegate for CancelOutcome {}
