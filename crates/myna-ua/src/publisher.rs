// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use myna_core::{generate_call_id, generate_tag, Body, Method, Response, SipUri};
use myna_parse::{header, parse_expires, parse_min_expires};
use myna_timer::{schedule, TimerHandle};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::UserAgentCore;
use crate::delegate::OutgoingRequestDelegate;
use crate::emitter::StateEmitter;
use crate::error::{StateTransitionError, UaError};
use crate::options::PublisherOptions;

/// Event-state publication lifecycle (RFC 3903).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Initial,
    Published,
    Unpublished,
    Terminated,
}

struct PubData {
    call_id: SmolStr,
    from_tag: SmolStr,
    cseq: u32,
    /// Entity tag from the last 2xx; keys refreshes and removals.
    etag: Option<SmolStr>,
    /// Requested lifetime; raised by 423 recovery.
    expires: u32,
    /// Last published document, re-sent when the server forgets our etag.
    last_body: Option<SmolStr>,
    removing: bool,
    refresh: TimerHandle,
    disposed: bool,
    dispose_waiter: Option<oneshot::Sender<()>>,
}

pub(crate) struct PublisherInner {
    core: Arc<UserAgentCore>,
    target: SipUri,
    options: PublisherOptions,
    emitter: StateEmitter<PublisherState>,
    data: Mutex<PubData>,
}

/// PUBLISH client per RFC 3903: publishes event state, refreshes it with
/// SIP-If-Match before it expires, and recovers from 412/423.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(core: Arc<UserAgentCore>, target: SipUri, options: PublisherOptions) -> Self {
        let call_id = generate_call_id(core.config().call_id_prefix.as_str());
        let expires = options.expires;
        Self {
            inner: Arc::new(PublisherInner {
                core,
                target,
                options,
                emitter: StateEmitter::new(PublisherState::Initial),
                data: Mutex::new(PubData {
                    call_id,
                    from_tag: generate_tag(),
                    cseq: 0,
                    etag: None,
                    expires,
                    last_body: None,
                    removing: false,
                    refresh: TimerHandle::disarmed(),
                    disposed: false,
                    dispose_waiter: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> PublisherState {
        self.inner.emitter.state()
    }

    pub fn on_state(&self, listener: impl Fn(PublisherState) + Send + Sync + 'static) {
        self.inner.emitter.on_change(listener);
    }

    /// Publishes (or modifies) the event state document.
    pub async fn publish(&self, content: impl Into<SmolStr>) -> Result<(), UaError> {
        if self.state() == PublisherState::Terminated {
            return Err(StateTransitionError::Illegal {
                from: SmolStr::new("Terminated"),
                to: SmolStr::new("Published"),
            }
            .into());
        }
        let content = content.into();
        self.inner.data.lock().last_body = Some(content.clone());
        self.inner.clone().send_publish(PublishKind::Document(content)).await
    }

    /// Removes the publication with Expires: 0.
    pub async fn unpublish(&self) -> Result<(), UaError> {
        match self.state() {
            PublisherState::Terminated => Err(StateTransitionError::Illegal {
                from: SmolStr::new("Terminated"),
                to: SmolStr::new("Unpublished"),
            }
            .into()),
            PublisherState::Unpublished | PublisherState::Initial => Ok(()),
            _ => self.inner.clone().send_publish(PublishKind::Remove).await,
        }
    }

    /// Cancels the refresh timer, removes an active publication, and drives
    /// the publisher to Terminated.
    pub async fn dispose(&self) {
        let needs_remove = {
            let mut data = self.inner.data.lock();
            if data.disposed {
                return;
            }
            data.disposed = true;
            data.refresh.cancel();
            self.state() == PublisherState::Published
        };
        if needs_remove {
            let (tx, rx) = oneshot::channel();
            self.inner.data.lock().dispose_waiter = Some(tx);
            if self.inner.clone().send_publish(PublishKind::Remove).await.is_ok() {
                let _ = rx.await;
            }
        }
        let _ = self.inner.emitter.transition(PublisherState::Terminated);
    }
}

/// What a PUBLISH carries: a document, a bodiless refresh, or a removal.
enum PublishKind {
    Document(SmolStr),
    Refresh,
    Remove,
}

impl PublisherInner {
    async fn send_publish(self: Arc<Self>, kind: PublishKind) -> Result<(), UaError> {
        let (call_id, from_tag, cseq, etag, expires) = {
            let mut data = self.data.lock();
            data.cseq += 1;
            data.removing = matches!(kind, PublishKind::Remove);
            let expires = if data.removing { 0 } else { data.expires };
            (
                data.call_id.clone(),
                data.from_tag.clone(),
                data.cseq,
                data.etag.clone(),
                expires,
            )
        };
        let mut builder = self
            .core
            .make_request(Method::Publish, self.target.clone(), self.target.clone())
            .call_id(call_id)
            .from_tag(from_tag)
            .cseq(cseq)
            .header("Event", self.options.event.clone())
            .header("Expires", SmolStr::new(expires.to_string()));
        if let Some(etag) = etag {
            builder = builder.header("SIP-If-Match", etag);
        }
        if let PublishKind::Document(content) = &kind {
            builder = builder.body(Body::new(self.options.content_type.clone(), content.clone()));
        }
        let request = builder.build(self.core.config().call_id_prefix.as_str());
        self.core
            .clone()
            .send_request(request, Arc::new(PubDelegate(self.clone())))
            .await
            .map(|_| ())
    }

    fn schedule_refresh(self: Arc<Self>, granted: u32) {
        let delay = Duration::from_secs_f64(f64::from(granted) * 0.9);
        let inner = self.clone();
        let handle = schedule(delay, move || {
            tokio::spawn(async move {
                debug!("refreshing publication");
                // A refresh carries no body, only the entity tag.
                if let Err(err) = inner.send_publish(PublishKind::Refresh).await {
                    warn!(%err, "publication refresh failed");
                }
            });
        });
        let mut data = self.data.lock();
        data.refresh.cancel();
        data.refresh = handle;
    }

    fn resolve_dispose(&self) {
        if let Some(waiter) = self.data.lock().dispose_waiter.take() {
            let _ = waiter.send(());
        }
    }
}

struct PubDelegate(Arc<PublisherInner>);

#[async_trait]
impl OutgoingRequestDelegate for PubDelegate {
    async fn on_accept(&self, response: Response) {
        let inner = &self.0;
        let (removing, disposed, requested) = {
            let data = inner.data.lock();
            (data.removing, data.disposed, data.expires)
        };
        if removing {
            inner.data.lock().etag = None;
            let _ = inner.emitter.transition(PublisherState::Unpublished);
            inner.resolve_dispose();
            return;
        }
        match header(&response.headers, "SIP-ETag") {
            Some(etag) => inner.data.lock().etag = Some(etag.clone()),
            None => warn!("2xx to PUBLISH carried no SIP-ETag"),
        }
        // The server may grant less, never more, than we asked for.
        let granted = parse_expires(&response.headers)
            .unwrap_or(requested)
            .min(requested);
        if !disposed && granted > 0 {
            inner.clone().schedule_refresh(granted);
        }
        let _ = inner.emitter.transition(PublisherState::Published);
    }

    async fn on_reject(&self, response: Response) {
        let inner = &self.0;
        let code = response.start.code;
        if code == 412 {
            // The server no longer knows our entity tag.
            let (removing, body) = {
                let mut data = inner.data.lock();
                data.etag = None;
                (data.removing, data.last_body.clone())
            };
            if !removing {
                if let Some(content) = body {
                    debug!("entity tag rejected, resubmitting initial publication");
                    if let Err(err) = inner.clone().send_publish(PublishKind::Document(content)).await {
                        warn!(%err, "412 recovery failed");
                    }
                    return;
                }
            }
            let _ = inner.emitter.transition(PublisherState::Terminated);
            inner.resolve_dispose();
            return;
        }
        if code == 423 {
            if let Some(min_expires) = parse_min_expires(&response.headers) {
                let (removing, body) = {
                    let mut data = inner.data.lock();
                    data.expires = data.expires.max(min_expires);
                    (data.removing, data.last_body.clone())
                };
                if !removing {
                    if let Some(content) = body {
                        if let Err(err) = inner.clone().send_publish(PublishKind::Document(content)).await {
                            warn!(%err, "423 recovery failed");
                        }
                        return;
                    }
                }
            }
        }
        warn!(code, "publication failed");
        let _ = inner.emitter.transition(PublisherState::Unpublished);
        let _ = inner.emitter.transition(PublisherState::Terminated);
        inner.resolve_dispose();
    }

    async fn on_timeout(&self) {
        let _ = self.0.emitter.transition(PublisherState::Unpublished);
        let _ = self.0.emitter.transition(PublisherState::Terminated);
        self.0.resolve_dispose();
    }

    async fn on_transport_error(&self) {
        let _ = self.0.emitter.transition(PublisherState::Unpublished);
        let _ = self.0.emitter.transition(PublisherState::Terminated);
        self.0.resolve_dispose();
    }
}
