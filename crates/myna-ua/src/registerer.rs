// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use myna_core::{generate_call_id, generate_tag, Method, Response, SipUri};
use myna_parse::{contact_expires, parse_expires, parse_min_expires};
use myna_timer::{schedule, TimerHandle};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::UserAgentCore;
use crate::delegate::OutgoingRequestDelegate;
use crate::emitter::StateEmitter;
use crate::error::{StateTransitionError, UaError};
use crate::options::RegistererOptions;

/// Registration lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistererState {
    Initial,
    Registered,
    Unregistered,
    Terminated,
}

struct RegData {
    /// Stable across refreshes so the registrar sees one registration.
    call_id: SmolStr,
    from_tag: SmolStr,
    cseq: u32,
    /// Requested binding lifetime; raised by 423 recovery.
    expires: u32,
    refresh: TimerHandle,
    unregistering: bool,
    disposed: bool,
    dispose_waiter: Option<oneshot::Sender<()>>,
}

pub(crate) struct RegistererInner {
    core: Arc<UserAgentCore>,
    options: RegistererOptions,
    registrar: SipUri,
    emitter: StateEmitter<RegistererState>,
    data: Mutex<RegData>,
}

/// REGISTER client per RFC 3261 §10: registers the agent's contact, keeps
/// the binding refreshed at a fraction of the granted expiry, recovers from
/// 423, and removes the binding on unregister/dispose.
#[derive(Clone)]
pub struct Registerer {
    inner: Arc<RegistererInner>,
}

impl Registerer {
    pub fn new(core: Arc<UserAgentCore>, options: RegistererOptions) -> Self {
        let registrar = options.registrar.clone().unwrap_or_else(|| {
            let mut uri = SipUri::new(core.config().aor.host.clone());
            uri.secure = core.config().aor.secure;
            uri
        });
        let call_id = generate_call_id(core.config().call_id_prefix.as_str());
        let expires = options.expires;
        Self {
            inner: Arc::new(RegistererInner {
                core,
                options,
                registrar,
                emitter: StateEmitter::new(RegistererState::Initial),
                data: Mutex::new(RegData {
                    call_id,
                    from_tag: generate_tag(),
                    cseq: 0,
                    expires,
                    refresh: TimerHandle::disarmed(),
                    unregistering: false,
                    disposed: false,
                    dispose_waiter: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> RegistererState {
        self.inner.emitter.state()
    }

    pub fn on_state(&self, listener: impl Fn(RegistererState) + Send + Sync + 'static) {
        self.inner.emitter.on_change(listener);
    }

    /// Sends (or refreshes) the registration. Resolves once the REGISTER is
    /// on the wire; the outcome arrives through the state channel.
    pub async fn register(&self) -> Result<(), UaError> {
        if self.state() == RegistererState::Terminated {
            return Err(StateTransitionError::Illegal {
                from: SmolStr::new("Terminated"),
                to: SmolStr::new("Registered"),
            }
            .into());
        }
        self.inner.clone().send_register(false).await
    }

    /// Removes the binding with an Expires: 0 REGISTER. Calling this while
    /// already Unregistered resolves without emitting a request.
    pub async fn unregister(&self) -> Result<(), UaError> {
        match self.state() {
            RegistererState::Unregistered => Ok(()),
            RegistererState::Terminated => Err(StateTransitionError::Illegal {
                from: SmolStr::new("Terminated"),
                to: SmolStr::new("Unregistered"),
            }
            .into()),
            _ => self.inner.clone().send_register(true).await,
        }
    }

    /// Cancels timers and drives the registerer to Terminated, removing the
    /// binding first when registered.
    pub async fn dispose(&self) {
        let needs_unregister = {
            let mut data = self.inner.data.lock();
            if data.disposed {
                return;
            }
            data.disposed = true;
            data.refresh.cancel();
            self.state() == RegistererState::Registered && self.options().unregister_on_dispose
        };
        if needs_unregister {
            let (tx, rx) = oneshot::channel();
            self.inner.data.lock().dispose_waiter = Some(tx);
            if self.inner.clone().send_register(true).await.is_ok() {
                let _ = rx.await;
            }
        }
        let _ = self.inner.emitter.transition(RegistererState::Terminated);
    }

    fn options(&self) -> &RegistererOptions {
        &self.inner.options
    }
}

impl RegistererInner {
    async fn send_register(self: Arc<Self>, remove: bool) -> Result<(), UaError> {
        let (call_id, from_tag, cseq, expires) = {
            let mut data = self.data.lock();
            data.cseq += 1;
            data.unregistering = remove;
            let expires = if remove { 0 } else { data.expires };
            (data.call_id.clone(), data.from_tag.clone(), data.cseq, expires)
        };
        let contact = self.core.config().contact.clone();
        let request = self
            .core
            .make_request(
                Method::Register,
                self.registrar.clone(),
                self.core.config().aor.clone(),
            )
            .call_id(call_id)
            .from_tag(from_tag)
            .cseq(cseq)
            .header("Contact", SmolStr::new(format!("<{}>", contact)))
            .header("Expires", SmolStr::new(expires.to_string()))
            .build(self.core.config().call_id_prefix.as_str());
        self.core
            .clone()
            .send_request(request, Arc::new(RegDelegate(self.clone())))
            .await
            .map(|_| ())
    }

    fn schedule_refresh(self: Arc<Self>, granted: u32) {
        let fraction = self.options.refresh_frequency.clamp(0.5, 0.99);
        let delay = Duration::from_secs_f64(f64::from(granted) * fraction);
        let inner = self.clone();
        let handle = schedule(delay, move || {
            tokio::spawn(async move {
                debug!("refreshing registration");
                if let Err(err) = inner.send_register(false).await {
                    warn!(%err, "registration refresh failed");
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

struct RegDelegate(Arc<RegistererInner>);

#[async_trait]
impl OutgoingRequestDelegate for RegDelegate {
    async fn on_accept(&self, response: Response) {
        let inner = &self.0;
        let (unregistering, disposed, requested) = {
            let data = inner.data.lock();
            (data.unregistering, data.disposed, data.expires)
        };
        if unregistering {
            let _ = inner.emitter.transition(RegistererState::Unregistered);
            inner.resolve_dispose();
            return;
        }
        // The registrar may grant less than we asked for.
        let granted = parse_expires(&response.headers)
            .or_else(|| contact_expires(&response.headers))
            .unwrap_or(requested)
            .min(requested);
        if !disposed && granted > 0 {
            inner.clone().schedule_refresh(granted);
        }
        let _ = inner.emitter.transition(RegistererState::Registered);
    }

    async fn on_reject(&self, response: Response) {
        let inner = &self.0;
        if response.start.code == 423 {
            // Interval Too Brief: adopt the registrar's minimum and retry.
            if let Some(min_expires) = parse_min_expires(&response.headers) {
                let retry = {
                    let mut data = inner.data.lock();
                    data.expires = data.expires.max(min_expires);
                    !data.unregistering && !data.disposed
                };
                if retry {
                    if let Err(err) = inner.clone().send_register(false).await {
                        warn!(%err, "423 recovery failed");
                    }
                    return;
                }
            }
        }
        warn!(code = response.start.code, "registration failed");
        let _ = inner.emitter.transition(RegistererState::Unregistered);
        inner.resolve_dispose();
    }

    async fn on_timeout(&self) {
        warn!("REGISTER timed out");
        let _ = self.0.emitter.transition(RegistererState::Unregistered);
        self.0.resolve_dispose();
    }

    async fn on_transport_error(&self) {
        let _ = self.0.emitter.transition(RegistererState::Unregistered);
        self.0.resolve_dispose();
    }
}
