// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use myna_core::{generate_call_id, generate_tag, Method, Request, Response, SipUri};
use myna_dialog::{Dialog, DialogId};
use myna_parse::{parse_expires, parse_min_expires, parse_subscription_state};
use myna_timer::{schedule, SipTimer, TimerHandle, TimerTable};
use myna_transaction::{reply_to, TransactionKey};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::core::{NotifyTarget, UserAgentCore};
use crate::delegate::OutgoingRequestDelegate;
use crate::emitter::StateEmitter;
use crate::error::{StateTransitionError, UaError};
use crate::options::SubscriberOptions;

/// Subscription lifecycle per RFC 6665: the first NOTIFY's
/// Subscription-State decides between Pending and Active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Initial,
    NotifyWait,
    Pending,
    Active,
    Terminated,
}

type NotifyListener = Arc<dyn Fn(Request) + Send + Sync>;

struct SubData {
    call_id: SmolStr,
    from_tag: SmolStr,
    cseq: u32,
    expires: u32,
    /// The SUBSCRIBE as sent, kept to build the dialog from its 2xx.
    last_subscribe: Option<Request>,
    dialog_id: Option<DialogId>,
    refresh: TimerHandle,
    notify_wait: TimerHandle,
    unsubscribing: bool,
    disposed: bool,
    dispose_waiter: Option<oneshot::Sender<()>>,
}

pub(crate) struct SubscriberInner {
    core: Arc<UserAgentCore>,
    target: SipUri,
    options: SubscriberOptions,
    emitter: StateEmitter<SubscriberState>,
    notify_listeners: Mutex<Vec<NotifyListener>>,
    data: Mutex<SubData>,
}

/// SUBSCRIBE/NOTIFY client usage (RFC 6665).
#[derive(Clone)]
pub struct Subscriber {
    inner: Arc<SubscriberInner>,
}

impl Subscriber {
    pub fn new(core: Arc<UserAgentCore>, target: SipUri, options: SubscriberOptions) -> Self {
        let call_id = generate_call_id(core.config().call_id_prefix.as_str());
        let expires = options.expires;
        Self {
            inner: Arc::new(SubscriberInner {
                core,
                target,
                options,
                emitter: StateEmitter::new(SubscriberState::Initial),
                notify_listeners: Mutex::new(Vec::new()),
                data: Mutex::new(SubData {
                    call_id,
                    from_tag: generate_tag(),
                    cseq: 0,
                    expires,
                    last_subscribe: None,
                    dialog_id: None,
                    refresh: TimerHandle::disarmed(),
                    notify_wait: TimerHandle::disarmed(),
                    unsubscribing: false,
                    disposed: false,
                    dispose_waiter: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> SubscriberState {
        self.inner.emitter.state()
    }

    pub fn on_state(&self, listener: impl Fn(SubscriberState) + Send + Sync + 'static) {
        self.inner.emitter.on_change(listener);
    }

    /// Registers a listener for NOTIFY bodies.
    pub fn on_notify(&self, listener: impl Fn(Request) + Send + Sync + 'static) {
        self.inner.notify_listeners.lock().push(Arc::new(listener));
    }

    /// Sends the initial SUBSCRIBE and waits for the dialog-forming NOTIFY.
    pub async fn subscribe(&self) -> Result<(), UaError> {
        if self.state() != SubscriberState::Initial {
            return Err(StateTransitionError::Illegal {
                from: SmolStr::new("NotifyWait"),
                to: SmolStr::new("NotifyWait"),
            }
            .into());
        }
        // Until the dialog forms, the NOTIFY routes by Call-ID + our tag.
        let (call_id, from_tag) = {
            let data = self.inner.data.lock();
            (data.call_id.clone(), data.from_tag.clone())
        };
        self.inner.core.register_pending_subscription(
            call_id,
            from_tag,
            Arc::new(SubNotifyTarget(self.inner.clone())),
        );
        self.inner.clone().send_subscribe(None).await?;
        self.inner.emitter.transition(SubscriberState::NotifyWait)?;
        self.inner.clone().arm_notify_wait();
        Ok(())
    }

    /// Ends the subscription with an Expires: 0 SUBSCRIBE; the notifier's
    /// terminal NOTIFY finishes the job.
    pub async fn unsubscribe(&self) -> Result<(), UaError> {
        eprintln!("DBG unsubscribe enter state={:?}", self.state());
        let r = match self.state() {
            SubscriberState::Terminated => Ok(()),
            SubscriberState::Initial => {
                let _ = self.inner.emitter.transition(SubscriberState::Terminated);
                Ok(())
            }
            _ => self.inner.clone().send_subscribe(Some(0)).await,
        };
        eprintln!("DBG unsubscribe exit {:?}", r.is_ok());
        r
    }

    /// Cancels timers, unsubscribes when active, and terminates.
    pub async fn dispose(&self) {
        let needs_unsubscribe = {
            let mut data = self.inner.data.lock();
            if data.disposed {
                return;
            }
            data.disposed = true;
            data.refresh.cancel();
            data.notify_wait.cancel();
            matches!(
                self.state(),
                SubscriberState::Pending | SubscriberState::Active
            )
        };
        if needs_unsubscribe {
            let (tx, rx) = oneshot::channel();
            self.inner.data.lock().dispose_waiter = Some(tx);
            if self.inner.clone().send_subscribe(Some(0)).await.is_ok() {
                let _ = rx.await;
            }
        }
        self.inner.terminate();
    }
}

impl SubscriberInner {
    async fn send_subscribe(self: Arc<Self>, expires_override: Option<u32>) -> Result<(), UaError> {
        let dialog_id = self.data.lock().dialog_id.clone();
        let expires = {
            let mut data = self.data.lock();
            data.unsubscribing = expires_override == Some(0);
            expires_override.unwrap_or(data.expires)
        };
        let request = match &dialog_id {
            // Refreshes and removals travel inside the dialog.
            Some(id) => self
                .core
                .make_in_dialog_request(
                    id,
                    Method::Subscribe,
                    None,
                    vec![
                        (SmolStr::new("Event"), self.options.event.clone()),
                        (SmolStr::new("Expires"), SmolStr::new(expires.to_string())),
                        (
                            SmolStr::new("Contact"),
                            SmolStr::new(format!("<{}>", self.core.config().contact)),
                        ),
                    ],
                )
                .ok_or_else(|| UaError::Validation(SmolStr::new("dialog gone")))?,
            None => {
                let (call_id, from_tag, cseq) = {
                    let mut data = self.data.lock();
                    data.cseq += 1;
                    (data.call_id.clone(), data.from_tag.clone(), data.cseq)
                };
                self.core
                    .make_request(Method::Subscribe, self.target.clone(), self.target.clone())
                    .call_id(call_id)
                    .from_tag(from_tag)
                    .cseq(cseq)
                    .header("Event", self.options.event.clone())
                    .header("Expires", SmolStr::new(expires.to_string()))
                    .header(
                        "Contact",
                        SmolStr::new(format!("<{}>", self.core.config().contact)),
                    )
                    .build(self.core.config().call_id_prefix.as_str())
            }
        };
        let sent = self
            .core
            .clone()
            .send_request(request, Arc::new(SubDelegate(self.clone())))
            .await?;
        self.data.lock().last_subscribe = Some(sent);
        Ok(())
    }

    /// Timer N: give up when no NOTIFY arrives after the SUBSCRIBE.
    fn arm_notify_wait(self: Arc<Self>) {
        let delay = TimerTable::new(true).duration(SipTimer::N);
        let inner = self.clone();
        let handle = schedule(delay, move || {
            if inner.emitter.state() == SubscriberState::NotifyWait {
                warn!("no NOTIFY after SUBSCRIBE, terminating subscription");
                inner.terminate();
            }
        });
        let mut data = self.data.lock();
        data.notify_wait.cancel();
        data.notify_wait = handle;
    }

    fn schedule_refresh(self: Arc<Self>, granted: u32) {
        let delay = Duration::from_secs_f64(f64::from(granted) * 0.9);
        let inner = self.clone();
        let handle = schedule(delay, move || {
            tokio::spawn(async move {
                debug!("refreshing subscription");
                if let Err(err) = inner.send_subscribe(None).await {
                    warn!(%err, "subscription refresh failed");
                }
            });
        });
        let mut data = self.data.lock();
        data.refresh.cancel();
        data.refresh = handle;
    }

    fn terminate(&self) {
        let (dialog_id, call_id, from_tag) = {
            let mut data = self.data.lock();
            data.refresh.cancel();
            data.notify_wait.cancel();
            (
                data.dialog_id.take(),
                data.call_id.clone(),
                data.from_tag.clone(),
            )
        };
        self.core
            .release_pending_subscription(call_id.as_str(), from_tag.as_str());
        if let Some(id) = &dialog_id {
            self.core.release_notify_target(id);
        }
        if let Some(waiter) = self.data.lock().dispose_waiter.take() {
            let _ = waiter.send(());
        }
        let _ = self.emitter.transition(SubscriberState::Terminated);
    }

    /// Builds the dialog once the first dialog-forming message arrives.
    fn adopt_dialog(self: Arc<Self>, dialog: Dialog) {
        let id = dialog.id.clone();
        let mut data = self.data.lock();
        if data.dialog_id.is_some() {
            return;
        }
        data.dialog_id = Some(id.clone());
        drop(data);
        self.core.dialogs.insert(dialog);
        self.core
            .dialogs
            .with(&id, |dialog| dialog.register_usage("subscription"));
        let core = self.core.clone();
        core.register_notify_target(id, Arc::new(SubNotifyTarget(self)));
    }
}

struct SubDelegate(Arc<SubscriberInner>);

#[async_trait]
impl OutgoingRequestDelegate for SubDelegate {
    async fn on_accept(&self, response: Response) {
        let inner = &self.0;
        let (request, requested, unsubscribing) = {
            let data = inner.data.lock();
            (
                data.last_subscribe.clone(),
                data.expires,
                data.unsubscribing,
            )
        };
        if unsubscribing {
            // The terminal NOTIFY finishes the subscription, except while
            // disposing, when nobody is left to wait for it.
            if inner.data.lock().disposed {
                inner.terminate();
            }
            return;
        }
        if inner.data.lock().dialog_id.is_none() {
            if let Some(request) = request {
                if let Some(dialog) = Dialog::new_uac(&request, &response) {
                    inner.clone().adopt_dialog(dialog);
                }
            }
        }
        let granted = parse_expires(&response.headers)
            .unwrap_or(requested)
            .min(requested);
        if granted > 0 && !inner.data.lock().disposed {
            inner.clone().schedule_refresh(granted);
        }
    }

    async fn on_reject(&self, response: Response) {
        let inner = &self.0;
        let code = response.start.code;
        if code == 423 {
            if let Some(min_expires) = parse_min_expires(&response.headers) {
                let retry = {
                    let mut data = inner.data.lock();
                    data.expires = data.expires.max(min_expires);
                    !data.unsubscribing && !data.disposed
                };
                if retry {
                    if let Err(err) = inner.clone().send_subscribe(None).await {
                        warn!(%err, "423 recovery failed");
                    }
                    return;
                }
            }
        }
        warn!(code, "subscription failed");
        inner.terminate();
    }

    async fn on_timeout(&self) {
        self.0.terminate();
    }

    async fn on_transport_error(&self) {
        self.0.terminate();
    }
}

struct SubNotifyTarget(Arc<SubscriberInner>);

#[async_trait]
impl NotifyTarget for SubNotifyTarget {
    async fn on_notify(&self, request: Request, key: TransactionKey) {
        let inner = &self.0;
        inner.data.lock().notify_wait.cancel();

        let response = reply_to(&request, 200);
        if inner.data.lock().dialog_id.is_none() {
            // The NOTIFY formed the dialog before (or instead of) the 2xx
            // to SUBSCRIBE (RFC 6665 §4.4.1, UAS construction rules).
            if let Some(dialog) = Dialog::new_uas(&request, &response) {
                inner.clone().adopt_dialog(dialog);
            }
        }
        if let Err(err) = inner.core.respond(&key, response).await {
            warn!(%err, "200 to NOTIFY failed");
        }

        let listeners: Vec<NotifyListener> = inner.notify_listeners.lock().clone();
        for listener in &listeners {
            listener(request.clone());
        }

        match parse_subscription_state(&request.headers) {
            Some(value) => match value.state.as_str() {
                "active" => {
                    if let Some(expires) = value.expires {
                        if !inner.data.lock().disposed {
                            inner.clone().schedule_refresh(expires.min(inner.data.lock().expires));
                        }
                    }
                    let _ = inner.emitter.transition(SubscriberState::Active);
                }
                "pending" => {
                    let _ = inner.emitter.transition(SubscriberState::Pending);
                }
                "terminated" => {
                    debug!(reason = ?value.reason, "subscription terminated by notifier");
                    inner.terminate();
                }
                other => {
                    debug!(state = other, "unhandled subscription state");
                }
            },
            None => {
                debug!("NOTIFY without Subscription-State");
            }
        }
    }
}
