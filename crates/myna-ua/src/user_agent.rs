// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use myna_core::SipUri;
use myna_transport::{Connector, Transport};
use rand::Rng;
use smol_str::SmolStr;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core::{CoreConfig, UserAgentCore};
use crate::emitter::StateEmitter;
use crate::error::UaError;
use crate::invitation::Invitation;
use crate::inviter::Inviter;
use crate::messager::Messager;
use crate::options::{PublisherOptions, RegistererOptions, SubscriberOptions, UserAgentOptions};
use crate::publisher::Publisher;
use crate::registerer::{Registerer, RegistererState};
use crate::session::SessionState;
use crate::subscriber::Subscriber;

/// User agent lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAgentState {
    Started,
    Stopped,
}

enum SessionEntry {
    Inviter(Inviter),
    Invitation(Invitation),
}

impl SessionEntry {
    async fn dispose(&self) {
        match self {
            SessionEntry::Inviter(inviter) => inviter.dispose().await,
            SessionEntry::Invitation(invitation) => invitation.dispose().await,
        }
    }
}

struct UaInner {
    options: UserAgentOptions,
    transport: Transport,
    core: Arc<UserAgentCore>,
    emitter: StateEmitter<UserAgentState>,
    registerers: DashMap<SmolStr, Registerer>,
    sessions: DashMap<SmolStr, SessionEntry>,
    subscribers: DashMap<SmolStr, Subscriber>,
    publishers: DashMap<SmolStr, Publisher>,
    stopping: AtomicBool,
}

/// The user agent: owns the transport and the UA core, carries the TU
/// collections, and orchestrates boot, shutdown and reconnection.
#[derive(Clone)]
pub struct UserAgent {
    inner: Arc<UaInner>,
}

fn random_token(len: usize) -> SmolStr {
    use rand::distributions::Alphanumeric;
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect();
    SmolStr::new(token.to_ascii_lowercase())
}

impl UserAgent {
    pub fn new(options: UserAgentOptions, connector: Arc<dyn Connector>) -> Self {
        let via_host = options
            .via_host
            .clone()
            .unwrap_or_else(|| SmolStr::new(format!("{}.invalid", random_token(8))));
        let via_transport = if options.hack_via_tcp {
            SmolStr::new("TCP")
        } else {
            SmolStr::new("WSS")
        };
        let contact_host = if options.hack_ip_in_contact {
            let mut rng = rand::thread_rng();
            // A random RFC 1918 address keeps broken registrars happy.
            SmolStr::new(format!(
                "192.168.{}.{}",
                rng.gen_range(1u8..255),
                rng.gen_range(1u8..255)
            ))
        } else {
            via_host.clone()
        };
        let mut contact = SipUri::new(contact_host);
        contact.secure = options.uri.secure;
        let contact = contact
            .with_user(Some(random_token(8).as_str()))
            .with_param(
                "transport",
                Some(if options.hack_wss_in_transport || !options.hack_via_tcp {
                    "ws"
                } else {
                    "tcp"
                }),
            );

        let transport = Transport::new(connector, options.transport_options.clone());
        let config = CoreConfig {
            aor: options.uri.clone(),
            display_name: options.display_name.clone(),
            contact,
            via_host,
            via_transport,
            force_rport: options.force_rport,
            user_agent: options.user_agent_string.clone(),
            supported: options.supported_option_tags(),
            call_id_prefix: random_token(8),
            preloaded_route_set: options.preloaded_route_set.clone(),
            credentials: options
                .authorization_username
                .clone()
                .zip(options.authorization_password.clone()),
            allow_out_of_dialog_refer: options.allow_out_of_dialog_refer,
            allow_out_of_dialog_notify: options.allow_out_of_dialog_notify,
        };
        let core = UserAgentCore::new(transport.clone(), config);
        core.set_delegate(options.delegate.clone());

        let ua = Self {
            inner: Arc::new(UaInner {
                options,
                transport,
                core,
                emitter: StateEmitter::new(UserAgentState::Stopped),
                registerers: DashMap::new(),
                sessions: DashMap::new(),
                subscribers: DashMap::new(),
                publishers: DashMap::new(),
                stopping: AtomicBool::new(false),
            }),
        };
        ua.wire_transport();
        ua.wire_invitation_factory();
        ua
    }

    pub fn state(&self) -> UserAgentState {
        self.inner.emitter.state()
    }

    pub fn core(&self) -> &Arc<UserAgentCore> {
        &self.inner.core
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn contact(&self) -> &SipUri {
        &self.inner.core.config().contact
    }

    /// Connects the transport and begins processing inbound messages.
    pub async fn start(&self) -> Result<(), UaError> {
        if self.state() == UserAgentState::Started {
            return Ok(());
        }
        let _ = self.inner.emitter.transition(UserAgentState::Started);
        self.inner.transport.connect().await?;
        if let Some(delegate) = &self.inner.options.delegate {
            delegate.on_connect().await;
        }
        Ok(())
    }

    /// Graceful shutdown: dispose registerers, sessions, subscriptions and
    /// publishers serially (avoiding a request flood), then disconnect the
    /// transport and reset the core. Stop during stop is a no-op.
    pub async fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.state() == UserAgentState::Stopped {
            self.inner.stopping.store(false, Ordering::SeqCst);
            return;
        }
        info!("user agent stopping");

        let registerers: Vec<Registerer> =
            self.inner.registerers.iter().map(|r| r.value().clone()).collect();
        for registerer in registerers {
            registerer.dispose().await;
        }
        let session_ids: Vec<SmolStr> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.key().clone())
            .collect();
        for id in session_ids {
            if let Some((_, session)) = self.inner.sessions.remove(&id) {
                session.dispose().await;
            }
        }
        let subscribers: Vec<Subscriber> =
            self.inner.subscribers.iter().map(|s| s.value().clone()).collect();
        for subscriber in subscribers {
            subscriber.dispose().await;
        }
        let publishers: Vec<Publisher> =
            self.inner.publishers.iter().map(|p| p.value().clone()).collect();
        for publisher in publishers {
            publisher.dispose().await;
        }

        self.inner.transport.disconnect().await;
        self.inner.core.reset();
        let _ = self.inner.emitter.transition(UserAgentState::Stopped);
        self.inner.stopping.store(false, Ordering::SeqCst);
    }

    /// Creates a registerer owned by this agent until it terminates.
    pub fn make_registerer(&self, options: RegistererOptions) -> Registerer {
        let registerer = Registerer::new(self.inner.core.clone(), options);
        let id = random_token(8);
        self.inner.registerers.insert(id.clone(), registerer.clone());
        let inner = self.inner.clone();
        registerer.on_state(move |state| {
            if state == RegistererState::Terminated {
                inner.registerers.remove(&id);
            }
        });
        registerer
    }

    /// Creates a publisher for `target` owned by this agent.
    pub fn make_publisher(&self, target: SipUri, options: PublisherOptions) -> Publisher {
        let publisher = Publisher::new(self.inner.core.clone(), target, options);
        let id = random_token(8);
        self.inner.publishers.insert(id.clone(), publisher.clone());
        let inner = self.inner.clone();
        publisher.on_state(move |state| {
            if state == crate::publisher::PublisherState::Terminated {
                inner.publishers.remove(&id);
            }
        });
        publisher
    }

    /// Creates a subscriber for `target` owned by this agent.
    pub fn make_subscriber(&self, target: SipUri, options: SubscriberOptions) -> Subscriber {
        let subscriber = Subscriber::new(self.inner.core.clone(), target, options);
        let id = random_token(8);
        self.inner.subscribers.insert(id.clone(), subscriber.clone());
        let inner = self.inner.clone();
        subscriber.on_state(move |state| {
            if state == crate::subscriber::SubscriberState::Terminated {
                inner.subscribers.remove(&id);
            }
        });
        subscriber
    }

    /// Creates an inviter toward `target`. Requires a configured
    /// session-description handler factory.
    pub fn make_inviter(&self, target: SipUri) -> Result<Inviter, UaError> {
        let factory = self
            .inner
            .options
            .sdh_factory
            .clone()
            .ok_or_else(|| UaError::Validation(SmolStr::new("no SDH factory configured")))?;
        let inviter = Inviter::new(self.inner.core.clone(), factory.make(), target);
        let id = random_token(8);
        self.inner
            .sessions
            .insert(id.clone(), SessionEntry::Inviter(inviter.clone()));
        let inner = self.inner.clone();
        inviter.on_state(move |state| {
            if state == SessionState::Terminated {
                inner.sessions.remove(&id);
            }
        });
        Ok(inviter)
    }

    /// Creates a page-mode message sender toward `target`.
    pub fn make_messager(&self, target: SipUri, content_type: impl Into<SmolStr>) -> Messager {
        Messager::new(self.inner.core.clone(), target, content_type)
    }

    fn wire_transport(&self) {
        // Inbound frames funnel through one queue so they are processed in
        // arrival order on a single task.
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
        self.inner.transport.on_message(move |frame| {
            let _ = frame_tx.send(frame);
        });
        let core = self.inner.core.clone();
        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                core.receive_message(&frame).await;
            }
        });

        let ua = self.clone();
        self.inner.transport.on_disconnect(move |error| {
            let Some(error) = error else {
                return;
            };
            if ua.state() != UserAgentState::Started {
                return;
            }
            let ua = ua.clone();
            tokio::spawn(async move {
                if let Some(delegate) = &ua.inner.options.delegate {
                    delegate.on_disconnect(Some(error.clone())).await;
                }
                ua.reconnect().await;
            });
        });
    }

    fn wire_invitation_factory(&self) {
        let ua = self.clone();
        self.inner.core.set_invitation_factory(move |request, key| {
            let Some(factory) = ua.inner.options.sdh_factory.clone() else {
                // No media handling configured; the 200 ms automatic 100 is
                // followed by a 480 through the no-answer path.
                let core = ua.inner.core.clone();
                tokio::spawn(async move {
                    let response = myna_transaction::reply_to(&request, 480);
                    let _ = core.respond(&key, response).await;
                });
                return;
            };
            let invitation =
                Invitation::new(ua.inner.core.clone(), factory.make(), request, key);
            let id = random_token(8);
            ua.inner
                .sessions
                .insert(id.clone(), SessionEntry::Invitation(invitation.clone()));
            let inner = ua.inner.clone();
            invitation.on_state(move |state| {
                if state == SessionState::Terminated {
                    inner.sessions.remove(&id);
                }
            });
            let auto_ring =
                ua.inner.options.auto_send_initial_provisional && ua.inner.options.delegate.is_some();
            let no_answer = ua.inner.options.no_answer_timeout;
            let delegate = ua.inner.options.delegate.clone();
            tokio::spawn(async move {
                invitation.start(auto_ring, no_answer).await;
                if let Some(delegate) = delegate {
                    delegate.on_invite(invitation).await;
                }
            });
        });
    }

    /// Retry loop after an unsolicited disconnect: the first attempt is
    /// immediate, later ones wait `reconnection_delay`.
    async fn reconnect(&self) {
        let attempts = self.inner.options.reconnection_attempts;
        if attempts == 0 {
            debug!("reconnection disabled");
            return;
        }
        for attempt in 0..attempts {
            if self.state() != UserAgentState::Started {
                return;
            }
            if attempt > 0 {
                tokio::time::sleep(self.inner.options.reconnection_delay).await;
            }
            match self.inner.transport.connect().await {
                Ok(()) => {
                    info!(attempt, "transport reconnected");
                    if let Some(delegate) = &self.inner.options.delegate {
                        delegate.on_connect().await;
                    }
                    self.reregister().await;
                    return;
                }
                Err(err) => {
                    warn!(attempt, %err, "reconnection attempt failed");
                }
            }
        }
        warn!("reconnection attempts exhausted");
    }

    /// Refreshes every registered binding after a reconnect.
    async fn reregister(&self) {
        let registerers: Vec<Registerer> = self
            .inner
            .registerers
            .iter()
            .filter(|r| r.state() == RegistererState::Registered)
            .map(|r| r.value().clone())
            .collect();
        for registerer in registerers {
            if let Err(err) = registerer.register().await {
                warn!(%err, "re-registration failed");
            }
        }
    }
}

impl std::fmt::Debug for UserAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserAgent")
            .field("state", &self.state())
            .field("transport", &self.inner.transport.state())
            .finish()
    }
}
