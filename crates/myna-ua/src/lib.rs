// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP user agent: the transaction-user layer.
//!
//! [`UserAgent`] owns the transport and the [`core::UserAgentCore`], and
//! hands out the request primitives: [`Inviter`]/[`Invitation`] for INVITE
//! sessions, [`Registerer`], [`Publisher`], [`Subscriber`] and [`Messager`].
//! Media negotiation stays behind the [`sdh::SessionDescriptionHandler`]
//! seam.
//!
//! # Example
//! ```no_run
//! use std::sync::Arc;
//! use myna_core::SipUri;
//! use myna_transport::TransportOptions;
//! use myna_ua::{RegistererOptions, UserAgent, UserAgentOptions};
//! # async fn example(connector: Arc<dyn myna_transport::Connector>) {
//! let uri = SipUri::parse("sip:alice@example.com").unwrap();
//! let options = UserAgentOptions::new(uri, TransportOptions::new("wss://edge.example.com"));
//! let ua = UserAgent::new(options, connector);
//! ua.start().await.unwrap();
//! let registerer = ua.make_registerer(RegistererOptions::default());
//! registerer.register().await.unwrap();
//! # }
//! ```

pub mod core;
pub mod delegate;
pub mod emitter;
pub mod error;
pub mod invitation;
pub mod inviter;
pub mod messager;
pub mod options;
pub mod publisher;
pub mod registerer;
pub mod sdh;
pub mod session;
pub mod subscriber;
pub mod user_agent;

pub use crate::core::{CoreConfig, UserAgentCore};
pub use delegate::{OutgoingRequestDelegate, UserAgentDelegate};
pub use emitter::StateEmitter;
pub use error::{StateTransitionError, UaError};
pub use invitation::Invitation;
pub use inviter::Inviter;
pub use messager::Messager;
pub use options::{
    PublisherOptions, RegistererOptions, SipExtension, SubscriberOptions, UserAgentOptions,
};
pub use publisher::{Publisher, PublisherState};
pub use registerer::{Registerer, RegistererState};
pub use sdh::{SdhFactory, SessionDescription, SessionDescriptionHandler};
pub use session::SessionState;
pub use subscriber::{Subscriber, SubscriberState};
pub use user_agent::{UserAgent, UserAgentState};
