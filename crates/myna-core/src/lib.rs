// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Core SIP message model per RFC 3261.
//!
//! Provides the value types shared by every other layer of the stack:
//! methods, URIs, name-addr headers, the order-preserving header collection,
//! request/response messages, and outgoing-request construction with
//! branch/tag/Call-ID generation.

pub mod headers;
pub mod method;
pub mod msg;
pub mod name_addr;
pub mod outgoing;
pub mod uri;
pub mod version;

pub use headers::{Header, Headers};
pub use method::Method;
pub use msg::{
    default_reason, Body, MessageError, Request, RequestLine, Response, SipMessage, StatusLine,
};
pub use name_addr::NameAddr;
pub use outgoing::{
    generate_branch, generate_call_id, generate_tag, OutgoingRequestBuilder, BRANCH_MAGIC_COOKIE,
};
pub use uri::SipUri;
pub use version::SipVersion;
