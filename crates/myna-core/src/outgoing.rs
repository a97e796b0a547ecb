// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};
use smol_str::SmolStr;

use crate::{
    headers::Headers,
    method::Method,
    msg::{Body, Request, RequestLine},
    name_addr::NameAddr,
    uri::SipUri,
};

/// RFC 3261 §8.1.1.7 magic cookie prefixing every branch this stack creates.
pub const BRANCH_MAGIC_COOKIE: &str = "z9hG4bK";

/// Generates a transaction branch: magic cookie plus a unique token.
pub fn generate_branch() -> SmolStr {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(16)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", BRANCH_MAGIC_COOKIE, suffix))
}

/// Generates a From/To tag of 20 random hex characters.
pub fn generate_tag() -> SmolStr {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut rng = rand::thread_rng();
    let tag: String = (0..20).map(|_| HEX[rng.gen_range(0..16)] as char).collect();
    SmolStr::new(tag)
}

/// Generates a Call-ID: the instance prefix plus 15 random characters.
pub fn generate_call_id(prefix: &str) -> SmolStr {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(15)
        .map(char::from)
        .collect();
    SmolStr::new(format!("{}{}", prefix, suffix))
}

/// Builds the envelope of an out-of-dialog (or in-dialog) request.
///
/// The builder fills the mandatory header set; the Via header is pushed later
/// by the user-agent core once the transaction branch is known. Supported and
/// User-Agent are appended after every other header so serialization matches
/// the wire layout the stack commits to.
pub struct OutgoingRequestBuilder {
    method: Method,
    request_uri: SipUri,
    from: NameAddr,
    to: NameAddr,
    call_id: Option<SmolStr>,
    cseq: u32,
    max_forwards: u32,
    route_set: Vec<SipUri>,
    extra_headers: Vec<(SmolStr, SmolStr)>,
    supported: Vec<SmolStr>,
    user_agent: Option<SmolStr>,
    body: Option<Body>,
}

impl OutgoingRequestBuilder {
    pub fn new(method: Method, request_uri: SipUri, from_uri: SipUri, to_uri: SipUri) -> Self {
        Self {
            method,
            request_uri,
            from: NameAddr::new(from_uri),
            to: NameAddr::new(to_uri),
            call_id: None,
            cseq: 1,
            max_forwards: 70,
            route_set: Vec::new(),
            extra_headers: Vec::new(),
            supported: Vec::new(),
            user_agent: None,
            body: None,
        }
    }

    pub fn from_display_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.from.display_name = Some(name.into());
        self
    }

    pub fn from_tag(mut self, tag: impl Into<SmolStr>) -> Self {
        self.from.set_param("tag", Some(tag.into().as_str()));
        self
    }

    pub fn to_tag(mut self, tag: impl Into<SmolStr>) -> Self {
        self.to.set_param("tag", Some(tag.into().as_str()));
        self
    }

    pub fn call_id(mut self, call_id: impl Into<SmolStr>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }

    pub fn cseq(mut self, cseq: u32) -> Self {
        self.cseq = cseq;
        self
    }

    pub fn route_set(mut self, routes: Vec<SipUri>) -> Self {
        self.route_set = routes;
        self
    }

    pub fn header(mut self, name: impl Into<SmolStr>, value: impl Into<SmolStr>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    pub fn supported(mut self, options: Vec<SmolStr>) -> Self {
        self.supported = options;
        self
    }

    pub fn user_agent(mut self, product: impl Into<SmolStr>) -> Self {
        self.user_agent = Some(product.into());
        self
    }

    pub fn body(mut self, body: Body) -> Self {
        self.body = Some(body);
        self
    }

    /// Assembles the request, generating the from-tag and Call-ID when the
    /// caller did not supply them. `call_id_prefix` ties generated Call-IDs
    /// to the owning user-agent instance.
    pub fn build(mut self, call_id_prefix: &str) -> Request {
        if self.from.tag().is_none() {
            let tag = generate_tag();
            self.from.set_param("tag", Some(tag.as_str()));
        }
        let call_id = self
            .call_id
            .unwrap_or_else(|| generate_call_id(call_id_prefix));

        let mut headers = Headers::new();
        headers.push("From", SmolStr::new(self.from.to_string()));
        headers.push("To", SmolStr::new(self.to.to_string()));
        headers.push("Call-ID", call_id);
        headers.push(
            "CSeq",
            SmolStr::new(format!("{} {}", self.cseq, self.method.as_str())),
        );
        headers.push("Max-Forwards", SmolStr::new(self.max_forwards.to_string()));
        for route in &self.route_set {
            headers.push("Route", SmolStr::new(format!("<{}>", route)));
        }
        for (name, value) in self.extra_headers {
            headers.push(name, value);
        }
        if !self.supported.is_empty() {
            let joined = self
                .supported
                .iter()
                .map(SmolStr::as_str)
                .collect::<Vec<_>>()
                .join(", ");
            headers.push("Supported", SmolStr::new(joined));
        }
        if let Some(product) = self.user_agent {
            headers.push("User-Agent", product);
        }

        let body = match self.body {
            Some(body) => {
                headers.push("Content-Type", body.content_type.clone());
                if body.content_disposition.as_str() != "render" {
                    headers.push("Content-Disposition", body.content_disposition.clone());
                }
                Bytes::from(body.content.as_str().to_owned())
            }
            None => Bytes::new(),
        };

        Request::new(
            RequestLine::new(self.method, self.request_uri),
            headers,
            body,
        )
    }
}
