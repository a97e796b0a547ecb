// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::fmt;

use smol_str::SmolStr;

/// Parsed representation of a SIP or SIPS URI (RFC 3261 §19.1).
///
/// Parameters and URI headers keep their insertion order; comparison follows
/// the equality rules of §19.1.4. The type is treated as immutable after
/// construction — callers clone before mutating through the `with_*` helpers.
#[derive(Debug, Clone, Eq)]
pub struct SipUri {
    pub secure: bool,
    pub user: Option<SmolStr>,
    pub host: SmolStr,
    pub port: Option<u16>,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
    pub headers: Vec<(SmolStr, SmolStr)>,
}

impl SipUri {
    /// Constructs a plain `sip:` URI with just a host.
    pub fn new(host: impl Into<SmolStr>) -> Self {
        Self {
            secure: false,
            user: None,
            host: host.into(),
            port: None,
            params: Vec::new(),
            headers: Vec::new(),
        }
    }

    /// Attempts to parse a SIP or SIPS URI from the provided string.
    pub fn parse(input: &str) -> Option<Self> {
        let (scheme, rest) = input.trim().split_once(':')?;
        let secure = scheme.eq_ignore_ascii_case("sips");
        if !secure && !scheme.eq_ignore_ascii_case("sip") {
            return None;
        }

        let (addr_part, headers_part) = match rest.split_once('?') {
            Some((addr, headers)) => (addr, Some(headers)),
            None => (rest, None),
        };

        let mut params = Vec::new();
        let mut addr_iter = addr_part.split(';');
        let base = addr_iter.next()?.trim();
        for param in addr_iter {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.push((
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim())),
                )),
                None => params.push((SmolStr::new(param.to_ascii_lowercase()), None)),
            }
        }

        let (user, host_port) = match base.rsplit_once('@') {
            Some((user, host)) if !user.is_empty() => (Some(SmolStr::new(user)), host.trim()),
            Some((_, host)) => (None, host.trim()),
            None => (None, base),
        };

        if host_port.is_empty() {
            return None;
        }

        let (host, port) = split_host_port(host_port)?;
        let host = SmolStr::new(host.to_ascii_lowercase());

        let mut headers = Vec::new();
        if let Some(headers_part) = headers_part {
            for pair in headers_part.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    headers.push((SmolStr::new(k.trim()), SmolStr::new(v.trim())));
                }
            }
        }

        Some(Self {
            secure,
            user,
            host,
            port,
            params,
            headers,
        })
    }

    /// Returns the scheme token.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "sips"
        } else {
            "sip"
        }
    }

    /// Looks up a URI parameter by name (names are stored lowercased).
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Returns true when the `lr` loose-routing parameter is present.
    pub fn is_loose_routing(&self) -> bool {
        self.param("lr").is_some()
    }

    /// Clones the URI with an added or replaced parameter.
    pub fn with_param(&self, name: &str, value: Option<&str>) -> Self {
        let mut uri = self.clone();
        let name = SmolStr::new(name.to_ascii_lowercase());
        let value = value.map(SmolStr::new);
        if let Some(slot) = uri.params.iter_mut().find(|(k, _)| *k == name) {
            slot.1 = value;
        } else {
            uri.params.push((name, value));
        }
        uri
    }

    /// Clones the URI with the user part replaced.
    pub fn with_user(&self, user: Option<&str>) -> Self {
        let mut uri = self.clone();
        uri.user = user.map(SmolStr::new);
        uri
    }

    /// Host with the optional port, as placed in Via `sent-by`.
    pub fn host_port(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{}", self.host, port),
            None => self.host.to_string(),
        }
    }
}

impl fmt::Display for SipUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:", self.scheme())?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        f.write_str(&self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        let mut sep = '?';
        for (name, value) in &self.headers {
            write!(f, "{}{}={}", sep, name, value)?;
            sep = '&';
        }
        Ok(())
    }
}

/// Parameters that carry a defined default and therefore must match whenever
/// either side spells one out (RFC 3261 §19.1.4).
const DEFAULTED_PARAMS: [&str; 5] = ["transport", "user", "ttl", "method", "maddr"];

impl PartialEq for SipUri {
    fn eq(&self, other: &Self) -> bool {
        if self.secure != other.secure
            || self.user != other.user
            || !self.host.eq_ignore_ascii_case(&other.host)
            || self.port != other.port
        {
            return false;
        }

        // Any parameter present in both URIs must agree; a defaulted
        // parameter present in only one side makes the URIs unequal.
        for (name, value) in &self.params {
            match other.param(name) {
                Some(theirs) => {
                    if !param_value_eq(value, theirs) {
                        return false;
                    }
                }
                None => {
                    if DEFAULTED_PARAMS.iter().any(|p| name.eq_ignore_ascii_case(p)) {
                        return false;
                    }
                }
            }
        }
        for (name, _) in &other.params {
            if self.param(name).is_none()
                && DEFAULTED_PARAMS.iter().any(|p| name.eq_ignore_ascii_case(p))
            {
                return false;
            }
        }

        // URI headers must be identical sets.
        if self.headers.len() != other.headers.len() {
            return false;
        }
        self.headers.iter().all(|(name, value)| {
            other
                .headers
                .iter()
                .any(|(n, v)| n.eq_ignore_ascii_case(name) && v == value)
        })
    }
}

impl std::hash::Hash for SipUri {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.secure.hash(state);
        self.user.hash(state);
        self.host.to_ascii_lowercase().hash(state);
        self.port.hash(state);
    }
}

fn param_value_eq(a: &Option<SmolStr>, b: &Option<SmolStr>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

/// Splits a host[:port] or bracketed IPv6 literal "[host]:port".
fn split_host_port(input: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = input.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        match tail.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if tail.is_empty() => Some((host, None)),
            None => None,
        }
    } else {
        match input.split_once(':') {
            Some((host, port)) => Some((host, Some(port.parse().ok()?))),
            None => Some((input, None)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_uri() {
        let uri = SipUri::parse("sips:alice@atlanta.example.com:5061;transport=tls?subject=x")
            .expect("uri");
        assert!(uri.secure);
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_str(), "atlanta.example.com");
        assert_eq!(uri.port, Some(5061));
        assert_eq!(uri.param("transport"), Some(&Some(SmolStr::new("tls"))));
        assert_eq!(uri.headers.len(), 1);
    }

    #[test]
    fn rejects_other_schemes() {
        assert!(SipUri::parse("http://example.com").is_none());
        assert!(SipUri::parse("tel:+15551234567").is_none());
    }

    #[test]
    fn display_round_trips() {
        for text in [
            "sip:example.com",
            "sip:bob@example.com:5060",
            "sips:alice@example.com;lr",
            "sip:carol@host.net;transport=ws?priority=urgent",
        ] {
            let uri = SipUri::parse(text).expect("uri");
            assert_eq!(uri.to_string(), text);
        }
    }

    #[test]
    fn host_comparison_ignores_case() {
        let a = SipUri::parse("sip:alice@AtLanTa.COM").expect("uri");
        let b = SipUri::parse("sip:alice@atlanta.com").expect("uri");
        assert_eq!(a, b);
    }

    #[test]
    fn user_comparison_is_case_sensitive() {
        let a = SipUri::parse("sip:alice@atlanta.com").expect("uri");
        let b = SipUri::parse("sip:Alice@atlanta.com").expect("uri");
        assert_ne!(a, b);
    }

    #[test]
    fn defaulted_param_on_one_side_breaks_equality() {
        let a = SipUri::parse("sip:carol@chicago.com").expect("uri");
        let b = SipUri::parse("sip:carol@chicago.com;transport=tcp").expect("uri");
        assert_ne!(a, b);

        // Non-defaulted params on only one side are ignored.
        let c = SipUri::parse("sip:carol@chicago.com;newparam=5").expect("uri");
        assert_eq!(a, c);
    }

    #[test]
    fn shared_params_must_agree() {
        let a = SipUri::parse("sip:bob@biloxi.com;transport=udp").expect("uri");
        let b = SipUri::parse("sip:bob@biloxi.com;transport=UDP").expect("uri");
        let c = SipUri::parse("sip:bob@biloxi.com;transport=tcp").expect("uri");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn ipv6_literal_hosts() {
        let uri = SipUri::parse("sip:[2001:db8::1]:5060").expect("uri");
        assert_eq!(uri.host.as_str(), "2001:db8::1");
        assert_eq!(uri.port, Some(5060));
    }

    #[test]
    fn with_param_replaces_existing() {
        let uri = SipUri::parse("sip:example.com;transport=ws").expect("uri");
        let updated = uri.with_param("transport", Some("wss"));
        assert_eq!(updated.param("transport"), Some(&Some(SmolStr::new("wss"))));
        assert_eq!(updated.params.len(), 1);
    }
}
