// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Digest authentication per RFC 3261 §22 (MD5 only).
//!
//! Parses 401/407 challenges, computes the credential response and renders
//! the `Authorization`/`Proxy-Authorization` header value per RFC 2617
//! syntax. The nonce-count is monotone across retries with the same context
//! and wraps to 1 at 2³².

use myna_core::Method;
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use smol_str::SmolStr;
use tracing::warn;

/// Quality-of-protection options this stack can satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Qop {
    Auth,
    AuthInt,
}

impl Qop {
    pub fn as_str(&self) -> &'static str {
        match self {
            Qop::Auth => "auth",
            Qop::AuthInt => "auth-int",
        }
    }
}

/// Parsed `WWW-Authenticate` / `Proxy-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Challenge {
    pub algorithm: Option<SmolStr>,
    pub realm: Option<SmolStr>,
    pub nonce: Option<SmolStr>,
    pub opaque: Option<SmolStr>,
    pub stale: bool,
    pub qop: Vec<SmolStr>,
}

impl Challenge {
    /// Parses a Digest challenge header value. Returns None when the scheme
    /// is not Digest.
    pub fn parse(value: &str) -> Option<Self> {
        let trimmed = value.trim();
        let scheme = trimmed.get(..6)?;
        if !scheme.eq_ignore_ascii_case("Digest") {
            return None;
        }
        let rest = &trimmed[6..];
        let mut challenge = Challenge::default();
        for part in split_challenge_params(rest) {
            let Some((name, raw)) = part.split_once('=') else {
                continue;
            };
            let name = name.trim();
            let value = raw.trim().trim_matches('"');
            if name.eq_ignore_ascii_case("algorithm") {
                challenge.algorithm = Some(SmolStr::new(value));
            } else if name.eq_ignore_ascii_case("realm") {
                challenge.realm = Some(SmolStr::new(value));
            } else if name.eq_ignore_ascii_case("nonce") {
                challenge.nonce = Some(SmolStr::new(value));
            } else if name.eq_ignore_ascii_case("opaque") {
                challenge.opaque = Some(SmolStr::new(value));
            } else if name.eq_ignore_ascii_case("stale") {
                challenge.stale = value.eq_ignore_ascii_case("true");
            } else if name.eq_ignore_ascii_case("qop") {
                challenge.qop = value
                    .split(',')
                    .map(|q| SmolStr::new(q.trim().to_ascii_lowercase()))
                    .filter(|q| !q.is_empty())
                    .collect();
            }
        }
        Some(challenge)
    }
}

/// Digest credential computation context for one username/password pair.
///
/// One context lives per user agent; the nonce-count keeps increasing across
/// challenges so a registrar sees strictly monotone `nc` values.
#[derive(Debug, Clone)]
pub struct DigestContext {
    username: SmolStr,
    password: SmolStr,
    nc: u32,
}

/// A computed credential ready to be rendered into a request header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    value: SmolStr,
}

impl Authorization {
    /// The header value (after `Authorization: ` / `Proxy-Authorization: `).
    pub fn value(&self) -> &str {
        self.value.as_str()
    }
}

impl DigestContext {
    pub fn new(username: impl Into<SmolStr>, password: impl Into<SmolStr>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            nc: 0,
        }
    }

    pub fn username(&self) -> &str {
        self.username.as_str()
    }

    /// Computes the credential for a challenged request.
    ///
    /// Returns None when the challenge cannot be satisfied: missing realm or
    /// nonce, a non-MD5 algorithm, or a qop set offering neither `auth` nor
    /// `auth-int`.
    pub fn authenticate(
        &mut self,
        challenge: &Challenge,
        method: &Method,
        uri: &str,
        body: Option<&[u8]>,
    ) -> Option<Authorization> {
        if let Some(algorithm) = &challenge.algorithm {
            if !algorithm.eq_ignore_ascii_case("MD5") {
                warn!(%algorithm, "challenge requested an unsupported digest algorithm");
                return None;
            }
        }
        let Some(realm) = &challenge.realm else {
            warn!("digest challenge missing realm");
            return None;
        };
        let Some(nonce) = &challenge.nonce else {
            warn!("digest challenge missing nonce");
            return None;
        };

        let qop = if challenge.qop.is_empty() {
            None
        } else if challenge.qop.iter().any(|q| q == "auth") {
            Some(Qop::Auth)
        } else if challenge.qop.iter().any(|q| q == "auth-int") {
            Some(Qop::AuthInt)
        } else {
            warn!("digest challenge offers no supported qop");
            return None;
        };

        // Monotone 8-hex nonce count, wrapping to 1 at 2^32.
        self.nc = self.nc.wrapping_add(1);
        if self.nc == 0 {
            self.nc = 1;
        }
        let nc = format!("{:08x}", self.nc);
        let cnonce: String = thread_rng()
            .sample_iter(&Alphanumeric)
            .take(12)
            .map(char::from)
            .collect();

        let ha1 = md5_hex(format!("{}:{}:{}", self.username, realm, self.password).as_bytes());
        let ha2 = match qop {
            Some(Qop::AuthInt) => {
                let body_hash = md5_hex(body.unwrap_or_default());
                md5_hex(format!("{}:{}:{}", method.as_str(), uri, body_hash).as_bytes())
            }
            _ => md5_hex(format!("{}:{}", method.as_str(), uri).as_bytes()),
        };
        let response = match qop {
            Some(qop) => md5_hex(
                format!("{}:{}:{}:{}:{}:{}", ha1, nonce, nc, cnonce, qop.as_str(), ha2).as_bytes(),
            ),
            None => md5_hex(format!("{}:{}:{}", ha1, nonce, ha2).as_bytes()),
        };

        let mut value = format!(
            "Digest algorithm=MD5, username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", response=\"{}\"",
            self.username, realm, nonce, uri, response
        );
        if let Some(opaque) = &challenge.opaque {
            value.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        if let Some(qop) = qop {
            value.push_str(&format!(
                ", qop={}, cnonce=\"{}\", nc={}",
                qop.as_str(),
                cnonce,
                nc
            ));
        }

        Some(Authorization {
            value: SmolStr::new(value),
        })
    }
}

fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

fn split_challenge_params(input: &str) -> Vec<&str> {
    // Comma-split, respecting quoted strings.
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (idx, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}
