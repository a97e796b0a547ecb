// myna - The Myna SIP Stack
// Copyright (C) 2025 James Ferris <ferrous.communications@gmail.com>
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SIP message serialization and the wire-parser seam.
//!
//! Serialization commits to the exact layout the stack puts on the wire:
//! start-line CRLF, headers CRLF-joined in stored order, a computed
//! `Content-Length`, a blank line, then the UTF-8 body. Parsing is
//! deliberately line-based and tolerant; a grammar-backed parser can replace
//! [`parse_message`] without touching any other layer.

use bytes::Bytes;
use myna_core::{Headers, Method, Request, RequestLine, Response, SipMessage, SipUri, StatusLine};
use smol_str::SmolStr;

mod header_values;

pub use header_values::{
    contact_expires, extract_tag, parse_cseq, parse_expires, parse_min_expires,
    parse_subscription_state, SubscriptionStateValue,
};

/// Messages larger than this are dropped at ingress.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Parses one framed SIP message (request or response) from transport text.
pub fn parse_message(frame: &str) -> Option<SipMessage> {
    let trimmed_start = frame.trim_start_matches(['\r', '\n']);
    if trimmed_start.len() > DEFAULT_MAX_MESSAGE_SIZE {
        return None;
    }
    if trimmed_start.starts_with("SIP/2.0") {
        parse_response(trimmed_start).map(SipMessage::Response)
    } else {
        parse_request(trimmed_start).map(SipMessage::Request)
    }
}

/// Parses a SIP request from framed text.
pub fn parse_request(frame: &str) -> Option<Request> {
    let (head, body) = split_head_body(frame);
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    let (method, uri) = parse_request_line(first)?;
    let headers = parse_headers(lines)?;
    Some(Request::new(
        RequestLine::new(method, uri),
        headers,
        Bytes::from(body.to_owned()),
    ))
}

/// Parses a SIP response from framed text.
pub fn parse_response(frame: &str) -> Option<Response> {
    let (head, body) = split_head_body(frame);
    let mut lines = head.split("\r\n");
    let first = lines.next()?.trim();
    let status = parse_status_line(first)?;
    let headers = parse_headers(lines)?;
    Some(Response::new(
        status,
        headers,
        Bytes::from(body.to_owned()),
    ))
}

/// Serializes a request for the wire.
pub fn serialize_request(req: &Request) -> String {
    use std::fmt::Write;

    let mut buf = String::new();
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        req.start.method.as_str(),
        req.start.uri,
        req.start.version.as_str()
    );
    write_headers_and_body(&mut buf, &req.headers, &req.body);
    buf
}

/// Serializes a response for the wire.
pub fn serialize_response(res: &Response) -> String {
    use std::fmt::Write;

    let mut buf = String::new();
    let _ = write!(
        buf,
        "{} {} {}\r\n",
        res.start.version.as_str(),
        res.start.code,
        res.start.reason
    );
    write_headers_and_body(&mut buf, &res.headers, &res.body);
    buf
}

fn write_headers_and_body(buf: &mut String, headers: &Headers, body: &Bytes) {
    use std::fmt::Write;

    for header in headers.iter() {
        // Content-Length is always computed, never copied through.
        if header.name.eq_ignore_ascii_case("Content-Length")
            || header.name.eq_ignore_ascii_case("l")
        {
            continue;
        }
        let _ = write!(buf, "{}: {}\r\n", header.name, header.value.trim());
    }
    let _ = write!(buf, "Content-Length: {}\r\n", body.len());
    buf.push_str("\r\n");
    if !body.is_empty() {
        buf.push_str(&String::from_utf8_lossy(body));
    }
}

/// Returns the first header value matching `name` (case-insensitive).
pub fn header<'a>(headers: &'a Headers, name: &str) -> Option<&'a SmolStr> {
    headers.get(name)
}

/// Returns the top-most Via header value, if present.
pub fn top_via(headers: &Headers) -> Option<&SmolStr> {
    headers.get_all("Via").next()
}

/// Extracts the `branch=` parameter from a Via header value.
pub fn branch_from_via(via: &str) -> Option<&str> {
    via.split(';').skip(1).find_map(|part| {
        let mut split = part.splitn(2, '=');
        let name = split.next()?.trim();
        let value = split.next()?.trim();
        if name.eq_ignore_ascii_case("branch") {
            Some(value)
        } else {
            None
        }
    })
}

/// Extracts the `sent-by` (host[:port]) from a Via header value.
pub fn sent_by_from_via(via: &str) -> Option<&str> {
    let after_protocol = via.split_whitespace().nth(1)?;
    Some(after_protocol.split(';').next()?.trim())
}

/// Splits framed text into head and body at the first blank line.
fn split_head_body(frame: &str) -> (&str, &str) {
    match frame.find("\r\n\r\n") {
        Some(pos) => (&frame[..pos], &frame[pos + 4..]),
        None => (frame, ""),
    }
}

fn parse_request_line(line: &str) -> Option<(Method, SipUri)> {
    use nom::{
        bytes::complete::take_while1, character::complete::space1, combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        take_while1::<_, _, nom::error::Error<_>>(is_token_char),
        space1::<_, nom::error::Error<_>>,
        take_while1::<_, _, nom::error::Error<_>>(is_uri_char),
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (method_token, _, uri_token, _, version_token)) = parser(line.trim()).ok()?;

    if !version_token.trim().eq_ignore_ascii_case("SIP/2.0") {
        return None;
    }
    let uri = SipUri::parse(uri_token)?;
    Some((Method::from_token(method_token), uri))
}

fn parse_status_line(line: &str) -> Option<StatusLine> {
    use nom::{
        bytes::complete::tag_no_case,
        character::complete::{space1, u16 as nom_u16},
        combinator::rest,
        sequence::tuple,
    };

    let mut parser = tuple((
        tag_no_case::<_, _, nom::error::Error<_>>("SIP/2.0"),
        space1::<_, nom::error::Error<_>>,
        nom_u16::<_, nom::error::Error<_>>,
        space1::<_, nom::error::Error<_>>,
        rest::<_, nom::error::Error<_>>,
    ));
    let (_, (_, _, code, _, reason)) = parser(line.trim()).ok()?;

    StatusLine::new(code, reason.trim()).ok()
}

/// Parses header lines, rejecting folded continuations (RFC 3261 §7.3.1
/// deprecates them and this stack never emits them).
fn parse_headers<'a, I>(lines: I) -> Option<Headers>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            return None;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        headers.push(SmolStr::new(name), SmolStr::new(value.trim()));
    }
    Some(headers)
}

fn is_token_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '-' | '.' | '!' | '%' | '*' | '_' | '+' | '`' | '\'' | '~'
        )
}

fn is_uri_char(c: char) -> bool {
    !c.is_whitespace()
}
