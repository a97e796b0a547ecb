use bytes::Bytes;
use myna_core::{default_reason, Headers, Request, Response, StatusLine};

/// Builds a response to `request` per RFC 3261 §8.2.6: Via values copied in
/// order, From/Call-ID/CSeq echoed, To echoed verbatim (callers add a to-tag
/// for dialog-forming responses before sending).
pub fn reply_to(request: &Request, code: u16) -> Response {
    let mut headers = Headers::new();
    for via in request.headers.get_all("Via") {
        headers.push("Via", via.clone());
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = request.headers.get(name) {
            headers.push(name, value.clone());
        }
    }
    let status = StatusLine::new(code, default_reason(code))
        .unwrap_or_else(|_| StatusLine {
            version: Default::default(),
            code: 500,
            reason: smol_str::SmolStr::new(default_reason(500)),
        });
    Response::new(status, headers, Bytes::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use myna_core::{Method, RequestLine, SipUri};

    #[test]
    fn echoes_identity_headers() {
        let mut headers = Headers::new();
        headers.push("Via", "SIP/2.0/WSS a.example.com;branch=z9hG4bK1");
        headers.push("Via", "SIP/2.0/WSS b.example.com;branch=z9hG4bK2");
        headers.push("From", "<sip:alice@example.com>;tag=abc");
        headers.push("To", "<sip:bob@example.com>");
        headers.push("Call-ID", "cid");
        headers.push("CSeq", "7 INVITE");
        let req = Request::new(
            RequestLine::new(Method::Invite, SipUri::parse("sip:bob@example.com").expect("uri")),
            headers,
            Bytes::new(),
        );
        let res = reply_to(&req, 180);
        assert_eq!(res.start.code, 180);
        assert_eq!(res.start.reason.as_str(), "Ringing");
        let vias: Vec<_> = res.headers.get_all("Via").collect();
        assert_eq!(vias.len(), 2);
        assert_eq!(res.headers.get("CSeq").map(|v| v.as_str()), Some("7 INVITE"));
    }
}
