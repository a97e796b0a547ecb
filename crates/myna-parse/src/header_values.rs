use myna_core::{Headers, Method};
use smol_str::SmolStr;

/// Extracts the `tag` parameter from a From/To header value.
pub fn extract_tag(value: &str) -> Option<SmolStr> {
    // Header params follow the closing bracket in name-addr form; in
    // addr-spec form everything after the first semicolon is a header param.
    let tail = match value.find('>') {
        Some(pos) => &value[pos + 1..],
        None => value,
    };
    tail.split(';').skip(usize::from(!tail.starts_with(';'))).find_map(|part| {
        let (name, tag) = part.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("tag") {
            Some(SmolStr::new(tag.trim()))
        } else {
            None
        }
    })
}

/// Parses a `CSeq` header into sequence number and method.
pub fn parse_cseq(headers: &Headers) -> Option<(u32, Method)> {
    let value = headers.get("CSeq")?;
    let mut parts = value.split_whitespace();
    let number = parts.next()?.parse().ok()?;
    let method = Method::from_token(parts.next()?);
    Some((number, method))
}

/// Parses the `Expires` header as whole seconds.
pub fn parse_expires(headers: &Headers) -> Option<u32> {
    headers.get("Expires")?.trim().parse().ok()
}

/// Parses the `Min-Expires` header (423 recovery).
pub fn parse_min_expires(headers: &Headers) -> Option<u32> {
    headers.get("Min-Expires")?.trim().parse().ok()
}

/// Returns the `expires` parameter of the first Contact header, the
/// registrar's per-binding grant when no Expires header is present.
pub fn contact_expires(headers: &Headers) -> Option<u32> {
    let contact = headers.get("Contact")?;
    let tail = match contact.find('>') {
        Some(pos) => &contact[pos + 1..],
        None => contact.as_str(),
    };
    tail.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        if name.trim().eq_ignore_ascii_case("expires") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

/// Parsed `Subscription-State` header (RFC 6665 §4.1.3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStateValue {
    pub state: SmolStr,
    pub expires: Option<u32>,
    pub reason: Option<SmolStr>,
}

/// Parses the `Subscription-State` header of a NOTIFY.
pub fn parse_subscription_state(headers: &Headers) -> Option<SubscriptionStateValue> {
    let value = headers.get("Subscription-State")?;
    let mut parts = value.split(';');
    let state = SmolStr::new(parts.next()?.trim().to_ascii_lowercase());
    let mut expires = None;
    let mut reason = None;
    for part in parts {
        if let Some((name, v)) = part.trim().split_once('=') {
            let v = v.trim();
            if name.trim().eq_ignore_ascii_case("expires") {
                expires = v.parse().ok();
            } else if name.trim().eq_ignore_ascii_case("reason") {
                reason = Some(SmolStr::new(v));
            }
        }
    }
    Some(SubscriptionStateValue {
        state,
        expires,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_tag_from_name_addr() {
        assert_eq!(
            extract_tag("\"Bob\" <sip:bob@biloxi.com>;tag=456248").map(|t| t.to_string()),
            Some("456248".to_string())
        );
    }

    #[test]
    fn extracts_tag_from_addr_spec() {
        assert_eq!(
            extract_tag("sip:bob@biloxi.com;tag=xyz").map(|t| t.to_string()),
            Some("xyz".to_string())
        );
        assert_eq!(extract_tag("<sip:bob@biloxi.com>"), None);
    }

    #[test]
    fn parses_cseq() {
        let mut headers = Headers::new();
        headers.push("CSeq", "314159 INVITE");
        assert_eq!(parse_cseq(&headers), Some((314159, Method::Invite)));
    }

    #[test]
    fn parses_expiry_headers() {
        let mut headers = Headers::new();
        headers.push("Expires", "3600");
        headers.push("Min-Expires", "1800");
        headers.push("Contact", "<sip:bob@client.biloxi.com>;expires=120");
        assert_eq!(parse_expires(&headers), Some(3600));
        assert_eq!(parse_min_expires(&headers), Some(1800));
        assert_eq!(contact_expires(&headers), Some(120));
    }

    #[test]
    fn parses_subscription_state() {
        let mut headers = Headers::new();
        headers.push("Subscription-State", "active;expires=599");
        let value = parse_subscription_state(&headers).expect("value");
        assert_eq!(value.state.as_str(), "active");
        assert_eq!(value.expires, Some(599));
        assert_eq!(value.reason, None);

        let mut headers = Headers::new();
        headers.push("Subscription-State", "terminated;reason=timeout");
        let value = parse_subscription_state(&headers).expect("value");
        assert_eq!(value.state.as_str(), "terminated");
        assert_eq!(value.reason.as_deref(), Some("timeout"));
    }
}
