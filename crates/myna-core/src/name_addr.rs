use smol_str::SmolStr;

use crate::SipUri;

/// Generic name-addr structure shared by From/To/Contact and friends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<SmolStr>,
    pub uri: SipUri,
    pub params: Vec<(SmolStr, Option<SmolStr>)>,
}

impl NameAddr {
    pub fn new(uri: SipUri) -> Self {
        Self {
            display_name: None,
            uri,
            params: Vec::new(),
        }
    }

    pub fn with_display_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Looks up a header parameter by name, ASCII case-insensitively.
    pub fn param(&self, name: &str) -> Option<&Option<SmolStr>> {
        self.params
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Sets or replaces a header parameter.
    pub fn set_param(&mut self, name: &str, value: Option<&str>) {
        let name_lower = SmolStr::new(name.to_ascii_lowercase());
        let value = value.map(SmolStr::new);
        if let Some(slot) = self.params.iter_mut().find(|(k, _)| *k == name_lower) {
            slot.1 = value;
        } else {
            self.params.push((name_lower, value));
        }
    }

    /// Returns the `tag` parameter, the dialog-identifying half of From/To.
    pub fn tag(&self) -> Option<&SmolStr> {
        match self.param("tag") {
            Some(Some(tag)) => Some(tag),
            _ => None,
        }
    }

    /// Parses a name-addr or addr-spec header value.
    pub fn parse(input: &str) -> Option<Self> {
        let input = input.trim();
        let (display_name, rest) = if let Some(open) = input.find('<') {
            let display = input[..open].trim().trim_matches('"').trim();
            let display = if display.is_empty() {
                None
            } else {
                Some(SmolStr::new(display))
            };
            (display, &input[open + 1..])
        } else {
            (None, input)
        };

        let (uri_text, param_text) = match rest.find('>') {
            Some(close) => (&rest[..close], rest[close + 1..].trim_start_matches(';')),
            // addr-spec form: header params begin at the first semicolon,
            // because URI params would require the bracketed form.
            None => match rest.split_once(';') {
                Some((uri, params)) => (uri, params),
                None => (rest, ""),
            },
        };

        let uri = SipUri::parse(uri_text.trim())?;
        let mut params = Vec::new();
        for param in param_text.split(';') {
            let param = param.trim();
            if param.is_empty() {
                continue;
            }
            match param.split_once('=') {
                Some((k, v)) => params.push((
                    SmolStr::new(k.trim().to_ascii_lowercase()),
                    Some(SmolStr::new(v.trim().trim_matches('"'))),
                )),
                None => params.push((SmolStr::new(param.to_ascii_lowercase()), None)),
            }
        }

        Some(Self {
            display_name,
            uri,
            params,
        })
    }
}

impl std::fmt::Display for NameAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(name) = &self.display_name {
            write!(f, "\"{}\" ", name)?;
        }
        write!(f, "<{}>", self.uri)?;
        for (name, value) in &self.params {
            match value {
                Some(value) => write!(f, ";{}={}", name, value)?,
                None => write!(f, ";{}", name)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_addr_with_tag() {
        let addr = NameAddr::parse("\"Alice\" <sip:alice@atlanta.com>;tag=1928301774").expect("addr");
        assert_eq!(addr.display_name.as_deref(), Some("Alice"));
        assert_eq!(addr.uri.user.as_deref(), Some("alice"));
        assert_eq!(addr.tag().map(SmolStr::as_str), Some("1928301774"));
    }

    #[test]
    fn parses_bare_addr_spec() {
        let addr = NameAddr::parse("sip:bob@biloxi.com;tag=a6c85cf").expect("addr");
        assert_eq!(addr.uri.user.as_deref(), Some("bob"));
        assert_eq!(addr.tag().map(SmolStr::as_str), Some("a6c85cf"));
        // The tag is a header param in addr-spec form, not a URI param.
        assert!(addr.uri.param("tag").is_none());
    }

    #[test]
    fn uri_params_stay_inside_brackets() {
        let addr = NameAddr::parse("<sip:carol@cube.com;transport=ws>;expires=60").expect("addr");
        assert!(addr.uri.param("transport").is_some());
        assert_eq!(addr.param("expires"), Some(&Some(SmolStr::new("60"))));
    }

    #[test]
    fn display_renders_quoted_name() {
        let addr = NameAddr::new(SipUri::parse("sip:alice@atlanta.com").expect("uri"))
            .with_display_name("Alice");
        assert_eq!(addr.to_string(), "\"Alice\" <sip:alice@atlanta.com>");
    }

    #[test]
    fn set_param_replaces() {
        let mut addr = NameAddr::new(SipUri::parse("sip:a@b.c").expect("uri"));
        addr.set_param("tag", Some("one"));
        addr.set_param("tag", Some("two"));
        assert_eq!(addr.tag().map(SmolStr::as_str), Some("two"));
        assert_eq!(addr.params.len(), 1);
    }
}
