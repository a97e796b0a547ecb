/// SIP protocol version token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum SipVersion {
    #[default]
    V2,
}

impl SipVersion {
    /// Returns the wire representation of the version.
    pub fn as_str(&self) -> &'static str {
        match self {
            SipVersion::V2 => "SIP/2.0",
        }
    }
}

impl std::fmt::Display for SipVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
