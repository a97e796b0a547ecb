use std::sync::Arc;
use std::time::Duration;

use myna_core::SipUri;
use myna_transport::TransportOptions;
use smol_str::SmolStr;

use crate::delegate::UserAgentDelegate;
use crate::sdh::SdhFactory;

/// Posture toward a SIP extension option tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SipExtension {
    Required,
    Supported,
    #[default]
    Unsupported,
}

/// User agent configuration.
///
/// Unset options take the defaults of [`UserAgentOptions::new`]; the hack
/// flags replicate the wire quirks some registrars require and affect only
/// how Via and Contact render.
#[derive(Clone)]
pub struct UserAgentOptions {
    /// The address of record this agent acts for.
    pub uri: SipUri,
    pub display_name: Option<SmolStr>,
    pub authorization_username: Option<SmolStr>,
    pub authorization_password: Option<SmolStr>,
    pub delegate: Option<Arc<dyn UserAgentDelegate>>,
    /// Add `;rport` to the Via this agent sends.
    pub force_rport: bool,
    /// Render the Via transport as TCP.
    pub hack_via_tcp: bool,
    /// Put a random IP in the Contact host instead of the via host.
    pub hack_ip_in_contact: bool,
    /// Render the Via transport as WSS even over insecure links.
    pub hack_wss_in_transport: bool,
    /// Accept inbound option tags we never registered as supported.
    pub hack_allow_unregistered_option_tags: bool,
    /// How long an Invitation may ring before this agent gives up.
    pub no_answer_timeout: Duration,
    /// Routes applied to every out-of-dialog request.
    pub preloaded_route_set: Vec<SipUri>,
    /// Reconnection attempts after an unsolicited disconnect; 0 disables.
    pub reconnection_attempts: u32,
    /// Delay between reconnection attempts (the first retry is immediate).
    pub reconnection_delay: Duration,
    pub sdh_factory: Option<Arc<dyn SdhFactory>>,
    pub sip_extension_100rel: SipExtension,
    pub sip_extension_replaces: SipExtension,
    /// Extra option tags advertised in Supported.
    pub sip_extension_extra_supported: Vec<SmolStr>,
    pub transport_options: TransportOptions,
    pub user_agent_string: SmolStr,
    /// Host placed in Via sent-by; defaults to a random `.invalid` name.
    pub via_host: Option<SmolStr>,
    /// Send 180 Ringing automatically before delegating an invitation.
    pub auto_send_initial_provisional: bool,
    /// Deliver out-of-dialog REFER to the delegate instead of replying 405.
    pub allow_out_of_dialog_refer: bool,
    /// Deliver out-of-dialog NOTIFY to the delegate instead of replying 481.
    pub allow_out_of_dialog_notify: bool,
}

impl UserAgentOptions {
    pub fn new(uri: SipUri, transport_options: TransportOptions) -> Self {
        Self {
            uri,
            display_name: None,
            authorization_username: None,
            authorization_password: None,
            delegate: None,
            force_rport: false,
            hack_via_tcp: false,
            hack_ip_in_contact: false,
            hack_wss_in_transport: false,
            hack_allow_unregistered_option_tags: false,
            no_answer_timeout: Duration::from_secs(60),
            preloaded_route_set: Vec::new(),
            reconnection_attempts: 0,
            reconnection_delay: Duration::from_secs(4),
            sdh_factory: None,
            sip_extension_100rel: SipExtension::Unsupported,
            sip_extension_replaces: SipExtension::Supported,
            sip_extension_extra_supported: Vec::new(),
            transport_options,
            user_agent_string: SmolStr::new("myna/0.1.0"),
            via_host: None,
            auto_send_initial_provisional: false,
            allow_out_of_dialog_refer: false,
            allow_out_of_dialog_notify: false,
        }
    }

    /// Option tags advertised in Supported, assembled from the extension
    /// postures plus the extra tags.
    pub fn supported_option_tags(&self) -> Vec<SmolStr> {
        let mut tags = Vec::new();
        if !matches!(self.sip_extension_100rel, SipExtension::Unsupported) {
            tags.push(SmolStr::new("100rel"));
        }
        if !matches!(self.sip_extension_replaces, SipExtension::Unsupported) {
            tags.push(SmolStr::new("replaces"));
        }
        tags.push(SmolStr::new("outbound"));
        for extra in &self.sip_extension_extra_supported {
            if !tags.contains(extra) {
                tags.push(extra.clone());
            }
        }
        tags
    }
}

/// Options for a [`crate::Registerer`].
#[derive(Clone)]
pub struct RegistererOptions {
    /// Registrar URI; defaults to the AOR's host.
    pub registrar: Option<SipUri>,
    /// Requested binding lifetime in seconds.
    pub expires: u32,
    /// Fraction of the granted expiry after which to refresh.
    pub refresh_frequency: f64,
    /// Send an un-REGISTER when disposed while registered.
    pub unregister_on_dispose: bool,
}

impl Default for RegistererOptions {
    fn default() -> Self {
        Self {
            registrar: None,
            expires: 600,
            refresh_frequency: 0.9,
            unregister_on_dispose: true,
        }
    }
}

/// Options for a [`crate::Publisher`].
#[derive(Clone)]
pub struct PublisherOptions {
    pub event: SmolStr,
    pub content_type: SmolStr,
    pub expires: u32,
}

impl PublisherOptions {
    pub fn new(event: impl Into<SmolStr>, content_type: impl Into<SmolStr>) -> Self {
        Self {
            event: event.into(),
            content_type: content_type.into(),
            expires: 3600,
        }
    }
}

/// Options for a [`crate::Subscriber`].
#[derive(Clone)]
pub struct SubscriberOptions {
    pub event: SmolStr,
    pub expires: u32,
}

impl SubscriberOptions {
    pub fn new(event: impl Into<SmolStr>) -> Self {
        Self {
            event: event.into(),
            expires: 3600,
        }
    }
}
