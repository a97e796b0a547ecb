use async_trait::async_trait;
use myna_core::{Request, Response};
use myna_transport::TransportError;

/// Application-level callbacks from the user agent.
///
/// Every method has a no-op default so applications implement only what they
/// care about.
#[async_trait]
pub trait UserAgentDelegate: Send + Sync + 'static {
    /// The transport (re)connected.
    async fn on_connect(&self) {}
    /// The transport went down; `Some` for unsolicited closes.
    async fn on_disconnect(&self, _error: Option<TransportError>) {}
    /// An inbound INVITE produced an invitation awaiting accept/reject.
    async fn on_invite(&self, _invitation: crate::Invitation) {}
    /// An inbound MESSAGE (already answered with 200).
    async fn on_message(&self, _request: Request) {}
    /// An out-of-dialog NOTIFY, delivered only when explicitly allowed.
    async fn on_notify(&self, _request: Request) {}
    /// An out-of-dialog REFER, delivered only when explicitly allowed.
    async fn on_refer(&self, _request: Request) {}
    /// An inbound REGISTER; a UA acting as registrar would accept it.
    async fn on_register(&self, _request: Request) {}
    /// An inbound SUBSCRIBE; a UA acting as notifier would accept it.
    async fn on_subscribe(&self, _request: Request) {}
}

/// Per-request callbacks for an outgoing client transaction, keyed by
/// response class.
#[async_trait]
pub trait OutgoingRequestDelegate: Send + Sync + 'static {
    /// 100 Trying.
    async fn on_trying(&self, _response: Response) {}
    /// 101–199.
    async fn on_progress(&self, _response: Response) {}
    /// 2xx.
    async fn on_accept(&self, _response: Response) {}
    /// 3xx.
    async fn on_redirect(&self, _response: Response) {}
    /// 4xx–6xx.
    async fn on_reject(&self, _response: Response) {}
    /// Timer B/F expired.
    async fn on_timeout(&self) {}
    /// The transport failed underneath the transaction.
    async fn on_transport_error(&self) {}
}
