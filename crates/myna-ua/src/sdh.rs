use async_trait::async_trait;
use smol_str::SmolStr;
use std::sync::Arc;

use crate::error::UaError;

/// A produced or received session description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub content_type: SmolStr,
    pub content: SmolStr,
}

/// External collaborator producing and consuming session descriptions.
///
/// One handler exists per session. Whether `get_description` yields an offer
/// or an answer is the handler's business: stable → offer, has-remote-offer
/// → answer.
#[async_trait]
pub trait SessionDescriptionHandler: Send + Sync + 'static {
    /// Produces the local description (offer or answer).
    async fn get_description(&self) -> Result<SessionDescription, UaError>;

    /// Installs the remote description.
    async fn set_description(&self, content: &str, content_type: &str) -> Result<(), UaError>;

    /// True when this handler understands the given content type.
    fn has_description(&self, content_type: &str) -> bool;

    /// Reverts a rejected re-offer.
    async fn rollback_description(&self) -> Result<(), UaError>;

    /// Sends DTMF tones through the media path.
    async fn send_dtmf(&self, tones: &str) -> Result<(), UaError>;

    /// Releases media resources. Idempotent.
    fn close(&self);
}

/// Creates a handler per session.
pub trait SdhFactory: Send + Sync + 'static {
    fn make(&self) -> Arc<dyn SessionDescriptionHandler>;
}

impl<F> SdhFactory for F
where
    F: Fn() -> Arc<dyn SessionDescriptionHandler> + Send + Sync + 'static,
{
    fn make(&self) -> Arc<dyn SessionDescriptionHandler> {
        self()
    }
}
