use std::sync::Arc;

use async_trait::async_trait;
use myna_core::{Body, Method, Response, SipUri};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;

use crate::core::UserAgentCore;
use crate::delegate::OutgoingRequestDelegate;
use crate::error::UaError;

/// One-shot MESSAGE sender (RFC 3428). A page-mode message is a single
/// non-INVITE transaction; the returned future resolves with the outcome.
pub struct Messager {
    core: Arc<UserAgentCore>,
    target: SipUri,
    content_type: SmolStr,
}

impl Messager {
    pub fn new(core: Arc<UserAgentCore>, target: SipUri, content_type: impl Into<SmolStr>) -> Self {
        Self {
            core,
            target,
            content_type: content_type.into(),
        }
    }

    /// Sends the message and resolves once a final response (or failure)
    /// arrives.
    pub async fn message(&self, content: impl Into<SmolStr>) -> Result<(), UaError> {
        let request = self
            .core
            .make_request(Method::Message, self.target.clone(), self.target.clone())
            .body(Body::new(self.content_type.clone(), content.into()))
            .build(self.core.config().call_id_prefix.as_str());
        let (tx, rx) = oneshot::channel();
        let delegate = Arc::new(OutcomeDelegate {
            outcome: Mutex::new(Some(tx)),
        });
        self.core.clone().send_request(request, delegate).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(UaError::Timeout),
        }
    }
}

/// Resolves a oneshot with the final outcome of a request.
pub(crate) struct OutcomeDelegate {
    pub outcome: Mutex<Option<oneshot::Sender<Result<(), UaError>>>>,
}

impl OutcomeDelegate {
    fn resolve(&self, result: Result<(), UaError>) {
        if let Some(tx) = self.outcome.lock().take() {
            let _ = tx.send(result);
        }
    }
}

#[async_trait]
impl OutgoingRequestDelegate for OutcomeDelegate {
    async fn on_accept(&self, _response: Response) {
        self.resolve(Ok(()));
    }

    async fn on_redirect(&self, response: Response) {
        self.resolve(Err(UaError::RequestFailure {
            code: response.start.code,
            reason: response.start.reason.clone(),
        }));
    }

    async fn on_reject(&self, response: Response) {
        let code = response.start.code;
        // A challenge surviving the credentialed retry is an auth failure,
        // not a plain rejection.
        let error = if code == 401 || code == 407 {
            UaError::AuthenticationFailure(response.start.reason.clone())
        } else {
            UaError::RequestFailure {
                code,
                reason: response.start.reason.clone(),
            }
        };
        self.resolve(Err(error));
    }

    async fn on_timeout(&self) {
        self.resolve(Err(UaError::Timeout));
    }

    async fn on_transport_error(&self) {
        self.resolve(Err(UaError::Transport(
            myna_transport::TransportError::SendFailed("transaction transport error".into()),
        )));
    }
}
