use myna_transport::TransportError;
use smol_str::SmolStr;

/// Failures surfaced by user-agent operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UaError {
    /// The transport could not carry the request.
    Transport(TransportError),
    /// An FSM transition was attempted while another was in flight, or the
    /// requested transition is not legal from the current state.
    StateTransition(StateTransitionError),
    /// A 401/407 persisted after a credentialed attempt, or the challenge
    /// could not be satisfied.
    AuthenticationFailure(SmolStr),
    /// A transaction timer (B/F/H) expired.
    Timeout,
    /// A final non-2xx response, surfaced with its status code and reason.
    RequestFailure { code: u16, reason: SmolStr },
    /// A malformed outgoing request (missing header, bad URI).
    Validation(SmolStr),
}

impl std::fmt::Display for UaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(err) => write!(f, "{}", err),
            Self::StateTransition(err) => write!(f, "{}", err),
            Self::AuthenticationFailure(reason) => write!(f, "authentication failed: {}", reason),
            Self::Timeout => write!(f, "request timed out"),
            Self::RequestFailure { code, reason } => {
                write!(f, "request failed: {} {}", code, reason)
            }
            Self::Validation(reason) => write!(f, "invalid request: {}", reason),
        }
    }
}

impl std::error::Error for UaError {}

impl From<TransportError> for UaError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<StateTransitionError> for UaError {
    fn from(err: StateTransitionError) -> Self {
        Self::StateTransition(err)
    }
}

/// Illegal or re-entrant state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateTransitionError {
    /// A transition was triggered from within a state-change observer of the
    /// same object.
    LoopDetected,
    /// The transition is not legal from the current state.
    Illegal { from: SmolStr, to: SmolStr },
}

impl std::fmt::Display for StateTransitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LoopDetected => write!(f, "state transition loop detected"),
            Self::Illegal { from, to } => {
                write!(f, "illegal state transition {} -> {}", from, to)
            }
        }
    }
}

impl std::error::Error for StateTransitionError {}
