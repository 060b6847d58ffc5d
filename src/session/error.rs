use thiserror::Error;

/// Fehler, die eine Session beenden
///
/// Jeder Fehler ist endgültig; ein neuer Versuch braucht eine neue Session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Signaling failure: {0}")]
    SignalingFailure(String),

    #[error("Negotiation failure: {0}")]
    NegotiationFailure(String),

    #[error("Capture failure: {0}")]
    CaptureFailure(String),

    #[error("Connectivity lost: {0}")]
    ConnectivityLost(String),
}

impl SessionError {
    pub fn description(&self) -> &str {
        match self {
            SessionError::SignalingFailure(d)
            | SessionError::NegotiationFailure(d)
            | SessionError::CaptureFailure(d)
            | SessionError::ConnectivityLost(d) => d,
        }
    }
}
