/// Why a user message was not sent.
///
/// Every variant leaves the session store untouched.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("not connected to the agent backend")]
    NotConnected,

    #[error("message is empty")]
    EmptyMessage,

    #[error("outbound queue is full")]
    Backpressure,

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("session has shut down")]
    SessionGone,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        assert_eq!(
            SendError::NotConnected.to_string(),
            "not connected to the agent backend"
        );
        assert_eq!(
            SendError::Encode("bad".into()).to_string(),
            "failed to encode message: bad"
        );
    }
}
