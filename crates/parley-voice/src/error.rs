use parley_resilience::{classify, BreakerError, ErrorKind};
use parley_types::audio::FrameError;
use std::time::Duration;
use thiserror::Error;

/// Failures raised by the speech and language collaborators.
///
/// Messages are worded so that [`parley_resilience::classify`] maps them onto
/// the right [`ErrorKind`].
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("invalid audio frame: {0}")]
    Frame(#[from] FrameError),

    #[error("STT error: {0}")]
    Stt(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("language model error: {0}")]
    Llm(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("provider request timed out: {0}")]
    Timeout(String),

    #[error("provider authentication failed: {0}")]
    Auth(String),

    #[error("provider rate limit reached: {0}")]
    RateLimited(String),

    #[error("provider service unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by [`crate::ConversationEngine`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Voice(#[from] VoiceError),

    /// The breaker for `service` is open; the collaborator was not called.
    #[error("service {service} is temporarily unavailable")]
    CircuitOpen {
        service: String,
        retry_after: Duration,
    },

    #[error("{stage} call timed out after {}ms", .after.as_millis())]
    Timeout { stage: &'static str, after: Duration },

    #[error("invalid message: text is empty")]
    EmptyMessage,

    #[error("language model returned an empty reply")]
    EmptyReply,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::CircuitOpen { .. } => ErrorKind::ServiceUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::EmptyMessage => ErrorKind::UserInput,
            other => classify(other).kind,
        }
    }

    /// Suggested client back-off, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::CircuitOpen { retry_after, .. } => Some(*retry_after),
            other => other.kind().retry_after(),
        }
    }
}

impl From<BreakerError<EngineError>> for EngineError {
    fn from(err: BreakerError<EngineError>) -> Self {
        match err {
            BreakerError::Open {
                service,
                retry_after,
            } => Self::CircuitOpen {
                service,
                retry_after,
            },
            BreakerError::Inner(e) => e,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn voice_errors_classify_by_wording() {
        let cases = [
            (VoiceError::Network("refused".into()), ErrorKind::Network),
            (VoiceError::Timeout("30s".into()), ErrorKind::Timeout),
            (VoiceError::RateLimited("slow down".into()), ErrorKind::RateLimited),
            (VoiceError::Auth("bad key".into()), ErrorKind::Auth),
            (VoiceError::Unavailable("502".into()), ErrorKind::ServiceUnavailable),
            (VoiceError::Llm("HTTP 500".into()), ErrorKind::Internal),
        ];
        for (err, kind) in cases {
            assert_eq!(EngineError::from(err).kind(), kind);
        }
    }

    #[test]
    fn open_breaker_maps_to_service_unavailable() {
        let err = EngineError::from(BreakerError::<EngineError>::Open {
            service: "llm".into(),
            retry_after: Duration::from_secs(12),
        });
        assert_eq!(err.kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(12)));
        assert_eq!(err.to_string(), "service llm is temporarily unavailable");
    }

    #[test]
    fn empty_message_is_user_input() {
        assert_eq!(EngineError::EmptyMessage.kind(), ErrorKind::UserInput);
        assert_eq!(EngineError::EmptyReply.kind(), ErrorKind::Internal);
    }
}
