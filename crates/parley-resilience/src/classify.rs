//! Error classification.
//!
//! Failures from any layer are mapped onto a closed [`ErrorKind`] taxonomy by
//! an ordered list of [`ClassificationRule`]s matched against the lowercased
//! error message. The first matching rule wins; nothing matching means
//! [`ErrorKind::Internal`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Network,
    Timeout,
    ServiceUnavailable,
    RateLimited,
    Auth,
    Validation,
    Internal,
    UserInput,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 8] = [
        ErrorKind::Network,
        ErrorKind::Timeout,
        ErrorKind::ServiceUnavailable,
        ErrorKind::RateLimited,
        ErrorKind::Auth,
        ErrorKind::Validation,
        ErrorKind::Internal,
        ErrorKind::UserInput,
    ];

    /// Wire name, as serialized.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "NETWORK",
            Self::Timeout => "TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::RateLimited => "RATE_LIMITED",
            Self::Auth => "AUTH",
            Self::Validation => "VALIDATION",
            Self::Internal => "INTERNAL",
            Self::UserInput => "USER_INPUT",
        }
    }

    /// Stable machine-readable error code sent to clients.
    pub fn code(self) -> &'static str {
        match self {
            Self::Network => "NETWORK_ERROR",
            Self::Timeout => "API_TIMEOUT",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::RateLimited => "RATE_LIMIT_EXCEEDED",
            Self::Auth => "AUTHENTICATION_ERROR",
            Self::Validation => "VALIDATION_ERROR",
            Self::Internal => "INTERNAL_ERROR",
            Self::UserInput => "USER_INPUT_ERROR",
        }
    }

    pub fn http_status(self) -> u16 {
        match self {
            Self::Network | Self::ServiceUnavailable => 503,
            Self::Timeout => 408,
            Self::RateLimited => 429,
            Self::Auth => 401,
            Self::Validation | Self::UserInput => 400,
            Self::Internal => 500,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::Timeout
                | Self::ServiceUnavailable
                | Self::RateLimited
                | Self::Internal
        )
    }

    /// Suggested client back-off for retryable kinds.
    pub fn retry_after(self) -> Option<Duration> {
        let ms = match self {
            Self::Network | Self::Internal => 5_000,
            Self::Timeout => 3_000,
            Self::ServiceUnavailable => 10_000,
            Self::RateLimited => 60_000,
            Self::Auth | Self::Validation | Self::UserInput => return None,
        };
        Some(Duration::from_millis(ms))
    }

    /// The short apology shown to end users in place of raw error text.
    pub fn fallback_message(self) -> &'static str {
        match self {
            Self::Network => {
                "I'm having trouble connecting right now. Please try again in a moment."
            }
            Self::Timeout => "That took longer than expected. Could you try again?",
            Self::ServiceUnavailable => {
                "The service is temporarily unavailable. Please try again in a few seconds."
            }
            Self::RateLimited => {
                "You're sending requests a little too fast. Please wait a moment and try again."
            }
            Self::Auth => "I couldn't verify your access. Please sign in again.",
            Self::Validation => "Something about that request wasn't valid. Please check it and try again.",
            Self::Internal => "Something went wrong on my side. Please try again.",
            Self::UserInput => "I didn't quite catch that. Could you rephrase?",
        }
    }

    pub fn info(self) -> ErrorInfo {
        ErrorInfo {
            kind: self,
            http_status: self.http_status(),
            retryable: self.is_retryable(),
            retry_after: self.retry_after(),
            fallback_message: self.fallback_message(),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a caller needs to react to a classified failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub http_status: u16,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
    pub fallback_message: &'static str,
}

impl ErrorInfo {
    /// Builds the client-facing payload. `detail` carries raw error text and
    /// should only be passed outside production.
    pub fn to_response(&self, detail: Option<String>) -> ErrorResponse {
        ErrorResponse {
            message: self.fallback_message.to_string(),
            kind: self.kind,
            code: self.kind.code(),
            status_code: self.http_status,
            retryable: self.retryable,
            retry_after_ms: self.retry_after.map(|d| d.as_millis() as u64),
            detail,
        }
    }
}

/// Client-facing error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub message: String,
    pub kind: ErrorKind,
    pub code: &'static str,
    pub status_code: u16,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorResponse {
    /// Replaces the generic retry hint with a precise one, e.g. the time
    /// left in a rate-limit window.
    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after_ms = Some(retry_after.as_millis() as u64);
        self
    }

    /// Builds a response for a kind directly, without classifying text.
    pub fn for_kind(kind: ErrorKind) -> Self {
        kind.info().to_response(None)
    }
}

type Predicate = Box<dyn Fn(&str) -> bool + Send + Sync>;

/// One `(predicate, kind)` row of the classification table.
pub struct ClassificationRule {
    kind: ErrorKind,
    predicate: Predicate,
}

impl fmt::Debug for ClassificationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassificationRule")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl ClassificationRule {
    /// Matches when the lowercased message contains any of `keywords`.
    pub fn keywords(kind: ErrorKind, keywords: &'static [&'static str]) -> Self {
        Self {
            kind,
            predicate: Box::new(move |message| keywords.iter().any(|k| message.contains(k))),
        }
    }

    /// Matches with an arbitrary predicate over the lowercased message.
    pub fn predicate(
        kind: ErrorKind,
        predicate: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            predicate: Box::new(predicate),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn matches(&self, lowered: &str) -> bool {
        (self.predicate)(lowered)
    }
}

/// Ordered rule table. Evaluated top to bottom; the first match wins.
#[derive(Debug)]
pub struct ErrorClassifier {
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(Self::default_rules())
    }
}

impl ErrorClassifier {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// network, timeout, rate limit, auth, validation, service unavailable.
    pub fn default_rules() -> Vec<ClassificationRule> {
        vec![
            ClassificationRule::keywords(
                ErrorKind::Network,
                &["network", "connection", "fetch", "econnrefused"],
            ),
            ClassificationRule::keywords(ErrorKind::Timeout, &["timeout", "aborted", "timed out"]),
            ClassificationRule::keywords(
                ErrorKind::RateLimited,
                &["rate limit", "too many requests", "429"],
            ),
            ClassificationRule::keywords(
                ErrorKind::Auth,
                &["unauthorized", "401", "authentication", "auth"],
            ),
            ClassificationRule::keywords(ErrorKind::Validation, &["validation", "invalid", "400"]),
            ClassificationRule::keywords(
                ErrorKind::ServiceUnavailable,
                &["service unavailable", "503", "unavailable"],
            ),
        ]
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify<E: fmt::Display + ?Sized>(&self, error: &E) -> ErrorInfo {
        self.classify_message(&error.to_string())
    }

    pub fn classify_message(&self, message: &str) -> ErrorInfo {
        let lowered = message.to_lowercase();
        let kind = self
            .rules
            .iter()
            .find(|rule| rule.matches(&lowered))
            .map_or(ErrorKind::Internal, |rule| rule.kind);
        kind.info()
    }
}

/// Classifies `error` with the default rule table.
pub fn classify<E: fmt::Display + ?Sized>(error: &E) -> ErrorInfo {
    static DEFAULT: OnceLock<ErrorClassifier> = OnceLock::new();
    DEFAULT.get_or_init(ErrorClassifier::default).classify(error)
}
