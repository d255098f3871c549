//! Failure classification for upstream, analysis and storage calls.
//!
//! Every failure that leaves a collaborator is mapped onto an [`ErrorKind`].
//! Retry eligibility is a pure function of that kind. Errors that must not be
//! retried travel wrapped in [`NoRetry`] so generic retry loops stop on the
//! first attempt.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpClass {
    /// 4xx other than session/auth expiry and throttling.
    ClientError,
    /// 5xx, 408 and 429.
    ServerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Http(HttpClass),
    AuthExpired,
    Application,
    Persistence,
    Configuration,
    Cancelled,
    Unknown,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::Network | ErrorKind::Http(HttpClass::ServerError) | ErrorKind::Persistence
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Http(HttpClass::ClientError) => "http_4xx",
            ErrorKind::Http(HttpClass::ServerError) => "http_5xx",
            ErrorKind::AuthExpired => "auth_expired",
            ErrorKind::Application => "application",
            ErrorKind::Persistence => "persistence",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map an HTTP status code onto the taxonomy.
pub fn classify_status(status: u16) -> ErrorKind {
    match status {
        401 | 419 | 440 => ErrorKind::AuthExpired,
        408 | 429 => ErrorKind::Http(HttpClass::ServerError),
        400..=499 => ErrorKind::Http(HttpClass::ClientError),
        500..=599 => ErrorKind::Http(HttpClass::ServerError),
        _ => ErrorKind::Unknown,
    }
}

const SESSION_EXPIRED_MARKERS: &[&str] = &[
    "session expired",
    "session_expired",
    "login required",
    "login_required",
    "token expired",
    "not logged in",
];

pub fn is_session_expired_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    SESSION_EXPIRED_MARKERS.iter().any(|m| lower.contains(m))
}

/// A failure with its taxonomy class attached.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Upstream identity the failure is attributed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            resource: None,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        let kind = match classify_status(status) {
            ErrorKind::Http(HttpClass::ClientError) if is_session_expired_message(&message) => {
                ErrorKind::AuthExpired
            }
            kind => kind,
        };
        Self {
            kind,
            message,
            status: Some(status),
            resource: None,
        }
    }

    pub fn auth_expired(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthExpired, message)
    }

    /// Well-formed response that signals failure. Session-expiry wording is
    /// promoted to [`ErrorKind::AuthExpired`].
    pub fn application(message: impl Into<String>) -> Self {
        let message = message.into();
        if is_session_expired_message(&message) {
            Self::new(ErrorKind::AuthExpired, message)
        } else {
            Self::new(ErrorKind::Application, message)
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Persistence, message)
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Configuration, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation cancelled")
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == ErrorKind::Cancelled
    }

    /// Convert into an `anyhow::Error`, wrapping non-retryable kinds in [`NoRetry`].
    pub fn into_propagated(self) -> anyhow::Error {
        if self.is_retryable() {
            anyhow::Error::new(self)
        } else {
            anyhow::Error::new(NoRetry(self))
        }
    }
}

/// Marker wrapper: the inner failure must not be retried.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("not retryable: {0}")]
pub struct NoRetry(pub ClassifiedError);

impl NoRetry {
    pub fn inner(&self) -> &ClassifiedError {
        &self.0
    }
}

/// Recover the classification of an arbitrary error chain.
pub fn classify(err: &anyhow::Error) -> ClassifiedError {
    for cause in err.chain() {
        if let Some(no_retry) = cause.downcast_ref::<NoRetry>() {
            return no_retry.0.clone();
        }
        if let Some(classified) = cause.downcast_ref::<ClassifiedError>() {
            return classified.clone();
        }
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            return ClassifiedError::network(io.to_string());
        }
        if let Some(json) = cause.downcast_ref::<serde_json::Error>() {
            return ClassifiedError::application(format!("malformed payload: {json}"));
        }
    }

    let message = format!("{err:#}");
    if is_session_expired_message(&message) {
        ClassifiedError::auth_expired(message)
    } else {
        ClassifiedError::unknown(message)
    }
}

/// True when a retry loop must stop immediately.
pub fn is_no_retry(err: &anyhow::Error) -> bool {
    err.chain().any(|c| c.downcast_ref::<NoRetry>().is_some()) || !classify(err).is_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn server_errors_are_retryable() {
        let err = ClassifiedError::http(503, "service unavailable");
        assert_eq!(err.kind, ErrorKind::Http(HttpClass::ServerError));
        assert!(err.is_retryable());

        let propagated = err.into_propagated();
        assert!(propagated.downcast_ref::<NoRetry>().is_none());
        assert!(!is_no_retry(&propagated));
    }

    #[test]
    fn forbidden_is_wrapped_as_no_retry() {
        let err = ClassifiedError::http(403, "forbidden");
        assert_eq!(err.kind, ErrorKind::Http(HttpClass::ClientError));
        assert!(!err.is_retryable());

        let propagated = err.into_propagated();
        let wrapped = propagated.downcast_ref::<NoRetry>().unwrap();
        assert_eq!(wrapped.inner().status, Some(403));
        assert!(is_no_retry(&propagated));
    }

    #[test]
    fn session_expired_is_auth_and_not_retryable() {
        let err = ClassifiedError::application("Session expired, please log in again");
        assert_eq!(err.kind, ErrorKind::AuthExpired);

        let propagated = err.into_propagated();
        assert!(propagated.downcast_ref::<NoRetry>().is_some());

        let via_status = ClassifiedError::http(400, "{\"error\":\"login_required\"}");
        assert_eq!(via_status.kind, ErrorKind::AuthExpired);
        assert_eq!(classify_status(401), ErrorKind::AuthExpired);
    }

    #[test]
    fn throttling_and_network_retry() {
        assert!(classify_status(429).is_retryable());
        assert!(classify_status(408).is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Persistence.is_retryable());
        assert!(!ErrorKind::Application.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn classify_walks_context_chain() {
        let err = Err::<(), _>(ClassifiedError::http(502, "bad gateway").into_propagated())
            .context("fetching comments")
            .unwrap_err();
        assert_eq!(classify(&err).status, Some(502));

        let io = anyhow::Error::new(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert_eq!(classify(&io).kind, ErrorKind::Network);

        let opaque = anyhow::anyhow!("something odd");
        assert_eq!(classify(&opaque).kind, ErrorKind::Unknown);
        assert!(is_no_retry(&opaque));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let value = serde_json::to_value(ErrorKind::Http(HttpClass::ServerError)).unwrap();
        assert_eq!(value, serde_json::json!({"http": "server_error"}));
        assert_eq!(ErrorKind::AuthExpired.to_string(), "auth_expired");
    }
}
