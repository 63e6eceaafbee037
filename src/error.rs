//! Classified automation errors
//!
//! Every failure in the session/automation layer carries a kind and a
//! `recoverable` flag. The flag defaults to true; `AUTH_FAILED` and
//! `SETUP_FAILED` are never recoverable regardless of the flag.

use thiserror::Error;

/// Classification of an automation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Login markers absent after the login sequence
    AuthFailed,
    /// Worker instantiation failed
    SetupFailed,
    /// Anti-automation challenge detected on the target site
    Captcha,
    /// Throttled by the admission controller or the target site
    RateLimit,
    /// Transport-level failure (navigation, connection lost)
    Network,
    /// Operation exceeded its deadline
    Timeout,
    Unknown,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::AuthFailed => "AUTH_FAILED",
            ErrorKind::SetupFailed => "SETUP_FAILED",
            ErrorKind::Captcha => "CAPTCHA",
            ErrorKind::RateLimit => "RATE_LIMIT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// An automation error with classification and recoverability.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct AutomationError {
    pub kind: ErrorKind,
    pub message: String,
    /// Explicit recoverability override; defaults to true.
    pub recoverable: bool,
}

impl AutomationError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            recoverable: true,
        }
    }

    /// Mark this error as non-recoverable regardless of kind.
    pub fn non_recoverable(mut self) -> Self {
        self.recoverable = false;
        self
    }

    pub fn auth_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthFailed, message)
    }

    pub fn setup_failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::SetupFailed, message)
    }

    pub fn captcha(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Captcha, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }

    /// True unless the kind is `AUTH_FAILED`/`SETUP_FAILED` or the flag was
    /// explicitly cleared.
    pub fn is_recoverable(&self) -> bool {
        if matches!(self.kind, ErrorKind::AuthFailed | ErrorKind::SetupFailed) {
            return false;
        }
        self.recoverable
    }

    /// Whether the backoff executor should retry this error.
    ///
    /// Network, timeout, rate-limit and challenge failures are transient by
    /// default; everything else short-circuits.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::Network | ErrorKind::Timeout | ErrorKind::RateLimit | ErrorKind::Captcha
        ) && self.is_recoverable()
    }
}

pub type Result<T> = std::result::Result<T, AutomationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_setup_are_never_recoverable() {
        assert!(!AutomationError::auth_failed("no markers").is_recoverable());
        assert!(!AutomationError::setup_failed("launch").is_recoverable());
        // Even with the default flag untouched
        assert!(AutomationError::auth_failed("x").recoverable);
    }

    #[test]
    fn explicit_override_wins_over_kind() {
        let err = AutomationError::network("reset").non_recoverable();
        assert!(!err.is_recoverable());
        assert!(!err.is_retryable());
    }

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(AutomationError::network("x").is_retryable());
        assert!(AutomationError::timeout("x").is_retryable());
        assert!(AutomationError::rate_limit("x").is_retryable());
        assert!(AutomationError::captcha("x").is_retryable());
        assert!(!AutomationError::unknown("x").is_retryable());
        assert!(!AutomationError::auth_failed("x").is_retryable());
    }

    #[test]
    fn display_includes_kind_tag() {
        let err = AutomationError::timeout("navigation took too long");
        assert_eq!(err.to_string(), "TIMEOUT: navigation took too long");
    }
}
