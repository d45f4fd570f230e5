//! Error taxonomy for the bridge, distinguished at API boundaries:
//! data-path transient errors never surface here, only control-path
//! (scan/connect/pair) and terminal data-path failures do.

use std::fmt;

/// A bridge error: a [`ErrorKind`] plus an optional human-readable message
/// and the underlying cause, if any.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Creates a new error of the given kind with a human-readable message.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attaches an underlying cause to this error.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// The classification of this error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref().map(|e| e as _)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error {
            kind,
            message: String::new(),
            source: None,
        }
    }
}

/// Kinds distinguished at API boundaries.
#[derive(Debug, displaydoc::Display, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// address not known to the discovery cache, or a required service or characteristic is absent
    NotFound,
    /// operation exceeded its time budget
    Timeout,
    /// peripheral requires pairing or bonding before this operation can proceed
    AuthRequired,
    /// a transport-level I/O or MTU write failure occurred
    Transport,
    /// a local OS resource could not be allocated
    Resource,
    /// the peripheral does not implement the expected Nordic UART contract
    Protocol,
    /// the operation was aborted by a concurrent stop or disconnect
    Cancelled,
    /// an unclassified error occurred
    Other,
}

impl From<bluer::Error> for Error {
    fn from(err: bluer::Error) -> Self {
        let kind = kind_from_bluer(&err);
        Error::new(kind, err.to_string())
    }
}

fn kind_from_bluer(err: &bluer::Error) -> ErrorKind {
    use bluer::ErrorKind as B;
    match err.kind {
        B::NotFound => ErrorKind::NotFound,
        B::NotReady | B::ServicesUnresolved => ErrorKind::Transport,
        B::NotAuthorized | B::NotPermitted => ErrorKind::AuthRequired,
        B::NotSupported => ErrorKind::Protocol,
        B::InvalidArguments | B::InvalidLength | B::InvalidOffset => ErrorKind::Other,
        B::InvalidAddress(_) | B::InvalidName(_) => ErrorKind::Other,
        B::ConnectionAttemptFailed => ErrorKind::Transport,
        B::Failed => {
            if is_auth_related(&err.to_string()) {
                ErrorKind::AuthRequired
            } else {
                ErrorKind::Other
            }
        }
        _ => ErrorKind::Other,
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::PermissionDenied => ErrorKind::Resource,
            _ => ErrorKind::Transport,
        };
        Error::new(kind, err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::new(ErrorKind::Resource, err.to_string())
    }
}

/// Substring tokens for classifying BLE stack errors as
/// authentication-related when no typed error code is available.
pub const AUTH_REQUIRED_TOKENS: &[&str] = &["not paired", "authentication", "bonding", "security"];

/// Matches an error message against [`AUTH_REQUIRED_TOKENS`],
/// case-insensitively. Used when the underlying BLE stack does not
/// surface a typed error code for an authentication failure.
pub fn is_auth_related(message: &str) -> bool {
    let lower = message.to_lowercase();
    AUTH_REQUIRED_TOKENS.iter().any(|token| lower.contains(token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_token_matching_is_case_insensitive() {
        assert!(is_auth_related("Peer removed pairing information; authentication required"));
        assert!(is_auth_related("Device not Paired"));
        assert!(is_auth_related("BONDING required"));
        assert!(!is_auth_related("generic connection failure"));
    }

    #[test]
    fn error_display_includes_message_when_present() {
        let err = Error::new(ErrorKind::Timeout, "scan exceeded 10s");
        assert_eq!(err.to_string(), "operation exceeded its time budget: scan exceeded 10s");
    }

    #[test]
    fn error_display_omits_colon_when_message_empty() {
        let err: Error = ErrorKind::NotFound.into();
        assert_eq!(err.to_string(), "address not known to the discovery cache, or a required service or characteristic is absent");
    }
}
