//! Send-path errors and blocking classification.
//!
//! Failures originate across HTTP, TLS, DNS, and raw sockets; the class is
//! computed here, where the error is produced, so the manager never parses
//! message strings.

use thiserror::Error;

/// How the manager reacts to a failed send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Active interference by a middlebox or CDN policy. Fall through fast.
    Blocking,
    /// Ordinary network transience. Proceed to the next transport.
    Transient,
    /// The target endpoint itself is wrong or hard-denied.
    Fatal,
    /// The caller gave up. Surface immediately.
    Cancelled,
}

/// Error returned by [`crate::Transport::send`].
#[derive(Debug, Clone, Error)]
pub enum SendError {
    #[error("request to {domain} timed out after {seconds} seconds")]
    Timeout { domain: String, seconds: u64 },

    #[error("network connection failed to {domain}: {reason}")]
    Dial { domain: String, reason: String },

    #[error("all DNS resolvers failed for {domain}")]
    DnsExhausted { domain: String },

    #[error("CDN blocked request to {domain} (403 Forbidden)")]
    CdnBlocked { domain: String },

    #[error("endpoint not found on {domain} (404 Not Found)")]
    EndpointMissing { domain: String },

    #[error("CDN gateway error {status} for {domain}")]
    CdnGateway { status: u16, domain: String },

    #[error("server {domain} returned status {status}: {body}")]
    ServerStatus {
        domain: String,
        status: u16,
        body: String,
    },

    #[error("no peers available in mesh network")]
    NoPeers,

    #[error("failed to send to any peer: {last}")]
    AllPeersFailed { last: String },

    #[error("send cancelled")]
    Cancelled,

    #[error("all transports failed: {last}")]
    AllTransportsFailed { last: Box<SendError> },

    #[error("transport error: {0}")]
    Other(String),
}

impl SendError {
    /// Classification used by the manager's dispatch loop.
    ///
    /// Typed variants carry their class directly; wrapped foreign errors
    /// fall back to the substring heuristic over the rendered message.
    pub fn class(&self) -> ErrorClass {
        match self {
            SendError::Cancelled => ErrorClass::Cancelled,
            SendError::CdnGateway { .. } => ErrorClass::Blocking,
            SendError::CdnBlocked { .. } | SendError::EndpointMissing { .. } => ErrorClass::Fatal,
            SendError::AllTransportsFailed { last } => last.class(),
            other => classify_message(&other.to_string()),
        }
    }
}

/// Markers that strongly suggest interference rather than transience.
const BLOCKING_MARKERS: [&str; 4] = ["502", "Bad Gateway", "blocked", "certificate"];

/// Substring classification for errors produced by foreign libraries, where
/// no uniform typed signal exists.
pub fn classify_message(message: &str) -> ErrorClass {
    if BLOCKING_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorClass::Blocking
    } else {
        ErrorClass::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocking_messages_classify_as_blocking() {
        for message in [
            "502 Bad Gateway",
            "blocked by policy",
            "certificate expired",
            "upstream said 502 while proxying",
        ] {
            assert_eq!(
                classify_message(message),
                ErrorClass::Blocking,
                "expected blocking for {message:?}"
            );
        }
    }

    #[test]
    fn transient_messages_classify_as_transient() {
        for message in ["timeout", "connection refused", "dial tcp: no route"] {
            assert_eq!(
                classify_message(message),
                ErrorClass::Transient,
                "expected transient for {message:?}"
            );
        }
    }

    #[test]
    fn gateway_statuses_are_blocking() {
        for status in [502, 503, 504] {
            let err = SendError::CdnGateway {
                status,
                domain: "cdn.example.com".into(),
            };
            assert_eq!(err.class(), ErrorClass::Blocking);
        }
    }

    #[test]
    fn hard_denials_are_fatal() {
        let forbidden = SendError::CdnBlocked {
            domain: "cdn.example.com".into(),
        };
        let missing = SendError::EndpointMissing {
            domain: "cdn.example.com".into(),
        };
        assert_eq!(forbidden.class(), ErrorClass::Fatal);
        assert_eq!(missing.class(), ErrorClass::Fatal);
    }

    #[test]
    fn cancellation_is_surfaced() {
        assert_eq!(SendError::Cancelled.class(), ErrorClass::Cancelled);
    }

    #[test]
    fn ordinary_failures_are_transient() {
        let timeout = SendError::Timeout {
            domain: "cdn.example.com".into(),
            seconds: 8,
        };
        let dns = SendError::DnsExhausted {
            domain: "cdn.example.com".into(),
        };
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert_eq!(dns.class(), ErrorClass::Transient);
        assert_eq!(SendError::NoPeers.class(), ErrorClass::Transient);
    }

    #[test]
    fn wrapped_messages_keep_their_markers() {
        let err = SendError::Other("TLS handshake: certificate unknown".into());
        assert_eq!(err.class(), ErrorClass::Blocking);

        let err = SendError::Dial {
            domain: "cdn.example.com".into(),
            reason: "connection refused".into(),
        };
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn terminal_error_inherits_last_class() {
        let err = SendError::AllTransportsFailed {
            last: Box::new(SendError::CdnGateway {
                status: 502,
                domain: "cdn.example.com".into(),
            }),
        };
        assert_eq!(err.class(), ErrorClass::Blocking);
    }
}
