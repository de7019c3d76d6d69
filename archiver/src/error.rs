//! Centralized error classification and persistence-layer error type.
//!
//! Mirrors `AudioCaptureError::into_backoff` in the TeamSpeak input adapter:
//! one place decides whether a failure is worth retrying, rather than every
//! call site re-deriving that decision from a raw error string.

use std::fmt;

/// Outcome of classifying a raw error message from an adapter.
///
/// Kept as a plain tagged enum (not `backoff::Error`) because the same
/// classification feeds the circuit breaker, the retry loop, and the VOD
/// row's `processing_error` text, not only the backoff crate.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Severity {
    /// The VOD itself is unrecoverable (deleted, DRM'd, unauthorized, bad
    /// url). Retrying will never succeed; stop and record the error.
    Fatal,
    /// Transient: network blip, 5xx, rate limit, a failed fragment. Worth
    /// another attempt after backoff.
    Retryable,
    /// Not recognized by the substring table. Treated conservatively as
    /// [`Severity::Retryable`].
    Unknown,
    /// The attempt was cancelled by an external request (shutdown, admin
    /// action). Also retryable — the VOD stays eligible for the next cycle.
    Cancelled,
}

impl Severity {
    /// Whether this severity should consume a retry attempt and back off.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Fatal)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "fatal",
            Self::Retryable => "retryable",
            Self::Unknown => "unknown",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Substring table used to classify adapter error text into a [`Severity`].
///
/// Order matters: `503` is checked before the generic `"unavailable"` match,
/// since upstream 503 bodies often also contain the word "unavailable".
#[must_use]
pub fn classify(message: &str) -> Severity {
    let lower = message.to_lowercase();

    if lower.contains("cancelled") || lower.contains("canceled") {
        return Severity::Cancelled;
    }

    // Fatal: content gone, DRM, unauthorized, malformed url.
    const FATAL_NEEDLES: &[&str] = &[
        "subscriber-only",
        "video unavailable",
        "invalid url",
        "drm protected",
        "drm-protected",
        "401",
        "403",
        "404",
        "unauthorized",
        "this video is private",
    ];
    for needle in FATAL_NEEDLES {
        if lower.contains(needle) {
            return Severity::Fatal;
        }
    }

    // Retryable: network, 5xx, rate limit, fragment failures.
    const RETRYABLE_NEEDLES: &[&str] = &[
        "connection reset",
        "timeout",
        "timed out",
        "500",
        "502",
        "503",
        "429",
        "fragment",
        "rate limit",
        "temporarily unavailable",
    ];
    for needle in RETRYABLE_NEEDLES {
        if lower.contains(needle) {
            return Severity::Retryable;
        }
    }

    Severity::Unknown
}

/// Error returned by every persistence-layer accessor.
///
/// Kept deliberately small and closed: callers match on it rather than on
/// the underlying [`sqlx::Error`], which they should never need to see.
#[derive(Clone, Debug, thiserror::Error)]
pub enum DbError {
    /// No row matched the lookup.
    #[error("not found")]
    NotFound,

    /// A uniqueness constraint or an atomic state transition lost a race
    /// (e.g. `ClaimForDownload` against an already-claimed row). Normal,
    /// expected traffic — not logged as an error by callers.
    #[error("conflict")]
    Conflict,

    /// Connection loss, serialization failure, or anything else worth
    /// retrying with backoff at the call site.
    #[error("transient database error: {0}")]
    Transient(String),
}

impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => Self::NotFound,
            sqlx::Error::Database(db_err) => {
                // Postgres unique_violation.
                if db_err.code().as_deref() == Some("23505") {
                    Self::Conflict
                } else {
                    Self::Transient(db_err.to_string())
                }
            }
            other => Self::Transient(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_fatal_strings() {
        for s in [
            "subscriber-only",
            "Video Unavailable",
            "invalid url",
            "DRM protected",
            "HTTP 401",
            "error 403",
            "404 not found",
        ] {
            assert_eq!(classify(s), Severity::Fatal, "{s}");
        }
    }

    #[test]
    fn classifies_retryable_strings() {
        for s in [
            "connection reset",
            "timeout",
            "500 internal error",
            "502 bad gateway",
            "503 service unavailable",
            "429 too many requests",
            "fragment 42 failed",
        ] {
            assert_eq!(classify(s), Severity::Retryable, "{s}");
        }
    }

    #[test]
    fn service_unavailable_is_retryable_not_fatal() {
        // "503 ... unavailable" must hit the 503 rule before the generic
        // "unavailable" fatal needle would otherwise apply.
        assert_eq!(
            classify("503 Service Temporarily Unavailable"),
            Severity::Retryable
        );
    }

    #[test]
    fn unknown_falls_back_conservatively() {
        assert_eq!(classify("something weird happened"), Severity::Unknown);
        assert!(Severity::Unknown.is_retryable());
    }

    #[test]
    fn cancelled_is_retryable() {
        assert_eq!(classify("request cancelled by caller"), Severity::Cancelled);
        assert!(Severity::Cancelled.is_retryable());
    }
}
