//! Shared error taxonomy for GitHub-facing components (C4–C10).
//!
//! `sipag-core`'s `GhCliGateway` collapses every `gh` failure into a single
//! `anyhow::Error` with a formatted message (`worker/github_gateway.rs`'s
//! `run_gh`) because its only caller logs and moves on. Here the writeback
//! engine and label coordinator branch on *kind of* failure, so the classification has to be a real enum, not a string.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// A GitHub REST or GraphQL call failed. Carries enough of the response to
/// classify the failure without a second round trip.
#[derive(Debug, Error, Clone)]
#[error("github api error: status={status} code={code:?}")]
pub struct GitHubApiError {
    pub status: u16,
    pub code: ErrorKind,
    pub response_text: String,
    /// `x-ratelimit-reset`, when the response carried one.
    pub rate_limit_reset: Option<DateTime<Utc>>,
}

/// Coarse classification used by callers to decide whether to retry, back
/// off, or surface to an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 422 with a body matching `label.*does not exist`.
    MissingLabel,
    /// 429, or a body containing a secondary-rate-limit marker.
    Transient,
    /// 401/403/404.
    Auth,
    Unknown,
}

impl GitHubApiError {
    pub fn classify(status: u16, body: &str) -> ErrorKind {
        let lower = body.to_lowercase();
        if status == 422 && lower.contains("label") && lower.contains("does not exist") {
            return ErrorKind::MissingLabel;
        }
        if status == 429 || is_secondary_rate_limit(&lower) {
            return ErrorKind::Transient;
        }
        if matches!(status, 401 | 403 | 404) {
            return ErrorKind::Auth;
        }
        ErrorKind::Unknown
    }

    pub fn new(status: u16, body: String) -> Self {
        let code = Self::classify(status, &body);
        Self { status, code, response_text: body, rate_limit_reset: None }
    }

    pub fn with_rate_limit_reset(mut self, reset: Option<DateTime<Utc>>) -> Self {
        self.rate_limit_reset = reset;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.code == ErrorKind::Transient
    }
}

/// Secondary rate limits surface as a 403/200 with one of these phrases in
/// the body rather than a dedicated status code.
fn is_secondary_rate_limit(lower_body: &str) -> bool {
    lower_body.contains("secondary rate limit")
        || lower_body.contains("abuse detection")
        || lower_body.contains("temporarily blocked")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_label_from_422_body() {
        let kind = GitHubApiError::classify(422, "Validation Failed: label \"ralph:status:queued\" does not exist");
        assert_eq!(kind, ErrorKind::MissingLabel);
    }

    #[test]
    fn classifies_secondary_rate_limit_as_transient_regardless_of_status() {
        assert_eq!(
            GitHubApiError::classify(403, "You have exceeded a secondary rate limit"),
            ErrorKind::Transient
        );
        assert_eq!(GitHubApiError::classify(429, "rate limited"), ErrorKind::Transient);
    }

    #[test]
    fn classifies_auth_statuses() {
        for status in [401, 403, 404] {
            assert_eq!(GitHubApiError::classify(status, "nope"), ErrorKind::Auth);
        }
    }

    #[test]
    fn unclassified_status_is_unknown() {
        assert_eq!(GitHubApiError::classify(500, "boom"), ErrorKind::Unknown);
    }
}
