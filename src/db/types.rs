use serde::{Deserialize, Serialize};
use sqlx::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "submissionstatus", rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Extracting,
    Scoring,
    Completed,
    Failed,
}

impl SubmissionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Extracting => "extracting",
            Self::Scoring => "scoring",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, Self::Pending | Self::Extracting | Self::Scoring)
    }
}

/// Why a submission ended up `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "failurekind", rename_all = "snake_case")]
pub enum FailureKind {
    Unreadable,
    Unsupported,
    TooLarge,
    Corrupt,
    Timeout,
    RateLimited,
    MalformedResponse,
    ProviderUnavailable,
    DocumentUnavailable,
    Cancelled,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unreadable => "unreadable",
            Self::Unsupported => "unsupported",
            Self::TooLarge => "too_large",
            Self::Corrupt => "corrupt",
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::MalformedResponse => "malformed_response",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::DocumentUnavailable => "document_unavailable",
            Self::Cancelled => "cancelled",
        }
    }

    /// Transient failures may be retried while attempts remain; garbage
    /// input and explicit cancellation never improve on retry.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::RateLimited
                | Self::MalformedResponse
                | Self::ProviderUnavailable
                | Self::DocumentUnavailable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Completed,
    PartiallyFailed,
    Failed,
}
