//! Delivery outcomes and caller-facing results.

use crate::Platform;

/// Why a delivery attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error("request timed out")]
    Timeout,
    #[error("no provider registered for {0}")]
    UnknownPlatform(Platform),
    #[error("gave up after {attempts} attempts: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<FailureReason>,
    },
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("invalid device token: {0}")]
    InvalidToken(String),
    #[error("payload rejected: {0}")]
    PayloadRejected(String),
    #[error("credentials rejected: {0}")]
    Unauthorized(String),
    #[error("rate limited by provider")]
    RateLimited,
    #[error("provider unavailable: {0}")]
    Unavailable(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("delivery cancelled")]
    Cancelled,
    #[error("dropped at shutdown")]
    Shutdown,
}

/// Classified result of one delivery attempt for one token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    RetryableFailure { reason: FailureReason },
    PermanentFailure { reason: FailureReason },
}

impl DeliveryOutcome {
    pub fn retryable(reason: FailureReason) -> Self {
        Self::RetryableFailure { reason }
    }

    pub fn permanent(reason: FailureReason) -> Self {
        Self::PermanentFailure { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Failure reason, if this is a failure.
    pub fn reason(&self) -> Option<&FailureReason> {
        match self {
            Self::Success => None,
            Self::RetryableFailure { reason } | Self::PermanentFailure { reason } => Some(reason),
        }
    }
}

/// Terminal status of a (notification, token) delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failure,
}

/// Caller-visible record of one terminal delivery.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Position of the notification in the submitted batch.
    pub notification_index: usize,
    pub platform: Platform,
    pub token: String,
    pub status: LogStatus,
    /// Failure description, absent on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Number of provider attempts made for this token.
    pub attempts: u32,
}

impl LogEntry {
    /// Build a log entry from a terminal outcome.
    pub fn new(
        notification_index: usize,
        platform: Platform,
        token: impl Into<String>,
        outcome: &DeliveryOutcome,
        attempts: u32,
    ) -> Self {
        Self {
            notification_index,
            platform,
            token: token.into(),
            status: if outcome.is_success() {
                LogStatus::Success
            } else {
                LogStatus::Failure
            },
            error: outcome.reason().map(ToString::to_string),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == LogStatus::Success
    }
}

/// Success/failure totals for a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Counts {
    pub success: u64,
    pub failure: u64,
}

impl Counts {
    /// Count the terminal statuses in `logs`.
    pub fn tally(logs: &[LogEntry]) -> Self {
        logs.iter().fold(Self::default(), |mut counts, entry| {
            if entry.is_success() {
                counts.success += 1;
            } else {
                counts.failure += 1;
            }
            counts
        })
    }

    pub fn total(&self) -> u64 {
        self.success + self.failure
    }
}

/// What the engine hands back for an accepted batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub counts: Counts,
    /// One entry per token, in submission order. Empty when dispatch is asynchronous.
    pub logs: Vec<LogEntry>,
    /// Number of token deliveries queued for this batch.
    pub queued: usize,
}
