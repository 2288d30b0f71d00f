//! Batch admission checks.

use push_core::Batch;

/// Why a batch was not queued. No rejection touches stats.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("Notifications field is empty.")]
    Empty,
    #[error("Number of notifications({count}) over limit({limit})")]
    OverLimit { count: usize, limit: usize },
    #[error("Notification {index} has no tokens.")]
    MissingTokens { index: usize },
    #[error("Malformed request: {0}")]
    Malformed(String),
    #[error("Dispatch queue is full.")]
    QueueFull,
    #[error("Dispatch engine is shutting down.")]
    ShuttingDown,
}

impl AdmissionError {
    /// Wrap a request decoding failure.
    pub fn malformed(error: impl std::fmt::Display) -> Self {
        Self::Malformed(error.to_string())
    }
}

/// Validates a batch against configured limits before it reaches the queue.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
    max_notification: usize,
}

impl Admission {
    pub fn new(max_notification: usize) -> Self {
        Self { max_notification }
    }

    /// Check a batch. Pure: the same batch always gets the same answer.
    pub fn check(&self, batch: &Batch) -> Result<(), AdmissionError> {
        if batch.is_empty() {
            return Err(AdmissionError::Empty);
        }

        if batch.len() > self.max_notification {
            return Err(AdmissionError::OverLimit {
                count: batch.len(),
                limit: self.max_notification,
            });
        }

        if let Some(index) = batch.notifications.iter().position(|n| n.tokens.is_empty()) {
            return Err(AdmissionError::MissingTokens { index });
        }

        Ok(())
    }
}
