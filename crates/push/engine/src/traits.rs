//! Engine traits.

use push_core::{Batch, Summary};
use push_stats::StatsSnapshot;

use crate::{AdmissionError, QueueStatus};

/// Entry point consumed by the transport layer.
#[trait_variant::make(Send)]
pub trait Dispatch: Send + Sync {
    /// Admit, queue and (in synchronous mode) await a batch.
    async fn queue_notification(&self, batch: Batch) -> Result<Summary, AdmissionError>;

    /// Current queue capacity and usage.
    fn queue_status(&self) -> QueueStatus;

    /// Process-wide delivery counters.
    fn stats(&self) -> color_eyre::eyre::Result<StatsSnapshot>;
}
