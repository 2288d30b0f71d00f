//! Stats traits.

use std::collections::BTreeMap;

use push_core::Platform;

/// Delivery counters shared by every dispatch worker.
///
/// Increments must be safe to call concurrently; a snapshot is a point-in-time
/// read with no relation to any single batch.
pub trait StatStore: Send + Sync {
    /// Record deliveries accepted onto the dispatch queue.
    fn increment_submitted(&self, n: u64) -> color_eyre::eyre::Result<()>;

    /// Record terminal successes for a platform.
    fn increment_succeeded(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()>;

    /// Record terminal failures for a platform.
    fn increment_failed(&self, platform: Platform, n: u64) -> color_eyre::eyre::Result<()>;

    /// Read all counters.
    fn snapshot(&self) -> color_eyre::eyre::Result<StatsSnapshot>;

    /// Clear all counters. Operator action only.
    fn reset(&self) -> color_eyre::eyre::Result<()>;
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Per-platform breakdown keyed by platform name.
    pub platforms: BTreeMap<String, PlatformStats>,
}

/// Per-platform terminal counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlatformStats {
    pub success: u64,
    pub failure: u64,
}

impl StatsSnapshot {
    /// Counts for one platform, zero if never seen.
    pub fn platform(&self, platform: Platform) -> PlatformStats {
        self.platforms
            .get(platform.name())
            .copied()
            .unwrap_or_default()
    }
}

/// Counter keys shared by persistent engines.
pub(crate) mod keys {
    use push_core::Platform;

    pub const SUBMITTED: &str = "total.submitted";
    pub const SUCCEEDED: &str = "total.succeeded";
    pub const FAILED: &str = "total.failed";

    pub fn success(platform: Platform) -> String {
        format!("{}.success", platform.name())
    }

    pub fn failure(platform: Platform) -> String {
        format!("{}.failure", platform.name())
    }
}
