//! Execution lanes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

/// Which worker pool a tool runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Lane {
    /// Network blocked; cheap file and shell operations
    NoNet,
    /// Network allowed
    Net,
    /// Long-running builds and validation; one at a time
    Heavy,
}

impl Lane {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::NoNet => "no-net",
            Lane::Net => "net",
            Lane::Heavy => "heavy",
        }
    }

    pub fn allows_network(&self) -> bool {
        matches!(self, Lane::Net | Lane::Heavy)
    }

    /// Default concurrent jobs per lane.
    pub fn default_concurrency(&self) -> usize {
        match self {
            Lane::NoNet => 10,
            Lane::Net => 5,
            Lane::Heavy => 1,
        }
    }

    /// Default per-job timeout.
    pub fn default_timeout_ms(&self) -> u64 {
        match self {
            Lane::NoNet => 30_000,
            Lane::Net => 60_000,
            Lane::Heavy => 600_000,
        }
    }
}

/// Semaphore-bounded worker pools, one per lane.
pub struct LanePools {
    no_net: Arc<Semaphore>,
    net: Arc<Semaphore>,
    heavy: Arc<Semaphore>,
}

impl LanePools {
    pub fn new(no_net: usize, net: usize, heavy: usize) -> Self {
        Self {
            no_net: Arc::new(Semaphore::new(no_net)),
            net: Arc::new(Semaphore::new(net)),
            heavy: Arc::new(Semaphore::new(heavy)),
        }
    }

    fn semaphore(&self, lane: Lane) -> &Arc<Semaphore> {
        match lane {
            Lane::NoNet => &self.no_net,
            Lane::Net => &self.net,
            Lane::Heavy => &self.heavy,
        }
    }

    /// Wait for a slot in the lane.
    pub async fn acquire(&self, lane: Lane) -> SemaphorePermit<'_> {
        self.semaphore(lane)
            .acquire()
            .await
            .expect("lane semaphore never closed")
    }

    /// Free slots right now (for telemetry).
    pub fn available(&self, lane: Lane) -> usize {
        self.semaphore(lane).available_permits()
    }
}

impl Default for LanePools {
    fn default() -> Self {
        Self::new(
            Lane::NoNet.default_concurrency(),
            Lane::Net.default_concurrency(),
            Lane::Heavy.default_concurrency(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lane_strings() {
        assert_eq!(Lane::NoNet.as_str(), "no-net");
        assert_eq!(Lane::Net.as_str(), "net");
        assert_eq!(Lane::Heavy.as_str(), "heavy");
    }

    #[test]
    fn test_network_policy() {
        assert!(!Lane::NoNet.allows_network());
        assert!(Lane::Net.allows_network());
        assert!(Lane::Heavy.allows_network());
    }

    #[test]
    fn test_defaults_match_contract() {
        assert_eq!(Lane::NoNet.default_concurrency(), 10);
        assert_eq!(Lane::Net.default_concurrency(), 5);
        assert_eq!(Lane::Heavy.default_concurrency(), 1);
        assert_eq!(Lane::NoNet.default_timeout_ms(), 30_000);
        assert_eq!(Lane::Net.default_timeout_ms(), 60_000);
        assert_eq!(Lane::Heavy.default_timeout_ms(), 600_000);
    }

    #[tokio::test]
    async fn test_heavy_lane_serializes() {
        let pools = LanePools::new(2, 2, 1);
        let first = pools.acquire(Lane::Heavy).await;
        assert_eq!(pools.available(Lane::Heavy), 0);
        drop(first);
        assert_eq!(pools.available(Lane::Heavy), 1);
    }

    #[test]
    fn test_serde_kebab() {
        assert_eq!(serde_json::to_string(&Lane::NoNet).unwrap(), "\"no-net\"");
        assert_eq!(serde_json::from_str::<Lane>("\"heavy\"").unwrap(), Lane::Heavy);
    }
}
