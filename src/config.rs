//! Tunables for the session, the poll loop and the derived metrics.
//!
//! Every struct deserializes with per-field defaults, so a configuration file
//! only has to name the values it changes.

use crate::protocol::MAX_CELLS;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Deadlines applied to every suspension point of a [`crate::session::ConnectionSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub write_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            write_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Number of physically present cells. Cell slots beyond it are ignored.
    pub cell_count: usize,
    /// SOC in % the discharge estimate counts down to.
    pub target_soc: u16,
    /// Smallest SOC change in % treated as a real trend rather than noise.
    pub min_soc_delta: u16,
    /// Maximum age of the trend anchor before it is replaced.
    #[serde(with = "humantime_serde")]
    pub trend_window: Duration,
}

impl MetricsConfig {
    pub fn with_cell_count(mut self, cell_count: usize) -> Self {
        self.cell_count = cell_count;
        self
    }

    /// The cell count clamped to what the status frame can carry.
    pub fn effective_cell_count(&self) -> usize {
        if self.cell_count == 0 || self.cell_count > MAX_CELLS {
            MAX_CELLS
        } else {
            self.cell_count
        }
    }

    /// Clamps the cell count, warning once if it was out of range.
    pub fn validated(mut self) -> Self {
        let cell_count = self.effective_cell_count();
        if cell_count != self.cell_count {
            log::warn!(
                "cell count {} out of range 1..={MAX_CELLS}, using {MAX_CELLS}",
                self.cell_count
            );
            self.cell_count = cell_count;
        }
        self
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            cell_count: MAX_CELLS,
            target_soc: 15,
            min_soc_delta: 1,
            trend_window: Duration::from_secs(2 * 60 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    /// Time between two poll cycles. Also the retry cadence after failures.
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Consecutive timeouts/transport errors after which the link is torn down and rebuilt.
    pub reconnect_threshold: u32,
    /// Consecutive unsuccessful cycles after which the device is reported offline.
    pub offline_threshold: u32,
    pub session: SessionConfig,
    pub metrics: MetricsConfig,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            reconnect_threshold: 3,
            offline_threshold: 3,
            session: SessionConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PollConfig::default();
        assert_eq!(config.interval, Duration::from_secs(30));
        assert_eq!(config.metrics.target_soc, 15);
        assert_eq!(config.metrics.effective_cell_count(), 16);
    }

    #[test]
    fn test_effective_cell_count() {
        let config = MetricsConfig::default();
        assert_eq!(config.clone().with_cell_count(4).effective_cell_count(), 4);
        assert_eq!(config.clone().with_cell_count(0).effective_cell_count(), 16);
        assert_eq!(config.with_cell_count(17).effective_cell_count(), 16);
    }

    #[test]
    fn test_validated_clamps_cell_count() {
        let config = MetricsConfig::default();
        assert_eq!(config.clone().with_cell_count(0).validated().cell_count, 16);
        assert_eq!(config.clone().with_cell_count(40).validated().cell_count, 16);
        assert_eq!(config.with_cell_count(4).validated().cell_count, 4);
    }
}
