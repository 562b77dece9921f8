//! Converts decoded status frames into the values reported to consumers.
//!
//! [`derive`] is a pure function of the current sample, an optional earlier
//! sample and the static per-device [`MetricsConfig`]. [`TrendTracker`] decides
//! which earlier sample is used as the anchor for SOC extrapolation.

use crate::config::MetricsConfig;
use crate::protocol::{self, BatteryState, StatusFrame};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const FULL_SOC: u16 = 100;

/// A status frame together with the wall-clock time it was received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub frame: StatusFrame,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(frame: StatusFrame, timestamp: DateTime<Utc>) -> Self {
        Self { frame, timestamp }
    }

    pub fn now(frame: StatusFrame) -> Self {
        Self::new(frame, Utc::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Charging,
    Discharging,
    Idle,
}

impl Direction {
    pub fn of(frame: &StatusFrame) -> Self {
        if is_charging(frame) {
            Direction::Charging
        } else if is_discharging(frame) {
            Direction::Discharging
        } else {
            Direction::Idle
        }
    }
}

/// When the battery is expected to reach `target_soc` at the current SOC rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeEstimate {
    pub target_soc: u16,
    pub reached_at: DateTime<Utc>,
    pub remaining_hours: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DerivedMetrics {
    pub timestamp: DateTime<Utc>,
    pub status: StatusFrame,
    pub total_voltage: f32,
    pub current: f32,
    pub power: f32,
    /// One entry per configured cell, `None` where the BMS reports no reading.
    pub cell_voltages: Vec<Option<f32>>,
    pub min_cell_voltage_mv: Option<u16>,
    pub max_cell_voltage_mv: Option<u16>,
    pub delta_cell_voltage_mv: Option<u16>,
    pub remaining_capacity_ah: f32,
    pub full_capacity_ah: f32,
    pub total_discharge_ah: f32,
    pub protection: Vec<String>,
    pub failures: Vec<String>,
    pub charging: bool,
    pub discharging: bool,
    pub balancing: bool,
    pub balancing_cells: Vec<bool>,
    pub charge_enabled: bool,
    pub discharge_enabled: bool,
    /// `None` whenever the SOC trend does not support an estimate.
    pub estimate: Option<TimeEstimate>,
}

pub fn is_charging(frame: &StatusFrame) -> bool {
    frame.battery_state() == BatteryState::Charging
}

pub fn is_discharging(frame: &StatusFrame) -> bool {
    frame.current_ma < 0 && !frame.discharge_disabled()
}

/// Computes the reported values for `current`.
///
/// `previous` is the trend anchor used for the time estimate; without it the
/// estimate is unavailable.
pub fn derive(
    current: &Sample,
    previous: Option<&Sample>,
    config: &MetricsConfig,
) -> DerivedMetrics {
    let frame = &current.frame;
    let n_cells = config.effective_cell_count();

    let present: Vec<u16> = frame.cell_voltages_mv[..n_cells]
        .iter()
        .copied()
        .filter(|&mv| mv != 0)
        .collect();
    let min_cell_voltage_mv = present.iter().copied().min();
    let max_cell_voltage_mv = present.iter().copied().max();
    let delta_cell_voltage_mv = min_cell_voltage_mv
        .zip(max_cell_voltage_mv)
        .map(|(min, max)| max - min);

    let total_voltage = frame.total_voltage_mv as f32 / 1000.0;
    let current_a = frame.current_ma as f32 / 1000.0;

    DerivedMetrics {
        timestamp: current.timestamp,
        status: frame.clone(),
        total_voltage,
        current: current_a,
        power: total_voltage * current_a,
        cell_voltages: frame.cell_voltages_mv[..n_cells]
            .iter()
            .map(|&mv| (mv != 0).then(|| mv as f32 / 1000.0))
            .collect(),
        min_cell_voltage_mv,
        max_cell_voltage_mv,
        delta_cell_voltage_mv,
        remaining_capacity_ah: frame.remaining_capacity_cah as f32 / 100.0,
        full_capacity_ah: frame.full_capacity_cah as f32 / 100.0,
        total_discharge_ah: frame.total_discharge_mah as f32 / 1000.0,
        protection: protocol::decode_protection_flags(frame.protection_flags),
        failures: protocol::decode_failure_flags(frame.failure_flags),
        charging: is_charging(frame),
        discharging: is_discharging(frame),
        balancing: frame.balancing_flags != 0,
        balancing_cells: frame.balancing_cells(n_cells),
        charge_enabled: frame.battery_state() != BatteryState::ChargeDisabled,
        discharge_enabled: !frame.discharge_disabled(),
        estimate: estimate(current, previous, config),
    }
}

/// Linear SOC extrapolation towards the target SOC (discharging) or 100% (charging).
pub fn estimate(
    current: &Sample,
    previous: Option<&Sample>,
    config: &MetricsConfig,
) -> Option<TimeEstimate> {
    let previous = previous?;
    let elapsed_s = (current.timestamp - previous.timestamp).num_milliseconds() as f64 / 1000.0;
    if elapsed_s <= 0.0 {
        return None;
    }

    let soc = current.frame.soc_percent;
    let delta = soc as f64 - previous.frame.soc_percent as f64;
    if delta == 0.0 || delta.abs() < config.min_soc_delta as f64 {
        log::trace!("SOC delta {delta} over {elapsed_s}s below detection threshold");
        return None;
    }

    let (target_soc, distance) = match Direction::of(&current.frame) {
        Direction::Discharging if delta < 0.0 => {
            (config.target_soc, soc.saturating_sub(config.target_soc))
        }
        Direction::Charging if delta > 0.0 => (FULL_SOC, FULL_SOC.saturating_sub(soc)),
        _ => return None,
    };
    // distance / (|delta| / elapsed)
    let seconds = distance as f64 * elapsed_s / delta.abs();

    let reached_at =
        current.timestamp + chrono::Duration::milliseconds((seconds * 1000.0).round() as i64);
    Some(TimeEstimate {
        target_soc,
        reached_at,
        remaining_hours: seconds / 3600.0,
    })
}

/// Keeps the first sample of the current charge/discharge trend.
#[derive(Debug, Default)]
pub struct TrendTracker {
    anchor: Option<Sample>,
}

impl TrendTracker {
    /// Derives metrics for `sample`, moving the anchor when the trend broke.
    pub fn observe(&mut self, sample: Sample, config: &MetricsConfig) -> DerivedMetrics {
        if let Some(anchor) = &self.anchor {
            if Self::trend_broken(anchor, &sample, config) {
                log::debug!(
                    "SOC trend restarted at {}% ({:?})",
                    sample.frame.soc_percent,
                    Direction::of(&sample.frame)
                );
                self.anchor = None;
            }
        }
        let metrics = derive(&sample, self.anchor.as_ref(), config);
        if self.anchor.is_none() {
            self.anchor = Some(sample);
        }
        metrics
    }

    pub fn anchor(&self) -> Option<&Sample> {
        self.anchor.as_ref()
    }

    pub fn reset(&mut self) {
        self.anchor = None;
    }

    fn trend_broken(anchor: &Sample, sample: &Sample, config: &MetricsConfig) -> bool {
        let direction = Direction::of(&sample.frame);
        if direction != Direction::of(&anchor.frame) {
            return true;
        }
        let age = sample.timestamp - anchor.timestamp;
        if age.to_std().map_or(true, |age| age > config.trend_window) {
            return true;
        }
        match direction {
            Direction::Discharging => sample.frame.soc_percent > anchor.frame.soc_percent,
            Direction::Charging => sample.frame.soc_percent < anchor.frame.soc_percent,
            Direction::Idle => false,
        }
    }
}
