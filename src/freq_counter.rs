//! 10 MHz frequency counter gated by the reference PPS.
//!
//! The reference-oscillator cycle count latched at each captured edge is
//! differenced against the previous edge. A measurement is published only
//! when the closing edge passed the period gate and a previous latch
//! exists, i.e. after two captured edges bracketing a valid period.

use crate::pps::PpsEdge;
use log::debug;
use serde::Serialize;
use std::collections::VecDeque;

pub const NOMINAL_COUNT: u64 = 10_000_000;
/// Each 10 MHz cycle is 100 ns.
pub const NS_PER_CYCLE: i64 = 100;
pub const SIGNAL_TIMEOUT_US: u64 = 2_000_000;
pub const OFFSET_WINDOW: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrequencyMeasurement {
    pub count: u64,
    /// `count - 10 000 000`
    pub error: i64,
    pub signal_present: bool,
    pub measurement_id: u64,
    pub taken_at_us: u64,
}

impl FrequencyMeasurement {
    /// Fractional frequency error in ppb (1 cycle in 10^7 = 100 ppb).
    pub fn error_ppb(&self) -> f64 {
        self.error as f64 * 100.0
    }

    /// Phase accumulated over the gate, in ns.
    pub fn offset_ns(&self) -> i64 {
        self.error * NS_PER_CYCLE
    }
}

/// Per-reader cursor for the one-shot "new measurement" flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct MeasurementCursor {
    seen_id: u64,
}

#[derive(Debug, Default)]
pub struct FrequencyCounter {
    last_cycles: Option<u64>,
    latest: Option<FrequencyMeasurement>,
    next_id: u64,
}

impl FrequencyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a captured reference edge. Returns the measurement it closed, if any.
    pub fn on_edge(&mut self, edge: &PpsEdge) -> Option<FrequencyMeasurement> {
        let previous = self.last_cycles.replace(edge.cycles_raw);
        if !edge.valid {
            return None;
        }
        let prev = previous?;
        let count = edge.cycles_raw.wrapping_sub(prev);
        self.next_id += 1;
        let m = FrequencyMeasurement {
            count,
            error: count as i64 - NOMINAL_COUNT as i64,
            signal_present: true,
            measurement_id: self.next_id,
            taken_at_us: edge.monotonic_us,
        };
        self.latest = Some(m);
        Some(m)
    }

    /// Drop the gate's opening latch, e.g. after a PPS source switch.
    pub fn restart_gate(&mut self) {
        self.last_cycles = None;
    }

    pub fn latest(&self) -> Option<FrequencyMeasurement> {
        self.latest
    }

    /// One-shot per reader: each measurement is returned once per cursor.
    pub fn take_new(&self, cursor: &mut MeasurementCursor) -> Option<FrequencyMeasurement> {
        let m = self.latest?;
        if m.measurement_id == cursor.seen_id {
            return None;
        }
        cursor.seen_id = m.measurement_id;
        Some(m)
    }

    /// At least one measurement in the last 2 s.
    pub fn signal_present(&self, now_us: u64) -> bool {
        self.latest
            .map_or(false, |m| now_us.saturating_sub(m.taken_at_us) < SIGNAL_TIMEOUT_US)
    }

    pub fn measurement_count(&self) -> u64 {
        self.next_id
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PpsOffsetStats {
    /// Latest GNSS-minus-reference phase, in reference ticks.
    pub offset_ticks: i64,
    /// Least-squares slope over the window, ticks per second.
    pub drift_ticks_per_s: f64,
    pub std_dev_ticks: f64,
    pub samples: usize,
}

/// Phase between the reference PPS and an independent GNSS PPS, measured in
/// reference-clock ticks.
#[derive(Debug, Default)]
pub struct PpsOffsetChannel {
    last_reference_cycles: Option<u64>,
    window: VecDeque<(f64, i64)>,
    latest: Option<i64>,
}

impl PpsOffsetChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_reference_edge(&mut self, cycles: u64) {
        self.last_reference_cycles = Some(cycles);
    }

    /// Record a GNSS edge. The offset is folded into ±half a second.
    pub fn on_gnss_edge(&mut self, cycles: u64, monotonic_us: u64) -> Option<i64> {
        let reference = self.last_reference_cycles?;
        let half = (NOMINAL_COUNT / 2) as i64;
        let mut offset = cycles.wrapping_sub(reference) as i64 % NOMINAL_COUNT as i64;
        if offset > half {
            offset -= NOMINAL_COUNT as i64;
        } else if offset < -half {
            offset += NOMINAL_COUNT as i64;
        }
        if self.window.len() == OFFSET_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back((monotonic_us as f64 / 1e6, offset));
        self.latest = Some(offset);
        debug!("[FreqCounter] GNSS-PPS offset {} ticks", offset);
        Some(offset)
    }

    pub fn stats(&self) -> PpsOffsetStats {
        let n = self.window.len();
        let mut stats = PpsOffsetStats {
            offset_ticks: self.latest.unwrap_or(0),
            samples: n,
            ..Default::default()
        };
        if n < 2 {
            return stats;
        }
        let nf = n as f64;
        let mean_t = self.window.iter().map(|(t, _)| t).sum::<f64>() / nf;
        let mean_y = self.window.iter().map(|(_, y)| *y as f64).sum::<f64>() / nf;
        let mut sxy = 0.0;
        let mut sxx = 0.0;
        let mut syy = 0.0;
        for (t, y) in &self.window {
            let dt = t - mean_t;
            let dy = *y as f64 - mean_y;
            sxy += dt * dy;
            sxx += dt * dt;
            syy += dy * dy;
        }
        if sxx > 0.0 {
            stats.drift_ticks_per_s = sxy / sxx;
        }
        stats.std_dev_ticks = (syy / (nf - 1.0)).sqrt();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pps::PpsSource;

    fn edge(t_us: u64, cycles: u64, valid: bool) -> PpsEdge {
        PpsEdge {
            monotonic_us: t_us,
            cycles_raw: cycles,
            source: PpsSource::Reference,
            valid,
            period_us: Some(1_000_000),
        }
    }

    #[test]
    fn test_first_edge_publishes_nothing() {
        let mut fc = FrequencyCounter::new();
        assert!(fc.on_edge(&edge(0, 0, true)).is_none());
        assert!(fc.latest().is_none());
    }

    #[test]
    fn test_measurement_after_two_edges() {
        let mut fc = FrequencyCounter::new();
        fc.on_edge(&edge(0, 5, true));
        let m = fc.on_edge(&edge(1_000_000, 10_000_012, true)).unwrap();
        assert_eq!(m.count, 10_000_007);
        assert_eq!(m.error, 7);
        assert_eq!(m.offset_ns(), 700);
        assert_eq!(m.error_ppb(), 700.0);
        assert_eq!(m.measurement_id, 1);
    }

    #[test]
    fn test_invalid_edge_publishes_nothing_but_relatches() {
        let mut fc = FrequencyCounter::new();
        fc.on_edge(&edge(0, 0, true));
        assert!(fc.on_edge(&edge(1_050_000, 10_500_000, false)).is_none());
        let m = fc.on_edge(&edge(2_050_000, 20_500_000, true)).unwrap();
        assert_eq!(m.count, NOMINAL_COUNT);
    }

    #[test]
    fn test_counter_wraparound() {
        let mut fc = FrequencyCounter::new();
        fc.on_edge(&edge(0, u64::MAX - 4, true));
        let m = fc.on_edge(&edge(1_000_000, NOMINAL_COUNT - 5, true)).unwrap();
        assert_eq!(m.count, NOMINAL_COUNT);
    }

    #[test]
    fn test_new_flag_is_one_shot_per_reader() {
        let mut fc = FrequencyCounter::new();
        let mut a = MeasurementCursor::default();
        let mut b = MeasurementCursor::default();
        fc.on_edge(&edge(0, 0, true));
        fc.on_edge(&edge(1_000_000, NOMINAL_COUNT, true));
        assert!(fc.take_new(&mut a).is_some());
        assert!(fc.take_new(&mut a).is_none());
        assert!(fc.take_new(&mut b).is_some());
    }

    #[test]
    fn test_signal_presence_decays() {
        let mut fc = FrequencyCounter::new();
        assert!(!fc.signal_present(0));
        fc.on_edge(&edge(0, 0, true));
        fc.on_edge(&edge(1_000_000, NOMINAL_COUNT, true));
        assert!(fc.signal_present(2_999_999));
        assert!(!fc.signal_present(3_000_000));
    }

    #[test]
    fn test_offset_channel_folds_and_regresses() {
        let mut ch = PpsOffsetChannel::new();
        assert!(ch.on_gnss_edge(100, 0).is_none());
        for i in 0..10u64 {
            let ref_cycles = i * NOMINAL_COUNT;
            ch.on_reference_edge(ref_cycles);
            // GNSS edge lags by 50 ticks and drifts 2 ticks per second
            ch.on_gnss_edge(ref_cycles + 50 + 2 * i, i * 1_000_000 + 5);
        }
        let stats = ch.stats();
        assert_eq!(stats.offset_ticks, 68);
        assert_eq!(stats.samples, 10);
        assert!((stats.drift_ticks_per_s - 2.0).abs() < 1e-6);
        assert!(stats.std_dev_ticks > 0.0);
    }

    #[test]
    fn test_offset_channel_negative_phase() {
        let mut ch = PpsOffsetChannel::new();
        ch.on_reference_edge(NOMINAL_COUNT);
        // GNSS edge 30 ticks before the next reference edge
        let off = ch.on_gnss_edge(2 * NOMINAL_COUNT - 30, 0).unwrap();
        assert_eq!(off, -30);
    }
}
