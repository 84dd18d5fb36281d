//! 1 PPS edge capture.
//!
//! Each rising edge is stamped with the monotonic microsecond clock and the
//! reference-oscillator cycle count latched at the same instant. The period
//! since the previous edge gates validity: only edges 1 s ± 100 µs after
//! their predecessor are accepted. Rejected edges still become the baseline
//! for the next period, so a single stray pulse costs exactly one edge.

use crate::error::CoreError;
use log::trace;
use serde::Serialize;

pub const NOMINAL_PERIOD_US: u64 = 1_000_000;
pub const PERIOD_TOLERANCE_US: u64 = 100;
pub const PPS_TIMEOUT_US: u64 = 2_000_000;
pub const EDGE_HISTORY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PpsSource {
    Reference,
    Gnss,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PpsEdge {
    pub monotonic_us: u64,
    pub cycles_raw: u64,
    pub source: PpsSource,
    pub valid: bool,
    /// Measured period from the previous edge; `None` for the first edge
    /// after start or a re-base.
    pub period_us: Option<u64>,
}

impl PpsEdge {
    /// `Err` for a rejected edge, carrying the offending period.
    pub fn check(&self) -> Result<(), CoreError> {
        match self.period_us {
            Some(period_us) if !self.valid => Err(CoreError::OutOfWindowEdge { period_us }),
            _ => Ok(()),
        }
    }
}

/// True when `period_us` lies in [999 900, 1 000 100].
pub fn period_in_window(period_us: u64) -> bool {
    period_us.abs_diff(NOMINAL_PERIOD_US) <= PERIOD_TOLERANCE_US
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PpsCounters {
    pub edge_count: u64,
    pub valid_count: u64,
    pub invalid_count: u64,
}

/// Capture state for one PPS input.
#[derive(Debug)]
pub struct PpsCapture {
    source: PpsSource,
    last_edge_us: Option<u64>,
    period_error_ns: i64,
    counters: PpsCounters,
    history: [u64; EDGE_HISTORY],
    head: usize,
    filled: usize,
}

impl PpsCapture {
    pub fn new(source: PpsSource) -> Self {
        PpsCapture {
            source,
            last_edge_us: None,
            period_error_ns: 0,
            counters: PpsCounters::default(),
            history: [0; EDGE_HISTORY],
            head: 0,
            filled: 0,
        }
    }

    /// Interrupt-context edge handler. Bounded work, no allocation.
    pub fn on_edge(&mut self, monotonic_us: u64, cycles_raw: u64) -> PpsEdge {
        let period_us = self.last_edge_us.map(|prev| monotonic_us.saturating_sub(prev));
        let valid = period_us.map_or(true, period_in_window);

        self.counters.edge_count += 1;
        if valid {
            self.counters.valid_count += 1;
        } else {
            self.counters.invalid_count += 1;
        }
        if let Some(p) = period_us {
            self.period_error_ns = (p as i64 - NOMINAL_PERIOD_US as i64) * 1_000;
        }
        self.last_edge_us = Some(monotonic_us);

        self.history[self.head] = monotonic_us;
        self.head = (self.head + 1) % EDGE_HISTORY;
        self.filled = (self.filled + 1).min(EDGE_HISTORY);

        trace!("[PPS] {:?} edge at {} µs period {:?} valid={}", self.source, monotonic_us, period_us, valid);

        PpsEdge {
            monotonic_us,
            cycles_raw,
            source: self.source,
            valid,
            period_us,
        }
    }

    /// Forget the previous edge: the next one is judged as a first edge.
    /// History is cleared too, since periods across a re-base are meaningless.
    pub fn rebase(&mut self, source: PpsSource) {
        self.source = source;
        self.last_edge_us = None;
        self.head = 0;
        self.filled = 0;
    }

    pub fn source(&self) -> PpsSource {
        self.source
    }

    pub fn last_edge_us(&self) -> Option<u64> {
        self.last_edge_us
    }

    pub fn edge_count(&self) -> u64 {
        self.counters.edge_count
    }

    pub fn valid_count(&self) -> u64 {
        self.counters.valid_count
    }

    pub fn invalid_count(&self) -> u64 {
        self.counters.invalid_count
    }

    pub fn counters(&self) -> PpsCounters {
        self.counters
    }

    /// Deviation of the last measured period from 1 s.
    pub fn period_error_ns(&self) -> i64 {
        self.period_error_ns
    }

    /// Last edge younger than 2 s.
    pub fn is_pps_valid(&self, now_us: u64) -> bool {
        self.last_edge_us
            .map_or(false, |last| now_us.saturating_sub(last) < PPS_TIMEOUT_US)
    }

    /// Edge timestamps, oldest first.
    pub fn history(&self) -> Vec<u64> {
        let start = (self.head + EDGE_HISTORY - self.filled) % EDGE_HISTORY;
        (0..self.filled)
            .map(|i| self.history[(start + i) % EDGE_HISTORY])
            .collect()
    }

    /// Standard deviation of the inter-edge period over the history ring, in
    /// ns. Periods outside the acceptance window are left out.
    pub fn jitter_ns(&self) -> Option<f64> {
        let edges = self.history();
        let periods: Vec<f64> = edges
            .windows(2)
            .map(|w| w[1].saturating_sub(w[0]))
            .filter(|p| period_in_window(*p))
            .map(|p| p as f64 * 1_000.0)
            .collect();
        if periods.len() < 2 {
            return None;
        }
        let n = periods.len() as f64;
        let mean = periods.iter().sum::<f64>() / n;
        let var = periods.iter().map(|p| (p - mean).powi(2)).sum::<f64>() / (n - 1.0);
        Some(var.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_window_bounds() {
        assert!(period_in_window(999_900));
        assert!(period_in_window(1_000_100));
        assert!(!period_in_window(999_899));
        assert!(!period_in_window(1_000_101));
    }

    #[test]
    fn test_first_edge_is_accepted() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        let edge = cap.on_edge(5_000, 0);
        assert!(edge.valid);
        assert_eq!(edge.period_us, None);
        assert_eq!(cap.valid_count(), 1);
    }

    #[test]
    fn test_jitter_pulse_rejected_then_resumes() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        let mut t = 0;
        let mut verdicts = vec![cap.on_edge(t, 0).valid];
        for period in [1_000_000, 1_000_000, 1_050_000, 1_000_000] {
            t += period;
            verdicts.push(cap.on_edge(t, 0).valid);
        }
        assert_eq!(verdicts, vec![true, true, true, false, true]);
        assert_eq!(cap.invalid_count(), 1);
        let stray = cap.on_edge(t + 1_050_000, 0);
        assert_eq!(stray.check(), Err(CoreError::OutOfWindowEdge { period_us: 1_050_000 }));
        assert_eq!(cap.on_edge(t + 2_050_000, 0).check(), Ok(()));
        assert_eq!(cap.valid_count(), 5);
        assert_eq!(cap.invalid_count(), 2);
        assert_eq!(cap.edge_count(), 7);
    }

    #[test]
    fn test_period_error_reported_in_ns() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        cap.on_edge(0, 0);
        cap.on_edge(1_000_042, 0);
        assert_eq!(cap.period_error_ns(), 42_000);
    }

    #[test]
    fn test_validity_decays_after_two_seconds() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        assert!(!cap.is_pps_valid(0));
        cap.on_edge(10_000_000, 0);
        assert!(cap.is_pps_valid(11_999_999));
        assert!(!cap.is_pps_valid(12_000_000));
    }

    #[test]
    fn test_history_ring_keeps_last_64() {
        let mut cap = PpsCapture::new(PpsSource::Internal);
        for i in 0..100u64 {
            cap.on_edge(i * NOMINAL_PERIOD_US, 0);
        }
        let hist = cap.history();
        assert_eq!(hist.len(), EDGE_HISTORY);
        assert_eq!(hist[0], 36 * NOMINAL_PERIOD_US);
        assert_eq!(*hist.last().unwrap(), 99 * NOMINAL_PERIOD_US);
    }

    #[test]
    fn test_jitter_of_perfect_pps_is_zero() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        for i in 0..10u64 {
            cap.on_edge(i * NOMINAL_PERIOD_US, 0);
        }
        assert_eq!(cap.jitter_ns(), Some(0.0));
    }

    #[test]
    fn test_random_trace_counts_balance() {
        let mut rng = rand::rng();
        let mut cap = PpsCapture::new(PpsSource::Reference);
        let mut t = 0u64;
        let mut expected_invalid = 0;
        cap.on_edge(t, 0);
        for _ in 0..500 {
            let period: u64 = rng.random_range(999_700..=1_000_300);
            if !period_in_window(period) {
                expected_invalid += 1;
            }
            t += period;
            cap.on_edge(t, 0);
        }
        assert_eq!(cap.invalid_count(), expected_invalid);
        assert_eq!(cap.valid_count() + cap.invalid_count(), cap.edge_count());
        let jitter = cap.jitter_ns().unwrap();
        assert!(jitter > 0.0 && jitter < 100_000.0);
    }

    #[test]
    fn test_rebase_forgets_baseline() {
        let mut cap = PpsCapture::new(PpsSource::Reference);
        cap.on_edge(0, 0);
        cap.rebase(PpsSource::Internal);
        let edge = cap.on_edge(300_000, 0);
        assert!(edge.valid);
        assert_eq!(edge.source, PpsSource::Internal);
        assert!(cap.history().len() == 1);
    }
}
