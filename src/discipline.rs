use crate::error::CoreError;
use log::{debug, info};
use serde::Serialize;
use std::collections::VecDeque;

pub const DEFAULT_KP: f64 = 0.7;
pub const DEFAULT_KI: f64 = 0.3;
pub const TAU_FAST: u32 = 64;
pub const TAU_SLOW: u32 = 1024;

/// Integral clamp, ppb.
pub const MAX_INTEGRAL_PPB: f64 = 100.0;
pub const LOCK_THRESHOLD_NS: i64 = 1_000;
pub const UNLOCK_THRESHOLD_NS: i64 = 10_000;
pub const LOCK_STREAK: u32 = 60;
pub const HISTORY_LEN: usize = 128;
/// Phase samples kept for the Allan estimator; τ = 100 needs 201.
pub const ALLAN_LEN: usize = 256;
const EMA_ALPHA: f64 = 0.01;
const MAX_DT_S: f64 = 10.0;
const MAX_GAIN: f64 = 10.0;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OffsetStats {
    pub min_ns: i64,
    pub max_ns: i64,
    pub mean_ns: f64,
    pub samples: u64,
}

/// Overlapping Allan deviation at τ = 1, 10 and 100 samples, computed over
/// the last [`ALLAN_LEN`] offsets. `None` until enough samples exist
/// (3, 21 and 201 respectively).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AllanDeviation {
    pub tau_1: Option<f64>,
    pub tau_10: Option<f64>,
    pub tau_100: Option<f64>,
}

/// PI frequency discipline.
///
/// Offsets are in ns, corrections in ppb; `kp · offset_ns` is already ppb,
/// so no intermediate conversion to seconds is needed.
#[derive(Debug)]
pub struct Discipline {
    default_kp: f64,
    default_ki: f64,
    kp: f64,
    ki: f64,
    tau_fast: u32,
    tau_slow: u32,
    tau: u32,
    integral_ppb: f64,
    last_offset_ns: i64,
    correction_ppb: f64,
    lock_streak: u32,
    locked: bool,
    last_update_us: Option<u64>,
    history: [i64; HISTORY_LEN],
    head: usize,
    filled: usize,
    allan_phase: VecDeque<i64>,
    stats: OffsetStats,
}

impl Default for Discipline {
    fn default() -> Self {
        Self::new(DEFAULT_KP, DEFAULT_KI, TAU_FAST, TAU_SLOW)
    }
}

impl Discipline {
    pub fn new(kp: f64, ki: f64, tau_fast: u32, tau_slow: u32) -> Self {
        Discipline {
            default_kp: kp,
            default_ki: ki,
            kp,
            ki,
            tau_fast,
            tau_slow,
            tau: tau_fast,
            integral_ppb: 0.0,
            last_offset_ns: 0,
            correction_ppb: 0.0,
            lock_streak: 0,
            locked: false,
            last_update_us: None,
            history: [0; HISTORY_LEN],
            head: 0,
            filled: 0,
            allan_phase: VecDeque::with_capacity(ALLAN_LEN),
            stats: OffsetStats::default(),
        }
    }

    /// Feed one offset sample. Returns the cumulative correction in ppb.
    pub fn update(&mut self, offset_ns: i64, now_us: u64) -> f64 {
        let dt = self
            .last_update_us
            .map(|last| now_us.saturating_sub(last) as f64 / 1e6)
            .filter(|dt| *dt > 0.0 && *dt <= MAX_DT_S)
            .unwrap_or(1.0);
        self.last_update_us = Some(now_us);

        let p_ppb = self.kp * offset_ns as f64;
        self.integral_ppb = (self.integral_ppb + self.ki * offset_ns as f64 * dt)
            .clamp(-MAX_INTEGRAL_PPB, MAX_INTEGRAL_PPB);
        self.correction_ppb = p_ppb + self.integral_ppb;
        self.last_offset_ns = offset_ns;

        let magnitude = offset_ns.abs();
        if magnitude < LOCK_THRESHOLD_NS {
            self.lock_streak = self.lock_streak.saturating_add(1);
            if !self.locked && self.lock_streak >= LOCK_STREAK {
                self.locked = true;
                self.kp = self.default_kp / 2.0;
                self.ki = self.default_ki / 2.0;
                self.tau = self.tau_slow;
                info!("[Discipline] Locked after {} samples (tau {})", self.lock_streak, self.tau);
            }
        } else if magnitude > UNLOCK_THRESHOLD_NS {
            if self.locked {
                info!("[Discipline] Lock lost: offset {} ns", offset_ns);
            }
            self.unlock();
        } else {
            self.lock_streak = 0;
        }

        self.record(offset_ns);

        debug!(
            "[Discipline] Offset={}ns dt={:.3}s P={:.3} I={:.3} Corr={:.3}ppb",
            offset_ns, dt, p_ppb, self.integral_ppb, self.correction_ppb
        );
        self.correction_ppb
    }

    fn record(&mut self, offset_ns: i64) {
        self.history[self.head] = offset_ns;
        self.head = (self.head + 1) % HISTORY_LEN;
        self.filled = (self.filled + 1).min(HISTORY_LEN);
        if self.allan_phase.len() == ALLAN_LEN {
            self.allan_phase.pop_front();
        }
        self.allan_phase.push_back(offset_ns);

        let s = &mut self.stats;
        if s.samples == 0 {
            s.min_ns = offset_ns;
            s.max_ns = offset_ns;
            s.mean_ns = offset_ns as f64;
        } else {
            s.min_ns = s.min_ns.min(offset_ns);
            s.max_ns = s.max_ns.max(offset_ns);
            s.mean_ns += EMA_ALPHA * (offset_ns as f64 - s.mean_ns);
        }
        s.samples += 1;
    }

    /// Drop lock and restore default gains. The integral (frequency
    /// estimate) is kept.
    pub fn unlock(&mut self) {
        self.locked = false;
        self.lock_streak = 0;
        self.kp = self.default_kp;
        self.ki = self.default_ki;
        self.tau = self.tau_fast;
    }

    /// Clear integral, lock and streak; restore default gains.
    pub fn reset(&mut self) {
        self.unlock();
        self.integral_ppb = 0.0;
        self.correction_ppb = 0.0;
        self.last_update_us = None;
        info!("[Discipline] Reset");
    }

    /// Operator back-door. Refused values leave the loop untouched.
    pub fn set_gains(&mut self, kp: f64, ki: f64) -> Result<(), CoreError> {
        if !kp.is_finite() || !ki.is_finite() || kp <= 0.0 || kp > MAX_GAIN || ki < 0.0 || ki > MAX_GAIN {
            return Err(CoreError::OperatorInputInvalid(format!(
                "gains kp={} ki={} outside (0, {}] / [0, {}]",
                kp, ki, MAX_GAIN, MAX_GAIN
            )));
        }
        self.default_kp = kp;
        self.default_ki = ki;
        let scale = if self.locked { 0.5 } else { 1.0 };
        self.kp = kp * scale;
        self.ki = ki * scale;
        info!("[Discipline] Gains set to kp={} ki={}", kp, ki);
        Ok(())
    }

    pub fn frequency_correction_ppb(&self) -> f64 {
        self.correction_ppb
    }

    pub fn integral_ppb(&self) -> f64 {
        self.integral_ppb
    }

    pub fn locked(&self) -> bool {
        self.locked
    }

    pub fn lock_streak(&self) -> u32 {
        self.lock_streak
    }

    pub fn last_offset_ns(&self) -> i64 {
        self.last_offset_ns
    }

    /// Active (kp, ki).
    pub fn gains(&self) -> (f64, f64) {
        (self.kp, self.ki)
    }

    pub fn tau(&self) -> u32 {
        self.tau
    }

    pub fn stats(&self) -> OffsetStats {
        self.stats
    }

    /// Offset history, oldest first.
    pub fn history(&self) -> Vec<i64> {
        let start = (self.head + HISTORY_LEN - self.filled) % HISTORY_LEN;
        (0..self.filled)
            .map(|i| self.history[(start + i) % HISTORY_LEN])
            .collect()
    }

    /// Overlapping Allan deviation at `m` samples, treating the recorded
    /// offsets as phase data at 1 s spacing. Dimensionless.
    pub fn allan_deviation(&self, m: usize) -> Option<f64> {
        let x = &self.allan_phase;
        if m == 0 || x.len() < 2 * m + 1 {
            return None;
        }
        let n = x.len() - 2 * m;
        let sum: f64 = (0..n)
            .map(|i| {
                let d = x[i + 2 * m] as f64 - 2.0 * x[i + m] as f64 + x[i] as f64;
                d * d
            })
            .sum();
        let tau_s = m as f64;
        let avar = sum / (2.0 * tau_s * tau_s * n as f64);
        Some(avar.sqrt() * 1e-9)
    }

    pub fn allan(&self) -> AllanDeviation {
        AllanDeviation {
            tau_1: self.allan_deviation(1),
            tau_10: self.allan_deviation(10),
            tau_100: self.allan_deviation(100),
        }
    }
}
