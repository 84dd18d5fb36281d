//! Reference arbitration and the INIT → FREQ_CAL → COARSE → FINE → LOCKED
//! progression, with HOLDOVER and ERROR.
//!
//! The machine is ticked at ~10 Hz with a snapshot of its inputs. It never
//! touches other components: the caller applies the side effects a
//! [`Transition`] implies (discipline unlock on HOLDOVER, reset on recovery
//! from ERROR).

use crate::config::SyncConfig;
use crate::error::CoreError;
use log::{info, warn};
use serde::Serialize;
use std::fmt;

/// PPS edges needed in FREQ_CAL and in COARSE before moving on.
pub const CALIBRATION_EDGES: u32 = 10;
/// PPS edges needed in FINE before LOCKED.
pub const LOCK_EDGES: u32 = 60;
/// Frequency offset above which entering COARSE is flagged, ppb (10 ppm).
pub const FREQ_WARN_PPB: f64 = 10_000.0;

const PPS_LOST: &str = "all PPS lost";
const TEN_MHZ_ABSENT: &str = "10 MHz absent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SyncState {
    Init,
    FreqCal,
    Coarse,
    Fine,
    Locked,
    Holdover,
    Error,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncState::Init => "INIT",
            SyncState::FreqCal => "FREQ_CAL",
            SyncState::Coarse => "COARSE",
            SyncState::Fine => "FINE",
            SyncState::Locked => "LOCKED",
            SyncState::Holdover => "HOLDOVER",
            SyncState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Which input drives the discipline loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Reference {
    None,
    Rubidium,
    Gnss,
}

/// One tick's view of the world.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncInputs {
    pub now_us: u64,
    pub rb_locked: bool,
    pub reference_pps_valid: bool,
    pub gnss_pps_valid: bool,
    pub gnss_time_valid: bool,
    /// 10 MHz counter produced a measurement within the last 2 s.
    pub signal_present: bool,
    pub epoch_set: bool,
    pub discipline_locked: bool,
    /// A secondary PPS (the internal generator) is still running.
    pub backup_pps: bool,
    pub frequency_offset_ppb: Option<f64>,
}

impl SyncInputs {
    fn gnss_available(&self) -> bool {
        self.gnss_time_valid && self.gnss_pps_valid
    }

    fn rb_available(&self) -> bool {
        self.rb_locked && self.reference_pps_valid
    }

    fn any_pps(&self) -> bool {
        self.reference_pps_valid || self.gnss_pps_valid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: SyncState,
    pub to: SyncState,
    pub from_reference: Reference,
    pub reference: Reference,
    pub reason: &'static str,
}

impl Transition {
    pub fn state_changed(&self) -> bool {
        self.from != self.to
    }

    pub fn reference_changed(&self) -> bool {
        self.from_reference != self.reference
    }

    /// The signal loss that forced this transition, if any.
    pub fn signal_lost(&self) -> Option<CoreError> {
        if !self.state_changed() {
            return None;
        }
        match self.reason {
            PPS_LOST => Some(CoreError::SignalLost("PPS")),
            TEN_MHZ_ABSENT => Some(CoreError::SignalLost("10 MHz")),
            _ => None,
        }
    }
}

pub struct SyncMachine {
    timings: SyncConfig,
    state: SyncState,
    entered_us: u64,
    pps_in_state: u32,
    time_valid: bool,
    reference: Reference,
    last_signal_us: u64,
    rb_stable_since: Option<u64>,
}

impl SyncMachine {
    pub fn new(timings: SyncConfig, now_us: u64) -> Self {
        SyncMachine {
            timings,
            state: SyncState::Init,
            entered_us: now_us,
            pps_in_state: 0,
            time_valid: false,
            reference: Reference::None,
            last_signal_us: now_us,
            rb_stable_since: None,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn reference(&self) -> Reference {
        self.reference
    }

    pub fn time_valid(&self) -> bool {
        self.time_valid
    }

    pub fn pps_in_state(&self) -> u32 {
        self.pps_in_state
    }

    pub fn state_time_us(&self, now_us: u64) -> u64 {
        now_us.saturating_sub(self.entered_us)
    }

    /// Seconds spent in HOLDOVER so far; 0 in any other state.
    pub fn holdover_secs(&self, now_us: u64) -> u64 {
        if self.state == SyncState::Holdover {
            self.state_time_us(now_us) / 1_000_000
        } else {
            0
        }
    }

    /// Count an accepted PPS edge toward the current state's thresholds.
    pub fn on_pps(&mut self) {
        self.pps_in_state = self.pps_in_state.saturating_add(1);
    }

    pub fn tick(&mut self, inputs: &SyncInputs) -> Option<Transition> {
        let now = inputs.now_us;
        if inputs.signal_present {
            self.last_signal_us = now;
        }
        if inputs.rb_available() {
            self.rb_stable_since.get_or_insert(now);
        } else {
            self.rb_stable_since = None;
        }

        let from = self.state;
        let from_reference = self.reference;
        let elapsed_s = self.state_time_us(now) / 1_000_000;

        let next = match self.state {
            SyncState::Init => {
                if inputs.gnss_available() {
                    Some((SyncState::FreqCal, "GNSS time and PPS valid"))
                } else if inputs.rb_locked {
                    Some((SyncState::FreqCal, "rubidium lock asserted"))
                } else if elapsed_s > self.timings.init_timeout_s {
                    Some((SyncState::Error, "no reference after startup timeout"))
                } else {
                    None
                }
            }
            SyncState::FreqCal => {
                let absent_s = now.saturating_sub(self.last_signal_us.max(self.entered_us)) / 1_000_000;
                if absent_s > self.timings.freq_cal_signal_timeout_s {
                    Some((SyncState::Error, TEN_MHZ_ABSENT))
                } else if self.pps_in_state >= CALIBRATION_EDGES {
                    if let Some(ppb) = inputs.frequency_offset_ppb.filter(|p| p.abs() > FREQ_WARN_PPB) {
                        warn!("[Sync] Frequency offset {:.0} ppb exceeds 10 ppm", ppb);
                    }
                    Some((SyncState::Coarse, "frequency calibrated"))
                } else {
                    None
                }
            }
            SyncState::Coarse => {
                if !inputs.any_pps() {
                    Some((SyncState::Error, PPS_LOST))
                } else if inputs.epoch_set || self.pps_in_state >= CALIBRATION_EDGES {
                    Some((SyncState::Fine, "coarse alignment done"))
                } else {
                    None
                }
            }
            SyncState::Fine => {
                if !inputs.any_pps() {
                    Some((SyncState::Holdover, PPS_LOST))
                } else if inputs.discipline_locked && self.pps_in_state >= LOCK_EDGES {
                    Some((SyncState::Locked, "discipline locked"))
                } else {
                    None
                }
            }
            SyncState::Locked => {
                if !inputs.any_pps() {
                    Some((SyncState::Holdover, PPS_LOST))
                } else if !inputs.discipline_locked {
                    Some((SyncState::Fine, "discipline lost lock"))
                } else {
                    None
                }
            }
            SyncState::Holdover => {
                let rb_stable_s = self
                    .rb_stable_since
                    .map_or(0, |since| now.saturating_sub(since) / 1_000_000);
                if inputs.gnss_available() {
                    Some((SyncState::Fine, "GNSS restored"))
                } else if inputs.rb_available() && rb_stable_s >= self.timings.rb_stable_s {
                    Some((SyncState::Fine, "rubidium stable (degraded)"))
                } else if elapsed_s > self.timings.holdover_max_s {
                    Some((SyncState::Error, "holdover ceiling reached"))
                } else {
                    None
                }
            }
            SyncState::Error => {
                if inputs.gnss_available() {
                    Some((SyncState::FreqCal, "GNSS restored"))
                } else if inputs.rb_available() {
                    Some((SyncState::FreqCal, "rubidium and PPS restored"))
                } else {
                    None
                }
            }
        };

        let reason = match next {
            Some((to, reason)) => {
                self.enter(to, now);
                reason
            }
            None => "",
        };

        self.update_time_valid(inputs);
        self.reference = self.select_reference(inputs);

        if self.state == from && self.reference == from_reference {
            return None;
        }
        let reason = if reason.is_empty() { "reference switch" } else { reason };
        if self.state != from {
            info!("[Sync] {} -> {} ({})", from, self.state, reason);
        }
        if self.reference != from_reference {
            info!("[Sync] Reference {:?} -> {:?}", from_reference, self.reference);
        }
        Some(Transition {
            from,
            to: self.state,
            from_reference,
            reference: self.reference,
            reason,
        })
    }

    fn enter(&mut self, to: SyncState, now_us: u64) {
        self.state = to;
        self.entered_us = now_us;
        self.pps_in_state = 0;
        if to == SyncState::FreqCal {
            self.last_signal_us = now_us;
        }
        match to {
            SyncState::Locked => self.time_valid = true,
            SyncState::Error | SyncState::Init => self.time_valid = false,
            _ => {}
        }
    }

    fn update_time_valid(&mut self, inputs: &SyncInputs) {
        if self.state != SyncState::Holdover || !self.time_valid {
            return;
        }
        let window = if inputs.backup_pps {
            self.timings.holdover_backup_valid_s
        } else {
            self.timings.holdover_valid_s
        };
        if self.state_time_us(inputs.now_us) > window * 1_000_000 {
            self.time_valid = false;
            warn!("[Sync] Holdover exceeded {} s, time no longer valid", window);
        }
    }

    fn select_reference(&self, inputs: &SyncInputs) -> Reference {
        match self.state {
            SyncState::Init | SyncState::Error => Reference::None,
            _ if inputs.gnss_available() => Reference::Gnss,
            _ if inputs.rb_locked && (inputs.reference_pps_valid || inputs.signal_present) => Reference::Rubidium,
            SyncState::Holdover => Reference::None,
            // Keep the last reference through momentary dropouts outside holdover
            _ => self.reference,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const S: u64 = 1_000_000;

    fn rb_inputs(now_us: u64) -> SyncInputs {
        SyncInputs {
            now_us,
            rb_locked: true,
            reference_pps_valid: true,
            signal_present: true,
            ..Default::default()
        }
    }

    fn machine() -> SyncMachine {
        SyncMachine::new(SyncConfig::default(), 0)
    }

    /// Tick once per accepted edge, like the cooperative loop does.
    fn run_edges(m: &mut SyncMachine, edges: u32, start_s: u64, locked: bool) -> u64 {
        let mut t = start_s;
        for _ in 0..edges {
            t += 1;
            m.on_pps();
            let mut inputs = rb_inputs(t * S);
            inputs.discipline_locked = locked;
            m.tick(&inputs);
        }
        t
    }

    #[test]
    fn test_rubidium_cold_start_progression() {
        let mut m = machine();
        let t = m.tick(&rb_inputs(0)).unwrap();
        assert_eq!((t.from, t.to), (SyncState::Init, SyncState::FreqCal));
        assert_eq!(t.reference, Reference::Rubidium);

        let t_s = run_edges(&mut m, 10, 0, true);
        assert_eq!(m.state(), SyncState::Coarse);
        let t_s = run_edges(&mut m, 10, t_s, true);
        assert_eq!(m.state(), SyncState::Fine);
        let t_s = run_edges(&mut m, 59, t_s, true);
        assert_eq!(m.state(), SyncState::Fine);
        assert!(!m.time_valid());
        run_edges(&mut m, 1, t_s, true);
        assert_eq!(m.state(), SyncState::Locked);
        assert!(m.time_valid());
    }

    #[test]
    fn test_gnss_preferred_at_init() {
        let mut m = machine();
        let inputs = SyncInputs {
            gnss_time_valid: true,
            gnss_pps_valid: true,
            rb_locked: true,
            reference_pps_valid: true,
            ..Default::default()
        };
        let t = m.tick(&inputs).unwrap();
        assert_eq!(t.reason, "GNSS time and PPS valid");
        assert_eq!(m.reference(), Reference::Gnss);
    }

    #[test]
    fn test_init_timeout() {
        let mut m = machine();
        assert!(m.tick(&SyncInputs { now_us: 600 * S, ..Default::default() }).is_none());
        let t = m.tick(&SyncInputs { now_us: 601 * S, ..Default::default() }).unwrap();
        assert_eq!(t.to, SyncState::Error);
        assert_eq!(t.signal_lost(), None);
        assert!(!m.time_valid());
    }

    #[test]
    fn test_freq_cal_without_10mhz_errors_after_30s() {
        let mut m = machine();
        m.tick(&SyncInputs { rb_locked: true, ..Default::default() });
        assert_eq!(m.state(), SyncState::FreqCal);
        let quiet = |t| SyncInputs { now_us: t, rb_locked: true, ..Default::default() };
        assert!(m.tick(&quiet(30 * S)).is_none());
        let t = m.tick(&quiet(31 * S)).unwrap();
        assert_eq!(t.to, SyncState::Error);
        assert_eq!(t.signal_lost(), Some(CoreError::SignalLost("10 MHz")));
    }

    #[test]
    fn test_epoch_set_skips_coarse_count() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        run_edges(&mut m, 10, 0, false);
        assert_eq!(m.state(), SyncState::Coarse);
        let mut inputs = rb_inputs(11 * S);
        inputs.epoch_set = true;
        assert_eq!(m.tick(&inputs).unwrap().to, SyncState::Fine);
    }

    #[test]
    fn test_pps_loss_to_holdover_and_time_valid_window() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let t_s = run_edges(&mut m, 80, 0, true);
        assert_eq!(m.state(), SyncState::Locked);

        let lost_at = (t_s + 2) * S;
        let lost = |now| SyncInputs { now_us: now, rb_locked: true, discipline_locked: true, ..Default::default() };
        let t = m.tick(&lost(lost_at)).unwrap();
        assert_eq!((t.from, t.to), (SyncState::Locked, SyncState::Holdover));
        assert_eq!(t.signal_lost(), Some(CoreError::SignalLost("PPS")));
        assert!(m.time_valid());
        m.tick(&lost(lost_at + 3_600 * S));
        assert!(m.time_valid());
        assert_eq!(m.holdover_secs(lost_at + 3_600 * S), 3_600);
        m.tick(&lost(lost_at + 3_600 * S + 1));
        assert!(!m.time_valid());
        assert_eq!(m.state(), SyncState::Holdover);
    }

    #[test]
    fn test_backup_pps_extends_holdover_validity() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let t_s = run_edges(&mut m, 80, 0, true);
        let start = (t_s + 2) * S;
        let backup = |now| SyncInputs { now_us: now, backup_pps: true, ..Default::default() };
        m.tick(&backup(start));
        m.tick(&backup(start + 5_000 * S));
        assert!(m.time_valid());
        m.tick(&backup(start + 7_201 * S));
        assert!(!m.time_valid());
    }

    #[test]
    fn test_holdover_recovery_paths() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let t_s = run_edges(&mut m, 30, 0, false);
        assert_eq!(m.state(), SyncState::Fine);
        let base = (t_s + 5) * S;
        m.tick(&SyncInputs { now_us: base, ..Default::default() });
        assert_eq!(m.state(), SyncState::Holdover);
        assert_eq!(m.reference(), Reference::None);

        // Rubidium back, but not yet stable for 300 s
        assert!(m.tick(&rb_inputs(base + S)).unwrap().reference_changed());
        assert_eq!(m.state(), SyncState::Holdover);
        assert!(m.tick(&rb_inputs(base + 300 * S)).is_none());
        let t = m.tick(&rb_inputs(base + 301 * S)).unwrap();
        assert_eq!(t.to, SyncState::Fine);
    }

    #[test]
    fn test_holdover_ceiling_and_error_recovery() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let t_s = run_edges(&mut m, 30, 0, false);
        let base = (t_s + 5) * S;
        m.tick(&SyncInputs { now_us: base, ..Default::default() });
        assert!(m.tick(&SyncInputs { now_us: base + 86_400 * S, ..Default::default() }).is_none());
        let t = m.tick(&SyncInputs { now_us: base + 86_401 * S, ..Default::default() }).unwrap();
        assert_eq!(t.to, SyncState::Error);
        assert!(!m.time_valid());

        let t = m.tick(&rb_inputs(base + 86_402 * S)).unwrap();
        assert_eq!((t.from, t.to), (SyncState::Error, SyncState::FreqCal));
        assert_eq!(m.pps_in_state(), 0);
    }

    #[test]
    fn test_locked_falls_back_to_fine_on_unlock() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let t_s = run_edges(&mut m, 80, 0, true);
        assert_eq!(m.state(), SyncState::Locked);
        let t = m.tick(&rb_inputs((t_s + 1) * S)).unwrap();
        assert_eq!(t.to, SyncState::Fine);
        // Time stays valid once established
        assert!(m.time_valid());
    }

    #[test]
    fn test_reference_switch_emits_transition() {
        let mut m = machine();
        m.tick(&rb_inputs(0));
        let mut inputs = rb_inputs(S);
        inputs.gnss_pps_valid = true;
        inputs.gnss_time_valid = true;
        let t = m.tick(&inputs).unwrap();
        assert!(!t.state_changed());
        assert!(t.reference_changed());
        assert_eq!(t.reference, Reference::Gnss);
    }
}
