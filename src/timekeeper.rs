//! The timekeeping core: owns every component of the pipeline and wires
//! edge events, GNSS input and the 10 Hz state-machine tick together.
//!
//! Mutation happens from two places only: [`Timekeeper::on_reference_edge`]
//! (edge context) and [`Timekeeper::task`] (cooperative loop). Everything
//! else is a snapshot accessor.

use crate::config::SystemConfig;
use crate::discipline::{Discipline, OffsetStats};
use crate::error::CoreError;
use crate::freq_counter::{FrequencyCounter, FrequencyMeasurement, PpsOffsetChannel};
use crate::gnss::{GnssPps, GnssReceiver, GnssState};
use crate::irq::EdgeCell;
use crate::pps::{PpsCapture, PpsEdge, PpsSource};
use crate::pps_gen::PpsGenerator;
use crate::status::{CoreStatus, LeapPending, PpsCounts, ServiceView};
use crate::sync_state::{Reference, SyncInputs, SyncMachine, SyncState, Transition};
use crate::time_oracle::{ReferenceClock, TimeOracle};
use crate::timestamp::NtpTimestamp;
use crate::traits::{ClockView, LockLine, MonotonicClock, PulseOutput};
use log::{debug, info, trace, warn};
use std::sync::{Arc, Mutex, MutexGuard};

/// Minimum spacing from the last accepted edge for the first edge after a
/// source switch to count as a new second.
pub const SWITCH_MIN_SPACING_US: u64 = 500_000;

/// Handed to edge consumers (NMEA-out, pulse outputs). `timestamp` is one
/// Time Oracle reading taken inside the edge processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeNotification {
    pub edge: PpsEdge,
    pub seconds: i64,
    pub timestamp: NtpTimestamp,
}

pub struct Timekeeper {
    capture: PpsCapture,
    freq: FrequencyCounter,
    pps_offset: PpsOffsetChannel,
    generator: PpsGenerator,
    gnss: GnssReceiver,
    gnss_pps: GnssPps,
    discipline: Discipline,
    machine: SyncMachine,
    oracle: TimeOracle,
    lock_line: Box<dyn LockLine + Send>,
    switch_pending: bool,
    last_accepted_us: Option<u64>,
    last_offset_ns: i64,
}

impl Timekeeper {
    pub fn new(
        config: &SystemConfig,
        lock_line: Box<dyn LockLine + Send>,
        pulse_output: Box<dyn PulseOutput + Send>,
        now_us: u64,
    ) -> Self {
        let servo = &config.servo;
        Timekeeper {
            capture: PpsCapture::new(PpsSource::Reference),
            freq: FrequencyCounter::new(),
            pps_offset: PpsOffsetChannel::new(),
            generator: PpsGenerator::new(pulse_output),
            gnss: GnssReceiver::new(config.gnss.nmea_timeout_ms * 1_000),
            gnss_pps: GnssPps::new(),
            discipline: Discipline::new(servo.kp, servo.ki, servo.tau_fast, servo.tau_slow),
            machine: SyncMachine::new(config.sync.clone(), now_us),
            oracle: TimeOracle::new(config.reference.epoch_offset),
            lock_line,
            switch_pending: false,
            last_accepted_us: None,
            last_offset_ns: 0,
        }
    }

    /// Reference-PPS edge handler. Returns a notification for accepted edges.
    pub fn on_reference_edge(&mut self, now_us: u64, cycles: u64) -> Option<EdgeNotification> {
        let edge = self.capture.on_edge(now_us, cycles);
        let measurement = self.freq.on_edge(&edge);
        if let Err(e) = edge.check() {
            trace!("[PPS] Rejected: {}", e);
            return None;
        }

        let advance = if std::mem::take(&mut self.switch_pending) {
            let spaced = self
                .last_accepted_us
                .map_or(true, |last| now_us.saturating_sub(last) >= SWITCH_MIN_SPACING_US);
            i64::from(spaced)
        } else {
            1
        };

        self.pps_offset.on_reference_edge(cycles);
        let seconds = self.oracle.on_pps(now_us, advance);
        self.machine.on_pps();
        self.last_accepted_us = Some(now_us);

        if let Some(m) = measurement {
            self.feed_rubidium(&m, now_us);
        }

        Some(EdgeNotification {
            edge,
            seconds,
            timestamp: self.current_timestamp(now_us),
        })
    }

    fn discipline_active(&self) -> bool {
        matches!(
            self.machine.state(),
            SyncState::Coarse | SyncState::Fine | SyncState::Locked
        )
    }

    fn feed_rubidium(&mut self, m: &FrequencyMeasurement, now_us: u64) {
        if self.machine.reference() != Reference::Rubidium || !self.discipline_active() {
            return;
        }
        let offset = m.offset_ns();
        self.last_offset_ns = offset;
        self.discipline.update(offset, now_us);
    }

    fn drain_gnss_pps(&mut self) {
        let Some(edge) = self.gnss_pps.poll() else {
            return;
        };
        self.pps_offset.on_gnss_edge(edge.cycles, edge.timestamp_us);

        if self.machine.reference() != Reference::Gnss || !self.discipline_active() {
            return;
        }
        let Some(boundary) = self.last_accepted_us else {
            return;
        };
        let mut delta = edge.timestamp_us as i64 - boundary as i64;
        delta = delta.rem_euclid(1_000_000);
        if delta > 500_000 {
            delta -= 1_000_000;
        }
        let offset = delta * 1_000;
        self.last_offset_ns = offset;
        self.discipline.update(offset, edge.timestamp_us);
    }

    /// Interrupt-side handle for the GNSS-PPS input.
    pub fn gnss_pps_cell(&self) -> Arc<EdgeCell> {
        self.gnss_pps.cell()
    }

    /// Bytes from the GNSS UART. A fresh UTC label is latched for the next
    /// reference edge.
    pub fn feed_gnss_bytes(&mut self, bytes: &[u8], now_us: u64) {
        self.gnss.feed(bytes, now_us);
        if let Some(utc) = self.gnss.take_fresh_utc() {
            if self.gnss.time_valid(now_us) && self.oracle.latch_utc(utc) {
                debug!("[GNSS] UTC {} pending for next edge", utc);
            }
        }
    }

    /// 10 Hz cooperative tick.
    pub fn task(&mut self, now_us: u64) -> Option<Transition> {
        self.drain_gnss_pps();

        let inputs = SyncInputs {
            now_us,
            rb_locked: self.lock_line.is_asserted(),
            reference_pps_valid: self.capture.is_pps_valid(now_us),
            gnss_pps_valid: self.gnss_pps.pps_valid(now_us),
            gnss_time_valid: self.gnss.time_valid(now_us),
            signal_present: self.freq.signal_present(now_us),
            epoch_set: self.oracle.epoch_set(),
            discipline_locked: self.discipline.locked(),
            backup_pps: self.generator.is_running() && !self.generator.use_internal(),
            frequency_offset_ppb: self.frequency_offset_ppb(),
        };
        let transition = self.machine.tick(&inputs)?;
        if let Some(e) = transition.signal_lost() {
            warn!("[Core] {} ({} -> {})", e, transition.from, transition.to);
        }

        if transition.state_changed() {
            match (transition.from, transition.to) {
                (from, SyncState::Holdover) if from != SyncState::Holdover => self.discipline.unlock(),
                (SyncState::Error, SyncState::FreqCal) => self.discipline.reset(),
                _ => {}
            }
        }
        Some(transition)
    }

    /// Operator selector between the external PPS and the internal generator.
    pub fn select_pps_source(&mut self, internal: bool) -> Result<(), CoreError> {
        if internal == self.generator.use_internal() {
            return Ok(());
        }
        if internal && !self.generator.is_running() {
            return Err(CoreError::OperatorInputInvalid(
                "internal PPS generator is not running".to_string(),
            ));
        }
        self.generator.set_use_internal(internal);
        let source = if internal {
            PpsSource::Internal
        } else {
            PpsSource::Reference
        };
        self.capture.rebase(source);
        self.freq.restart_gate();
        self.switch_pending = true;
        info!("[PPS] Source switched to {:?}", source);
        Ok(())
    }

    pub fn start_generator(&mut self, cycles: u64) {
        self.generator.start(cycles);
    }

    pub fn stop_generator(&mut self) -> Result<(), CoreError> {
        if self.generator.use_internal() {
            return Err(CoreError::OperatorInputInvalid(
                "internal PPS is the selected source".to_string(),
            ));
        }
        self.generator.stop();
        Ok(())
    }

    /// Advance the generator; returns the cycle of the last pulse emitted
    /// and whether it should be looped into the capture input.
    pub fn poll_generator(&mut self, cycles: u64) -> Option<(u64, bool)> {
        self.generator
            .poll(cycles)
            .map(|due| (due, self.generator.use_internal()))
    }

    pub fn set_time(&mut self, ts: NtpTimestamp, operator: bool) -> Result<(), CoreError> {
        self.oracle.set_time(ts, self.machine.state(), operator)
    }

    pub fn force_resync(&mut self) {
        self.oracle.force_resync();
    }

    pub fn set_gains(&mut self, kp: f64, ki: f64) -> Result<(), CoreError> {
        self.discipline.set_gains(kp, ki)
    }

    pub fn discipline_reset(&mut self) {
        self.discipline.reset();
    }

    pub fn current_timestamp(&self, now_us: u64) -> NtpTimestamp {
        self.oracle
            .current_timestamp(now_us, self.discipline.frequency_correction_ppb())
    }

    pub fn reference_clock(&self) -> ReferenceClock {
        self.oracle.clock()
    }

    pub fn sync_state(&self) -> SyncState {
        self.machine.state()
    }

    pub fn reference(&self) -> Reference {
        self.machine.reference()
    }

    pub fn time_valid(&self) -> bool {
        self.machine.time_valid()
    }

    /// Discipline lock qualified by state and by a live reference.
    pub fn locked(&self, now_us: u64) -> bool {
        self.discipline.locked()
            && matches!(self.machine.state(), SyncState::Fine | SyncState::Locked)
            && (self.lock_line.is_asserted() || self.gnss_pps.pps_valid(now_us))
    }

    pub fn offset_ns(&self) -> i64 {
        self.last_offset_ns
    }

    /// Measured frequency error of the last gate.
    pub fn frequency_offset_ppb(&self) -> Option<f64> {
        self.freq.latest().map(|m| m.error_ppb())
    }

    pub fn frequency_correction_ppb(&self) -> f64 {
        self.discipline.frequency_correction_ppb()
    }

    pub fn pps_counts(&self) -> PpsCounts {
        PpsCounts {
            reference: self.capture.counters(),
            gnss: self.gnss_pps.pps_count(),
            internal: self.generator.count(),
        }
    }

    pub fn pps_is_valid(&self, now_us: u64) -> bool {
        self.capture.is_pps_valid(now_us)
    }

    pub fn pps_history(&self) -> Vec<u64> {
        self.capture.history()
    }

    pub fn gnss_state(&self, now_us: u64) -> GnssState {
        self.gnss.state(now_us, &self.gnss_pps)
    }

    pub fn discipline_stats(&self) -> OffsetStats {
        self.discipline.stats()
    }

    pub fn service_view(&self, now_us: u64) -> ServiceView {
        let leap = if self.oracle.epoch_set() {
            let unix_now = self.current_timestamp(now_us).unix_seconds();
            self.gnss.leap_pending(unix_now, now_us)
        } else {
            LeapPending::None
        };
        ServiceView {
            sync_state: self.machine.state(),
            time_valid: self.machine.time_valid(),
            reference: self.machine.reference(),
            leap,
            holdover_secs: self.machine.holdover_secs(now_us),
        }
    }

    pub fn status(&self, now_us: u64) -> CoreStatus {
        let clock = self.oracle.clock();
        CoreStatus {
            sync_state: self.machine.state(),
            reference: self.machine.reference(),
            time_valid: self.machine.time_valid(),
            locked: self.locked(now_us),
            unix_seconds: self.current_timestamp(now_us).unix_seconds(),
            epoch_set: clock.epoch_set,
            offset_ns: self.last_offset_ns,
            frequency_correction_ppb: self.discipline.frequency_correction_ppb(),
            frequency_offset_ppb: self.frequency_offset_ppb(),
            pps: self.pps_counts(),
            pps_source: self.capture.source(),
            jitter_ns: self.capture.jitter_ns(),
            period_error_ns: self.capture.period_error_ns(),
            measurement: self.freq.latest(),
            pps_offset: self.pps_offset.stats(),
            gnss: self.gnss_state(now_us),
            offset_stats: self.discipline.stats(),
            allan: self.discipline.allan(),
        }
    }
}

/// Lock the core, recovering from a poisoned mutex.
pub fn lock_core(core: &Mutex<Timekeeper>) -> MutexGuard<'_, Timekeeper> {
    core.lock().unwrap_or_else(|poisoned| {
        warn!("[Core] Mutex poisoned, recovering");
        poisoned.into_inner()
    })
}

/// [`ClockView`] over a shared core, for the network responders.
pub struct SharedClock<M: MonotonicClock> {
    core: Arc<Mutex<Timekeeper>>,
    clock: M,
}

impl<M: MonotonicClock> SharedClock<M> {
    pub fn new(core: Arc<Mutex<Timekeeper>>, clock: M) -> Self {
        SharedClock { core, clock }
    }
}

impl<M: MonotonicClock> ClockView for SharedClock<M> {
    fn now(&self) -> NtpTimestamp {
        let core = lock_core(&self.core);
        core.current_timestamp(self.clock.now_us())
    }

    fn view(&self) -> ServiceView {
        let core = lock_core(&self.core);
        core.service_view(self.clock.now_us())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freq_counter::NOMINAL_COUNT;
    use crate::gnss::nmea::with_checksum;
    use crate::traits::{MockLockLine, MockMonotonicClock, MockPulseOutput};

    const S: u64 = 1_000_000;

    fn core_with_lock(asserted: bool) -> Timekeeper {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut line = MockLockLine::new();
        line.expect_is_asserted().return_const(asserted);
        let mut out = MockPulseOutput::new();
        out.expect_pulse().return_const(());
        Timekeeper::new(&SystemConfig::default(), Box::new(line), Box::new(out), 0)
    }

    /// Perfect PPS and 10 MHz; tick before the first edge and after each one.
    fn run_perfect(core: &mut Timekeeper, edges: u64) {
        core.task(0);
        for i in 1..=edges {
            core.on_reference_edge(i * S, i * NOMINAL_COUNT);
            core.task(i * S + 1);
        }
    }

    #[test]
    fn test_cold_start_reaches_locked() {
        let mut core = core_with_lock(true);
        run_perfect(&mut core, 10);
        assert_eq!(core.sync_state(), SyncState::Coarse);
        let mut core = core_with_lock(true);
        run_perfect(&mut core, 20);
        assert_eq!(core.sync_state(), SyncState::Fine);
        let mut core = core_with_lock(true);
        run_perfect(&mut core, 80);
        assert_eq!(core.sync_state(), SyncState::Locked);
        assert!(core.time_valid());
        assert!(core.locked(80 * S + 1));
        assert_eq!(core.offset_ns(), 0);
    }

    #[test]
    fn test_rejected_edge_does_not_advance_seconds() {
        let mut core = core_with_lock(true);
        let mut t = 0;
        let mut cycles = 0;
        let mut seconds = vec![];
        for period in [S, S, S, 1_050_000, S] {
            t += period;
            cycles += period * 10;
            core.on_reference_edge(t, cycles);
            seconds.push(core.reference_clock().current_seconds);
        }
        assert_eq!(seconds, vec![1, 2, 3, 3, 4]);
        assert_eq!(core.pps_counts().reference.invalid_count, 1);
    }

    #[test]
    fn test_gnss_label_latched_for_next_edge() {
        let mut core = core_with_lock(false);
        core.on_reference_edge(S, NOMINAL_COUNT);
        let rmc = format!("{}\r\n", with_checksum("GPRMC,221320.00,A,5230.000,N,01322.000,E,0.0,0.0,141123,,,A"));
        core.feed_gnss_bytes(rmc.as_bytes(), S + 500_000);
        assert!(core.reference_clock().pending_utc_pps_latched);
        let note = core.on_reference_edge(2 * S, 2 * NOMINAL_COUNT).unwrap();
        assert_eq!(note.seconds, 1_700_000_001);
        assert_eq!(note.timestamp.unix_seconds(), 1_700_000_001);
        assert_eq!(note.timestamp.fraction, 0);
        assert!(!core.reference_clock().pending_utc_pps_latched);
    }

    #[test]
    fn test_holdover_unlocks_discipline_but_keeps_integral() {
        let mut core = core_with_lock(true);
        run_perfect(&mut core, 80);
        assert!(core.discipline.locked());
        let integral = core.discipline.integral_ppb();
        let t = core.task(82 * S).unwrap();
        assert_eq!(t.to, SyncState::Holdover);
        assert!(!core.discipline.locked());
        assert_eq!(core.discipline.integral_ppb(), integral);
        assert!(!core.pps_is_valid(82 * S));
        assert!(core.time_valid());
    }

    #[test]
    fn test_source_switch_advances_at_most_one() {
        let mut core = core_with_lock(true);
        for i in 1..=3 {
            core.on_reference_edge(i * S, i * NOMINAL_COUNT);
        }
        assert!(matches!(
            core.select_pps_source(true),
            Err(CoreError::OperatorInputInvalid(_))
        ));
        core.start_generator(3 * NOMINAL_COUNT);
        core.select_pps_source(true).unwrap();
        // Internal edge arrives 0.2 s after the last external one: same second
        let note = core.on_reference_edge(3 * S + 200_000, 3 * NOMINAL_COUNT + 2_000_000).unwrap();
        assert_eq!(note.seconds, 3);
        assert_eq!(note.edge.source, PpsSource::Internal);
        let note = core.on_reference_edge(4 * S + 200_000, 4 * NOMINAL_COUNT + 2_000_000).unwrap();
        assert_eq!(note.seconds, 4);

        core.select_pps_source(false).unwrap();
        // Switch back with a well-spaced edge: exactly one second
        let note = core.on_reference_edge(5 * S, 5 * NOMINAL_COUNT).unwrap();
        assert_eq!(note.seconds, 5);
    }

    #[test]
    fn test_generator_loops_when_selected() {
        let mut core = core_with_lock(true);
        core.start_generator(0);
        assert_eq!(core.poll_generator(NOMINAL_COUNT), Some((NOMINAL_COUNT, false)));
        core.select_pps_source(true).unwrap();
        assert_eq!(core.poll_generator(2 * NOMINAL_COUNT), Some((2 * NOMINAL_COUNT, true)));
        assert!(core.stop_generator().is_err());
    }

    #[test]
    fn test_gnss_reference_feeds_phase_offset() {
        let mut core = core_with_lock(false);
        let cell = core.gnss_pps_cell();
        let rmc = |t: u64| {
            let body = format!("GPZDA,{},14,11,2023,00,00", {
                let s = 1_700_000_000 + t;
                format!("{:02}{:02}{:02}.00", (s / 3600) % 24, (s / 60) % 60, s % 60)
            });
            format!("{}\r\n", with_checksum(&body))
        };
        core.task(0);
        for i in 1..=15u64 {
            core.on_reference_edge(i * S, i * NOMINAL_COUNT);
            // GNSS PPS 3 µs after the local boundary
            cell.publish(i * S + 3, i * NOMINAL_COUNT + 30);
            core.feed_gnss_bytes(rmc(i).as_bytes(), i * S + 300_000);
            core.task(i * S + 300_001);
        }
        assert_eq!(core.reference(), Reference::Gnss);
        assert_eq!(core.sync_state(), SyncState::Fine);
        assert_eq!(core.offset_ns(), 3_000);
        assert_eq!(core.status(15 * S + 300_001).pps_offset.offset_ticks, 30);
    }

    #[test]
    fn test_set_time_refused_when_locked() {
        let mut core = core_with_lock(true);
        run_perfect(&mut core, 80);
        let ts = NtpTimestamp::from_unix_nanos(1_700_000_000, 0);
        assert!(core.set_time(ts, false).is_err());
        core.set_time(ts, true).unwrap();
        assert_eq!(core.reference_clock().current_seconds, 1_700_000_000);
    }

    #[test]
    fn test_shared_clock_reads_core() {
        let mut core = core_with_lock(true);
        core.on_reference_edge(S, NOMINAL_COUNT);
        let mut mono = MockMonotonicClock::new();
        mono.expect_now_us().return_const(S + 500_000);
        let shared = SharedClock::new(Arc::new(Mutex::new(core)), mono);
        let ts = shared.now();
        assert_eq!(ts.unix_seconds(), 1);
        assert_eq!(ts.fraction, 1 << 31);
        assert_eq!(shared.view().sync_state, SyncState::Init);
    }
}
