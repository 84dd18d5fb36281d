//! Seconds counter driven by accepted PPS edges, and the wall-clock reading
//! built from it.
//!
//! A GNSS time label always arrives after the edge it describes, so a
//! latched value `U` is applied on the following edge as `U + 1`.

use crate::error::CoreError;
use crate::sync_state::SyncState;
use crate::timestamp::NtpTimestamp;
use log::{info, trace, warn};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// 2020-01-01T00:00:00Z; earlier operator times are refused.
pub const MIN_SET_TIME_UNIX: i64 = 1_577_836_800;

/// Last second representable in NTP era 0.
pub const MAX_SET_TIME_UNIX: i64 = u32::MAX as i64 - crate::timestamp::NTP_UNIX_OFFSET as i64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceClock {
    pub current_seconds: i64,
    pub last_pps_us: u64,
    pub pending_utc: i64,
    pub pending_utc_pps_latched: bool,
    pub epoch_set: bool,
}

#[derive(Debug, Default)]
pub struct TimeOracle {
    clock: ReferenceClock,
    epoch_offset: i64,
}

impl TimeOracle {
    pub fn new(epoch_offset: i64) -> Self {
        TimeOracle {
            clock: ReferenceClock::default(),
            epoch_offset,
        }
    }

    /// Copy of `(seconds, last_pps_µs, latch)` taken together.
    pub fn clock(&self) -> ReferenceClock {
        self.clock
    }

    pub fn epoch_set(&self) -> bool {
        self.clock.epoch_set
    }

    /// Offer a GNSS UTC value for the edge that just passed. Ignored once
    /// the epoch is set. Returns whether it was latched.
    pub fn latch_utc(&mut self, utc_unix: i64) -> bool {
        if self.clock.epoch_set {
            return false;
        }
        self.clock.pending_utc = utc_unix;
        self.clock.pending_utc_pps_latched = true;
        trace!("[Time] Latched UTC {}", utc_unix);
        true
    }

    /// Accepted edge at `now_us`. `advance` is 1 normally, 0 for the first
    /// edge after a source switch that came too soon. Returns the new seconds.
    pub fn on_pps(&mut self, now_us: u64, advance: i64) -> i64 {
        let c = &mut self.clock;
        if c.pending_utc_pps_latched {
            c.pending_utc_pps_latched = false;
            let labelled = c.pending_utc + 1;
            if labelled >= c.current_seconds {
                c.current_seconds = labelled;
                c.epoch_set = true;
                info!("[Time] Epoch set from GNSS: {}", labelled);
            } else {
                warn!(
                    "[Time] GNSS label {} behind counter {}, not applied",
                    labelled, c.current_seconds
                );
                c.current_seconds += advance;
            }
        } else {
            c.current_seconds += advance;
        }
        c.last_pps_us = now_us;
        c.current_seconds
    }

    /// Time Oracle reading. `correction_ppb > 0` means the local timebase
    /// runs fast, so the elapsed interval is shortened.
    ///
    /// Whole seconds elapsed since the last edge are carried into the
    /// result, so the reading keeps running while edges are missing
    /// (holdover). `current_seconds` itself only moves on edges.
    pub fn current_timestamp(&self, now_us: u64, correction_ppb: f64) -> NtpTimestamp {
        let ReferenceClock {
            current_seconds,
            last_pps_us,
            ..
        } = self.clock;
        let elapsed_ns = if last_pps_us > 0 {
            now_us.saturating_sub(last_pps_us) as i64 * 1_000
        } else {
            0
        };
        let correction_ns = (elapsed_ns as f64 * correction_ppb / 1e9) as i64;
        let corrected = (elapsed_ns - correction_ns).max(0);
        NtpTimestamp::from_unix_nanos(
            current_seconds + self.epoch_offset + corrected / NANOS_PER_SEC,
            (corrected % NANOS_PER_SEC) as u32,
        )
    }

    /// Set the seconds counter. Refused while LOCKED unless `operator`.
    pub fn set_time(&mut self, ts: NtpTimestamp, state: SyncState, operator: bool) -> Result<(), CoreError> {
        if state == SyncState::Locked && !operator {
            return Err(CoreError::OperatorInputInvalid(
                "set_time refused while LOCKED".to_string(),
            ));
        }
        let unix = ts.unix_seconds();
        if !(MIN_SET_TIME_UNIX..=MAX_SET_TIME_UNIX).contains(&unix) {
            return Err(CoreError::OperatorInputInvalid(format!(
                "time {} outside {}..={}",
                unix, MIN_SET_TIME_UNIX, MAX_SET_TIME_UNIX
            )));
        }
        self.clock.current_seconds = unix;
        self.clock.epoch_set = true;
        self.clock.pending_utc_pps_latched = false;
        info!("[Time] Time set to {} (operator={})", unix, operator);
        Ok(())
    }

    /// Forget the epoch so the next GNSS sentence is applied again.
    pub fn force_resync(&mut self) {
        self.clock.epoch_set = false;
        self.clock.pending_utc_pps_latched = false;
        info!("[Time] Resync requested");
    }
}
