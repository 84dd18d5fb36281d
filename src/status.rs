use crate::discipline::{AllanDeviation, OffsetStats};
use crate::freq_counter::{FrequencyMeasurement, PpsOffsetStats};
use crate::gnss::GnssState;
use crate::ntp_server::NtpStats;
use crate::pps::PpsCounters;
use crate::ptp_server::PtpStats;
use crate::sync_state::{Reference, SyncState};
use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;

/// Announced leap second for the current UTC day.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LeapPending {
    #[default]
    None,
    Insert,
    Delete,
}

/// The part of the core state a time responder needs per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ServiceView {
    pub sync_state: SyncState,
    pub time_valid: bool,
    pub reference: Reference,
    pub leap: LeapPending,
    /// Seconds spent in HOLDOVER; 0 otherwise.
    pub holdover_secs: u64,
}

impl ServiceView {
    /// Nothing is known yet; responders answer as unsynchronised.
    pub fn unsynchronised() -> Self {
        ServiceView {
            sync_state: SyncState::Init,
            time_valid: false,
            reference: Reference::None,
            leap: LeapPending::None,
            holdover_secs: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PpsCounts {
    pub reference: PpsCounters,
    pub gnss: u64,
    pub internal: u64,
}

/// Core-side operator snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CoreStatus {
    pub sync_state: SyncState,
    pub reference: Reference,
    pub time_valid: bool,
    pub locked: bool,
    pub unix_seconds: i64,
    pub epoch_set: bool,
    pub offset_ns: i64,
    pub frequency_correction_ppb: f64,
    pub frequency_offset_ppb: Option<f64>,
    pub pps: PpsCounts,
    pub pps_source: crate::pps::PpsSource,
    pub jitter_ns: Option<f64>,
    pub period_error_ns: i64,
    pub measurement: Option<FrequencyMeasurement>,
    pub pps_offset: PpsOffsetStats,
    pub gnss: GnssState,
    pub offset_stats: OffsetStats,
    pub allan: AllanDeviation,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    #[serde(flatten)]
    pub core: CoreStatus,
    pub ntp: Option<NtpStats>,
    pub ptp: Option<PtpStats>,
}

impl StatusSnapshot {
    pub fn summary(&self) -> String {
        let c = &self.core;
        format!(
            "{} ref={:?} valid={} offset={} ns corr={:+.3} ppb pps={}/{} gnss_pps={} ntp={}",
            c.sync_state,
            c.reference,
            c.time_valid,
            c.offset_ns,
            c.frequency_correction_ppb,
            c.pps.reference.valid_count,
            c.pps.reference.edge_count,
            c.pps.gnss,
            self.ntp.map_or(0, |n| n.served),
        )
    }

    /// Replace `path` with the JSON snapshot (write to a sibling, then rename).
    pub fn write_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("renaming to {}", path.display()))?;
        Ok(())
    }
}
