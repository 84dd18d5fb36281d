//! GNSS ingest: NMEA time/fix sentences, the optional UBX binary channel and
//! the GNSS-PPS edge input.
//!
//! Both framers share one byte pipeline. Every byte is offered to each, so a
//! UBX frame in the middle of NMEA traffic only interrupts the sentence it
//! lands in.

pub mod nmea;
pub mod ubx;

use crate::error::NmeaError;
use crate::irq::{CapturedEdge, EdgeCell};
use crate::pps::PPS_TIMEOUT_US;
use crate::status::LeapPending;
use chrono::{DateTime, Datelike};
use log::{debug, info, warn};
use nmea::{FixType, FrameEvent, NmeaFramer, Sentence};
use serde::Serialize;
use std::sync::Arc;
use ubx::{FirmwareVersion, LeapSecondInfo, UbxEvent, UbxFramer, UbxMessage};

pub const DEFAULT_NMEA_TIMEOUT_US: u64 = 5_000_000;
/// Receivers report 1980/2000-era dates before their first fix.
pub const MIN_VALID_YEAR: i32 = 2020;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GnssCounters {
    pub sentences: u64,
    pub nmea_errors: u64,
    pub overflows: u64,
    /// Well-formed sentences of a type we do not use.
    pub ignored: u64,
    pub ubx_frames: u64,
    pub ubx_errors: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GnssState {
    pub utc_unix: Option<i64>,
    pub time_valid: bool,
    pub fix: FixType,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<f64>,
    pub leap_offset: Option<i8>,
    pub leap_change: i8,
    pub firmware: Option<FirmwareVersion>,
    pub last_pps_us: Option<u64>,
    pub pps_count: u64,
    pub pps_valid: bool,
    pub counters: GnssCounters,
}

#[derive(Debug, Clone, Copy)]
struct UtcFix {
    unix: i64,
    year: i32,
    received_us: u64,
}

#[derive(Debug, Clone)]
struct LeapRecord {
    info: LeapSecondInfo,
    received_us: u64,
}

pub struct GnssReceiver {
    nmea: NmeaFramer,
    ubx: UbxFramer,
    nmea_timeout_us: u64,
    utc: Option<UtcFix>,
    fresh_utc: Option<i64>,
    gsa_fix: Option<(FixType, u64)>,
    gga_fix: FixType,
    satellites: u8,
    hdop: Option<f64>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    altitude: Option<f64>,
    leap: Option<LeapRecord>,
    firmware: Option<FirmwareVersion>,
    counters: GnssCounters,
}

impl GnssReceiver {
    pub fn new(nmea_timeout_us: u64) -> Self {
        GnssReceiver {
            nmea: NmeaFramer::new(),
            ubx: UbxFramer::new(),
            nmea_timeout_us,
            utc: None,
            fresh_utc: None,
            gsa_fix: None,
            gga_fix: FixType::None,
            satellites: 0,
            hdop: None,
            latitude: None,
            longitude: None,
            altitude: None,
            leap: None,
            firmware: None,
            counters: GnssCounters::default(),
        }
    }

    /// Bytes to write to the receiver to ask for firmware version and
    /// leap-second state.
    pub fn poll_requests() -> Vec<u8> {
        let mut out = ubx::poll_request(ubx::CLASS_MON, ubx::ID_MON_VER);
        out.extend(ubx::poll_request(ubx::CLASS_NAV, ubx::ID_NAV_TIMELS));
        out
    }

    pub fn feed(&mut self, bytes: &[u8], now_us: u64) {
        for &byte in bytes {
            if let Some(event) = self.ubx.push(byte) {
                self.handle_ubx(event, now_us);
            }
            match self.nmea.push(byte) {
                Some(FrameEvent::Sentence(raw)) => self.handle_sentence(&raw, now_us),
                Some(FrameEvent::Overflow) => {
                    self.counters.overflows += 1;
                    debug!("[GNSS] {}", NmeaError::BufferOverflow(nmea::MAX_SENTENCE_LEN));
                }
                Some(FrameEvent::Interrupted) | None => {}
            }
        }
    }

    fn handle_sentence(&mut self, raw: &[u8], now_us: u64) {
        let sentence = match nmea::parse_sentence(raw) {
            Ok(s) => s,
            Err(NmeaError::Unsupported(_)) => {
                self.counters.ignored += 1;
                return;
            }
            Err(e) => {
                self.counters.nmea_errors += 1;
                debug!("[GNSS] Dropped sentence: {}", e);
                return;
            }
        };
        self.counters.sentences += 1;

        match sentence {
            Sentence::Rmc(rmc) => {
                if rmc.valid {
                    if let Some(date) = rmc.date {
                        if let Some(unix) = nmea::unix_seconds(date, &rmc.time) {
                            self.record_utc(unix, date.year(), now_us);
                        }
                    }
                    self.latitude = rmc.latitude.or(self.latitude);
                    self.longitude = rmc.longitude.or(self.longitude);
                }
            }
            Sentence::Gga(gga) => {
                self.satellites = gga.satellites;
                self.hdop = gga.hdop;
                self.gga_fix = match (gga.quality, gga.altitude) {
                    (0, _) => FixType::None,
                    (_, Some(_)) => FixType::ThreeD,
                    (_, None) => FixType::TwoD,
                };
                if gga.quality > 0 {
                    self.altitude = gga.altitude;
                    self.latitude = gga.latitude.or(self.latitude);
                    self.longitude = gga.longitude.or(self.longitude);
                }
            }
            Sentence::Gsa(gsa) => {
                self.gsa_fix = Some((gsa.fix, now_us));
                if gsa.hdop.is_some() {
                    self.hdop = gsa.hdop;
                }
            }
            Sentence::Zda(zda) => {
                if let Some(unix) = nmea::unix_seconds(zda.date, &zda.time) {
                    self.record_utc(unix, zda.date.year(), now_us);
                }
            }
        }
    }

    fn record_utc(&mut self, unix: i64, year: i32, now_us: u64) {
        self.utc = Some(UtcFix {
            unix,
            year,
            received_us: now_us,
        });
        if year >= MIN_VALID_YEAR {
            self.fresh_utc = Some(unix);
        }
    }

    fn handle_ubx(&mut self, event: UbxEvent, now_us: u64) {
        let frame = match event {
            UbxEvent::Frame(frame) => frame,
            UbxEvent::ChecksumError | UbxEvent::Oversize => {
                self.counters.ubx_errors += 1;
                return;
            }
        };
        self.counters.ubx_frames += 1;
        match ubx::decode(&frame) {
            Ok(UbxMessage::LeapSeconds(info)) => {
                if info.change != 0 {
                    info!(
                        "[GNSS] Leap second {} announced in {:?} s",
                        if info.change > 0 { "insertion" } else { "deletion" },
                        info.time_to_event_s
                    );
                }
                self.leap = Some(LeapRecord {
                    info,
                    received_us: now_us,
                });
            }
            Ok(UbxMessage::Version(version)) => {
                info!("[GNSS] Receiver firmware {} (hw {})", version.software, version.hardware);
                self.firmware = Some(version);
            }
            Ok(UbxMessage::Other { class, id }) => {
                debug!("[GNSS] Ignoring UBX {:02X}-{:02X}", class, id);
            }
            Err(e) => {
                self.counters.ubx_errors += 1;
                warn!("[GNSS] UBX decode failed: {}", e);
            }
        }
    }

    /// UTC is usable: year ≥ 2020 and the sentence carrying it is younger
    /// than the NMEA timeout.
    pub fn time_valid(&self, now_us: u64) -> bool {
        self.utc.map_or(false, |u| {
            u.year >= MIN_VALID_YEAR && now_us.saturating_sub(u.received_us) < self.nmea_timeout_us
        })
    }

    /// Last UTC value received, regardless of age.
    pub fn utc_unix(&self) -> Option<i64> {
        self.utc.map(|u| u.unix)
    }

    /// UTC seconds from a sentence not yet handed out. One-shot.
    pub fn take_fresh_utc(&mut self) -> Option<i64> {
        self.fresh_utc.take()
    }

    /// GSA fix while GSA is current, GGA quality otherwise.
    pub fn fix_type(&self, now_us: u64) -> FixType {
        match self.gsa_fix {
            Some((fix, at)) if now_us.saturating_sub(at) < self.nmea_timeout_us => fix,
            _ => self.gga_fix,
        }
    }

    /// GPS − UTC in seconds, if the receiver reported it as valid.
    pub fn leap_offset(&self) -> Option<i8> {
        self.leap.as_ref().and_then(|l| l.info.current_offset)
    }

    /// Leap indication for the UTC day that ends with the announced event.
    pub fn leap_pending(&self, unix_now: i64, now_us: u64) -> LeapPending {
        let Some(record) = &self.leap else {
            return LeapPending::None;
        };
        let Some(time_to_event) = record.info.time_to_event_s else {
            return LeapPending::None;
        };
        if record.info.change == 0 {
            return LeapPending::None;
        }
        let elapsed_s = (now_us.saturating_sub(record.received_us) / 1_000_000) as i64;
        let event_unix = unix_now + i64::from(time_to_event) - elapsed_s;
        let (Some(event_day), Some(today)) = (
            DateTime::from_timestamp(event_unix - 1, 0),
            DateTime::from_timestamp(unix_now, 0),
        ) else {
            return LeapPending::None;
        };
        if event_day.date_naive() != today.date_naive() || unix_now >= event_unix {
            return LeapPending::None;
        }
        if record.info.change > 0 {
            LeapPending::Insert
        } else {
            LeapPending::Delete
        }
    }

    pub fn firmware(&self) -> Option<&FirmwareVersion> {
        self.firmware.as_ref()
    }

    pub fn counters(&self) -> GnssCounters {
        self.counters
    }

    pub fn state(&self, now_us: u64, pps: &GnssPps) -> GnssState {
        GnssState {
            utc_unix: self.utc_unix(),
            time_valid: self.time_valid(now_us),
            fix: self.fix_type(now_us),
            satellites: self.satellites,
            hdop: self.hdop,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            leap_offset: self.leap_offset(),
            leap_change: self.leap.as_ref().map_or(0, |l| l.info.change),
            firmware: self.firmware.clone(),
            last_pps_us: pps.last_pps_us(),
            pps_count: pps.pps_count(),
            pps_valid: pps.pps_valid(now_us),
            counters: self.counters,
        }
    }
}

/// GNSS-PPS input. The edge handler publishes into the shared cell; the
/// loop drains it with [`GnssPps::poll`].
#[derive(Debug, Default)]
pub struct GnssPps {
    cell: Arc<EdgeCell>,
    last_us: Option<u64>,
    count: u64,
}

impl GnssPps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for the interrupt side.
    pub fn cell(&self) -> Arc<EdgeCell> {
        Arc::clone(&self.cell)
    }

    pub fn poll(&mut self) -> Option<CapturedEdge> {
        let edge = self.cell.take()?;
        self.last_us = Some(edge.timestamp_us);
        self.count = edge.count;
        Some(edge)
    }

    pub fn last_pps_us(&self) -> Option<u64> {
        self.last_us
    }

    pub fn pps_count(&self) -> u64 {
        self.count
    }

    /// Last edge younger than 2 s.
    pub fn pps_valid(&self, now_us: u64) -> bool {
        self.last_us
            .map_or(false, |last| now_us.saturating_sub(last) < PPS_TIMEOUT_US)
    }
}
