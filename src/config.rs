use crate::discipline::{DEFAULT_KI, DEFAULT_KP, TAU_FAST, TAU_SLOW};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub servo: ServoConfig,
    pub gnss: GnssConfig,
    pub ntp: NtpConfig,
    pub ptp: PtpConfig,
    pub sync: SyncConfig,
    pub reference: ReferenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServoConfig {
    pub kp: f64,
    pub ki: f64,
    pub tau_fast: u32,
    pub tau_slow: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GnssConfig {
    pub device: Option<String>,
    pub baud: u32,
    pub pps_device: Option<String>,
    pub nmea_timeout_ms: u64,
    /// Interval for MON-VER / NAV-TIMELS polls; 0 disables the binary channel.
    pub ubx_poll_interval_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NtpConfig {
    pub enabled: bool,
    pub bind: String,
    pub port: u16,
    pub min_poll: i8,
    pub max_poll: i8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtpConfig {
    pub enabled: bool,
    /// Interface name; auto-detected when unset.
    pub interface: Option<String>,
    pub domain: u8,
    /// `aa:bb:cc:dd:ee:ff`; a locally administered address is used when unset.
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub init_timeout_s: u64,
    pub freq_cal_signal_timeout_s: u64,
    pub holdover_valid_s: u64,
    pub holdover_backup_valid_s: u64,
    pub holdover_max_s: u64,
    pub rb_stable_s: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReferenceConfig {
    pub pps_device: Option<String>,
    /// sysfs GPIO number of the rubidium lock line; lock assumed when unset.
    pub rb_lock_gpio: Option<u32>,
    pub internal_pps: bool,
    /// Seconds added to every served timestamp.
    pub epoch_offset: i64,
}

impl Default for ServoConfig {
    fn default() -> Self {
        ServoConfig {
            kp: DEFAULT_KP,
            ki: DEFAULT_KI,
            tau_fast: TAU_FAST,
            tau_slow: TAU_SLOW,
        }
    }
}

impl Default for GnssConfig {
    fn default() -> Self {
        GnssConfig {
            device: None,
            baud: 9600,
            pps_device: None,
            nmea_timeout_ms: 5_000,
            ubx_poll_interval_s: 600,
        }
    }
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            enabled: true,
            bind: "0.0.0.0".to_string(),
            port: 123,
            min_poll: 4,
            max_poll: 10,
        }
    }
}

impl Default for PtpConfig {
    fn default() -> Self {
        PtpConfig {
            enabled: true,
            interface: None,
            domain: 0,
            mac: None,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            init_timeout_s: 600,
            freq_cal_signal_timeout_s: 30,
            holdover_valid_s: 3_600,
            holdover_backup_valid_s: 7_200,
            holdover_max_s: 86_400,
            rb_stable_s: 300,
        }
    }
}

impl Default for ReferenceConfig {
    fn default() -> Self {
        ReferenceConfig {
            pps_device: None,
            rb_lock_gpio: None,
            internal_pps: false,
            epoch_offset: 0,
        }
    }
}

impl SystemConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let s = &self.servo;
        if !(s.kp.is_finite() && s.kp > 0.0) || !(s.ki.is_finite() && s.ki >= 0.0) {
            return Err(anyhow!("servo gains must be finite with kp > 0, ki >= 0"));
        }
        if s.tau_fast == 0 || s.tau_slow < s.tau_fast {
            return Err(anyhow!("servo tau_slow must be >= tau_fast > 0"));
        }
        if self.gnss.nmea_timeout_ms == 0 {
            return Err(anyhow!("gnss.nmea_timeout_ms must be positive"));
        }
        let n = &self.ntp;
        if n.min_poll > n.max_poll || n.min_poll < 0 || n.max_poll > 17 {
            return Err(anyhow!("ntp poll clamps {}..{} invalid", n.min_poll, n.max_poll));
        }
        let y = &self.sync;
        if y.holdover_backup_valid_s < y.holdover_valid_s || y.holdover_max_s < y.holdover_backup_valid_s {
            return Err(anyhow!("holdover windows must satisfy valid <= backup_valid <= max"));
        }
        if let Some(mac) = &self.ptp.mac {
            parse_mac(mac)?;
        }
        Ok(())
    }
}

/// `aa:bb:cc:dd:ee:ff` (or `-` separated).
pub fn parse_mac(text: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = text.split(|c| c == ':' || c == '-').collect();
    if parts.len() != 6 {
        return Err(anyhow!("MAC {:?} must have six octets", text));
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16).with_context(|| format!("MAC octet {:?}", part))?;
    }
    Ok(mac)
}
