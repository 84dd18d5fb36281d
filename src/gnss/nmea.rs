// NMEA 0183 framing and sentence parser for GNSS receivers
//
// Supported sentences (GP and GN talkers):
// - RMC - Recommended minimum: time, date, status, position
// - GGA - Fix data: quality, satellites, HDOP, altitude
// - GSA - DOP and active satellites: fix type
// - ZDA - Time and date

use crate::error::NmeaError;
use chrono::{NaiveDate, TimeZone, Utc};
use serde::Serialize;

/// Longest sentence accepted, including `$` and the checksum.
pub const MAX_SENTENCE_LEN: usize = 96;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FixType {
    None,
    TwoD,
    ThreeD,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UtcTime {
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub micros: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rmc {
    pub time: UtcTime,
    /// Status `A`
    pub valid: bool,
    pub date: Option<NaiveDate>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gga {
    pub time: Option<UtcTime>,
    pub quality: u8,
    pub satellites: u8,
    pub hdop: Option<f64>,
    pub altitude: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Gsa {
    pub fix: FixType,
    pub satellites_used: u8,
    pub pdop: Option<f64>,
    pub hdop: Option<f64>,
    pub vdop: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zda {
    pub time: UtcTime,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sentence {
    Rmc(Rmc),
    Gga(Gga),
    Gsa(Gsa),
    Zda(Zda),
}

/// XOR of every byte between `$` and `*`.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Framing outcome for one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete `$...` sentence, without CR/LF.
    Sentence(Vec<u8>),
    /// The sentence outgrew the buffer and was discarded.
    Overflow,
    /// A non-text byte interrupted a sentence (binary traffic); discarded
    /// without counting as an NMEA error.
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Idle,
    Collecting,
    /// Overflowed; wait for the next `$`.
    Discarding,
}

/// Byte-at-a-time sentence framer.
#[derive(Debug)]
pub struct NmeaFramer {
    buf: Vec<u8>,
    state: FrameState,
}

impl Default for NmeaFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl NmeaFramer {
    pub fn new() -> Self {
        NmeaFramer {
            buf: Vec::with_capacity(MAX_SENTENCE_LEN),
            state: FrameState::Idle,
        }
    }

    pub fn push(&mut self, byte: u8) -> Option<FrameEvent> {
        match byte {
            b'$' => {
                // A new start always re-syncs, dropping any partial sentence.
                self.buf.clear();
                self.buf.push(byte);
                self.state = FrameState::Collecting;
                None
            }
            b'\r' | b'\n' => {
                if self.state == FrameState::Collecting && self.buf.len() > 1 {
                    self.state = FrameState::Idle;
                    return Some(FrameEvent::Sentence(std::mem::take(&mut self.buf)));
                }
                if self.state == FrameState::Collecting {
                    self.buf.clear();
                }
                self.state = FrameState::Idle;
                None
            }
            _ if self.state != FrameState::Collecting => None,
            0x20..=0x7e => {
                if self.buf.len() >= MAX_SENTENCE_LEN {
                    self.buf.clear();
                    self.state = FrameState::Discarding;
                    return Some(FrameEvent::Overflow);
                }
                self.buf.push(byte);
                None
            }
            _ => {
                self.buf.clear();
                self.state = FrameState::Idle;
                Some(FrameEvent::Interrupted)
            }
        }
    }
}

/// Validate framing and checksum, then parse a supported sentence.
///
/// Returns `Err(NmeaError::Unsupported)` for well-formed sentences this
/// parser does not consume; callers should not count those as failures.
pub fn parse_sentence(raw: &[u8]) -> Result<Sentence, NmeaError> {
    let raw = trim_line_end(raw);
    if raw.first() != Some(&b'$') {
        return Err(NmeaError::Framing);
    }
    if raw.len() > MAX_SENTENCE_LEN {
        return Err(NmeaError::BufferOverflow(MAX_SENTENCE_LEN));
    }
    let star = raw.iter().position(|&b| b == b'*').ok_or(NmeaError::Framing)?;
    let body = &raw[1..star];
    let declared = parse_hex_byte(&raw[star + 1..]).ok_or(NmeaError::Framing)?;
    let computed = checksum(body);
    if computed != declared {
        return Err(NmeaError::Checksum { computed, declared });
    }

    let text = std::str::from_utf8(body).map_err(|_| NmeaError::Framing)?;
    let fields: Vec<&str> = text.split(',').collect();
    let address = fields[0];
    if address.len() != 5 || !address.is_ascii() {
        return Err(NmeaError::Framing);
    }
    let (talker, kind) = address.split_at(2);
    if talker != "GP" && talker != "GN" {
        return Err(NmeaError::Unsupported(address.to_string()));
    }

    match kind {
        "RMC" => parse_rmc(&fields).map(Sentence::Rmc),
        "GGA" => parse_gga(&fields).map(Sentence::Gga),
        "GSA" => parse_gsa(&fields).map(Sentence::Gsa),
        "ZDA" => parse_zda(&fields).map(Sentence::Zda),
        _ => Err(NmeaError::Unsupported(address.to_string())),
    }
}

/// Unix seconds for a UTC date and time-of-day. A leap second (`:60`) maps
/// onto the first second of the next minute.
pub fn unix_seconds(date: NaiveDate, time: &UtcTime) -> Option<i64> {
    let second = time.second.min(59);
    let naive = date.and_hms_opt(time.hour as u32, time.minute as u32, second as u32)?;
    let base = Utc.from_utc_datetime(&naive).timestamp();
    Some(base + i64::from(time.second.saturating_sub(59)))
}

fn trim_line_end(raw: &[u8]) -> &[u8] {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\r' | b'\n') {
        end -= 1;
    }
    &raw[..end]
}

fn parse_hex_byte(digits: &[u8]) -> Option<u8> {
    if digits.len() != 2 {
        return None;
    }
    let text = std::str::from_utf8(digits).ok()?;
    u8::from_str_radix(text, 16).ok()
}

fn field<'a>(fields: &[&'a str], index: usize) -> &'a str {
    fields.get(index).copied().unwrap_or("")
}

fn parse_opt<T: std::str::FromStr>(
    fields: &[&str],
    index: usize,
    sentence: &'static str,
) -> Result<Option<T>, NmeaError> {
    let raw = field(fields, index);
    if raw.is_empty() {
        return Ok(None);
    }
    raw.parse()
        .map(Some)
        .map_err(|_| NmeaError::Field { sentence, index })
}

fn parse_time(raw: &str, sentence: &'static str, index: usize) -> Result<UtcTime, NmeaError> {
    let err = NmeaError::Field { sentence, index };
    if raw.len() < 6 || !raw.is_ascii() {
        return Err(err);
    }
    let (hms, frac) = raw.split_at(6);
    let num = |s: &str| s.parse::<u8>().map_err(|_| err.clone());
    let hour = num(&hms[0..2])?;
    let minute = num(&hms[2..4])?;
    let second = num(&hms[4..6])?;
    if hour > 23 || minute > 59 || second > 60 {
        return Err(err);
    }
    let micros = match frac.strip_prefix('.') {
        None if frac.is_empty() => 0,
        Some(digits) if !digits.is_empty() && digits.len() <= 6 => {
            let value: u32 = digits.parse().map_err(|_| err.clone())?;
            value * 10u32.pow(6 - digits.len() as u32)
        }
        _ => return Err(err),
    };
    Ok(UtcTime {
        hour,
        minute,
        second,
        micros,
    })
}

fn parse_rmc_date(raw: &str, index: usize) -> Result<Option<NaiveDate>, NmeaError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let err = NmeaError::Field {
        sentence: "RMC",
        index,
    };
    if raw.len() != 6 || !raw.is_ascii() {
        return Err(err);
    }
    let num = |s: &str| s.parse::<u32>().map_err(|_| err.clone());
    let day = num(&raw[0..2])?;
    let month = num(&raw[2..4])?;
    let yy = num(&raw[4..6])? as i32;
    let year = if yy < 80 { 2000 + yy } else { 1900 + yy };
    NaiveDate::from_ymd_opt(year, month, day).map(Some).ok_or(err)
}

fn parse_coordinate(
    value: &str,
    hemisphere: &str,
    sentence: &'static str,
    index: usize,
) -> Result<Option<f64>, NmeaError> {
    if value.is_empty() {
        return Ok(None);
    }
    let err = NmeaError::Field { sentence, index };
    let raw: f64 = value.parse().map_err(|_| err.clone())?;
    let degrees = (raw / 100.0).trunc();
    let minutes = raw - degrees * 100.0;
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        _ => Err(NmeaError::Field {
            sentence,
            index: index + 1,
        }),
    }
}

fn parse_rmc(fields: &[&str]) -> Result<Rmc, NmeaError> {
    if fields.len() < 10 {
        return Err(NmeaError::Field {
            sentence: "RMC",
            index: fields.len(),
        });
    }
    let time = parse_time(fields[1], "RMC", 1)?;
    let valid = match fields[2] {
        "A" => true,
        "V" => false,
        _ => {
            return Err(NmeaError::Field {
                sentence: "RMC",
                index: 2,
            })
        }
    };
    Ok(Rmc {
        time,
        valid,
        latitude: parse_coordinate(fields[3], fields[4], "RMC", 3)?,
        longitude: parse_coordinate(fields[5], fields[6], "RMC", 5)?,
        date: parse_rmc_date(fields[9], 9)?,
    })
}

fn parse_gga(fields: &[&str]) -> Result<Gga, NmeaError> {
    if fields.len() < 10 {
        return Err(NmeaError::Field {
            sentence: "GGA",
            index: fields.len(),
        });
    }
    let time = match fields[1] {
        "" => None,
        raw => Some(parse_time(raw, "GGA", 1)?),
    };
    Ok(Gga {
        time,
        latitude: parse_coordinate(fields[2], fields[3], "GGA", 2)?,
        longitude: parse_coordinate(fields[4], fields[5], "GGA", 4)?,
        quality: parse_opt(fields, 6, "GGA")?.unwrap_or(0),
        satellites: parse_opt(fields, 7, "GGA")?.unwrap_or(0),
        hdop: parse_opt(fields, 8, "GGA")?,
        altitude: parse_opt(fields, 9, "GGA")?,
    })
}

fn parse_gsa(fields: &[&str]) -> Result<Gsa, NmeaError> {
    if fields.len() < 3 {
        return Err(NmeaError::Field {
            sentence: "GSA",
            index: fields.len(),
        });
    }
    let fix = match fields[2] {
        "" | "1" => FixType::None,
        "2" => FixType::TwoD,
        "3" => FixType::ThreeD,
        _ => {
            return Err(NmeaError::Field {
                sentence: "GSA",
                index: 2,
            })
        }
    };
    let satellites_used = fields
        .iter()
        .skip(3)
        .take(12)
        .filter(|f| !f.is_empty())
        .count() as u8;
    Ok(Gsa {
        fix,
        satellites_used,
        pdop: parse_opt(fields, 15, "GSA")?,
        hdop: parse_opt(fields, 16, "GSA")?,
        vdop: parse_opt(fields, 17, "GSA")?,
    })
}

fn parse_zda(fields: &[&str]) -> Result<Zda, NmeaError> {
    if fields.len() < 5 {
        return Err(NmeaError::Field {
            sentence: "ZDA",
            index: fields.len(),
        });
    }
    let time = parse_time(fields[1], "ZDA", 1)?;
    let day: u32 = parse_opt(fields, 2, "ZDA")?.ok_or(NmeaError::Field {
        sentence: "ZDA",
        index: 2,
    })?;
    let month: u32 = parse_opt(fields, 3, "ZDA")?.ok_or(NmeaError::Field {
        sentence: "ZDA",
        index: 3,
    })?;
    let year: i32 = parse_opt(fields, 4, "ZDA")?.ok_or(NmeaError::Field {
        sentence: "ZDA",
        index: 4,
    })?;
    let date = NaiveDate::from_ymd_opt(year, month, day).ok_or(NmeaError::Field {
        sentence: "ZDA",
        index: 2,
    })?;
    Ok(Zda { time, date })
}

#[cfg(test)]
pub(crate) fn with_checksum(body: &str) -> String {
    format!("${}*{:02X}", body, checksum(body.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    const RMC: &str = "$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W*6A";

    #[test]
    fn test_reference_rmc_checksum() {
        match parse_sentence(RMC.as_bytes()).unwrap() {
            Sentence::Rmc(rmc) => {
                assert!(rmc.valid);
                assert_eq!(rmc.time.hour, 12);
                assert_eq!(rmc.time.minute, 35);
                assert_eq!(rmc.time.second, 19);
                assert_eq!(rmc.date, NaiveDate::from_ymd_opt(1994, 3, 23));
                let lat = rmc.latitude.unwrap();
                assert!((lat - 48.1173).abs() < 1e-4);
                let lon = rmc.longitude.unwrap();
                assert!((lon - 11.516_666).abs() < 1e-4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gn_talker_accepted() {
        let s = with_checksum("GNZDA,201530.00,04,07,2023,00,00");
        match parse_sentence(s.as_bytes()).unwrap() {
            Sentence::Zda(zda) => {
                assert_eq!(zda.date, NaiveDate::from_ymd_opt(2023, 7, 4).unwrap());
                assert_eq!(unix_seconds(zda.date, &zda.time), Some(1_688_501_730));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gga_fields() {
        let s = with_checksum("GPGGA,092750.000,5321.6802,N,00630.3372,W,1,8,1.03,61.7,M,55.2,M,,");
        match parse_sentence(s.as_bytes()).unwrap() {
            Sentence::Gga(gga) => {
                assert_eq!(gga.quality, 1);
                assert_eq!(gga.satellites, 8);
                assert_eq!(gga.hdop, Some(1.03));
                assert_eq!(gga.altitude, Some(61.7));
                assert!(gga.longitude.unwrap() < 0.0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_gsa_fix_type() {
        let s = with_checksum("GPGSA,A,3,04,05,,09,12,,,24,,,,,2.5,1.3,2.1");
        match parse_sentence(s.as_bytes()).unwrap() {
            Sentence::Gsa(gsa) => {
                assert_eq!(gsa.fix, FixType::ThreeD);
                assert_eq!(gsa.satellites_used, 5);
                assert_eq!(gsa.hdop, Some(1.3));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_fractional_seconds() {
        let t = parse_time("235959.25", "RMC", 1).unwrap();
        assert_eq!(t.micros, 250_000);
        assert!(parse_time("2359", "RMC", 1).is_err());
        assert!(parse_time("246000", "RMC", 1).is_err());
    }

    #[test]
    fn test_leap_second_maps_to_next_minute() {
        let date = NaiveDate::from_ymd_opt(2016, 12, 31).unwrap();
        let leap = UtcTime {
            hour: 23,
            minute: 59,
            second: 60,
            micros: 0,
        };
        let midnight = NaiveDate::from_ymd_opt(2017, 1, 1).unwrap();
        let zero = UtcTime {
            hour: 0,
            minute: 0,
            second: 0,
            micros: 0,
        };
        assert_eq!(unix_seconds(date, &leap), unix_seconds(midnight, &zero));
    }

    #[test]
    fn test_wrong_checksum_rejected() {
        let bad = RMC.replace("*6A", "*6B");
        assert_eq!(
            parse_sentence(bad.as_bytes()),
            Err(NmeaError::Checksum {
                computed: 0x6A,
                declared: 0x6B
            })
        );
    }

    #[test]
    fn test_missing_checksum_rejected() {
        assert_eq!(
            parse_sentence(b"$GPRMC,123519,A,4807.038,N,01131.000,E,022.4,084.4,230394,003.1,W"),
            Err(NmeaError::Framing)
        );
    }

    #[test]
    fn test_unsupported_sentence_reported() {
        let s = with_checksum("GPGSV,3,1,11,03,03,111,00");
        assert!(matches!(
            parse_sentence(s.as_bytes()),
            Err(NmeaError::Unsupported(_))
        ));
        let s = with_checksum("GLRMC,123519,A,,,,,,,230394,,");
        assert!(matches!(
            parse_sentence(s.as_bytes()),
            Err(NmeaError::Unsupported(_))
        ));
    }

    #[test]
    fn test_non_ascii_address_rejected() {
        // Five bytes, but byte 2 sits inside a multi-byte character
        let s = with_checksum("GéMC,123519,A,,,,,,,230394,,");
        assert_eq!(parse_sentence(s.as_bytes()), Err(NmeaError::Framing));
    }

    #[test]
    fn test_every_single_bit_flip_is_rejected() {
        let sentences = [
            RMC.to_string(),
            with_checksum("GNGGA,000001.00,,,,,0,00,99.99,,,,,,"),
            with_checksum("GPZDA,120000.00,01,01,2024,00,00"),
        ];
        for sentence in &sentences {
            assert!(parse_sentence(sentence.as_bytes()).is_ok());
            let star = sentence.find('*').unwrap();
            for pos in 1..star {
                for bit in 0..8 {
                    let mut bytes = sentence.as_bytes().to_vec();
                    bytes[pos] ^= 1 << bit;
                    assert!(
                        parse_sentence(&bytes).is_err(),
                        "flip of bit {} at {} accepted in {}",
                        bit,
                        pos,
                        sentence
                    );
                }
            }
        }
    }

    #[test]
    fn test_generated_sentences_round_trip_checksum() {
        let mut rng = rand::rng();
        for _ in 0..200 {
            let body = format!(
                "GPZDA,{:02}{:02}{:02}.{:02},{:02},{:02},{},00,00",
                rng.random_range(0..24),
                rng.random_range(0..60),
                rng.random_range(0..60),
                rng.random_range(0..100),
                rng.random_range(1..29),
                rng.random_range(1..13),
                rng.random_range(2020..2100)
            );
            let s = with_checksum(&body);
            assert!(parse_sentence(s.as_bytes()).is_ok(), "{}", s);
        }
    }

    #[test]
    fn test_framer_splits_on_crlf() {
        let mut framer = NmeaFramer::new();
        let mut out = Vec::new();
        for b in format!("junk{}\r\n{}\r\n", RMC, RMC).bytes() {
            if let Some(FrameEvent::Sentence(s)) = framer.push(b) {
                out.push(s);
            }
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], RMC.as_bytes());
    }

    #[test]
    fn test_framer_overflow_resyncs_on_dollar() {
        let mut framer = NmeaFramer::new();
        let mut events = Vec::new();
        let long = format!("$GPTXT,{}", "X".repeat(MAX_SENTENCE_LEN + 10));
        for b in format!("{}\r\n{}\r\n", long, RMC).bytes() {
            if let Some(ev) = framer.push(b) {
                events.push(ev);
            }
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], FrameEvent::Overflow);
        assert_eq!(events[1], FrameEvent::Sentence(RMC.as_bytes().to_vec()));
    }

    #[test]
    fn test_framer_binary_byte_interrupts() {
        let mut framer = NmeaFramer::new();
        let mut events = Vec::new();
        let mut bytes = b"$GPRMC,12".to_vec();
        bytes.extend_from_slice(&[0xB5, 0x62]);
        bytes.extend_from_slice(b"3519\r\n");
        for b in bytes {
            if let Some(ev) = framer.push(b) {
                events.push(ev);
            }
        }
        assert_eq!(events, vec![FrameEvent::Interrupted]);
    }
}
