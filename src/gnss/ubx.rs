//! u-blox UBX binary channel: framing plus the two messages the core uses,
//! MON-VER (firmware version) and NAV-TIMELS (leap-second state).
//!
//! Frame: `B5 62 class id len_lo len_hi payload.. ck_a ck_b`, with an 8-bit
//! Fletcher checksum over class through payload.

use anyhow::{anyhow, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::Cursor;

pub const SYNC_1: u8 = 0xB5;
pub const SYNC_2: u8 = 0x62;
pub const CLASS_NAV: u8 = 0x01;
pub const CLASS_MON: u8 = 0x0A;
pub const ID_NAV_TIMELS: u8 = 0x26;
pub const ID_MON_VER: u8 = 0x04;
pub const MAX_PAYLOAD: usize = 512;

const TIMELS_LEN: usize = 24;
const VER_SW_LEN: usize = 30;
const VER_HW_LEN: usize = 10;
const VER_EXT_LEN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UbxFrame {
    pub class: u8,
    pub id: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UbxEvent {
    Frame(UbxFrame),
    ChecksumError,
    Oversize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync1,
    Sync2,
    Class,
    Id,
    Len1,
    Len2,
    Payload,
    CkA,
    CkB,
}

/// Byte-at-a-time UBX frame assembler. Ignores everything outside frames,
/// so it can share a byte stream with NMEA.
#[derive(Debug)]
pub struct UbxFramer {
    state: State,
    class: u8,
    id: u8,
    len: usize,
    payload: Vec<u8>,
    ck_a: u8,
}

impl Default for UbxFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl UbxFramer {
    pub fn new() -> Self {
        UbxFramer {
            state: State::Sync1,
            class: 0,
            id: 0,
            len: 0,
            payload: Vec::new(),
            ck_a: 0,
        }
    }

    /// True while inside a frame (after both sync bytes).
    pub fn in_frame(&self) -> bool {
        !matches!(self.state, State::Sync1 | State::Sync2)
    }

    pub fn push(&mut self, byte: u8) -> Option<UbxEvent> {
        match self.state {
            State::Sync1 => {
                if byte == SYNC_1 {
                    self.state = State::Sync2;
                }
            }
            State::Sync2 => {
                self.state = match byte {
                    SYNC_2 => State::Class,
                    SYNC_1 => State::Sync2,
                    _ => State::Sync1,
                };
            }
            State::Class => {
                self.class = byte;
                self.state = State::Id;
            }
            State::Id => {
                self.id = byte;
                self.state = State::Len1;
            }
            State::Len1 => {
                self.len = byte as usize;
                self.state = State::Len2;
            }
            State::Len2 => {
                self.len |= (byte as usize) << 8;
                if self.len > MAX_PAYLOAD {
                    self.state = State::Sync1;
                    return Some(UbxEvent::Oversize);
                }
                self.payload.clear();
                self.state = if self.len == 0 {
                    State::CkA
                } else {
                    State::Payload
                };
            }
            State::Payload => {
                self.payload.push(byte);
                if self.payload.len() == self.len {
                    self.state = State::CkA;
                }
            }
            State::CkA => {
                self.ck_a = byte;
                self.state = State::CkB;
            }
            State::CkB => {
                self.state = State::Sync1;
                let (a, b) = fletcher(&self.header_and_payload());
                if a != self.ck_a || b != byte {
                    return Some(UbxEvent::ChecksumError);
                }
                return Some(UbxEvent::Frame(UbxFrame {
                    class: self.class,
                    id: self.id,
                    payload: std::mem::take(&mut self.payload),
                }));
            }
        }
        None
    }

    fn header_and_payload(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(4 + self.payload.len());
        data.push(self.class);
        data.push(self.id);
        data.extend_from_slice(&(self.len as u16).to_le_bytes());
        data.extend_from_slice(&self.payload);
        data
    }
}

/// 8-bit Fletcher checksum.
pub fn fletcher(data: &[u8]) -> (u8, u8) {
    let mut a: u8 = 0;
    let mut b: u8 = 0;
    for &byte in data {
        a = a.wrapping_add(byte);
        b = b.wrapping_add(a);
    }
    (a, b)
}

pub fn encode(class: u8, id: u8, payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD {
        return Err(anyhow!("UBX payload of {} bytes too large", payload.len()));
    }
    let mut out = Vec::with_capacity(8 + payload.len());
    out.push(SYNC_1);
    out.push(SYNC_2);
    out.push(class);
    out.push(id);
    out.write_u16::<LittleEndian>(payload.len() as u16)?;
    out.extend_from_slice(payload);
    let (a, b) = fletcher(&out[2..]);
    out.push(a);
    out.push(b);
    Ok(out)
}

/// Empty-payload poll request for `class`/`id`.
pub fn poll_request(class: u8, id: u8) -> Vec<u8> {
    let mut out = vec![SYNC_1, SYNC_2, class, id, 0, 0];
    let (a, b) = fletcher(&out[2..]);
    out.push(a);
    out.push(b);
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeapSecondInfo {
    /// GPS − UTC in seconds, when the receiver reports it valid.
    pub current_offset: Option<i8>,
    /// Announced change: +1 insertion, −1 deletion, 0 none.
    pub change: i8,
    /// Seconds until the change takes effect, when valid.
    pub time_to_event_s: Option<i32>,
}

impl LeapSecondInfo {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < TIMELS_LEN {
            return Err(anyhow!("NAV-TIMELS payload too short ({} bytes)", payload.len()));
        }
        let mut rdr = Cursor::new(payload);
        let _itow = rdr.read_u32::<LittleEndian>()?;
        let version = rdr.read_u8()?;
        if version != 0 {
            return Err(anyhow!("NAV-TIMELS version {} not understood", version));
        }
        rdr.set_position(8);
        let _src_curr = rdr.read_u8()?;
        let curr_ls = rdr.read_i8()?;
        let _src_change = rdr.read_u8()?;
        let change = rdr.read_i8()?;
        let time_to_event = rdr.read_i32::<LittleEndian>()?;
        let valid = payload[23];

        Ok(LeapSecondInfo {
            current_offset: (valid & 0x01 != 0).then_some(curr_ls),
            change: if valid & 0x02 != 0 { change.signum() } else { 0 },
            time_to_event_s: (valid & 0x02 != 0).then_some(time_to_event),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FirmwareVersion {
    pub software: String,
    pub hardware: String,
    pub extensions: Vec<String>,
}

impl FirmwareVersion {
    pub fn parse(payload: &[u8]) -> Result<Self> {
        if payload.len() < VER_SW_LEN + VER_HW_LEN {
            return Err(anyhow!("MON-VER payload too short ({} bytes)", payload.len()));
        }
        let software = c_string(&payload[..VER_SW_LEN]);
        let hardware = c_string(&payload[VER_SW_LEN..VER_SW_LEN + VER_HW_LEN]);
        let extensions = payload[VER_SW_LEN + VER_HW_LEN..]
            .chunks_exact(VER_EXT_LEN)
            .map(c_string)
            .filter(|s| !s.is_empty())
            .collect();
        Ok(FirmwareVersion {
            software,
            hardware,
            extensions,
        })
    }
}

fn c_string(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(&raw[..end]).trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UbxMessage {
    LeapSeconds(LeapSecondInfo),
    Version(FirmwareVersion),
    Other { class: u8, id: u8 },
}

pub fn decode(frame: &UbxFrame) -> Result<UbxMessage> {
    match (frame.class, frame.id) {
        (CLASS_NAV, ID_NAV_TIMELS) => LeapSecondInfo::parse(&frame.payload).map(UbxMessage::LeapSeconds),
        (CLASS_MON, ID_MON_VER) => FirmwareVersion::parse(&frame.payload).map(UbxMessage::Version),
        (class, id) => Ok(UbxMessage::Other { class, id }),
    }
}

#[cfg(test)]
pub(crate) fn timels_payload(curr_ls: i8, change: i8, time_to_event: i32, valid: u8) -> Vec<u8> {
    let mut p = vec![0u8; TIMELS_LEN];
    p[8] = 2;
    p[9] = curr_ls as u8;
    p[10] = 2;
    p[11] = change as u8;
    p[12..16].copy_from_slice(&time_to_event.to_le_bytes());
    p[23] = valid;
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(framer: &mut UbxFramer, bytes: &[u8]) -> Vec<UbxEvent> {
        bytes.iter().filter_map(|b| framer.push(*b)).collect()
    }

    #[test]
    fn test_poll_request_checksum() {
        // Known-good MON-VER poll
        assert_eq!(
            poll_request(CLASS_MON, ID_MON_VER),
            vec![0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34]
        );
    }

    #[test]
    fn test_frame_round_trip_through_framer() {
        let payload = timels_payload(18, 1, 3600, 0x03);
        let bytes = encode(CLASS_NAV, ID_NAV_TIMELS, &payload).unwrap();
        let mut framer = UbxFramer::new();
        let mut stream = b"$GPGSV,junk\r\n".to_vec();
        stream.extend_from_slice(&bytes);
        let events = feed(&mut framer, &stream);
        assert_eq!(events.len(), 1);
        let UbxEvent::Frame(frame) = &events[0] else {
            panic!("expected a frame, got {:?}", events[0]);
        };
        match decode(frame).unwrap() {
            UbxMessage::LeapSeconds(info) => {
                assert_eq!(info.current_offset, Some(18));
                assert_eq!(info.change, 1);
                assert_eq!(info.time_to_event_s, Some(3600));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_corrupt_checksum_reported() {
        let mut bytes = encode(CLASS_NAV, ID_NAV_TIMELS, &timels_payload(18, 0, 0, 1)).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        let mut framer = UbxFramer::new();
        assert_eq!(feed(&mut framer, &bytes), vec![UbxEvent::ChecksumError]);
    }

    #[test]
    fn test_invalid_flags_hide_values() {
        let info = LeapSecondInfo::parse(&timels_payload(18, -1, 100, 0)).unwrap();
        assert_eq!(info.current_offset, None);
        assert_eq!(info.change, 0);
        assert_eq!(info.time_to_event_s, None);
    }

    #[test]
    fn test_mon_ver_strings() {
        let mut payload = vec![0u8; VER_SW_LEN + VER_HW_LEN + VER_EXT_LEN];
        payload[..10].copy_from_slice(b"ROM CORE 3");
        payload[VER_SW_LEN..VER_SW_LEN + 8].copy_from_slice(b"00080000");
        payload[VER_SW_LEN + VER_HW_LEN..VER_SW_LEN + VER_HW_LEN + 12].copy_from_slice(b"PROTVER=18.0");
        let bytes = encode(CLASS_MON, ID_MON_VER, &payload).unwrap();
        let mut framer = UbxFramer::new();
        let events = feed(&mut framer, &bytes);
        let UbxEvent::Frame(frame) = &events[0] else {
            panic!("expected a frame");
        };
        let UbxMessage::Version(ver) = decode(frame).unwrap() else {
            panic!("expected MON-VER");
        };
        assert_eq!(ver.software, "ROM CORE 3");
        assert_eq!(ver.hardware, "00080000");
        assert_eq!(ver.extensions, vec!["PROTVER=18.0".to_string()]);
    }

    #[test]
    fn test_oversize_length_resyncs() {
        let mut framer = UbxFramer::new();
        let events = feed(&mut framer, &[0xB5, 0x62, 0x01, 0x26, 0xFF, 0xFF]);
        assert_eq!(events, vec![UbxEvent::Oversize]);
        assert!(!framer.in_frame());
    }
}
