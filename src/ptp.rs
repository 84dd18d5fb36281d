//! IEEE 1588-2008 (PTPv2) message codecs for a two-step grandmaster.
//!
//! Timestamps are 48-bit seconds since the Unix epoch plus nanoseconds.

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

pub const PTP_MULTICAST_ADDR: &str = "224.0.1.129";
pub const PTP_EVENT_PORT: u16 = 319;
pub const PTP_GENERAL_PORT: u16 = 320;
pub const PTP_VERSION: u8 = 2;

pub const HEADER_SIZE: usize = 34;
pub const SYNC_SIZE: usize = 44;
pub const FOLLOW_UP_SIZE: usize = 44;
pub const DELAY_REQ_SIZE: usize = 44;
pub const DELAY_RESP_SIZE: usize = 54;
pub const ANNOUNCE_SIZE: usize = 64;

pub const FLAG_TWO_STEP: u16 = 0x0200;
pub const FLAG_LEAP61: u16 = 0x0001;
pub const FLAG_LEAP59: u16 = 0x0002;
pub const FLAG_UTC_OFFSET_VALID: u16 = 0x0004;

pub const TIME_SOURCE_ATOMIC_CLOCK: u8 = 0x10;
pub const TIME_SOURCE_GPS: u8 = 0x20;
pub const TIME_SOURCE_INTERNAL_OSCILLATOR: u8 = 0xA0;

pub const CLOCK_CLASS_LOCKED: u8 = 6;
pub const CLOCK_CLASS_HOLDOVER: u8 = 7;
pub const CLOCK_CLASS_DEFAULT: u8 = 248;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum MessageType {
    Sync = 0x0,
    DelayReq = 0x1,
    FollowUp = 0x8,
    DelayResp = 0x9,
    Announce = 0xB,
    Other = 0xF,
}

impl From<u8> for MessageType {
    fn from(v: u8) -> Self {
        match v & 0x0F {
            0x0 => MessageType::Sync,
            0x1 => MessageType::DelayReq,
            0x8 => MessageType::FollowUp,
            0x9 => MessageType::DelayResp,
            0xB => MessageType::Announce,
            _ => MessageType::Other,
        }
    }
}

impl MessageType {
    /// Legacy controlField value.
    fn control(self) -> u8 {
        match self {
            MessageType::Sync => 0,
            MessageType::DelayReq => 1,
            MessageType::FollowUp => 2,
            MessageType::DelayResp => 3,
            _ => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockIdentity(pub [u8; 8]);

impl ClockIdentity {
    /// EUI-64 from a MAC: insert FF:FE between OUI and NIC halves.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        ClockIdentity([mac[0], mac[1], mac[2], 0xFF, 0xFE, mac[3], mac[4], mac[5]])
    }
}

impl std::fmt::Display for ClockIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}.{:02x}{:02x}.{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortIdentity {
    pub clock: ClockIdentity,
    pub port: u16,
}

impl PortIdentity {
    fn read(rdr: &mut Cursor<&[u8]>) -> Result<Self> {
        let mut id = [0u8; 8];
        for b in id.iter_mut() {
            *b = rdr.read_u8()?;
        }
        let port = rdr.read_u16::<BigEndian>()?;
        Ok(PortIdentity {
            clock: ClockIdentity(id),
            port,
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.extend_from_slice(&self.clock.0);
        out.write_u16::<BigEndian>(self.port)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PtpTimestamp {
    /// 48 bits on the wire
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl PtpTimestamp {
    pub fn new(seconds: u64, nanoseconds: u32) -> Self {
        PtpTimestamp {
            seconds: seconds & 0xFFFF_FFFF_FFFF,
            nanoseconds,
        }
    }

    pub fn from_ntp(ts: crate::timestamp::NtpTimestamp) -> Self {
        PtpTimestamp::new(ts.unix_seconds().max(0) as u64, ts.subsec_nanos())
    }

    pub fn to_nanos(&self) -> i128 {
        self.seconds as i128 * 1_000_000_000 + self.nanoseconds as i128
    }

    fn read(rdr: &mut Cursor<&[u8]>) -> Result<Self> {
        let hi = rdr.read_u16::<BigEndian>()? as u64;
        let lo = rdr.read_u32::<BigEndian>()? as u64;
        let nanoseconds = rdr.read_u32::<BigEndian>()?;
        if nanoseconds >= 1_000_000_000 {
            return Err(anyhow!("PTP timestamp nanoseconds {} out of range", nanoseconds));
        }
        Ok(PtpTimestamp {
            seconds: (hi << 32) | lo,
            nanoseconds,
        })
    }

    fn write(&self, out: &mut Vec<u8>) -> Result<()> {
        out.write_u16::<BigEndian>((self.seconds >> 32) as u16)?;
        out.write_u32::<BigEndian>(self.seconds as u32)?;
        out.write_u32::<BigEndian>(self.nanoseconds)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpHeader {
    pub message_type: MessageType,
    pub version: u8,
    pub message_length: u16,
    pub domain: u8,
    pub flags: u16,
    pub correction: i64,
    pub source: PortIdentity,
    pub sequence_id: u16,
    pub control: u8,
    pub log_interval: i8,
}

impl PtpHeader {
    pub fn new(message_type: MessageType, domain: u8, source: PortIdentity, sequence_id: u16) -> Self {
        PtpHeader {
            message_type,
            version: PTP_VERSION,
            message_length: 0,
            domain,
            flags: 0,
            correction: 0,
            source,
            sequence_id,
            control: message_type.control(),
            log_interval: 0,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(anyhow!("Packet too short for PTP header"));
        }
        let mut rdr = Cursor::new(data);
        let message_type = MessageType::from(rdr.read_u8()?);
        let version = rdr.read_u8()? & 0x0F;
        if version != PTP_VERSION {
            return Err(anyhow!("Unsupported PTP version {}", version));
        }
        let message_length = rdr.read_u16::<BigEndian>()?;
        let domain = rdr.read_u8()?;
        let _reserved = rdr.read_u8()?;
        let flags = rdr.read_u16::<BigEndian>()?;
        let correction = rdr.read_i64::<BigEndian>()?;
        rdr.set_position(rdr.position() + 4);
        let source = PortIdentity::read(&mut rdr)?;
        let sequence_id = rdr.read_u16::<BigEndian>()?;
        let control = rdr.read_u8()?;
        let log_interval = rdr.read_i8()?;
        Ok(PtpHeader {
            message_type,
            version,
            message_length,
            domain,
            flags,
            correction,
            source,
            sequence_id,
            control,
            log_interval,
        })
    }

    fn write(&self, out: &mut Vec<u8>, length: usize) -> Result<()> {
        out.write_u8(self.message_type as u8)?;
        out.write_u8(self.version)?;
        out.write_u16::<BigEndian>(length as u16)?;
        out.write_u8(self.domain)?;
        out.write_u8(0)?;
        out.write_u16::<BigEndian>(self.flags)?;
        out.write_i64::<BigEndian>(self.correction)?;
        out.write_u32::<BigEndian>(0)?;
        self.source.write(out)?;
        out.write_u16::<BigEndian>(self.sequence_id)?;
        out.write_u8(self.control)?;
        out.write_i8(self.log_interval)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceBody {
    pub origin: PtpTimestamp,
    pub current_utc_offset: i16,
    pub priority1: u8,
    pub clock_class: u8,
    pub clock_accuracy: u8,
    pub offset_scaled_log_variance: u16,
    pub priority2: u8,
    pub grandmaster: ClockIdentity,
    pub steps_removed: u16,
    pub time_source: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtpMessage {
    Sync { header: PtpHeader, origin: PtpTimestamp },
    FollowUp { header: PtpHeader, precise_origin: PtpTimestamp },
    DelayReq { header: PtpHeader, origin: PtpTimestamp },
    DelayResp { header: PtpHeader, receive: PtpTimestamp, requesting: PortIdentity },
    Announce { header: PtpHeader, body: AnnounceBody },
    Other { header: PtpHeader },
}

pub fn parse_message(data: &[u8]) -> Result<PtpMessage> {
    let header = PtpHeader::parse(data)?;
    let need = match header.message_type {
        MessageType::Sync | MessageType::FollowUp | MessageType::DelayReq => SYNC_SIZE,
        MessageType::DelayResp => DELAY_RESP_SIZE,
        MessageType::Announce => ANNOUNCE_SIZE,
        MessageType::Other => HEADER_SIZE,
    };
    if data.len() < need {
        return Err(anyhow!(
            "{:?} truncated: {} of {} bytes",
            header.message_type,
            data.len(),
            need
        ));
    }
    let mut rdr = Cursor::new(data);
    rdr.set_position(HEADER_SIZE as u64);
    Ok(match header.message_type {
        MessageType::Sync => PtpMessage::Sync {
            header,
            origin: PtpTimestamp::read(&mut rdr)?,
        },
        MessageType::FollowUp => PtpMessage::FollowUp {
            header,
            precise_origin: PtpTimestamp::read(&mut rdr)?,
        },
        MessageType::DelayReq => PtpMessage::DelayReq {
            header,
            origin: PtpTimestamp::read(&mut rdr)?,
        },
        MessageType::DelayResp => PtpMessage::DelayResp {
            header,
            receive: PtpTimestamp::read(&mut rdr)?,
            requesting: PortIdentity::read(&mut rdr)?,
        },
        MessageType::Announce => {
            let origin = PtpTimestamp::read(&mut rdr)?;
            let current_utc_offset = rdr.read_i16::<BigEndian>()?;
            let _reserved = rdr.read_u8()?;
            let priority1 = rdr.read_u8()?;
            let clock_class = rdr.read_u8()?;
            let clock_accuracy = rdr.read_u8()?;
            let offset_scaled_log_variance = rdr.read_u16::<BigEndian>()?;
            let priority2 = rdr.read_u8()?;
            let gm = PortIdentity::read(&mut rdr)?;
            // PortIdentity::read consumed stepsRemoved as the port field
            let steps_removed = gm.port;
            let time_source = rdr.read_u8()?;
            PtpMessage::Announce {
                header,
                body: AnnounceBody {
                    origin,
                    current_utc_offset,
                    priority1,
                    clock_class,
                    clock_accuracy,
                    offset_scaled_log_variance,
                    priority2,
                    grandmaster: gm.clock,
                    steps_removed,
                    time_source,
                },
            }
        }
        MessageType::Other => PtpMessage::Other { header },
    })
}

/// Two-step Sync; the origin timestamp is a placeholder.
pub fn build_sync(header: &PtpHeader, origin: PtpTimestamp) -> Result<Vec<u8>> {
    let mut h = *header;
    h.message_type = MessageType::Sync;
    h.control = MessageType::Sync.control();
    h.flags |= FLAG_TWO_STEP;
    let mut out = Vec::with_capacity(SYNC_SIZE);
    h.write(&mut out, SYNC_SIZE)?;
    origin.write(&mut out)?;
    Ok(out)
}

pub fn build_follow_up(header: &PtpHeader, precise_origin: PtpTimestamp) -> Result<Vec<u8>> {
    let mut h = *header;
    h.message_type = MessageType::FollowUp;
    h.control = MessageType::FollowUp.control();
    let mut out = Vec::with_capacity(FOLLOW_UP_SIZE);
    h.write(&mut out, FOLLOW_UP_SIZE)?;
    precise_origin.write(&mut out)?;
    Ok(out)
}

/// Delay_Resp for `request`: same sequence id and correction, the
/// requester's port identity echoed.
pub fn build_delay_resp(
    request: &PtpHeader,
    source: PortIdentity,
    receive: PtpTimestamp,
) -> Result<Vec<u8>> {
    let mut h = PtpHeader::new(MessageType::DelayResp, request.domain, source, request.sequence_id);
    h.correction = request.correction;
    let mut out = Vec::with_capacity(DELAY_RESP_SIZE);
    h.write(&mut out, DELAY_RESP_SIZE)?;
    receive.write(&mut out)?;
    request.source.write(&mut out)?;
    Ok(out)
}

pub fn build_announce(header: &PtpHeader, body: &AnnounceBody) -> Result<Vec<u8>> {
    let mut h = *header;
    h.message_type = MessageType::Announce;
    h.control = MessageType::Announce.control();
    let mut out = Vec::with_capacity(ANNOUNCE_SIZE);
    h.write(&mut out, ANNOUNCE_SIZE)?;
    body.origin.write(&mut out)?;
    out.write_i16::<BigEndian>(body.current_utc_offset)?;
    out.write_u8(0)?;
    out.write_u8(body.priority1)?;
    out.write_u8(body.clock_class)?;
    out.write_u8(body.clock_accuracy)?;
    out.write_u16::<BigEndian>(body.offset_scaled_log_variance)?;
    out.write_u8(body.priority2)?;
    out.extend_from_slice(&body.grandmaster.0);
    out.write_u16::<BigEndian>(body.steps_removed)?;
    out.write_u8(body.time_source)?;
    Ok(out)
}
