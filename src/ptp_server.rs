//! Two-step PTPv2 grandmaster: Sync + Follow_Up + Announce once a second,
//! Delay_Resp for every Delay_Req. No BMCA; this clock is always master.

use crate::config::PtpConfig;
use crate::error::CoreError;
use crate::net::{create_multicast_socket, interface_mac, select_interface};
use crate::ptp::{
    build_announce, build_delay_resp, build_follow_up, build_sync, parse_message, AnnounceBody,
    ClockIdentity, MessageType, PortIdentity, PtpHeader, PtpMessage, PtpTimestamp,
    CLOCK_CLASS_DEFAULT, CLOCK_CLASS_HOLDOVER, CLOCK_CLASS_LOCKED, FLAG_LEAP59, FLAG_LEAP61,
    FLAG_UTC_OFFSET_VALID, PTP_EVENT_PORT, PTP_GENERAL_PORT, PTP_MULTICAST_ADDR,
    TIME_SOURCE_ATOMIC_CLOCK, TIME_SOURCE_GPS, TIME_SOURCE_INTERNAL_OSCILLATOR,
};
use crate::status::{LeapPending, ServiceView};
use crate::sync_state::{Reference, SyncState};
use crate::traits::{ClockView, DatagramSocket};
use anyhow::Result;
use log::{debug, info, trace, warn};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr, UdpSocket};

const SYNC_INTERVAL_US: u64 = 1_000_000;
const MAX_MESSAGES_PER_POLL: usize = 64;
const DEFAULT_PRIORITY: u8 = 128;
/// TAI - UTC when GNSS has not reported it.
const DEFAULT_UTC_OFFSET: i16 = 37;
/// GPS time is TAI - 19 s.
const GPS_TAI_OFFSET: i16 = 19;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PtpStats {
    pub sync_sent: u64,
    pub follow_up_sent: u64,
    pub announce_sent: u64,
    pub delay_req: u64,
    pub delay_resp_sent: u64,
    pub tx_errors: u64,
    pub dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtpDestinations {
    pub event: SocketAddr,
    pub general: SocketAddr,
}

impl Default for PtpDestinations {
    fn default() -> Self {
        let group: IpAddr = PTP_MULTICAST_ADDR
            .parse()
            .unwrap_or(IpAddr::from([224, 0, 1, 129]));
        PtpDestinations {
            event: SocketAddr::new(group, PTP_EVENT_PORT),
            general: SocketAddr::new(group, PTP_GENERAL_PORT),
        }
    }
}

pub fn clock_class(view: &ServiceView) -> u8 {
    match view.sync_state {
        SyncState::Locked => CLOCK_CLASS_LOCKED,
        SyncState::Holdover if view.time_valid => CLOCK_CLASS_HOLDOVER,
        _ => CLOCK_CLASS_DEFAULT,
    }
}

pub fn time_source(view: &ServiceView) -> u8 {
    match view.reference {
        Reference::Gnss => TIME_SOURCE_GPS,
        Reference::Rubidium => TIME_SOURCE_ATOMIC_CLOCK,
        Reference::None => TIME_SOURCE_INTERNAL_OSCILLATOR,
    }
}

pub struct PtpServer<S: DatagramSocket, C: ClockView> {
    event: S,
    general: S,
    clock: C,
    port: PortIdentity,
    domain: u8,
    dest: PtpDestinations,
    /// GPS - UTC as reported by the receiver.
    gps_utc_offset: Option<i8>,
    sync_seq: u16,
    announce_seq: u16,
    next_sync_us: Option<u64>,
    stats: PtpStats,
}

impl<C: ClockView> PtpServer<UdpSocket, C> {
    /// Join the PTP multicast group on the configured (or best) interface.
    pub fn bind(config: &PtpConfig, clock: C) -> Result<Self> {
        let iface = select_interface(config.interface.as_deref())?;
        let mac = interface_mac(&iface, config.mac.as_deref())?;
        let event = create_multicast_socket(PTP_EVENT_PORT, iface.addr)?;
        let general = create_multicast_socket(PTP_GENERAL_PORT, iface.addr)?;
        let identity = ClockIdentity::from_mac(mac);
        info!(
            "[PTP] Grandmaster {} on {} ({}), domain {}",
            identity, iface.name, iface.addr, config.domain
        );
        Ok(PtpServer::new(event, general, clock, identity, config.domain))
    }
}

impl<S: DatagramSocket, C: ClockView> PtpServer<S, C> {
    pub fn new(event: S, general: S, clock: C, identity: ClockIdentity, domain: u8) -> Self {
        PtpServer {
            event,
            general,
            clock,
            port: PortIdentity {
                clock: identity,
                port: 1,
            },
            domain,
            dest: PtpDestinations::default(),
            gps_utc_offset: None,
            sync_seq: 0,
            announce_seq: 0,
            next_sync_us: None,
            stats: PtpStats::default(),
        }
    }

    pub fn with_destinations(mut self, dest: PtpDestinations) -> Self {
        self.dest = dest;
        self
    }

    pub fn set_gps_utc_offset(&mut self, offset: Option<i8>) {
        self.gps_utc_offset = offset;
    }

    pub fn stats(&self) -> PtpStats {
        self.stats
    }

    pub fn identity(&self) -> PortIdentity {
        self.port
    }

    /// Answer pending Delay_Req and run the 1 Hz tick when due.
    pub fn poll(&mut self, now_us: u64) -> usize {
        let handled = self.poll_event();
        self.drain_general();
        if self.next_sync_us.map_or(true, |due| now_us >= due) {
            self.tick();
            // Skip missed seconds rather than bursting
            let next = self.next_sync_us.unwrap_or(now_us) + SYNC_INTERVAL_US;
            self.next_sync_us = Some(if next <= now_us { now_us + SYNC_INTERVAL_US } else { next });
        }
        handled
    }

    fn poll_event(&mut self) -> usize {
        let mut buf = [0u8; 256];
        let mut handled = 0;
        while handled < MAX_MESSAGES_PER_POLL {
            match self.event.recv_from(&mut buf) {
                Ok((size, src)) => {
                    let receive = self.clock.now();
                    handled += 1;
                    self.handle_event(&buf[..size], src, PtpTimestamp::from_ntp(receive));
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => break,
                Err(e) => {
                    warn!("[PTP] Event socket error: {}", e);
                    break;
                }
            }
        }
        handled
    }

    fn handle_event(&mut self, data: &[u8], src: SocketAddr, receive: PtpTimestamp) {
        match parse_message(data) {
            Ok(PtpMessage::DelayReq { header, .. }) if header.domain == self.domain => {
                self.stats.delay_req += 1;
                match build_delay_resp(&header, self.port, receive) {
                    Ok(resp) => {
                        if self.send(Channel::General, &resp) {
                            self.stats.delay_resp_sent += 1;
                            trace!("[PTP] Delay_Resp seq {} to {}", header.sequence_id, header.source.clock);
                        }
                    }
                    Err(e) => {
                        self.stats.dropped += 1;
                        warn!("[PTP] Delay_Resp build failed: {}", e);
                    }
                }
            }
            Ok(other) => trace!("[PTP] Ignored {:?} from {}", message_type(&other), src),
            Err(e) => {
                self.stats.dropped += 1;
                debug!("[PTP] Dropped {} bytes from {}: {}", data.len(), src, e);
            }
        }
    }

    /// Other masters' Announce or Follow_Up; nothing to do with them.
    fn drain_general(&mut self) {
        let mut buf = [0u8; 256];
        for _ in 0..MAX_MESSAGES_PER_POLL {
            if self.general.recv_from(&mut buf).is_err() {
                break;
            }
        }
    }

    fn header(&self, msg: MessageType, seq: u16, view: &ServiceView) -> PtpHeader {
        let mut h = PtpHeader::new(msg, self.domain, self.port, seq);
        if msg == MessageType::Announce {
            if self.gps_utc_offset.is_some() {
                h.flags |= FLAG_UTC_OFFSET_VALID;
            }
            h.flags |= match view.leap {
                LeapPending::Insert => FLAG_LEAP61,
                LeapPending::Delete => FLAG_LEAP59,
                LeapPending::None => 0,
            };
        }
        h
    }

    /// Sync, then Follow_Up with the time read right after it left.
    pub fn tick(&mut self) {
        let view = self.clock.view();
        let seq = self.sync_seq;
        self.sync_seq = self.sync_seq.wrapping_add(1);

        let sync_header = self.header(MessageType::Sync, seq, &view);
        let sync = match build_sync(&sync_header, PtpTimestamp::default()) {
            Ok(pkt) => pkt,
            Err(e) => {
                warn!("[PTP] Sync build failed: {}", e);
                return;
            }
        };
        if !self.send(Channel::Event, &sync) {
            return;
        }
        let precise = PtpTimestamp::from_ntp(self.clock.now());
        self.stats.sync_sent += 1;

        let follow_header = self.header(MessageType::FollowUp, seq, &view);
        match build_follow_up(&follow_header, precise) {
            Ok(pkt) => {
                if self.send(Channel::General, &pkt) {
                    self.stats.follow_up_sent += 1;
                }
            }
            Err(e) => warn!("[PTP] Follow_Up build failed: {}", e),
        }

        self.announce(&view, precise);
    }

    fn announce(&mut self, view: &ServiceView, origin: PtpTimestamp) {
        let seq = self.announce_seq;
        self.announce_seq = self.announce_seq.wrapping_add(1);
        let header = self.header(MessageType::Announce, seq, view);
        let body = AnnounceBody {
            origin,
            current_utc_offset: self
                .gps_utc_offset
                .map_or(DEFAULT_UTC_OFFSET, |o| o as i16 + GPS_TAI_OFFSET),
            priority1: DEFAULT_PRIORITY,
            clock_class: clock_class(view),
            // 0x21: within 100 ns; 0xFE: unknown
            clock_accuracy: if view.sync_state == SyncState::Locked { 0x21 } else { 0xFE },
            offset_scaled_log_variance: 0xFFFF,
            priority2: DEFAULT_PRIORITY,
            grandmaster: self.port.clock,
            steps_removed: 0,
            time_source: time_source(view),
        };
        match build_announce(&header, &body) {
            Ok(pkt) => {
                if self.send(Channel::General, &pkt) {
                    self.stats.announce_sent += 1;
                }
            }
            Err(e) => warn!("[PTP] Announce build failed: {}", e),
        }
    }

    fn send(&mut self, channel: Channel, pkt: &[u8]) -> bool {
        let (socket, dest) = match channel {
            Channel::Event => (&self.event, self.dest.event),
            Channel::General => (&self.general, self.dest.general),
        };
        match socket.send_to(pkt, dest) {
            Ok(_) => true,
            Err(e) => {
                self.stats.tx_errors += 1;
                warn!("[PTP] {}", CoreError::TransientTransmitFailure(format!("{}: {}", dest, e)));
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Channel {
    Event,
    General,
}

fn message_type(msg: &PtpMessage) -> MessageType {
    match msg {
        PtpMessage::Sync { header, .. }
        | PtpMessage::FollowUp { header, .. }
        | PtpMessage::DelayReq { header, .. }
        | PtpMessage::DelayResp { header, .. }
        | PtpMessage::Announce { header, .. }
        | PtpMessage::Other { header } => header.message_type,
    }
}
