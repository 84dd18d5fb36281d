//! NTP responder.
//!
//! Answers NTPv3/v4 client requests (mode 3) from the Time Oracle. Stratum,
//! leap indicator and root dispersion follow the synchronisation state:
//!
//! | state                     | stratum | LI            | dispersion          |
//! |---------------------------|---------|---------------|---------------------|
//! | LOCKED                    | 1       | leap/none     | 10 µs               |
//! | FINE                      | 2       | leap/none     | 100 µs              |
//! | HOLDOVER, time valid      | 2       | leap/none     | 10 µs + 15 µs/s     |
//! | INIT, ERROR               | 16      | alarm         | 16 s                |
//! | anything else             | 16      | leap/none     | 16 s                |
//!
//! Requests are polled from a non-blocking socket inside the cooperative
//! loop; nothing here blocks.

use crate::config::NtpConfig;
use crate::error::CoreError;
use crate::status::{LeapPending, ServiceView};
use crate::sync_state::SyncState;
use crate::timestamp::NtpTimestamp;
use crate::traits::{ActivityIndicator, ClockView, DatagramSocket, NoIndicator};
use anyhow::{anyhow, Result};
use log::{debug, info, warn};
use serde::Serialize;
use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};

// ============================================================================
// NTP PROTOCOL CONSTANTS
// ============================================================================

/// NTP packet size (48 bytes)
pub const NTP_PACKET_SIZE: usize = 48;

/// Mode: 3 = client
const MODE_CLIENT: u8 = 3;

/// Mode: 4 = server
const MODE_SERVER: u8 = 4;

pub const LI_NONE: u8 = 0;
pub const LI_INSERT: u8 = 1;
pub const LI_DELETE: u8 = 2;
pub const LI_ALARM: u8 = 3;

pub const STRATUM_PRIMARY: u8 = 1;
pub const STRATUM_SECONDARY: u8 = 2;
pub const STRATUM_UNSYNC: u8 = 16;

/// 2^-20 s ≈ 1 µs
pub const PRECISION: i8 = -20;

/// Reference ID: rubidium-disciplined master
pub const REF_ID: [u8; 4] = *b"RBDM";

const DISPERSION_LOCKED_US: u64 = 10;
const DISPERSION_FINE_US: u64 = 100;
const HOLDOVER_GROWTH_US_PER_S: u64 = 15;
const DISPERSION_UNSYNC_US: u64 = 16_000_000;

/// Requests handled per poll before yielding back to the loop.
const MAX_REQUESTS_PER_POLL: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NtpStats {
    pub served: u64,
    pub dropped: u64,
    pub tx_errors: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollLimits {
    pub min: i8,
    pub max: i8,
}

impl Default for PollLimits {
    fn default() -> Self {
        PollLimits { min: 4, max: 10 }
    }
}

pub fn leap_indicator(view: &ServiceView) -> u8 {
    match view.sync_state {
        SyncState::Init | SyncState::Error => LI_ALARM,
        _ => match view.leap {
            LeapPending::None => LI_NONE,
            LeapPending::Insert => LI_INSERT,
            LeapPending::Delete => LI_DELETE,
        },
    }
}

pub fn stratum(view: &ServiceView) -> u8 {
    match view.sync_state {
        SyncState::Locked => STRATUM_PRIMARY,
        SyncState::Fine => STRATUM_SECONDARY,
        SyncState::Holdover if view.time_valid => STRATUM_SECONDARY,
        _ => STRATUM_UNSYNC,
    }
}

/// Root dispersion in NTP short format (16.16 s), rounded up.
pub fn root_dispersion(view: &ServiceView) -> u32 {
    let us = match view.sync_state {
        SyncState::Locked => DISPERSION_LOCKED_US,
        SyncState::Fine => DISPERSION_FINE_US,
        SyncState::Holdover if view.time_valid => {
            DISPERSION_LOCKED_US + HOLDOVER_GROWTH_US_PER_S.saturating_mul(view.holdover_secs)
        }
        _ => DISPERSION_UNSYNC_US,
    };
    micros_to_short(us)
}

fn micros_to_short(us: u64) -> u32 {
    let short = (us as u128 * 65_536 + 999_999) / 1_000_000;
    short.min(u32::MAX as u128) as u32
}

/// Build a response for `request`, or `None` if it must be dropped.
///
/// The transmit timestamp is left zero; stamp it with [`stamp_transmit`]
/// immediately before sending.
pub fn build_response(
    request: &[u8],
    receive: NtpTimestamp,
    reference: NtpTimestamp,
    view: &ServiceView,
    limits: PollLimits,
) -> Option<[u8; NTP_PACKET_SIZE]> {
    if request.len() < NTP_PACKET_SIZE {
        return None;
    }
    let li_vn_mode = request[0];
    let version = ((li_vn_mode >> 3) & 0x07).clamp(3, 4);
    if li_vn_mode & 0x07 != MODE_CLIENT {
        return None;
    }
    let poll = (request[2] as i8).clamp(limits.min, limits.max);

    let mut response = [0u8; NTP_PACKET_SIZE];

    // Byte 0: LI (2 bits) | VN (3 bits) | Mode (3 bits)
    response[0] = (leap_indicator(view) << 6) | (version << 3) | MODE_SERVER;
    response[1] = stratum(view);
    response[2] = poll as u8;
    response[3] = PRECISION as u8;

    // Bytes 4-7: Root Delay, zero for a primary reference
    response[8..12].copy_from_slice(&root_dispersion(view).to_be_bytes());
    response[12..16].copy_from_slice(&REF_ID);
    response[16..24].copy_from_slice(&reference.whole_seconds().to_bytes());

    // Originate: client's transmit timestamp, untouched
    response[24..32].copy_from_slice(&request[40..48]);
    response[32..40].copy_from_slice(&receive.to_bytes());
    Some(response)
}

pub fn stamp_transmit(response: &mut [u8; NTP_PACKET_SIZE], transmit: NtpTimestamp) {
    response[40..48].copy_from_slice(&transmit.to_bytes());
}

// ============================================================================
// NTP SERVER
// ============================================================================

pub struct NtpServer<S: DatagramSocket, C: ClockView> {
    socket: S,
    clock: C,
    indicator: Box<dyn ActivityIndicator + Send>,
    limits: PollLimits,
    stats: NtpStats,
}

impl<C: ClockView> NtpServer<UdpSocket, C> {
    /// Bind a non-blocking UDP socket per `config`.
    pub fn bind(config: &NtpConfig, clock: C) -> Result<Self> {
        let bind_addr = format!("{}:{}", config.bind, config.port);
        let socket = UdpSocket::bind(&bind_addr).map_err(|e| {
            anyhow!(
                "Failed to bind NTP server to {}: {} (hint: port 123 requires root)",
                bind_addr,
                e
            )
        })?;
        socket.set_nonblocking(true)?;
        info!("[NTP-Server] Listening on {}", socket.local_addr()?);
        Ok(NtpServer::new(
            socket,
            clock,
            PollLimits {
                min: config.min_poll,
                max: config.max_poll,
            },
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl<S: DatagramSocket, C: ClockView> NtpServer<S, C> {
    pub fn new(socket: S, clock: C, limits: PollLimits) -> Self {
        NtpServer {
            socket,
            clock,
            indicator: Box::new(NoIndicator),
            limits,
            stats: NtpStats::default(),
        }
    }

    pub fn with_indicator(mut self, indicator: Box<dyn ActivityIndicator + Send>) -> Self {
        self.indicator = indicator;
        self
    }

    pub fn stats(&self) -> NtpStats {
        self.stats
    }

    /// Serve every pending request (bounded). Returns how many were read.
    pub fn poll(&mut self) -> usize {
        let mut buf = [0u8; 512];
        let mut handled = 0;
        while handled < MAX_REQUESTS_PER_POLL {
            match self.socket.recv_from(&mut buf) {
                Ok((size, src)) => {
                    // Receive timestamp before any parsing
                    let receive = self.clock.now();
                    handled += 1;
                    self.handle_request(&buf[..size], src, receive);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => break,
                Err(e) => {
                    warn!("[NTP-Server] Socket error: {}", e);
                    break;
                }
            }
        }
        handled
    }

    fn handle_request(&mut self, request: &[u8], src: SocketAddr, receive: NtpTimestamp) {
        let view = self.clock.view();
        let reference = self.clock.now();
        let Some(mut response) = build_response(request, receive, reference, &view, self.limits) else {
            self.stats.dropped += 1;
            debug!("[NTP-Server] Dropped {} byte request from {}", request.len(), src);
            return;
        };

        stamp_transmit(&mut response, self.clock.now());
        match self.socket.send_to(&response, src) {
            Ok(_) => {
                self.indicator.blink();
                self.stats.served += 1;
                debug!("[NTP-Server] Responded to {} (stratum {})", src, response[1]);
            }
            Err(e) => {
                self.stats.tx_errors += 1;
                warn!("[NTP-Server] {}", CoreError::TransientTransmitFailure(format!("{}: {}", src, e)));
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
