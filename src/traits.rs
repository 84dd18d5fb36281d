use crate::status::ServiceView;
use crate::timestamp::NtpTimestamp;
use std::io;
use std::net::{SocketAddr, UdpSocket};

/// Free-running microsecond timebase. Never steps, never slews.
#[cfg_attr(test, mockall::automock)]
pub trait MonotonicClock {
    fn now_us(&self) -> u64;
}

/// Digital input carrying the rubidium "locked" indication (asserted high).
#[cfg_attr(test, mockall::automock)]
pub trait LockLine {
    fn is_asserted(&self) -> bool;
}

/// Reference-oscillator cycle counter, latched at PPS edges.
#[cfg_attr(test, mockall::automock)]
pub trait CycleCounter {
    fn latch(&self) -> u64;
}

/// Output pin driven by the internal PPS generator.
#[cfg_attr(test, mockall::automock)]
pub trait PulseOutput {
    /// Emit one pulse; `cycle` is the reference cycle at which it was due.
    fn pulse(&mut self, cycle: u64);
}

/// Activity indicator blinked once per served request.
#[cfg_attr(test, mockall::automock)]
pub trait ActivityIndicator {
    fn blink(&mut self);
}

/// Datagram transport used by the NTP and PTP responders.
#[cfg_attr(test, mockall::automock)]
pub trait DatagramSocket {
    /// Returns `WouldBlock` when nothing is pending.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl DatagramSocket for UdpSocket {
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, addr)
    }
}

/// What the network responders may see of the core.
///
/// Every call returns a fresh snapshot; nothing here blocks for longer
/// than the core's critical section.
#[cfg_attr(test, mockall::automock)]
pub trait ClockView {
    /// Current Time Oracle reading.
    fn now(&self) -> NtpTimestamp;

    /// Synchronisation state relevant to response headers.
    fn view(&self) -> ServiceView;
}

pub struct NoIndicator;

impl ActivityIndicator for NoIndicator {
    fn blink(&mut self) {}
}
