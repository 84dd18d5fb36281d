//! End-to-end behaviour of the timekeeping core through its public API.

use rbsync::config::{NtpConfig, SystemConfig};
use rbsync::freq_counter::NOMINAL_COUNT;
use rbsync::gnss::nmea::checksum;
use rbsync::ntp_server::{build_response, NtpServer, PollLimits, NTP_PACKET_SIZE};
use rbsync::irq::{Edge, IrqTable, Line};
use rbsync::platform::{register_pps_handlers, FixedLockLine, LogPulseOutput};
use rbsync::ptp::{parse_message, ClockIdentity, PtpMessage};
use rbsync::ptp_server::{PtpDestinations, PtpServer};
use rbsync::sync_state::SyncState;
use rbsync::timekeeper::{lock_core, SharedClock, Timekeeper};
use rbsync::traits::MonotonicClock;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const S: u64 = 1_000_000;

fn core(rb_locked: bool) -> Timekeeper {
    let _ = env_logger::builder().is_test(true).try_init();
    Timekeeper::new(
        &SystemConfig::default(),
        Box::new(FixedLockLine(rb_locked)),
        Box::new(LogPulseOutput::default()),
        0,
    )
}

fn sentence(body: &str) -> String {
    format!("${}*{:02X}\r\n", body, checksum(body.as_bytes()))
}

/// Perfect 1 PPS and 10 MHz; the 10 Hz tick runs before the first edge
/// and right after each one.
fn run_perfect(core: &mut Timekeeper, edges: u64) {
    core.task(0);
    for i in 1..=edges {
        core.on_reference_edge(i * S, i * NOMINAL_COUNT);
        core.task(i * S + 1);
    }
}

#[derive(Clone, Default)]
struct SteppedClock(Arc<AtomicU64>);

impl MonotonicClock for SteppedClock {
    fn now_us(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[test]
fn cold_start_reaches_locked() {
    let mut c = core(true);
    run_perfect(&mut c, 10);
    assert_eq!(c.sync_state(), SyncState::Coarse);
    run_perfect_from(&mut c, 11, 20);
    assert_eq!(c.sync_state(), SyncState::Fine);
    run_perfect_from(&mut c, 21, 80);
    assert_eq!(c.sync_state(), SyncState::Locked);
    assert!(c.time_valid());
    assert!(c.offset_ns().abs() < 1_000);

    let now = 80 * S + 1;
    let mut request = [0u8; NTP_PACKET_SIZE];
    request[0] = (4 << 3) | 3;
    let response = build_response(
        &request,
        c.current_timestamp(now),
        c.current_timestamp(now),
        &c.service_view(now),
        PollLimits::default(),
    )
    .unwrap();
    assert_eq!(response[1], 1);
    assert_eq!(&response[12..16], b"RBDM");
}

fn run_perfect_from(core: &mut Timekeeper, first: u64, last: u64) {
    for i in first..=last {
        core.on_reference_edge(i * S, i * NOMINAL_COUNT);
        core.task(i * S + 1);
    }
}

#[test]
fn jitter_pulse_is_rejected() {
    let mut c = core(true);
    let mut t = 0;
    let mut seconds = Vec::new();
    for period in [S, S, 1_050_000, S] {
        t += period;
        c.on_reference_edge(t, t * 10);
        seconds.push(c.reference_clock().current_seconds);
    }
    assert_eq!(seconds, vec![1, 2, 2, 3]);
    assert_eq!(c.pps_counts().reference.invalid_count, 1);
}

#[test]
fn gnss_label_applies_to_next_edge() {
    let mut c = core(false);
    let rmc = sentence("GPRMC,221320.00,A,5230.000,N,01322.000,E,0.0,0.0,141123,,,A");
    c.feed_gnss_bytes(rmc.as_bytes(), 500_000);
    assert!(c.reference_clock().pending_utc_pps_latched);

    let note = c.on_reference_edge(S, NOMINAL_COUNT).unwrap();
    assert_eq!(note.seconds, 1_700_000_001);
    assert_eq!(c.current_timestamp(S).unix_seconds(), 1_700_000_001);
    assert!(!c.reference_clock().pending_utc_pps_latched);
}

#[test]
fn signal_loss_enters_holdover() {
    let mut c = core(true);
    run_perfect(&mut c, 80);
    let last_edge = 80 * S;

    assert!(c.task(last_edge + 1_900_000).is_none());
    assert!(c.pps_is_valid(last_edge + 1_999_999));
    assert!(!c.pps_is_valid(last_edge + 2 * S));

    let entered = last_edge + 2 * S;
    let t = c.task(entered).unwrap();
    assert_eq!(t.to, SyncState::Holdover);
    assert!(c.time_valid());

    // The served clock keeps running while no edges arrive
    let served = |c: &Timekeeper, at: u64| c.current_timestamp(at);
    assert_eq!(served(&c, last_edge + 500_000).unix_seconds(), 80);
    assert_eq!(served(&c, last_edge + 600 * S + 500_000).unix_seconds(), 680);
    assert_eq!(served(&c, last_edge + 600 * S + 500_000).fraction, 1 << 31);
    let view = c.service_view(last_edge + 600 * S);
    let mut request = [0u8; NTP_PACKET_SIZE];
    request[0] = (4 << 3) | 3;
    let at = last_edge + 600 * S + 500_000;
    let response = build_response(&request, served(&c, at), served(&c, at), &view, PollLimits::default()).unwrap();
    assert_eq!(response[1], 2);
    let rx_secs = u32::from_be_bytes([response[32], response[33], response[34], response[35]]);
    assert_eq!(rx_secs as u64, 680 + 2_208_988_800);

    c.task(entered + 3_600 * S);
    assert_eq!(c.sync_state(), SyncState::Holdover);
    assert!(c.time_valid());
    c.task(entered + 3_600 * S + 100_000);
    assert!(!c.time_valid());
}

#[test]
fn ntp_origin_echo_over_udp() {
    let mono = SteppedClock::default();
    let mut c = core(true);
    run_perfect(&mut c, 80);
    mono.0.store(80 * S + 250_000, Ordering::SeqCst);
    let shared = SharedClock::new(Arc::new(Mutex::new(c)), mono);

    let config = NtpConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        ..NtpConfig::default()
    };
    let mut server = NtpServer::bind(&config, shared).unwrap();
    let addr = server.local_addr().unwrap();

    let client = UdpSocket::bind("127.0.0.1:0").unwrap();
    client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut request = [0u8; NTP_PACKET_SIZE];
    request[0] = (4 << 3) | 3;
    request[40..48].copy_from_slice(&0xDEAD_BEEF_CAFE_BABE_u64.to_be_bytes());
    client.send_to(&request, addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while server.stats().served == 0 && Instant::now() < deadline {
        server.poll();
        std::thread::sleep(Duration::from_millis(5));
    }
    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    assert_eq!(n, NTP_PACKET_SIZE);
    assert_eq!(&buf[24..32], &[0xDE, 0xAD, 0xBE, 0xEF, 0xCA, 0xFE, 0xBA, 0xBE]);
    assert_eq!(buf[0] & 0x07, 4);
    assert_eq!(buf[1], 1);
}

#[test]
fn corrupt_nmea_is_counted_and_ignored() {
    let mut c = core(false);
    let good = sentence("GPRMC,221320.00,A,5230.000,N,01322.000,E,0.0,0.0,141123,,,A");
    // Flip one bit of the declared checksum
    let star = good.find('*').unwrap();
    let declared = u8::from_str_radix(&good[star + 1..star + 3], 16).unwrap();
    let corrupt = format!("{}*{:02X}\r\n", &good[..star], declared ^ 0x01);

    c.feed_gnss_bytes(corrupt.as_bytes(), 100_000);
    let state = c.gnss_state(100_000);
    assert_eq!(state.counters.nmea_errors, 1);
    assert_eq!(state.utc_unix, None);
    assert_eq!(state.latitude, None);
    assert!(!c.reference_clock().pending_utc_pps_latched);

    c.feed_gnss_bytes(good.as_bytes(), 200_000);
    let state = c.gnss_state(200_000);
    assert_eq!(state.counters.nmea_errors, 1);
    assert_eq!(state.utc_unix, Some(1_700_000_000));
    assert!(state.latitude.is_some());
}

#[test]
fn ptp_grandmaster_over_loopback() {
    let mono = SteppedClock::default();
    let mut c = core(true);
    run_perfect(&mut c, 80);
    mono.0.store(80 * S + 1, Ordering::SeqCst);
    let shared = SharedClock::new(Arc::new(Mutex::new(c)), mono);

    let listener = UdpSocket::bind("127.0.0.1:0").unwrap();
    listener.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let dest = listener.local_addr().unwrap();

    let event = UdpSocket::bind("127.0.0.1:0").unwrap();
    let general = UdpSocket::bind("127.0.0.1:0").unwrap();
    event.set_nonblocking(true).unwrap();
    general.set_nonblocking(true).unwrap();
    let identity = ClockIdentity::from_mac([0x00, 0x1B, 0x21, 0xAB, 0xCD, 0xEF]);
    let mut server = PtpServer::new(event, general, shared, identity, 0).with_destinations(PtpDestinations {
        event: dest,
        general: dest,
    });
    server.poll(0);

    let mut buf = [0u8; 128];
    let mut seen = Vec::new();
    for _ in 0..3 {
        let (n, _) = listener.recv_from(&mut buf).unwrap();
        seen.push(parse_message(&buf[..n]).unwrap());
    }
    assert!(matches!(seen[0], PtpMessage::Sync { .. }));
    match &seen[1] {
        PtpMessage::FollowUp { precise_origin, .. } => assert_eq!(precise_origin.seconds, 80),
        other => panic!("expected Follow_Up, got {:?}", other),
    }
    match &seen[2] {
        PtpMessage::Announce { body, .. } => {
            assert_eq!(body.clock_class, 6);
            assert_eq!(body.grandmaster, identity);
        }
        other => panic!("expected Announce, got {:?}", other),
    }
}

#[test]
fn kernel_stamped_edges_lock_through_the_edge_table() {
    let core = Arc::new(Mutex::new(core(true)));
    let mut irq = IrqTable::new();
    register_pps_handlers(&mut irq, &core);

    lock_core(&core).task(0);
    for i in 1..=80u64 {
        let stamp = i * S;
        irq.dispatch(Line::ReferencePps, Edge::Rising, stamp);
        // Tick lands 0.9 ms after the stamped edge
        lock_core(&core).task(stamp + 900);
    }
    let c = lock_core(&core);
    assert_eq!(c.sync_state(), SyncState::Locked);
    assert!(c.offset_ns().abs() < 1_000);
    assert!(c.frequency_correction_ppb().abs() < 1.0);
}
