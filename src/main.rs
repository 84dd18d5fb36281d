use anyhow::Result;
use clap::Parser;
use log::{info, warn};
use rbsync::config::SystemConfig;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Kernel PPS device carrying the rubidium 1 PPS (e.g. /dev/pps0)
    #[arg(long)]
    pps_device: Option<String>,

    /// GNSS serial port (e.g. /dev/ttyAMA0)
    #[arg(long)]
    gnss_device: Option<String>,

    /// Kernel PPS device carrying the GNSS 1 PPS
    #[arg(long)]
    gnss_pps_device: Option<String>,

    /// sysfs GPIO number of the rubidium lock output
    #[arg(long)]
    rb_lock_gpio: Option<u32>,

    /// Capture from the internal divider instead of the external PPS
    #[arg(long)]
    internal_pps: bool,

    /// Disable the PTP grandmaster
    #[arg(long)]
    no_ptp: bool,

    /// Write a JSON status snapshot here every status period
    #[arg(long)]
    status_file: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut SystemConfig) {
        if let Some(dev) = &self.pps_device {
            config.reference.pps_device = Some(dev.clone());
        }
        if let Some(dev) = &self.gnss_device {
            config.gnss.device = Some(dev.clone());
        }
        if let Some(dev) = &self.gnss_pps_device {
            config.gnss.pps_device = Some(dev.clone());
        }
        if let Some(gpio) = self.rb_lock_gpio {
            config.reference.rb_lock_gpio = Some(gpio);
        }
        if self.internal_pps {
            config.reference.internal_pps = true;
        }
        if self.no_ptp {
            config.ptp.enabled = false;
        }
    }
}

fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => {
            warn!("No --config given, using defaults");
            SystemConfig::default()
        }
    };
    args.apply(&mut config);
    config.validate()?;

    info!("rbsync {} starting", env!("CARGO_PKG_VERSION"));
    host::run(config, args.status_file)
}

#[cfg(target_os = "linux")]
mod host {
    use anyhow::Result;
    use log::{debug, info, warn};
    use rbsync::config::SystemConfig;
    use rbsync::gnss::GnssReceiver;
    use rbsync::irq::{Edge, IrqTable, Line};
    use rbsync::ntp_server::NtpServer;
    use rbsync::platform::{
        advance_generator, register_pps_handlers, FixedLockLine, HostMonotonic, KernelPps,
        LogPulseOutput, SerialPort, SyntheticCycleCounter, SysfsLockLine,
    };
    use rbsync::ptp_server::PtpServer;
    use rbsync::status::StatusSnapshot;
    use rbsync::timekeeper::{lock_core, SharedClock, Timekeeper};
    use rbsync::traits::{CycleCounter, LockLine, MonotonicClock};
    use std::net::UdpSocket;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    const TASK_PERIOD_US: u64 = 100_000;
    const STATUS_PERIOD_US: u64 = 10_000_000;
    const WATCHDOG_PERIOD_US: u64 = 1_000_000;
    const LOOP_SLEEP: Duration = Duration::from_millis(1);

    type Ntp = NtpServer<UdpSocket, SharedClock<HostMonotonic>>;
    type Ptp = PtpServer<UdpSocket, SharedClock<HostMonotonic>>;

    fn open_pps(path: Option<&String>) -> Result<Option<KernelPps>> {
        path.map(|p| KernelPps::open(Path::new(p))).transpose()
    }

    /// Poll one kernel PPS device; a failing device is dropped.
    fn poll_pps(dev: &mut Option<KernelPps>, irq: &mut IrqTable, line: Line) {
        let Some(pps) = dev.as_mut() else {
            return;
        };
        match pps.poll() {
            Ok(Some(edge_us)) => {
                irq.dispatch(line, Edge::Rising, edge_us);
            }
            Ok(None) => {}
            Err(e) => {
                warn!("[PPS] {:?} input disabled: {}", line, e);
                *dev = None;
            }
        }
    }

    pub fn run(config: SystemConfig, status_file: Option<PathBuf>) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        let r = running.clone();
        ctrlc::set_handler(move || {
            info!("Ctrl+C received. Shutting down...");
            r.store(false, Ordering::SeqCst);
        })?;

        let mono = HostMonotonic;
        let lock_line: Box<dyn LockLine + Send> = match config.reference.rb_lock_gpio {
            Some(gpio) => Box::new(SysfsLockLine::open(gpio)?),
            None => {
                warn!("[Sync] No lock line configured, rubidium assumed locked");
                Box::new(FixedLockLine(true))
            }
        };
        let core = Arc::new(Mutex::new(Timekeeper::new(
            &config,
            lock_line,
            Box::new(LogPulseOutput::default()),
            mono.now_us(),
        )));

        // Edge handlers, registered once
        let mut irq = IrqTable::new();
        register_pps_handlers(&mut irq, &core);

        let mut reference_pps = open_pps(config.reference.pps_device.as_ref())?;
        let mut gnss_pps = open_pps(config.gnss.pps_device.as_ref())?;
        if reference_pps.is_none() && !config.reference.internal_pps {
            warn!("[PPS] No reference PPS device configured");
        }
        let mut serial = config
            .gnss
            .device
            .as_ref()
            .map(|dev| SerialPort::open(Path::new(dev), config.gnss.baud))
            .transpose()?;

        let counter = SyntheticCycleCounter::new(HostMonotonic);
        if config.reference.internal_pps {
            let mut c = lock_core(&core);
            c.start_generator(counter.latch());
            c.select_pps_source(true)?;
        }

        let mut ntp: Option<Ntp> = if config.ntp.enabled {
            Some(NtpServer::bind(&config.ntp, SharedClock::new(core.clone(), HostMonotonic))?)
        } else {
            None
        };
        let mut ptp: Option<Ptp> = if config.ptp.enabled {
            match PtpServer::bind(&config.ptp, SharedClock::new(core.clone(), HostMonotonic)) {
                Ok(server) => Some(server),
                Err(e) => {
                    warn!("[PTP] Disabled: {:#}", e);
                    None
                }
            }
        } else {
            None
        };

        if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
            debug!("sd_notify ready: {}", e);
        }

        let ubx_interval_us = config.gnss.ubx_poll_interval_s * 1_000_000;
        let mut serial_buf = [0u8; 256];
        let mut last_task = 0u64;
        let mut last_status = mono.now_us();
        let mut last_watchdog = 0u64;
        let mut last_ubx: Option<u64> = None;

        while running.load(Ordering::SeqCst) {
            poll_pps(&mut reference_pps, &mut irq, Line::ReferencePps);
            poll_pps(&mut gnss_pps, &mut irq, Line::GnssPps);

            advance_generator(&mut irq, &core, counter.latch());

            let now = mono.now_us();

            if let Some(port) = serial.as_mut() {
                loop {
                    match port.read_available(&mut serial_buf) {
                        Ok(0) => break,
                        Ok(n) => lock_core(&core).feed_gnss_bytes(&serial_buf[..n], mono.now_us()),
                        Err(e) => {
                            warn!("[GNSS] Serial read failed: {}", e);
                            break;
                        }
                    }
                }
                if ubx_interval_us > 0 && last_ubx.map_or(true, |t| now.saturating_sub(t) >= ubx_interval_us) {
                    last_ubx = Some(now);
                    if let Err(e) = port.write_all(&GnssReceiver::poll_requests()) {
                        warn!("[GNSS] UBX poll failed: {}", e);
                    }
                }
            }

            let now = mono.now_us();
            if now.saturating_sub(last_task) >= TASK_PERIOD_US {
                last_task = now;
                if let Some(t) = lock_core(&core).task(now) {
                    debug!("[Core] {:?}", t);
                }
            }

            if let Some(server) = ntp.as_mut() {
                server.poll();
            }
            if let Some(server) = ptp.as_mut() {
                server.poll(mono.now_us());
            }

            if now.saturating_sub(last_watchdog) >= WATCHDOG_PERIOD_US {
                last_watchdog = now;
                let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Watchdog]);
            }

            if now.saturating_sub(last_status) >= STATUS_PERIOD_US {
                last_status = now;
                let core_status = lock_core(&core).status(now);
                if let Some(server) = ptp.as_mut() {
                    server.set_gps_utc_offset(core_status.gnss.leap_offset);
                }
                let snapshot = StatusSnapshot {
                    core: core_status,
                    ntp: ntp.as_ref().map(|s| s.stats()),
                    ptp: ptp.as_ref().map(|s| s.stats()),
                };
                info!("[Status] {}", snapshot.summary());
                if let Some(path) = &status_file {
                    if let Err(e) = snapshot.write_json(path) {
                        warn!("[Status] {:#}", e);
                    }
                }
            }

            thread::sleep(LOOP_SLEEP);
        }

        let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
        info!("Stopped in state {}", lock_core(&core).sync_state());
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
mod host {
    use anyhow::{anyhow, Result};
    use rbsync::config::SystemConfig;
    use std::path::PathBuf;

    pub fn run(_config: SystemConfig, _status_file: Option<PathBuf>) -> Result<()> {
        Err(anyhow!("rbsync needs Linux PPS and serial back-ends"))
    }
}
