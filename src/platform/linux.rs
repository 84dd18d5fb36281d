use crate::traits::{LockLine, MonotonicClock};
use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::mem;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

fn clock_us(id: libc::clockid_t) -> u64 {
    let mut ts: libc::timespec = unsafe { mem::zeroed() };
    // clock_gettime cannot fail for a valid clock id and pointer
    unsafe { libc::clock_gettime(id, &mut ts) };
    ts.tv_sec as u64 * 1_000_000 + ts.tv_nsec as u64 / 1_000
}

/// `CLOCK_MONOTONIC_RAW`: not slewed by NTP/adjtimex.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMonotonic;

impl MonotonicClock for HostMonotonic {
    fn now_us(&self) -> u64 {
        clock_us(libc::CLOCK_MONOTONIC_RAW)
    }
}

// ============================================================================
// KERNEL PPS (RFC 2783 via /dev/ppsN)
// ============================================================================

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsKtime {
    sec: i64,
    nsec: i32,
    flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsKinfo {
    assert_sequence: u32,
    clear_sequence: u32,
    assert_tu: PpsKtime,
    clear_tu: PpsKtime,
    current_mode: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct PpsFdata {
    info: PpsKinfo,
    timeout: PpsKtime,
}

// The kernel header encodes the size of a pointer, not of the struct.
nix::ioctl_readwrite_bad!(
    pps_fetch,
    nix::request_code_readwrite!(b'p', 0xa4, mem::size_of::<*mut PpsFdata>()),
    PpsFdata
);

/// Assert edges from a kernel PPS device, mapped onto the monotonic timebase.
pub struct KernelPps {
    path: PathBuf,
    file: File,
    last_sequence: Option<u32>,
}

impl KernelPps {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("opening PPS device {}", path.display()))?;
        info!("[PPS] Using {}", path.display());
        Ok(KernelPps {
            path: path.to_path_buf(),
            file,
            last_sequence: None,
        })
    }

    /// Non-blocking fetch. Returns the monotonic µs of a new assert edge.
    pub fn poll(&mut self) -> Result<Option<u64>> {
        // Zero timeout without PPS_TIME_INVALID: return immediately
        let mut data = PpsFdata::default();
        unsafe { pps_fetch(self.file.as_raw_fd(), &mut data) }
            .map_err(|e| anyhow!("PPS_FETCH on {}: {}", self.path.display(), e))?;

        let seq = data.info.assert_sequence;
        if self.last_sequence == Some(seq) {
            return Ok(None);
        }
        let first = self.last_sequence.is_none();
        self.last_sequence = Some(seq);
        if first {
            // Whatever was latched before we opened is stale
            return Ok(None);
        }

        let tu = data.info.assert_tu;
        let edge_real_us = tu.sec as i128 * 1_000_000 + tu.nsec as i128 / 1_000;
        let real_us = clock_us(libc::CLOCK_REALTIME) as i128;
        let mono_us = clock_us(libc::CLOCK_MONOTONIC_RAW) as i128;
        let age = (real_us - edge_real_us).max(0);
        Ok(Some((mono_us - age).max(0) as u64))
    }
}

// ============================================================================
// SERIAL PORT
// ============================================================================

fn baud_constant(baud: u32) -> Result<libc::speed_t> {
    Ok(match baud {
        4_800 => libc::B4800,
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        other => return Err(anyhow!("Unsupported baud rate {}", other)),
    })
}

/// Raw 8N1 non-blocking tty for the GNSS receiver.
pub struct SerialPort {
    file: File,
}

impl SerialPort {
    pub fn open(path: &Path, baud: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("opening serial port {}", path.display()))?;
        let fd = file.as_raw_fd();
        let speed = baud_constant(baud)?;

        let mut tio: libc::termios = unsafe { mem::zeroed() };
        if unsafe { libc::tcgetattr(fd, &mut tio) } < 0 {
            return Err(anyhow!(
                "tcgetattr on {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            ));
        }
        unsafe {
            libc::cfmakeraw(&mut tio);
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
        }
        tio.c_cflag &= !(libc::PARENB | libc::CSTOPB | libc::CSIZE | libc::CRTSCTS);
        tio.c_cflag |= libc::CS8 | libc::CLOCAL | libc::CREAD;
        tio.c_cc[libc::VMIN] = 0;
        tio.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } < 0 {
            return Err(anyhow!(
                "tcsetattr on {}: {}",
                path.display(),
                std::io::Error::last_os_error()
            ));
        }
        info!("[GNSS] Opened {} at {} 8N1", path.display(), baud);
        Ok(SerialPort { file })
    }

    /// Whatever is buffered right now; empty when nothing arrived.
    pub fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.file.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        match self.file.write_all(bytes) {
            Ok(()) => Ok(()),
            // Receiver polls are best effort
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                debug!("[GNSS] Serial TX buffer full, poll skipped");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// SYSFS GPIO LOCK LINE
// ============================================================================

pub struct SysfsLockLine {
    value_path: PathBuf,
}

impl SysfsLockLine {
    pub fn open(gpio: u32) -> Result<Self> {
        Self::open_in(Path::new("/sys/class/gpio"), gpio)
    }

    fn open_in(root: &Path, gpio: u32) -> Result<Self> {
        let dir = root.join(format!("gpio{}", gpio));
        if !dir.exists() {
            std::fs::write(root.join("export"), gpio.to_string())
                .with_context(|| format!("exporting GPIO {}", gpio))?;
        }
        if let Err(e) = std::fs::write(dir.join("direction"), "in") {
            warn!("[Sync] Could not set GPIO {} direction: {}", gpio, e);
        }
        let value_path = dir.join("value");
        std::fs::read_to_string(&value_path)
            .with_context(|| format!("reading {}", value_path.display()))?;
        info!("[Sync] Rubidium lock line on GPIO {}", gpio);
        Ok(SysfsLockLine { value_path })
    }
}

impl LockLine for SysfsLockLine {
    fn is_asserted(&self) -> bool {
        match std::fs::read_to_string(&self.value_path) {
            Ok(v) => v.trim() == "1",
            Err(e) => {
                debug!("[Sync] {}: {}", self.value_path.display(), e);
                false
            }
        }
    }
}
