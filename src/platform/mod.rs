//! Host back-ends for the hardware traits.

use crate::irq::{Edge, IrqTable, Line};
use crate::timekeeper::{lock_core, Timekeeper};
use crate::traits::{CycleCounter, LockLine, MonotonicClock, PulseOutput};
use log::trace;
use std::sync::{Arc, Mutex};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::{HostMonotonic, KernelPps, SerialPort, SysfsLockLine};

/// Nominal 10 MHz count derived from the monotonic timebase, for hosts
/// without a hardware counter on the reference input.
pub struct SyntheticCycleCounter<M: MonotonicClock> {
    clock: M,
}

impl<M: MonotonicClock> SyntheticCycleCounter<M> {
    pub fn new(clock: M) -> Self {
        SyntheticCycleCounter { clock }
    }
}

impl<M: MonotonicClock> CycleCounter for SyntheticCycleCounter<M> {
    fn latch(&self) -> u64 {
        cycles_at(self.clock.now_us())
    }
}

/// Synthetic 10 MHz count at monotonic instant `us`.
pub fn cycles_at(us: u64) -> u64 {
    us.wrapping_mul(10)
}

/// Monotonic instant of synthetic cycle count `cycles`.
pub fn micros_at(cycles: u64) -> u64 {
    cycles / 10
}

/// Bind the reference and GNSS PPS lines to the core. Both handlers latch
/// the cycle count at the stamped edge instant, not at dispatch time, so
/// loop latency never shows up as frequency error.
pub fn register_pps_handlers(irq: &mut IrqTable, core: &Arc<Mutex<Timekeeper>>) {
    let reference = core.clone();
    irq.register(Line::ReferencePps, Edge::Rising, move |edge_us| {
        if let Some(n) = lock_core(&reference).on_reference_edge(edge_us, cycles_at(edge_us)) {
            trace!("[PPS] Second {} at {} µs", n.seconds, edge_us);
        }
    });
    let cell = lock_core(core).gnss_pps_cell();
    irq.register(Line::GnssPps, Edge::Rising, move |edge_us| {
        cell.publish(edge_us, cycles_at(edge_us));
    });
}

/// Advance the internal generator to `cycles`. A pulse from the selected
/// generator is dispatched on the reference line at the instant it fell
/// due. Returns the due cycle of the last pulse.
pub fn advance_generator(irq: &mut IrqTable, core: &Mutex<Timekeeper>, cycles: u64) -> Option<u64> {
    let (due, looped) = lock_core(core).poll_generator(cycles)?;
    if looped {
        irq.dispatch(Line::ReferencePps, Edge::Rising, micros_at(due));
    }
    Some(due)
}

/// Lock line with a fixed level, for references without a lock output.
pub struct FixedLockLine(pub bool);

impl LockLine for FixedLockLine {
    fn is_asserted(&self) -> bool {
        self.0
    }
}

/// Pulse sink used when no output pin is wired.
#[derive(Default)]
pub struct LogPulseOutput {
    pulses: u64,
}

impl PulseOutput for LogPulseOutput {
    fn pulse(&mut self, cycle: u64) {
        self.pulses += 1;
        trace!("[PPS-Gen] Pulse {} at cycle {}", self.pulses, cycle);
    }
}
