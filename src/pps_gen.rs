//! Internal 1 PPS synthesised by dividing the 10 MHz reference.

use crate::freq_counter::NOMINAL_COUNT;
use crate::traits::PulseOutput;
use log::info;

pub struct PpsGenerator {
    output: Box<dyn PulseOutput + Send>,
    running: bool,
    use_internal: bool,
    next_edge_cycle: u64,
    count: u64,
}

impl PpsGenerator {
    pub fn new(output: Box<dyn PulseOutput + Send>) -> Self {
        PpsGenerator {
            output,
            running: false,
            use_internal: false,
            next_edge_cycle: 0,
            count: 0,
        }
    }

    /// Start dividing; the first pulse is due one full second after `cycles`.
    pub fn start(&mut self, cycles: u64) {
        if self.running {
            return;
        }
        self.running = true;
        self.next_edge_cycle = cycles.wrapping_add(NOMINAL_COUNT);
        info!("[PPS-Gen] Started");
    }

    pub fn stop(&mut self) {
        if self.running {
            self.running = false;
            info!("[PPS-Gen] Stopped after {} pulses", self.count);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Pulses emitted since construction.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether the capture chain should treat the generator as authoritative.
    pub fn use_internal(&self) -> bool {
        self.use_internal
    }

    pub fn set_use_internal(&mut self, on: bool) {
        self.use_internal = on;
    }

    /// Advance to the current cycle count. Emits every pulse that fell due and
    /// returns the cycle of the last one.
    pub fn poll(&mut self, cycles: u64) -> Option<u64> {
        if !self.running {
            return None;
        }
        let mut last = None;
        while (cycles.wrapping_sub(self.next_edge_cycle) as i64) >= 0 {
            let due = self.next_edge_cycle;
            self.output.pulse(due);
            self.count += 1;
            last = Some(due);
            self.next_edge_cycle = due.wrapping_add(NOMINAL_COUNT);
        }
        last
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockPulseOutput;
    use mockall::predicate::*;

    #[test]
    fn test_divides_by_ten_million() {
        let mut out = MockPulseOutput::new();
        out.expect_pulse().with(eq(10_000_000)).times(1).return_const(());
        out.expect_pulse().with(eq(20_000_000)).times(1).return_const(());

        let mut gen = PpsGenerator::new(Box::new(out));
        gen.start(0);
        assert_eq!(gen.poll(9_999_999), None);
        assert_eq!(gen.poll(10_000_000), Some(10_000_000));
        assert_eq!(gen.poll(15_000_000), None);
        assert_eq!(gen.poll(20_000_001), Some(20_000_000));
        assert_eq!(gen.count(), 2);
    }

    #[test]
    fn test_catches_up_missed_pulses() {
        let mut out = MockPulseOutput::new();
        out.expect_pulse().times(3).return_const(());
        let mut gen = PpsGenerator::new(Box::new(out));
        gen.start(100);
        assert_eq!(gen.poll(30_000_200), Some(30_000_100));
        assert_eq!(gen.count(), 3);
    }

    #[test]
    fn test_stopped_generator_is_silent() {
        let mut out = MockPulseOutput::new();
        out.expect_pulse().never();
        let mut gen = PpsGenerator::new(Box::new(out));
        assert_eq!(gen.poll(50_000_000), None);
        gen.start(0);
        gen.stop();
        assert!(!gen.is_running());
        assert_eq!(gen.poll(50_000_000), None);
    }

    #[test]
    fn test_selector_independent_of_running() {
        let out = MockPulseOutput::new();
        let mut gen = PpsGenerator::new(Box::new(out));
        gen.set_use_internal(true);
        assert!(gen.use_internal());
        assert!(!gen.is_running());
    }
}
