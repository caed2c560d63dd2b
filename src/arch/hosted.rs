//! # Hosted Port
//!
//! A [`Port`] for running the kernel on the development machine. There is no
//! MPU and no task stack memory: the port records what the kernel asked for
//! so tests and the simulator can inspect it. A simulated cycle counter
//! advances by a fixed amount per tick, and each switch is charged the
//! cycles counted since the previous one, like the DWT counter on the target.

use super::Port;
use crate::region::ProtectionMask;
use crate::task::InitialFrame;

/// Simulated processor.
#[derive(Debug, Clone)]
pub struct HostedPort {
    /// Cycles the simulated core runs per tick.
    pub cycles_per_tick: u32,
    cycle_count: u32,
    last_cycle_count: u32,
    /// Mask most recently handed to the MPU.
    pub protection: Option<ProtectionMask>,
    /// Number of MPU reprogrammings.
    pub protection_updates: usize,
    /// Number of initial frames laid down.
    pub frames_materialized: usize,
    /// Set once the kernel requested a reset.
    pub reset_requested: bool,
}

impl HostedPort {
    pub const fn new(cycles_per_tick: u32) -> Self {
        Self {
            cycles_per_tick,
            cycle_count: 0,
            last_cycle_count: 0,
            protection: None,
            protection_updates: 0,
            frames_materialized: 0,
            reset_requested: false,
        }
    }

    /// Let one tick worth of cycles pass.
    pub fn tick(&mut self) {
        self.cycle_count = self.cycle_count.wrapping_add(self.cycles_per_tick);
    }
}

impl Default for HostedPort {
    fn default() -> Self {
        // one 1 ms tick at 40 MHz
        Self::new(40_000)
    }
}

impl Port for HostedPort {
    fn apply_protection(&mut self, mask: ProtectionMask) {
        self.protection = Some(mask);
        self.protection_updates += 1;
    }

    fn take_elapsed_cycles(&mut self) -> u32 {
        let elapsed = self.cycle_count.wrapping_sub(self.last_cycle_count);
        self.last_cycle_count = self.cycle_count;
        elapsed
    }

    fn materialize(&mut self, frame: &InitialFrame) -> u32 {
        self.frames_materialized += 1;
        frame.stack_pointer()
    }

    fn request_reset(&mut self) {
        log::info!("reset requested");
        self.reset_requested = true;
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_cycles_follow_ticks() {
        let mut port = HostedPort::new(100);
        assert_eq!(port.take_elapsed_cycles(), 0);

        port.tick();
        port.tick();
        assert_eq!(port.take_elapsed_cycles(), 200);
        // a second switch within the same tick is charged nothing
        assert_eq!(port.take_elapsed_cycles(), 0);
    }

    #[test]
    fn test_counter_wraps() {
        let mut port = HostedPort::new(3_000_000_000);
        port.tick();
        assert_eq!(port.take_elapsed_cycles(), 3_000_000_000);
        port.tick();
        assert_eq!(port.take_elapsed_cycles(), 3_000_000_000);
    }
}
