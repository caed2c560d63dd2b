//! # Architecture Abstraction Layer
//!
//! The kernel core never touches hardware. Everything it needs from the
//! processor goes through [`Port`]: programming the MPU, reading the CPU
//! time-accounting timer, laying down a new task's first stack frame, and
//! resetting the system.
//!
//! - [`cortex_m4`] is the TM4C123GH6PM port (bare-metal builds only).
//! - [`hosted`] runs the same kernel on the development host, for tests and
//!   simulation.

use crate::region::ProtectionMask;
use crate::task::InitialFrame;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod cortex_m4;

pub mod hosted;

/// Services the kernel core requires from the processor port.
pub trait Port {
    /// Program the SRAM subregion-disable bits for the task about to run.
    fn apply_protection(&mut self, mask: ProtectionMask);

    /// CPU cycles elapsed since the previous call. Restarts the free-running
    /// accounting timer.
    fn take_elapsed_cycles(&mut self) -> u32;

    /// Write a never-run task's initial frame below `frame.stack_top` and
    /// return the stack pointer the context switch should restore.
    fn materialize(&mut self, frame: &InitialFrame) -> u32;

    /// Ask for a system reset. May not return.
    fn request_reset(&mut self);
}
