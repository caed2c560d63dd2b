//! # mpuos: MPU-protected priority RTOS
//!
//! A small preemptive real-time kernel for the TM4C123GH6PM (ARM Cortex-M4)
//! in which every task runs unprivileged inside its own memory window.
//!
//! ## Overview
//!
//! - **Region allocator**: task stacks and task heap blocks are carved out of
//!   28 KiB of SRAM split into five MPU regions of eight subregions each.
//!   Every allocation is a whole number of subregions, so it doubles as an
//!   MPU access window for its owner.
//! - **Scheduler**: fixed priorities 0–15 with round-robin inside a tier, or
//!   plain round-robin; optional tick preemption; per-task CPU accounting
//!   over one-second epochs.
//! - **Synchronization**: mutexes with FIFO hand-off and optional priority
//!   inheritance; counting semaphores with FIFO wake-up.
//! - **Service gate**: tasks reach the kernel only through `svc`, with a
//!   typed [`ServiceCall`](syscall::ServiceCall) request.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │              Application Tasks (unprivileged)           │
//! │                      api.rs  ── svc ──┐                 │
//! ├───────────────────────────────────────┼────────────────┤
//! │        Service gate (syscall.rs)  ◄───┘                 │
//! │    ServiceCall · ServiceReply · listings                │
//! ├────────────────────────────────────────────────────────┤
//! │                  Kernel (kernel.rs)                     │
//! │  lifecycle · lock/unlock · wait/post · switch_context   │
//! ├──────────────┬─────────────────┬───────────────────────┤
//! │  Scheduler   │ Region allocator│  Sync primitives      │
//! │  scheduler.rs│ allocator.rs    │  sync.rs              │
//! │              │ region.rs       │                       │
//! ├──────────────┴─────────────────┴───────────────────────┤
//! │               Task Model (task.rs)                      │
//! ├────────────────────────────────────────────────────────┤
//! │   Port trait (arch/mod.rs)                              │
//! │   arch/cortex_m4.rs: MPU · PendSV · SVCall · SysTick    │
//! │   arch/hosted.rs:    simulated port for the host        │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Memory Model
//!
//! - **No heap**: all kernel state is statically sized
//! - **No `alloc`**: pure `core`, `arrayvec` for bounded collections
//! - **Fixed tables**: [`MAX_TASKS`](config::MAX_TASKS) descriptors,
//!   [`MAX_ALLOCATIONS`](config::MAX_ALLOCATIONS) allocation records
//! - **Single owner**: every piece of kernel state lives in one
//!   [`Kernel`](kernel::Kernel), reached on the target through a
//!   critical section

#![cfg_attr(not(test), no_std)]

pub mod allocator;
pub mod arch;
pub mod config;
pub mod error;
pub mod kernel;
pub mod region;
pub mod scheduler;
pub mod sync;
pub mod syscall;
pub mod task;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod api;

pub use error::KernelError;
pub use kernel::Kernel;
