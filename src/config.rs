//! # Kernel Configuration
//!
//! Compile-time constants governing the kernel. All limits are fixed at
//! compile time; the kernel never allocates dynamically.

/// Maximum number of task descriptors. Bounds the static TCB array.
pub const MAX_TASKS: usize = 12;

/// Number of priority levels. Priority 0 is the most urgent.
pub const NUM_PRIORITIES: usize = 16;

/// Maximum length of a task name, in bytes.
pub const MAX_NAME_LEN: usize = 16;

/// Number of mutexes in the registry.
pub const MAX_MUTEXES: usize = 1;

/// Wait-queue capacity of each mutex.
pub const MAX_MUTEX_QUEUE_SIZE: usize = 4;

/// Number of counting semaphores in the registry.
pub const MAX_SEMAPHORES: usize = 3;

/// Wait-queue capacity of each semaphore.
pub const MAX_SEMAPHORE_QUEUE_SIZE: usize = 4;

/// SysTick frequency in Hz. One tick is the unit of `sleep`.
pub const TICK_HZ: u32 = 1000;

/// System clock frequency in Hz (TM4C123GH6PM with PLL at 40 MHz).
pub const SYSTEM_CLOCK_HZ: u32 = 40_000_000;

/// Number of ticks in one CPU accounting epoch. At the end of each epoch the
/// per-task CPU accumulators swap buffers.
pub const CPU_EPOCH_TICKS: u32 = 1000;

/// Scale applied to the CPU percentage so it is reported in hundredths of a
/// percent (10 000 = 100.00 %).
pub const CPU_PCT_SCALE: u64 = 10_000;

/// Largest single allocation the region allocator will grant.
pub const MAX_ALLOC_SIZE: u32 = 8 * 1024;

/// Capacity of the allocation record table.
pub const MAX_ALLOCATIONS: usize = 19;

/// Start of the SRAM arena managed by the region allocator.
pub const SRAM_HEAP_BASE: u32 = 0x2000_1000;

/// One past the last byte of SRAM. The initial process stack pointer used to
/// start the kernel sits here.
pub const SRAM_TOP: u32 = 0x2000_8000;

/// Name of the task whose restart also posts one unit to the semaphore it is
/// associated with.
pub const GATEKEEPER_TASK: &str = "ReadKeys";
