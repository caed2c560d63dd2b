//! # Task Control Block
//!
//! Defines the task model: identity, lifecycle state, priorities, the saved
//! execution context, the stack block and the MPU window a task runs with.

use arrayvec::ArrayString;

use crate::config::{MAX_NAME_LEN, MAX_TASKS};
use crate::region::ProtectionMask;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Stable task identity. By convention the address of the task's entry
/// function, which makes it unique among live tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(u32);

impl Pid {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// The pid of a task entry function.
    pub fn of(entry: TaskEntry) -> Self {
        Self(entry as usize as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:#07x}", self.0)
    }
}

/// Signature of a task entry point.
pub type TaskEntry = extern "C" fn() -> !;

/// Fixed-capacity task name.
pub type TaskName = ArrayString<MAX_NAME_LEN>;

/// Build a task name, truncating at a character boundary if `name` is too
/// long.
pub fn task_name(name: &str) -> TaskName {
    let mut out = TaskName::new();
    for c in name.chars() {
        if out.try_push(c).is_err() {
            break;
        }
    }
    out
}

/// Index of a descriptor in the task table.
pub type TaskIndex = usize;

// ---------------------------------------------------------------------------
// Task state machine
// ---------------------------------------------------------------------------

/// Lifecycle state of a task descriptor.
///
/// ```text
///   Invalid ──create──► Ready ◄──────────────┐
///                        │  ▲                 │ tick / unlock / post
///              schedule  ▼  │ preempt / yield │
///                       Running ──► Delayed, BlockedMutex, BlockedSemaphore
///                        │
///          terminate     ▼        restart
///   (from any live) ──► Stopped ──────────► Ready
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Slot unused.
    Invalid,
    /// Terminated; all memory released. Only `restart` leaves this state.
    Stopped,
    /// Runnable, waiting for the CPU.
    Ready,
    /// Currently dispatched.
    Running,
    /// Sleeping until its tick countdown reaches zero.
    Delayed,
    /// Queued on a mutex.
    BlockedMutex,
    /// Queued on a semaphore.
    BlockedSemaphore,
}

impl TaskState {
    /// Whether the descriptor belongs to a live (non-terminated) task.
    #[inline]
    pub const fn is_alive(self) -> bool {
        !matches!(self, Self::Invalid | Self::Stopped)
    }

    /// Short name used by the task listing.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Stopped => "STOPPED",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Delayed => "DELAYED",
            Self::BlockedMutex => "BLK_MUTEX",
            Self::BlockedSemaphore => "BLK_SEM",
        }
    }
}

// ---------------------------------------------------------------------------
// Execution context
// ---------------------------------------------------------------------------

/// Exception return value: thread mode, process stack, no FPU frame.
pub const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// xPSR with only the Thumb bit set.
pub const XPSR_THUMB: u32 = 0x0100_0000;

/// Words in a full saved context: the 8-word hardware frame plus R4–R11 and
/// the EXC_RETURN value pushed by the switch handler.
pub const CONTEXT_WORDS: usize = 17;

/// The context of a task that has never run: it resumes at `entry` with a
/// fresh register file and interrupts enabled, exactly as if it had been
/// switched out just before its first instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitialFrame {
    pub entry: u32,
    pub stack_top: u32,
}

impl InitialFrame {
    /// The stack pointer once the frame is in place.
    pub const fn stack_pointer(&self) -> u32 {
        self.stack_top - (CONTEXT_WORDS as u32) * 4
    }

    /// Frame contents from the lowest address up.
    ///
    /// ```text
    ///   sp ─► EXC_RETURN  R4 … R11 │ R0 R1 R2 R3 R12 LR PC xPSR ◄─ stack_top
    ///         software-saved       │ hardware-stacked
    /// ```
    pub const fn words(&self) -> [u32; CONTEXT_WORDS] {
        [
            EXC_RETURN_THREAD_PSP,
            0, 0, 0, 0, 0, 0, 0, 0, // R4–R11
            0, 0, 0, 0, 0,          // R0–R3, R12
            0,                      // LR
            self.entry & !1,        // PC
            XPSR_THUMB,
        ]
    }
}

/// Where a task resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    /// Never dispatched since creation or restart.
    Fresh(InitialFrame),
    /// Switched out; `sp` points at the saved software frame.
    Saved { sp: u32 },
}

// ---------------------------------------------------------------------------
// Task Control Block
// ---------------------------------------------------------------------------

/// Task Control Block (TCB).
#[derive(Debug, Clone, Copy)]
pub struct TaskControlBlock {
    pub state: TaskState,
    pub pid: Pid,
    pub name: TaskName,
    /// Priority given at creation (0 = most urgent).
    pub priority: u8,
    /// Effective priority; differs from `priority` while inheriting.
    pub current_priority: u8,
    pub context: Context,
    /// Base of the stack block.
    pub stack_base: u32,
    /// Requested stack size, reused by `restart`.
    pub stack_size: u32,
    /// MPU subregion-disable bits this task runs with.
    pub window: ProtectionMask,
    /// Ticks left to sleep while `Delayed`.
    pub ticks: u32,
    /// Mutex the task last used or is blocked on.
    pub mutex: Option<usize>,
    /// Semaphore the task last used or is blocked on.
    pub semaphore: Option<usize>,
    /// CPU cycles per epoch, double-buffered (see `Scheduler::tick`).
    pub cpu_cycles: [u32; 2],
}

impl TaskControlBlock {
    /// An unused slot.
    pub const EMPTY: Self = Self {
        state: TaskState::Invalid,
        pid: Pid(0),
        name: TaskName::new_const(),
        priority: 0,
        current_priority: 0,
        context: Context::Saved { sp: 0 },
        stack_base: 0,
        stack_size: 0,
        window: ProtectionMask::NO_ACCESS,
        ticks: 0,
        mutex: None,
        semaphore: None,
        cpu_cycles: [0; 2],
    };

    /// Initialize a slot for a new task. The task stays `Invalid` until
    /// [`reset_context`](Self::reset_context) hands it a stack.
    pub fn init(&mut self, pid: Pid, name: &str, priority: u8, stack_size: u32) {
        *self = Self::EMPTY;
        self.pid = pid;
        self.name = task_name(name);
        self.priority = priority;
        self.current_priority = priority;
        self.stack_size = stack_size;
    }

    /// Point the task at a fresh stack and reset its context to the first
    /// instruction of its entry function.
    pub fn reset_context(&mut self, stack_base: u32, stack_top: u32, window: ProtectionMask) {
        self.stack_base = stack_base;
        self.window = window;
        self.context = Context::Fresh(InitialFrame {
            entry: self.pid.raw(),
            stack_top,
        });
        self.state = TaskState::Ready;
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state == TaskState::Ready
    }

    #[inline]
    pub fn is_alive(&self) -> bool {
        self.state.is_alive()
    }
}

/// The task table.
pub type TaskTable = [TaskControlBlock; MAX_TASKS];

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
