//! # Kernel Errors
//!
//! Every recoverable failure the kernel reports. Invariant violations inside
//! the kernel itself (no ready task, occupancy/record divergence) are not
//! represented here: they panic, which halts the core.

use core::fmt;

/// Error returned by kernel operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// The allocator cannot satisfy the request: zero size, larger than
    /// [`MAX_ALLOC_SIZE`](crate::config::MAX_ALLOC_SIZE), no free placement,
    /// or the record table is full.
    OutOfMemory,
    /// Every task descriptor is in use.
    TableFull,
    /// A live task with the same entry point already exists.
    DuplicateEntry,
    /// A wait-queue is at capacity.
    QueueFull,
    /// No task matches the given pid or name.
    NotFound,
    /// A task tried to unlock a mutex it does not own. The task is
    /// terminated.
    ProtocolViolation,
    /// The task is in the wrong lifecycle state for the request (killing a
    /// stopped task, restarting one that is still alive).
    AlreadyStopped,
    /// A mutex or semaphore index outside the registry.
    InvalidId,
}

impl KernelError {
    /// Status code handed to the shell collaborator: `0` for "no match",
    /// `0xFF` for "matched but nothing to do", `0xFE` for anything else.
    pub const fn status(self) -> u8 {
        match self {
            Self::NotFound => 0,
            Self::AlreadyStopped => 0xFF,
            _ => 0xFE,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfMemory => "out of memory",
            Self::TableFull => "task table full",
            Self::DuplicateEntry => "task already exists",
            Self::QueueFull => "wait-queue full",
            Self::NotFound => "no such task",
            Self::ProtocolViolation => "mutex unlocked by non-owner",
            Self::AlreadyStopped => "task in wrong state",
            Self::InvalidId => "no such mutex or semaphore",
        };
        f.write_str(msg)
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_shell_convention() {
        assert_eq!(KernelError::NotFound.status(), 0);
        assert_eq!(KernelError::AlreadyStopped.status(), 0xFF);
        assert_eq!(KernelError::QueueFull.status(), 0xFE);
    }

    #[test]
    fn test_display_is_human_readable() {
        assert_eq!(KernelError::OutOfMemory.to_string(), "out of memory");
    }
}
