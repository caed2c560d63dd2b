//! # Task API
//!
//! Wrappers that unprivileged task code uses to reach the kernel. Each one
//! builds a [`ServiceCall`] on the caller's stack and traps with `svc 0`.
//! Calls that only need a status pass a null reply pointer, so the large
//! [`ServiceReply`] is only placed on the stack of tasks that ask for a
//! listing.

use core::arch::asm;
use core::ptr;

use crate::error::KernelError;
use crate::scheduler::SchedPolicy;
use crate::syscall::{IpcReport, MemoryList, ServiceCall, ServiceReply, TaskList};
use crate::task::{task_name, Pid};

#[inline(never)]
fn trap(call: &ServiceCall, reply: *mut ServiceReply) -> u32 {
    let result: u32;
    unsafe {
        asm!(
            "svc 0",
            inout("r0") call as *const ServiceCall as u32 => result,
            in("r1") reply,
            options(nostack),
        );
    }
    result
}

fn call(call: ServiceCall) -> u32 {
    trap(&call, ptr::null_mut())
}

fn listing(call: ServiceCall) -> ServiceReply {
    let mut reply = ServiceReply::Done;
    trap(&call, &mut reply);
    reply
}

/// Map the status word of a pid/name call back to a result.
fn status(word: u32) -> Result<(), KernelError> {
    match word {
        1 => Ok(()),
        0 => Err(KernelError::NotFound),
        0xFF => Err(KernelError::AlreadyStopped),
        _ => Err(KernelError::ProtocolViolation),
    }
}

pub fn yield_now() {
    call(ServiceCall::Yield);
}

pub fn sleep(ticks: u32) {
    call(ServiceCall::Sleep(ticks));
}

pub fn lock(mutex: usize) {
    call(ServiceCall::Lock(mutex));
}

pub fn unlock(mutex: usize) {
    call(ServiceCall::Unlock(mutex));
}

pub fn wait(semaphore: usize) {
    call(ServiceCall::Wait(semaphore));
}

pub fn post(semaphore: usize) {
    call(ServiceCall::Post(semaphore));
}

/// Allocate `size` bytes owned by the calling task. The block is added to
/// the caller's protection window and freed when the task terminates.
pub fn malloc(size: u32) -> Option<*mut u8> {
    match call(ServiceCall::Malloc(size)) {
        0 => None,
        address => Some(address as *mut u8),
    }
}

pub fn reboot() {
    call(ServiceCall::Reboot);
}

pub fn kill(pid: Pid) -> Result<(), KernelError> {
    status(call(ServiceCall::Kill(pid)))
}

pub fn pkill(name: &str) -> Result<(), KernelError> {
    status(call(ServiceCall::Pkill(task_name(name))))
}

pub fn run(name: &str) -> Result<(), KernelError> {
    status(call(ServiceCall::Run(task_name(name))))
}

pub fn restart(pid: Pid) -> Result<(), KernelError> {
    status(call(ServiceCall::Restart(pid)))
}

pub fn set_priority(pid: Pid, priority: u8) -> Result<(), KernelError> {
    status(call(ServiceCall::SetPriority(pid, priority)))
}

pub fn pidof(name: &str) -> Option<Pid> {
    match call(ServiceCall::Pidof(task_name(name))) {
        0 => None,
        raw => Some(Pid::from_raw(raw)),
    }
}

pub fn set_priority_inheritance(on: bool) {
    call(ServiceCall::PriorityInheritance(on));
}

pub fn set_preemption(on: bool) {
    call(ServiceCall::Preemption(on));
}

pub fn set_scheduler(policy: SchedPolicy) {
    call(ServiceCall::Sched(policy));
}

pub fn ps() -> Option<TaskList> {
    match listing(ServiceCall::Ps) {
        ServiceReply::Tasks(tasks) => Some(tasks),
        _ => None,
    }
}

pub fn ipcs() -> Option<IpcReport> {
    match listing(ServiceCall::Ipcs) {
        ServiceReply::Ipc(report) => Some(report),
        _ => None,
    }
}

pub fn meminfo() -> Option<MemoryList> {
    match listing(ServiceCall::MemInfo) {
        ServiceReply::Memory(memory) => Some(memory),
        _ => None,
    }
}
