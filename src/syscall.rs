//! # Service Calls
//!
//! Unprivileged tasks reach the kernel through a single supervisor call.
//! The request is a [`ServiceCall`] value; the kernel answers with a
//! [`ServiceReply`] or a [`KernelError`].
//!
//! ```text
//!   task ── svc ──► SVCall handler ──► Kernel::dispatch(call)
//!                                          │
//!          ◄── r0 = return_word(result) ───┤
//!          ◄── *reply = result (listings) ─┘
//! ```
//!
//! Any call that can leave the caller not `Ready` (sleep, blocking lock or
//! wait, kill of itself, protocol violation) sets `needs_reschedule`; the
//! port pends a context switch when it sees the flag.

use arrayvec::ArrayVec;

use crate::arch::Port;
use crate::config::{
    MAX_ALLOCATIONS, MAX_MUTEXES, MAX_MUTEX_QUEUE_SIZE, MAX_SEMAPHORES, MAX_SEMAPHORE_QUEUE_SIZE,
    MAX_TASKS,
};
use crate::error::KernelError;
use crate::kernel::Kernel;
use crate::scheduler::SchedPolicy;
use crate::task::{Pid, TaskIndex, TaskName, TaskState};

/// A request from a task to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceCall {
    /// Dispatch the first task.
    Start,
    Yield,
    /// Sleep for a number of ticks.
    Sleep(u32),
    Lock(usize),
    Unlock(usize),
    Wait(usize),
    Post(usize),
    /// Allocate bytes for the caller and extend its protection window.
    Malloc(u32),
    Reboot,
    /// Task listing.
    Ps,
    /// Semaphore and mutex listing.
    Ipcs,
    /// Allocation listing.
    MemInfo,
    Kill(Pid),
    /// Kill by name.
    Pkill(TaskName),
    Pidof(TaskName),
    /// Restart a stopped task by name.
    Run(TaskName),
    Restart(Pid),
    SetPriority(Pid, u8),
    PriorityInheritance(bool),
    Preemption(bool),
    Sched(SchedPolicy),
}

// ---------------------------------------------------------------------------
// Listings
// ---------------------------------------------------------------------------

/// One row of the task listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: TaskName,
    pub pid: Pid,
    /// CPU share over the last epoch, hundredths of a percent.
    pub cpu: u32,
    pub state: TaskState,
    pub priority: u8,
    pub current_priority: u8,
    /// Semaphore the task is blocked on or last waited on.
    pub semaphore: Option<usize>,
    /// Mutex the task is blocked on or last locked.
    pub mutex: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreInfo {
    pub count: u32,
    pub waiters: ArrayVec<Pid, MAX_SEMAPHORE_QUEUE_SIZE>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexInfo {
    pub owner: Option<Pid>,
    pub waiters: ArrayVec<Pid, MAX_MUTEX_QUEUE_SIZE>,
}

/// The synchronization listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcReport {
    pub semaphores: ArrayVec<SemaphoreInfo, MAX_SEMAPHORES>,
    pub mutexes: ArrayVec<MutexInfo, MAX_MUTEXES>,
}

/// One row of the memory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub owner: Pid,
    pub base: u32,
    pub size: u32,
}

pub type TaskList = ArrayVec<TaskInfo, MAX_TASKS>;
pub type MemoryList = ArrayVec<MemInfo, MAX_ALLOCATIONS>;

/// Successful answer to a [`ServiceCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    Done,
    /// Base address of a `Malloc` block.
    Address(u32),
    Pid(Pid),
    Tasks(TaskList),
    Ipc(IpcReport),
    Memory(MemoryList),
}

/// The single word handed back in `r0`.
///
/// `Malloc` yields the block address or 0, `Pidof` the pid or 0, lookups by
/// pid or name 1 on success, and failures the error's status code.
pub fn return_word(result: &Result<ServiceReply, KernelError>) -> u32 {
    match result {
        Ok(ServiceReply::Address(address)) => *address,
        Ok(ServiceReply::Pid(pid)) => pid.raw(),
        Ok(_) => 1,
        Err(KernelError::OutOfMemory) => 0,
        Err(e) => u32::from(e.status()),
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

impl Kernel {
    /// Execute `call` on behalf of the running task.
    pub fn dispatch<P: Port>(
        &mut self,
        port: &mut P,
        call: ServiceCall,
    ) -> Result<ServiceReply, KernelError> {
        log::trace!("service call {:?}", call);

        if call == ServiceCall::Start {
            if !self.is_started() {
                self.start();
            }
            return Ok(ServiceReply::Done);
        }
        let caller = self.current_task().ok_or(KernelError::NotFound)?;

        match call {
            ServiceCall::Start => Ok(ServiceReply::Done),
            ServiceCall::Yield => {
                self.scheduler.sleep_current(0);
                Ok(ServiceReply::Done)
            }
            ServiceCall::Sleep(ticks) => {
                self.scheduler.sleep_current(ticks);
                Ok(ServiceReply::Done)
            }
            ServiceCall::Lock(index) => self.lock(caller, index).map(|_| ServiceReply::Done),
            ServiceCall::Unlock(index) => self.unlock(caller, index).map(|_| ServiceReply::Done),
            ServiceCall::Wait(index) => self.wait(caller, index).map(|_| ServiceReply::Done),
            ServiceCall::Post(index) => self.post(index).map(|_| ServiceReply::Done),
            ServiceCall::Malloc(size) => {
                let pid = self.scheduler.tasks[caller].pid;
                let block = self.heap.allocate(pid, size)?;
                self.grant_window(caller, block.base, size);
                port.apply_protection(self.scheduler.tasks[caller].window);
                Ok(ServiceReply::Address(block.base))
            }
            ServiceCall::Reboot => {
                port.request_reset();
                Ok(ServiceReply::Done)
            }
            ServiceCall::Ps => Ok(ServiceReply::Tasks(self.task_list())),
            ServiceCall::Ipcs => Ok(ServiceReply::Ipc(self.ipc_report())),
            ServiceCall::MemInfo => Ok(ServiceReply::Memory(self.memory_list())),
            ServiceCall::Kill(pid) => {
                let task = self.lookup(pid)?;
                self.terminate(task).map(|_| ServiceReply::Done)
            }
            ServiceCall::Pkill(name) => {
                let task = self.scheduler.find_by_name(&name).ok_or(KernelError::NotFound)?;
                self.terminate(task).map(|_| ServiceReply::Done)
            }
            ServiceCall::Pidof(name) => {
                let task = self.scheduler.find_by_name(&name).ok_or(KernelError::NotFound)?;
                Ok(ServiceReply::Pid(self.scheduler.tasks[task].pid))
            }
            ServiceCall::Run(name) => {
                let task = self.scheduler.find_by_name(&name).ok_or(KernelError::NotFound)?;
                self.restart(task).map(|_| ServiceReply::Done)
            }
            ServiceCall::Restart(pid) => {
                let task = self.lookup(pid)?;
                self.restart(task).map(|_| ServiceReply::Done)
            }
            ServiceCall::SetPriority(pid, priority) => {
                let task = self.lookup(pid)?;
                self.set_priority(task, priority);
                Ok(ServiceReply::Done)
            }
            ServiceCall::PriorityInheritance(on) => {
                self.priority_inheritance = on;
                log::info!("priority inheritance {}", if on { "on" } else { "off" });
                Ok(ServiceReply::Done)
            }
            ServiceCall::Preemption(on) => {
                self.scheduler.preemption = on;
                log::info!("preemption {}", if on { "on" } else { "off" });
                Ok(ServiceReply::Done)
            }
            ServiceCall::Sched(policy) => {
                self.scheduler.policy = policy;
                log::info!("scheduler {:?}", policy);
                Ok(ServiceReply::Done)
            }
        }
    }

    /// Live task with `pid`, falling back to a stopped one.
    fn lookup(&self, pid: Pid) -> Result<TaskIndex, KernelError> {
        self.scheduler
            .find_alive(pid)
            .or_else(|| self.scheduler.find(pid))
            .ok_or(KernelError::NotFound)
    }

    /// Every non-empty descriptor, in table order.
    pub fn task_list(&self) -> TaskList {
        self.scheduler
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.state != TaskState::Invalid)
            .map(|(i, t)| TaskInfo {
                name: t.name,
                pid: t.pid,
                cpu: self.scheduler.cpu_percent(i),
                state: t.state,
                priority: t.priority,
                current_priority: t.current_priority,
                semaphore: t.semaphore,
                mutex: t.mutex,
            })
            .collect()
    }

    pub fn ipc_report(&self) -> IpcReport {
        let pid_of = |task: TaskIndex| self.scheduler.tasks[task].pid;
        IpcReport {
            semaphores: self
                .semaphores
                .iter()
                .map(|s| SemaphoreInfo {
                    count: s.count(),
                    waiters: s.queue().iter().map(pid_of).collect(),
                })
                .collect(),
            mutexes: self
                .mutexes
                .iter()
                .map(|m| MutexInfo {
                    owner: m.owner().map(pid_of),
                    waiters: m.queue().iter().map(pid_of).collect(),
                })
                .collect(),
        }
    }

    pub fn memory_list(&self) -> MemoryList {
        self.heap
            .records()
            .iter()
            .map(|r| MemInfo { owner: r.owner, base: r.block.base, size: r.block.size })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::hosted::HostedPort;
    use crate::kernel::tests::{kernel_with, pid};
    use crate::task::task_name;

    fn started(priorities: &[u8]) -> (Kernel, HostedPort) {
        let mut k = kernel_with(priorities);
        let mut port = HostedPort::default();
        assert_eq!(k.dispatch(&mut port, ServiceCall::Start), Ok(ServiceReply::Done));
        k.switch_context(&mut port, 0);
        (k, port)
    }

    #[test]
    fn test_calls_before_start_have_no_caller() {
        let mut k = kernel_with(&[1]);
        let mut port = HostedPort::default();
        assert_eq!(k.dispatch(&mut port, ServiceCall::Yield), Err(KernelError::NotFound));
    }

    #[test]
    fn test_yield_and_sleep_request_reschedule() {
        let (mut k, mut port) = started(&[1, 1]);
        k.dispatch(&mut port, ServiceCall::Yield).unwrap();
        assert!(k.scheduler.needs_reschedule);
        k.switch_context(&mut port, 0);
        assert_eq!(k.current_task(), Some(1));

        k.dispatch(&mut port, ServiceCall::Sleep(5)).unwrap();
        assert_eq!(k.scheduler.tasks[1].state, TaskState::Delayed);
        assert_eq!(k.scheduler.tasks[1].ticks, 5);
    }

    #[test]
    fn test_blocking_lock_switches_away() {
        let (mut k, mut port) = started(&[1, 2]);
        k.lock(1, 0).unwrap();
        k.scheduler.needs_reschedule = false;

        k.dispatch(&mut port, ServiceCall::Lock(0)).unwrap();
        assert!(k.scheduler.needs_reschedule);
        k.switch_context(&mut port, 0);
        assert_eq!(k.current_task(), Some(1));
        assert_eq!(k.dispatch(&mut port, ServiceCall::Lock(3)), Err(KernelError::InvalidId));
    }

    #[test]
    fn test_malloc_extends_and_applies_window() {
        let (mut k, mut port) = started(&[1]);
        let reply = k.dispatch(&mut port, ServiceCall::Malloc(1024)).unwrap();
        assert_eq!(reply, ServiceReply::Address(0x2000_2000));
        let window = port.protection.unwrap();
        assert!(window.allows(8));
        assert!(window.allows(0));
        assert_eq!(window.granted().len(), 2);
        assert_eq!(port.protection_updates, 2);

        let memory = k.memory_list();
        assert_eq!(memory.len(), 2);
        assert!(memory.iter().all(|m| m.owner == pid(0)));

        let failed = k.dispatch(&mut port, ServiceCall::Malloc(0));
        assert_eq!(failed, Err(KernelError::OutOfMemory));
        assert_eq!(return_word(&failed), 0);
    }

    #[test]
    fn test_kill_by_pid_and_name() {
        let (mut k, mut port) = started(&[1, 2, 3]);
        k.scheduler.tasks[2].name = task_name("Errant");

        let result = k.dispatch(&mut port, ServiceCall::Kill(pid(1)));
        assert_eq!(return_word(&result), 1);
        let again = k.dispatch(&mut port, ServiceCall::Kill(pid(1)));
        assert_eq!(again, Err(KernelError::AlreadyStopped));
        assert_eq!(return_word(&again), 0xFF);
        let missing = k.dispatch(&mut port, ServiceCall::Kill(pid(42)));
        assert_eq!(return_word(&missing), 0);

        k.dispatch(&mut port, ServiceCall::Pkill(task_name("Errant"))).unwrap();
        assert_eq!(k.scheduler.tasks[2].state, TaskState::Stopped);
    }

    #[test]
    fn test_killing_self_requests_reschedule() {
        let (mut k, mut port) = started(&[1, 2]);
        k.dispatch(&mut port, ServiceCall::Kill(pid(0))).unwrap();
        assert!(k.scheduler.needs_reschedule);
        k.switch_context(&mut port, 0);
        assert_eq!(k.current_task(), Some(1));
    }

    #[test]
    fn test_run_restarts_stopped_task_by_name() {
        let (mut k, mut port) = started(&[1, 2]);
        k.scheduler.tasks[1].name = task_name("Flash4Hz");
        assert_eq!(
            k.dispatch(&mut port, ServiceCall::Run(task_name("Flash4Hz"))),
            Err(KernelError::AlreadyStopped)
        );
        k.terminate(1).unwrap();
        k.dispatch(&mut port, ServiceCall::Run(task_name("Flash4Hz"))).unwrap();
        assert_eq!(k.scheduler.tasks[1].state, TaskState::Ready);

        k.terminate(1).unwrap();
        k.dispatch(&mut port, ServiceCall::Restart(pid(1))).unwrap();
        assert_eq!(k.scheduler.tasks[1].state, TaskState::Ready);
    }

    #[test]
    fn test_pidof_reports_pid() {
        let (mut k, mut port) = started(&[1]);
        k.scheduler.tasks[0].name = task_name("Idle");
        let reply = k.dispatch(&mut port, ServiceCall::Pidof(task_name("Idle")));
        assert_eq!(reply, Ok(ServiceReply::Pid(pid(0))));
        assert_eq!(return_word(&reply), pid(0).raw());
        let missing = k.dispatch(&mut port, ServiceCall::Pidof(task_name("nobody")));
        assert_eq!(return_word(&missing), 0);
    }

    #[test]
    fn test_switches_and_setters() {
        let (mut k, mut port) = started(&[1, 4]);
        k.dispatch(&mut port, ServiceCall::PriorityInheritance(true)).unwrap();
        k.dispatch(&mut port, ServiceCall::Preemption(false)).unwrap();
        k.dispatch(&mut port, ServiceCall::Sched(SchedPolicy::RoundRobin)).unwrap();
        k.dispatch(&mut port, ServiceCall::SetPriority(pid(1), 0)).unwrap();

        assert!(k.priority_inheritance);
        assert!(!k.scheduler.preemption);
        assert_eq!(k.scheduler.policy, SchedPolicy::RoundRobin);
        assert_eq!(k.scheduler.tasks[1].current_priority, 0);

        k.dispatch(&mut port, ServiceCall::Reboot).unwrap();
        assert!(port.reset_requested);
    }

    #[test]
    fn test_listings_reflect_kernel_state() {
        let (mut k, mut port) = started(&[1, 2, 3]);
        k.init_semaphore(1, 2).unwrap();
        k.lock(0, 0).unwrap();
        k.lock(2, 0).unwrap();
        k.wait(1, 0).unwrap();

        let Ok(ServiceReply::Tasks(tasks)) = k.dispatch(&mut port, ServiceCall::Ps) else {
            panic!("expected task listing");
        };
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[1].state, TaskState::BlockedSemaphore);
        assert_eq!(tasks[1].semaphore, Some(0));
        assert_eq!(tasks[2].mutex, Some(0));

        let Ok(ServiceReply::Ipc(ipc)) = k.dispatch(&mut port, ServiceCall::Ipcs) else {
            panic!("expected ipc listing");
        };
        assert_eq!(ipc.semaphores[0].waiters.as_slice(), &[pid(1)]);
        assert_eq!(ipc.semaphores[1].count, 2);
        assert_eq!(ipc.mutexes[0].owner, Some(pid(0)));
        assert_eq!(ipc.mutexes[0].waiters.as_slice(), &[pid(2)]);

        let Ok(ServiceReply::Memory(memory)) = k.dispatch(&mut port, ServiceCall::MemInfo) else {
            panic!("expected memory listing");
        };
        assert_eq!(memory.len(), 3);
        assert!(memory.iter().all(|m| m.size == 512));
    }

    #[test]
    fn test_terminated_owner_scenario_through_calls() {
        let (mut k, mut port) = started(&[1, 2]);
        k.dispatch(&mut port, ServiceCall::Lock(0)).unwrap();
        k.dispatch(&mut port, ServiceCall::Malloc(200)).unwrap();
        k.lock(1, 0).unwrap();

        k.dispatch(&mut port, ServiceCall::Kill(pid(0))).unwrap();
        assert_eq!(k.mutexes[0].owner(), Some(1));
        assert_eq!(k.scheduler.tasks[1].state, TaskState::Ready);
        assert!(k.memory_list().iter().all(|m| m.owner != pid(0)));
    }
}
