//! # Kernel
//!
//! The [`Kernel`] aggregate owns every piece of kernel state: the scheduler
//! and its task table, the region allocator, the mutex and semaphore
//! registries, and the runtime switches. It is driven from three places,
//! all running at the same exception priority so they never interleave:
//!
//! ```text
//!   SVCall  ──► Kernel::dispatch(ServiceCall)   (syscall.rs)
//!   SysTick ──► Kernel::tick()
//!   PendSV  ──► Kernel::switch_context(port, outgoing_sp) -> incoming_sp
//! ```
//!
//! ## Startup Sequence
//!
//! ```text
//! reset (cortex-m-rt)
//!   └─► main()
//!         ├─► Kernel::new() + init_semaphore() (×N)
//!         ├─► Kernel::spawn()                   (×N)
//!         └─► arch::start()                     ← MPU, SysTick, first SVC
//!               └─► ServiceCall::Start ─► PendSV ─► first task
//! ```

use crate::allocator::RegionAllocator;
use crate::arch::Port;
use crate::config::{GATEKEEPER_TASK, MAX_MUTEXES, MAX_SEMAPHORES, NUM_PRIORITIES};
use crate::error::KernelError;
use crate::region::{window_for, ProtectionMask};
use crate::scheduler::Scheduler;
use crate::sync::{LockOutcome, Mutex, Semaphore, WaitOutcome};
use crate::task::{Context, Pid, TaskEntry, TaskIndex, TaskState};

/// All kernel state.
pub struct Kernel {
    pub scheduler: Scheduler,
    pub heap: RegionAllocator,
    pub mutexes: [Mutex; MAX_MUTEXES],
    pub semaphores: [Semaphore; MAX_SEMAPHORES],
    /// Whether a blocked mutex requester lends its priority to the owner.
    pub priority_inheritance: bool,
    started: bool,
}

impl Default for Kernel {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    pub const fn new() -> Self {
        const MUTEX: Mutex = Mutex::new();
        const SEMAPHORE: Semaphore = Semaphore::new(0);
        Self {
            scheduler: Scheduler::new(),
            heap: RegionAllocator::new(),
            mutexes: [MUTEX; MAX_MUTEXES],
            semaphores: [SEMAPHORE; MAX_SEMAPHORES],
            priority_inheritance: false,
            started: false,
        }
    }

    /// Whether the first task has been dispatched.
    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Set the initial count of semaphore `index`.
    pub fn init_semaphore(&mut self, index: usize, count: u32) -> Result<(), KernelError> {
        self.semaphores
            .get_mut(index)
            .ok_or(KernelError::InvalidId)?
            .set_count(count);
        Ok(())
    }

    /// Running task, if the kernel has started.
    pub fn current_task(&self) -> Option<TaskIndex> {
        self.scheduler.current
    }

    /// Pid of the running task. Used by fault handlers.
    pub fn current_task_id(&self) -> Option<Pid> {
        self.scheduler.current_tcb().map(|t| t.pid)
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    /// Create a task running `entry`.
    pub fn spawn(
        &mut self,
        entry: TaskEntry,
        name: &str,
        priority: u8,
        stack_bytes: u32,
    ) -> Result<TaskIndex, KernelError> {
        self.create_task(Pid::of(entry), name, priority, stack_bytes)
    }

    /// Create a task identified by `pid`, whose entry point is the pid
    /// itself.
    ///
    /// # Errors
    /// - `DuplicateEntry`: a live task already has this pid.
    /// - `TableFull`: no unused descriptor.
    /// - `OutOfMemory`: the stack cannot be placed.
    pub fn create_task(
        &mut self,
        pid: Pid,
        name: &str,
        priority: u8,
        stack_bytes: u32,
    ) -> Result<TaskIndex, KernelError> {
        if self.scheduler.find_alive(pid).is_some() {
            return Err(KernelError::DuplicateEntry);
        }
        let slot = self.scheduler.free_slot().ok_or(KernelError::TableFull)?;
        let block = self.heap.allocate(pid, stack_bytes)?;

        let mut window = ProtectionMask::NO_ACCESS;
        window.allow(block.subregions());

        let tcb = &mut self.scheduler.tasks[slot];
        tcb.init(pid, name, clamp_priority(priority), stack_bytes);
        tcb.reset_context(block.base, block.top(), window);

        log::info!(
            "created {} ({}) prio {} stack {:#010x}+{}",
            tcb.name,
            pid,
            tcb.priority,
            block.base,
            block.size
        );
        Ok(slot)
    }

    /// Stop `task` and release everything it holds.
    ///
    /// The task leaves every wait-queue, mutexes it owns are unlocked (with
    /// the usual hand-off), and all memory it owns is freed. Terminating the
    /// running task requests a reschedule.
    pub fn terminate(&mut self, task: TaskIndex) -> Result<(), KernelError> {
        let tcb = &self.scheduler.tasks[task];
        if !tcb.is_alive() {
            return Err(KernelError::AlreadyStopped);
        }
        let (pid, stack_base) = (tcb.pid, tcb.stack_base);

        for index in 0..MAX_MUTEXES {
            if self.mutexes[index].cancel_wait(task) {
                if let Some(owner) = self.mutexes[index].owner() {
                    let effective = self.effective_priority(owner);
                    self.scheduler.tasks[owner].current_priority = effective;
                }
            }
            if self.mutexes[index].owner() == Some(task) {
                self.release_mutex(index, task)?;
            }
        }
        for semaphore in self.semaphores.iter_mut() {
            semaphore.cancel_wait(task);
        }

        // freeing the stack cascades over everything else the pid owns
        self.heap.free(stack_base);

        let tcb = &mut self.scheduler.tasks[task];
        tcb.window = ProtectionMask::NO_ACCESS;
        tcb.state = TaskState::Stopped;
        tcb.current_priority = tcb.priority;
        tcb.ticks = 0;
        self.scheduler.forget(task);
        if self.scheduler.current == Some(task) {
            self.scheduler.needs_reschedule = true;
        }

        log::info!("terminated {} ({})", self.scheduler.tasks[task].name, pid);
        Ok(())
    }

    /// Bring a stopped task back with a fresh stack of its original size.
    pub fn restart(&mut self, task: TaskIndex) -> Result<(), KernelError> {
        let tcb = &self.scheduler.tasks[task];
        if tcb.state != TaskState::Stopped {
            return Err(KernelError::AlreadyStopped);
        }
        let block = self.heap.allocate(tcb.pid, tcb.stack_size)?;

        let mut window = ProtectionMask::NO_ACCESS;
        window.allow(block.subregions());

        let tcb = &mut self.scheduler.tasks[task];
        tcb.reset_context(block.base, block.top(), window);
        tcb.current_priority = tcb.priority;
        tcb.cpu_cycles = [0; 2];

        // the key reader may have been killed holding the token it hands back
        if tcb.name.as_str() == GATEKEEPER_TASK {
            if let Some(index) = tcb.semaphore {
                self.post(index)?;
            }
        }

        let tcb = &self.scheduler.tasks[task];
        log::info!("restarted {} ({})", tcb.name, tcb.pid);
        Ok(())
    }

    /// Change the base priority of `task`. A priority inherited from a
    /// blocked waiter stays in effect until the mutex is released.
    pub fn set_priority(&mut self, task: TaskIndex, priority: u8) {
        self.scheduler.tasks[task].priority = clamp_priority(priority);
        let effective = self.effective_priority(task);
        let tcb = &mut self.scheduler.tasks[task];
        tcb.current_priority = effective;
        log::debug!("{} priority now {}/{}", tcb.name, tcb.priority, effective);

        // a waiter's new priority changes what its mutex owner inherits
        if tcb.state == TaskState::BlockedMutex {
            if let Some(owner) = tcb.mutex.and_then(|i| self.mutexes[i].owner()) {
                let effective = self.effective_priority(owner);
                self.scheduler.tasks[owner].current_priority = effective;
            }
        }
        self.scheduler.needs_reschedule = true;
    }

    /// Extend `task`'s protection window to cover `[base, base + size)`
    /// without recording an allocation.
    pub fn grant_window(&mut self, task: TaskIndex, base: u32, size: u32) {
        self.scheduler.tasks[task].window.allow(window_for(base, size));
    }

    /// Terminate the running task after a memory protection fault.
    pub fn fault_current(&mut self) {
        if let Some(task) = self.scheduler.current {
            let name = self.scheduler.tasks[task].name;
            log::warn!("protection fault in {}", name);
            if let Err(e) = self.terminate(task) {
                log::error!("could not terminate {}: {}", name, e);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Lock mutex `index` for `task`, blocking it if the mutex is held.
    pub fn lock(&mut self, task: TaskIndex, index: usize) -> Result<LockOutcome, KernelError> {
        let mutex = self.mutexes.get_mut(index).ok_or(KernelError::InvalidId)?;
        let outcome = mutex.lock(task)?;
        self.scheduler.tasks[task].mutex = Some(index);

        if let LockOutcome::Blocked { owner } = outcome {
            if self.priority_inheritance {
                self.inherit(owner, self.scheduler.tasks[task].current_priority);
            }
            self.scheduler.tasks[task].state = TaskState::BlockedMutex;
            self.scheduler.needs_reschedule = true;
        }
        Ok(outcome)
    }

    /// Unlock mutex `index`. A task unlocking a mutex it does not own is
    /// terminated.
    pub fn unlock(&mut self, task: TaskIndex, index: usize) -> Result<(), KernelError> {
        if index >= MAX_MUTEXES {
            return Err(KernelError::InvalidId);
        }
        match self.release_mutex(index, task) {
            Err(KernelError::ProtocolViolation) => {
                log::warn!(
                    "{} unlocked mutex {} it does not own",
                    self.scheduler.tasks[task].name,
                    index
                );
                self.terminate(task)?;
                self.scheduler.needs_reschedule = true;
                Err(KernelError::ProtocolViolation)
            }
            other => other,
        }
    }

    /// Wait on semaphore `index`.
    pub fn wait(&mut self, task: TaskIndex, index: usize) -> Result<WaitOutcome, KernelError> {
        let semaphore = self.semaphores.get_mut(index).ok_or(KernelError::InvalidId)?;
        let outcome = semaphore.wait(task)?;
        self.scheduler.tasks[task].semaphore = Some(index);

        if outcome == WaitOutcome::Blocked {
            self.scheduler.tasks[task].state = TaskState::BlockedSemaphore;
            self.scheduler.needs_reschedule = true;
        }
        Ok(outcome)
    }

    /// Post semaphore `index`, waking the head waiter if there is one.
    pub fn post(&mut self, index: usize) -> Result<(), KernelError> {
        let semaphore = self.semaphores.get_mut(index).ok_or(KernelError::InvalidId)?;
        if let Some(woken) = semaphore.post() {
            self.scheduler.tasks[woken].state = TaskState::Ready;
            log::debug!("semaphore {} wakes {}", index, self.scheduler.tasks[woken].name);
        }
        Ok(())
    }

    fn release_mutex(&mut self, index: usize, task: TaskIndex) -> Result<(), KernelError> {
        let next = self.mutexes[index].unlock(task)?;
        let effective = self.effective_priority(task);
        self.scheduler.tasks[task].current_priority = effective;

        if let Some(next) = next {
            let effective = self.effective_priority(next);
            let tcb = &mut self.scheduler.tasks[next];
            tcb.state = TaskState::Ready;
            tcb.mutex = Some(index);
            tcb.current_priority = effective;
            log::debug!("mutex {} handed to {}", index, tcb.name);
        }
        Ok(())
    }

    /// Priority `task` should run at: its base priority, or with
    /// inheritance on, the most urgent waiter queued on a mutex it owns.
    fn effective_priority(&self, task: TaskIndex) -> u8 {
        let tasks = &self.scheduler.tasks;
        let base = tasks[task].priority;
        if !self.priority_inheritance {
            return base;
        }
        self.mutexes
            .iter()
            .filter(|m| m.owner() == Some(task))
            .flat_map(|m| m.queue().iter())
            .map(|w| tasks[w].current_priority)
            .fold(base, u8::min)
    }

    fn inherit(&mut self, owner: TaskIndex, priority: u8) {
        let tcb = &mut self.scheduler.tasks[owner];
        if tcb.current_priority > priority {
            log::debug!("{} inherits priority {}", tcb.name, priority);
            tcb.current_priority = priority;
        }
    }

    // -----------------------------------------------------------------------
    // Time and context switching
    // -----------------------------------------------------------------------

    /// Account one SysTick. Returns whether a context switch should be
    /// pended.
    pub fn tick(&mut self) -> bool {
        self.scheduler.tick();
        self.started && self.scheduler.needs_reschedule
    }

    /// Mark the kernel started. The first [`switch_context`](Self::switch_context)
    /// dispatches the first task.
    pub fn start(&mut self) {
        self.started = true;
        self.scheduler.needs_reschedule = true;
        log::info!("kernel started");
    }

    /// Switch from the running task to the next one.
    ///
    /// `outgoing_sp` is the running task's stack pointer after its software
    /// frame was pushed; it is ignored before the first dispatch. Returns the
    /// stack pointer to restore.
    pub fn switch_context<P: Port>(&mut self, port: &mut P, outgoing_sp: u32) -> u32 {
        let cycles = port.take_elapsed_cycles();
        if let Some(current) = self.scheduler.current {
            self.scheduler.tasks[current].context = Context::Saved { sp: outgoing_sp };
            self.scheduler.account(cycles);
        }

        let next = self.scheduler.schedule();
        let tcb = &mut self.scheduler.tasks[next];
        port.apply_protection(tcb.window);

        match tcb.context {
            Context::Fresh(frame) => {
                let sp = port.materialize(&frame);
                tcb.context = Context::Saved { sp };
                sp
            }
            Context::Saved { sp } => sp,
        }
    }
}

fn clamp_priority(priority: u8) -> u8 {
    priority.min(NUM_PRIORITIES as u8 - 1)
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
