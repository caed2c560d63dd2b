//! # Scheduler
//!
//! The task table and the selection policy.
//!
//! ## Policies
//!
//! - **Priority** (default): the lowest `current_priority` among `Ready`
//!   tasks wins. Tasks sharing that priority take turns: the search starts
//!   just after the task last dispatched at that level and wraps around.
//!   Lower-priority tasks starve while a more urgent one stays ready.
//! - **Round-robin**: priorities are ignored; the first `Ready` task after
//!   the last dispatched slot is picked.
//!
//! ## Tick
//!
//! Every SysTick the scheduler counts down sleeping tasks, rolls the CPU
//! accounting epoch over once per [`CPU_EPOCH_TICKS`], and, when preemption
//! is enabled, asks for a reschedule.

use crate::config::{CPU_EPOCH_TICKS, CPU_PCT_SCALE, MAX_TASKS, NUM_PRIORITIES, SYSTEM_CLOCK_HZ};
use crate::task::{Pid, TaskControlBlock, TaskIndex, TaskState, TaskTable};

/// Task selection policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    Priority,
    RoundRobin,
}

/// The task table plus everything needed to pick the next task.
pub struct Scheduler {
    /// Fixed-size array of TCBs.
    pub tasks: TaskTable,

    /// Index of the dispatched task; `None` until the kernel starts.
    pub current: Option<TaskIndex>,

    pub policy: SchedPolicy,

    /// Whether the tick forces a reschedule.
    pub preemption: bool,

    /// Flag set when a context switch should happen at the next opportunity.
    pub needs_reschedule: bool,

    /// Last task dispatched at each priority level.
    last_at_priority: [Option<TaskIndex>; NUM_PRIORITIES],

    /// Ticks into the current CPU accounting epoch.
    epoch_ticks: u32,

    /// Which of the two `cpu_cycles` buffers is accumulating.
    active_buffer: usize,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Self {
        Self {
            tasks: [TaskControlBlock::EMPTY; MAX_TASKS],
            current: None,
            policy: SchedPolicy::Priority,
            preemption: true,
            needs_reschedule: false,
            last_at_priority: [None; NUM_PRIORITIES],
            epoch_ticks: 0,
            active_buffer: 0,
        }
    }

    /// Slot of the live task with `pid`.
    pub fn find_alive(&self, pid: Pid) -> Option<TaskIndex> {
        self.tasks.iter().position(|t| t.is_alive() && t.pid == pid)
    }

    /// Slot of any non-empty descriptor with `pid`, live or stopped.
    pub fn find(&self, pid: Pid) -> Option<TaskIndex> {
        self.tasks
            .iter()
            .position(|t| t.state != TaskState::Invalid && t.pid == pid)
    }

    /// Slot of the first non-empty descriptor named `name`.
    pub fn find_by_name(&self, name: &str) -> Option<TaskIndex> {
        self.tasks
            .iter()
            .position(|t| t.state != TaskState::Invalid && t.name.as_str() == name)
    }

    /// First unused descriptor.
    pub fn free_slot(&self) -> Option<TaskIndex> {
        self.tasks.iter().position(|t| t.state == TaskState::Invalid)
    }

    pub fn current_tcb(&self) -> Option<&TaskControlBlock> {
        self.current.map(|i| &self.tasks[i])
    }

    /// Pick the next task and make it `Running`.
    ///
    /// The previously running task, if still `Running`, goes back to `Ready`
    /// first so it competes like everyone else.
    ///
    /// # Panics
    /// When no task is ready. An idle task that never blocks must exist.
    pub fn schedule(&mut self) -> TaskIndex {
        if let Some(prev) = self.current {
            if self.tasks[prev].state == TaskState::Running {
                self.tasks[prev].state = TaskState::Ready;
            }
        }

        let next = match self.policy {
            SchedPolicy::Priority => self.select_by_priority(),
            SchedPolicy::RoundRobin => self.select_round_robin(),
        };
        let Some(next) = next else {
            panic!("no ready task to schedule");
        };

        self.tasks[next].state = TaskState::Running;
        self.current = Some(next);
        self.needs_reschedule = false;
        log::trace!("dispatch {} ({})", self.tasks[next].name, self.tasks[next].pid);
        next
    }

    fn select_by_priority(&mut self) -> Option<TaskIndex> {
        let level = self
            .tasks
            .iter()
            .filter(|t| t.is_ready())
            .map(|t| t.current_priority)
            .min()?;

        let start = self.last_at_priority[level as usize].map_or(0, |last| last + 1);
        let next = (0..MAX_TASKS)
            .map(|offset| (start + offset) % MAX_TASKS)
            .find(|&i| self.tasks[i].is_ready() && self.tasks[i].current_priority == level)?;

        self.last_at_priority[level as usize] = Some(next);
        Some(next)
    }

    fn select_round_robin(&self) -> Option<TaskIndex> {
        let start = self.current.map_or(0, |last| last + 1);
        (0..MAX_TASKS)
            .map(|offset| (start + offset) % MAX_TASKS)
            .find(|&i| self.tasks[i].is_ready())
    }

    /// Called from the SysTick handler every tick.
    pub fn tick(&mut self) {
        for task in self.tasks.iter_mut().filter(|t| t.state == TaskState::Delayed) {
            task.ticks = task.ticks.saturating_sub(1);
            if task.ticks == 0 {
                task.state = TaskState::Ready;
            }
        }

        self.epoch_ticks += 1;
        if self.epoch_ticks >= CPU_EPOCH_TICKS {
            self.epoch_ticks = 0;
            self.active_buffer ^= 1;
            let active = self.active_buffer;
            for task in self.tasks.iter_mut() {
                task.cpu_cycles[active] = 0;
            }
        }

        if self.preemption {
            self.needs_reschedule = true;
        }
    }

    /// Charge `cycles` of CPU time to the running task.
    pub fn account(&mut self, cycles: u32) {
        if let Some(current) = self.current {
            let active = self.active_buffer;
            let slot = &mut self.tasks[current].cpu_cycles[active];
            *slot = slot.saturating_add(cycles);
        }
    }

    /// CPU share of `task` over the last complete epoch, in hundredths of a
    /// percent.
    pub fn cpu_percent(&self, task: TaskIndex) -> u32 {
        let previous = self.tasks[task].cpu_cycles[self.active_buffer ^ 1];
        (u64::from(previous) * CPU_PCT_SCALE / u64::from(SYSTEM_CLOCK_HZ)) as u32
    }

    /// Put the running task to sleep for `ticks`. Sleeping zero ticks is a
    /// plain yield.
    pub fn sleep_current(&mut self, ticks: u32) {
        if let Some(current) = self.current {
            if ticks > 0 {
                self.tasks[current].ticks = ticks;
                self.tasks[current].state = TaskState::Delayed;
            }
            self.needs_reschedule = true;
        }
    }

    /// Forget the round-robin position of `task`, e.g. when it is stopped.
    pub fn forget(&mut self, task: TaskIndex) {
        for last in self.last_at_priority.iter_mut() {
            if *last == Some(task) {
                *last = None;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------
