//! # mpuos Demo Firmware
//!
//! The classic protected-kernel workload:
//!
//! | Task          | Priority | Stack | Behavior                                          |
//! |---------------|----------|-------|---------------------------------------------------|
//! | `Idle`        | 15       | 512   | Yields forever; keeps one task always ready       |
//! | `Flash4Hz`    | 8        | 512   | Sleeps 125 ms in a loop                           |
//! | `OneShot`     | 4        | 1536  | Waits on `FLASH_REQ`, then sleeps one second      |
//! | `LengthyFn`   | 12       | 1024  | Mallocs 5000 B, fills it under `RESOURCE`         |
//! | `ReadKeys`    | 12       | 1024  | Key gatekeeper: posts presses, drives other tasks |
//! | `Debounce`    | 12       | 1024  | Turns a press back into a release                 |
//! | `Important`   | 0        | 1024  | Holds `RESOURCE` for a second at a time           |
//! | `Uncoop`      | 12       | 1024  | Spins for a long time before yielding             |
//! | `Errant`      | 12       | 512   | Eventually writes kernel memory and is killed     |
//!
//! The board's push buttons are replaced by a fixed press sequence, so the
//! firmware runs without any GPIO setup.
//!
//! On the target this is firmware; on the host the same task set runs on the
//! simulated port, each task issuing a fixed cycle of service calls.

#![cfg_attr(target_os = "none", no_std, no_main)]

/// Semaphore: a key went down.
const KEY_PRESSED: usize = 0;
/// Semaphore: all keys are up again.
const KEY_RELEASED: usize = 1;
/// Semaphore: one-shot flash requests.
const FLASH_REQ: usize = 2;
/// Mutex shared by `LengthyFn` and `Important`.
const RESOURCE: usize = 0;

const KEY_PRESSED_COUNT: u32 = 1;
const KEY_RELEASED_COUNT: u32 = 0;
const FLASH_REQ_COUNT: u32 = 5;

// ---------------------------------------------------------------------------
// Firmware
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
mod firmware {
    use cortex_m_rt::entry;
    use panic_halt as _;

    use mpuos::api;
    use mpuos::arch::cortex_m4;

    use super::*;

    /// Key presses replayed by `ReadKeys`, one bit per button.
    const KEY_SCRIPT: [u8; 4] = [0b0_0010, 0b0_1000, 0b0_0100, 0b1_0000];

    /// Cycles burned by a unit of simulated work (~1 ms at 40 MHz).
    const WORK_CYCLES: u32 = 39_600;

    extern "C" fn idle() -> ! {
        loop {
            cortex_m::asm::delay(WORK_CYCLES);
            api::yield_now();
        }
    }

    extern "C" fn flash_4hz() -> ! {
        loop {
            api::sleep(125);
        }
    }

    extern "C" fn oneshot() -> ! {
        loop {
            api::wait(FLASH_REQ);
            api::sleep(1000);
        }
    }

    extern "C" fn lengthy_fn() -> ! {
        let mem = api::malloc(5000);
        loop {
            api::lock(RESOURCE);
            for i in 0..5000u32 {
                cortex_m::asm::delay(WORK_CYCLES);
                api::yield_now();
                if let Some(mem) = mem {
                    unsafe { mem.add(i as usize).write_volatile(i as u8) };
                }
            }
            api::unlock(RESOURCE);
        }
    }

    extern "C" fn read_keys() -> ! {
        let mut next = 0;
        loop {
            api::wait(KEY_RELEASED);
            api::sleep(2000);
            let buttons = KEY_SCRIPT[next % KEY_SCRIPT.len()];
            next += 1;

            api::post(KEY_PRESSED);
            if buttons & 0b0_0010 != 0 {
                api::post(FLASH_REQ);
            }
            if buttons & 0b0_0100 != 0 {
                let _ = api::run("Flash4Hz");
            }
            if buttons & 0b0_1000 != 0 {
                let _ = api::pkill("Flash4Hz");
            }
            if buttons & 0b1_0000 != 0 {
                if let Some(pid) = api::pidof("LengthyFn") {
                    let _ = api::set_priority(pid, 4);
                }
            }
            api::yield_now();
        }
    }

    extern "C" fn debounce() -> ! {
        loop {
            api::wait(KEY_PRESSED);
            let mut quiet = 10;
            while quiet != 0 {
                api::sleep(10);
                quiet -= 1;
            }
            api::post(KEY_RELEASED);
        }
    }

    extern "C" fn important() -> ! {
        loop {
            api::lock(RESOURCE);
            api::sleep(1000);
            api::unlock(RESOURCE);
        }
    }

    extern "C" fn uncooperative() -> ! {
        loop {
            cortex_m::asm::delay(WORK_CYCLES * 100);
            api::yield_now();
        }
    }

    extern "C" fn errant() -> ! {
        let kernel_ram = 0x2000_0000 as *mut u32;
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            if rounds == 10_000 {
                // outside every window: MemManage fault, task terminated
                unsafe { kernel_ram.write_volatile(0) };
            }
            api::yield_now();
        }
    }

    #[entry]
    fn main() -> ! {
        let cp = cortex_m::Peripherals::take().expect("peripherals already taken");

        cortex_m4::with_kernel(|kernel, _| {
            kernel.init_semaphore(KEY_PRESSED, KEY_PRESSED_COUNT)?;
            kernel.init_semaphore(KEY_RELEASED, KEY_RELEASED_COUNT)?;
            kernel.init_semaphore(FLASH_REQ, FLASH_REQ_COUNT)?;
            kernel.priority_inheritance = true;

            kernel.spawn(idle, "Idle", 15, 512)?;
            kernel.spawn(lengthy_fn, "LengthyFn", 12, 1024)?;
            kernel.spawn(flash_4hz, "Flash4Hz", 8, 512)?;
            kernel.spawn(oneshot, "OneShot", 4, 1536)?;
            kernel.spawn(read_keys, "ReadKeys", 12, 1024)?;
            kernel.spawn(debounce, "Debounce", 12, 1024)?;
            kernel.spawn(important, "Important", 0, 1024)?;
            kernel.spawn(uncooperative, "Uncoop", 12, 1024)?;
            kernel.spawn(errant, "Errant", 12, 512)?;
            Ok::<(), mpuos::KernelError>(())
        })
        .expect("task setup failed");

        cortex_m4::start(cp)
    }
}

// ---------------------------------------------------------------------------
// Host simulation
// ---------------------------------------------------------------------------

#[cfg(not(target_os = "none"))]
mod simulation {
    use mpuos::arch::hosted::HostedPort;
    use mpuos::syscall::{ServiceCall, ServiceReply};
    use mpuos::task::{Context, Pid};
    use mpuos::Kernel;

    use super::*;

    const SIM_TICKS: u32 = 5_000;

    /// What a simulated task does each time it gets the CPU.
    #[derive(Clone, Copy)]
    enum Step {
        Call(ServiceCall),
        /// Touch memory outside the task's window.
        Fault,
    }

    use Step::{Call, Fault};

    struct Demo {
        name: &'static str,
        priority: u8,
        stack: u32,
        /// Run once, before `steps`.
        first: &'static [Step],
        /// Repeated forever.
        steps: &'static [Step],
    }

    const fn pid(slot: u32) -> Pid {
        Pid::from_raw(0x0000_1000 + 0x100 * slot)
    }

    const FLASH_4HZ: Pid = pid(2);
    const LENGTHY_FN: Pid = pid(1);

    const DEMOS: [Demo; 9] = [
        Demo {
            name: "Idle",
            priority: 15,
            stack: 512,
            first: &[],
            steps: &[Call(ServiceCall::Yield)],
        },
        Demo {
            name: "LengthyFn",
            priority: 12,
            stack: 1024,
            first: &[Call(ServiceCall::Malloc(5000))],
            steps: &[
                Call(ServiceCall::Lock(RESOURCE)),
                Call(ServiceCall::Yield),
                Call(ServiceCall::Yield),
                Call(ServiceCall::Unlock(RESOURCE)),
                Call(ServiceCall::Lock(RESOURCE)),
                Call(ServiceCall::Yield),
                Call(ServiceCall::Unlock(RESOURCE)),
            ],
        },
        Demo {
            name: "Flash4Hz",
            priority: 8,
            stack: 512,
            first: &[],
            steps: &[Call(ServiceCall::Sleep(125))],
        },
        Demo {
            name: "OneShot",
            priority: 4,
            stack: 1536,
            first: &[],
            steps: &[Call(ServiceCall::Wait(FLASH_REQ)), Call(ServiceCall::Sleep(1000))],
        },
        Demo {
            name: "ReadKeys",
            priority: 12,
            stack: 1024,
            first: &[],
            steps: &[
                Call(ServiceCall::Wait(KEY_RELEASED)),
                Call(ServiceCall::Sleep(500)),
                Call(ServiceCall::Post(KEY_PRESSED)),
                Call(ServiceCall::Post(FLASH_REQ)),
                Call(ServiceCall::Kill(FLASH_4HZ)),
                Call(ServiceCall::Wait(KEY_RELEASED)),
                Call(ServiceCall::Sleep(500)),
                Call(ServiceCall::Post(KEY_PRESSED)),
                Call(ServiceCall::Restart(FLASH_4HZ)),
                Call(ServiceCall::SetPriority(LENGTHY_FN, 4)),
            ],
        },
        Demo {
            name: "Debounce",
            priority: 12,
            stack: 1024,
            first: &[],
            steps: &[
                Call(ServiceCall::Wait(KEY_PRESSED)),
                Call(ServiceCall::Sleep(100)),
                Call(ServiceCall::Post(KEY_RELEASED)),
            ],
        },
        Demo {
            name: "Important",
            priority: 0,
            stack: 1024,
            first: &[],
            steps: &[
                Call(ServiceCall::Lock(RESOURCE)),
                Call(ServiceCall::Sleep(1000)),
                Call(ServiceCall::Unlock(RESOURCE)),
            ],
        },
        Demo {
            name: "Uncoop",
            priority: 12,
            stack: 1024,
            first: &[],
            steps: &[Call(ServiceCall::Yield)],
        },
        Demo {
            name: "Errant",
            priority: 12,
            stack: 512,
            first: &[],
            steps: &[Call(ServiceCall::Yield), Call(ServiceCall::Yield), Fault],
        },
    ];

    fn switch(kernel: &mut Kernel, port: &mut HostedPort) {
        let sp = match kernel.scheduler.current_tcb().map(|t| t.context) {
            Some(Context::Saved { sp }) => sp,
            Some(Context::Fresh(frame)) => frame.stack_pointer(),
            None => 0,
        };
        kernel.switch_context(port, sp);
    }

    pub fn run() -> Result<(), mpuos::KernelError> {
        let mut kernel = Kernel::new();
        let mut port = HostedPort::default();

        kernel.init_semaphore(KEY_PRESSED, KEY_PRESSED_COUNT)?;
        kernel.init_semaphore(KEY_RELEASED, KEY_RELEASED_COUNT)?;
        kernel.init_semaphore(FLASH_REQ, FLASH_REQ_COUNT)?;
        kernel.priority_inheritance = true;

        for (slot, demo) in DEMOS.iter().enumerate() {
            kernel.create_task(pid(slot as u32), demo.name, demo.priority, demo.stack)?;
        }
        let mut cursor = [0usize; DEMOS.len()];

        kernel.dispatch(&mut port, ServiceCall::Start)?;
        switch(&mut kernel, &mut port);

        for _ in 0..SIM_TICKS {
            if let Some(task) = kernel.current_task() {
                let demo = &DEMOS[task];
                let n = cursor[task];
                cursor[task] += 1;
                let step = match demo.first.get(n) {
                    Some(&step) => step,
                    None => demo.steps[(n - demo.first.len()) % demo.steps.len()],
                };
                match step {
                    Call(call) => {
                        if let Err(e) = kernel.dispatch(&mut port, call) {
                            log::debug!("{} {:?}: {}", demo.name, call, e);
                        }
                    }
                    Fault => kernel.fault_current(),
                }
                if kernel.scheduler.needs_reschedule {
                    switch(&mut kernel, &mut port);
                }
            }
            port.tick();
            if kernel.tick() {
                switch(&mut kernel, &mut port);
            }
        }

        if let ServiceReply::Tasks(tasks) = kernel.dispatch(&mut port, ServiceCall::Ps)? {
            for t in tasks.iter() {
                log::info!(
                    "{:<12} {} {:>3}.{:02}% {:<10} prio {}/{}",
                    t.name.as_str(),
                    t.pid,
                    t.cpu / 100,
                    t.cpu % 100,
                    t.state.as_str(),
                    t.priority,
                    t.current_priority
                );
            }
        }
        if let ServiceReply::Ipc(ipc) = kernel.dispatch(&mut port, ServiceCall::Ipcs)? {
            for (i, s) in ipc.semaphores.iter().enumerate() {
                log::info!("semaphore {} count {} waiters {:?}", i, s.count, s.waiters);
            }
            for (i, m) in ipc.mutexes.iter().enumerate() {
                log::info!("mutex {} owner {:?} waiters {:?}", i, m.owner, m.waiters);
            }
        }
        if let ServiceReply::Memory(memory) = kernel.dispatch(&mut port, ServiceCall::MemInfo)? {
            for m in memory.iter() {
                log::info!("{} {:#010x} {:>5} B", m.owner, m.base, m.size);
            }
        }
        Ok(())
    }
}

#[cfg(not(target_os = "none"))]
fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(e) = simulation::run() {
        log::error!("simulation failed: {}", e);
        std::process::exit(1);
    }
}
