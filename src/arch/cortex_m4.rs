//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the TM4C123GH6PM (Cortex-M4, Thumb-2).
//! Implements the MPU setup, context switching via PendSV, the SVCall
//! gate, the SysTick tick and the fault entry points.
//!
//! ## Context Switch Mechanism
//!
//! Tasks run unprivileged on the **PSP**; the kernel and every handler run
//! on the **MSP**. On exception entry the hardware stacks R0–R3, R12, LR, PC
//! and xPSR onto the task stack. PendSV pushes R4–R11 and then EXC_RETURN
//! below that, hands the resulting PSP to [`Kernel::switch_context`], and
//! unwinds the incoming task's frame the same way in reverse.
//!
//! ## Interrupt Priorities
//!
//! SVCall, SysTick and PendSV all sit at priority 0xFF. None of them can
//! preempt another, so kernel state is only ever touched by one of them at a
//! time. MemManage keeps its higher default priority.
//!
//! ## MPU Map
//!
//! | Region | Range                     | Access                          |
//! |--------|---------------------------|---------------------------------|
//! | 0–4    | SRAM heap (5 regions)     | full RW, gated per subregion    |
//! | 5      | flash, 256 KiB            | full access, executable         |
//! | 6      | peripherals, 64 MiB       | full RW, never executable       |
//!
//! Anything else (including the kernel's own 4 KiB of SRAM) is only reachable
//! through the privileged default map.

use core::arch::{asm, naked_asm};
use core::cell::RefCell;

use cortex_m::interrupt::Mutex;
use cortex_m::peripheral::scb::{Exception, SystemHandler};
use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::{DWT, MPU, SCB};
use cortex_m_rt::{exception, ExceptionFrame};

use super::Port;
use crate::config::{SRAM_TOP, SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::kernel::Kernel;
use crate::region::{ProtectionMask, REGION_COUNT, SRAM_REGIONS};
use crate::sync::critical_section;
use crate::syscall::{return_word, ServiceCall, ServiceReply};
use crate::task::InitialFrame;

// ---------------------------------------------------------------------------
// Global kernel instance
// ---------------------------------------------------------------------------

static KERNEL: Mutex<RefCell<Kernel>> = Mutex::new(RefCell::new(Kernel::new()));

static PORT: Mutex<RefCell<Tm4c123Port>> = Mutex::new(RefCell::new(Tm4c123Port::new()));

/// Run `f` with exclusive access to the kernel and the port.
pub fn with_kernel<F, R>(f: F) -> R
where
    F: FnOnce(&mut Kernel, &mut Tm4c123Port) -> R,
{
    critical_section(|cs| {
        let mut kernel = KERNEL.borrow(cs).borrow_mut();
        let mut port = PORT.borrow(cs).borrow_mut();
        f(&mut kernel, &mut port)
    })
}

// ---------------------------------------------------------------------------
// Port
// ---------------------------------------------------------------------------

/// The TM4C123 implementation of [`Port`].
pub struct Tm4c123Port {
    last_cycle_count: u32,
}

impl Tm4c123Port {
    const fn new() -> Self {
        Self { last_cycle_count: 0 }
    }
}

impl Port for Tm4c123Port {
    fn apply_protection(&mut self, mask: ProtectionMask) {
        // SAFETY: only called from the kernel handlers, which never nest
        let mpu = unsafe { &*MPU::PTR };
        for region in 0..REGION_COUNT {
            unsafe {
                mpu.rnr.write(region as u32);
                let rasr = mpu.rasr.read() & !RASR_SRD_MASK;
                mpu.rasr.write(rasr | u32::from(mask.srd_bits(region)) << 8);
            }
        }
    }

    fn take_elapsed_cycles(&mut self) -> u32 {
        let now = DWT::cycle_count();
        let elapsed = now.wrapping_sub(self.last_cycle_count);
        self.last_cycle_count = now;
        elapsed
    }

    fn materialize(&mut self, frame: &InitialFrame) -> u32 {
        let sp = frame.stack_pointer();
        let words = frame.words();
        // SAFETY: the frame lies inside the task's freshly allocated stack
        unsafe {
            let base = sp as *mut u32;
            for (i, word) in words.iter().enumerate() {
                base.add(i).write_volatile(*word);
            }
        }
        sp
    }

    fn request_reset(&mut self) {
        SCB::sys_reset();
    }
}

// ---------------------------------------------------------------------------
// MPU configuration
// ---------------------------------------------------------------------------

const RASR_ENABLE: u32 = 1;
const RASR_SRD_MASK: u32 = 0xFF << 8;
const RASR_B: u32 = 1 << 16;
const RASR_C: u32 = 1 << 17;
const RASR_S: u32 = 1 << 18;
const RASR_AP_FULL: u32 = 0b011 << 24;
const RASR_XN: u32 = 1 << 28;

const MPU_CTRL_ENABLE: u32 = 1 << 0;
const MPU_CTRL_PRIVDEFENA: u32 = 1 << 2;

const FLASH_REGION: u32 = 5;
const PERIPHERAL_REGION: u32 = 6;

/// SIZE field for a power-of-two region of `bytes`.
const fn rasr_size(bytes: u32) -> u32 {
    (bytes.trailing_zeros() - 1) << 1
}

fn configure_region(mpu: &mut MPU, number: u32, base: u32, rasr: u32) {
    unsafe {
        mpu.rnr.write(number);
        mpu.rbar.write(base);
        mpu.rasr.write(rasr);
    }
}

/// Program every MPU region and enable the MPU with the privileged default
/// map as background. SRAM subregions start out enabled so that the boot
/// code can drop to unprivileged mode on the top of SRAM.
pub fn configure_mpu(mpu: &mut MPU) {
    configure_region(
        mpu,
        FLASH_REGION,
        0x0000_0000,
        rasr_size(256 * 1024) | RASR_AP_FULL | RASR_C | RASR_ENABLE,
    );
    configure_region(
        mpu,
        PERIPHERAL_REGION,
        0x4000_0000,
        rasr_size(64 * 1024 * 1024) | RASR_AP_FULL | RASR_S | RASR_B | RASR_XN | RASR_ENABLE,
    );
    for (number, region) in SRAM_REGIONS.iter().enumerate() {
        configure_region(
            mpu,
            number as u32,
            region.base,
            rasr_size(region.size()) | RASR_AP_FULL | RASR_S | RASR_C | RASR_XN | RASR_ENABLE,
        );
    }
    unsafe {
        mpu.ctrl.write(MPU_CTRL_PRIVDEFENA | MPU_CTRL_ENABLE);
    }
    cortex_m::asm::dsb();
    cortex_m::asm::isb();
}

// ---------------------------------------------------------------------------
// Startup
// ---------------------------------------------------------------------------

/// The first service call. Lives in flash so unprivileged code can read it.
static START_CALL: ServiceCall = ServiceCall::Start;

/// Configure the processor and hand control to the first task.
///
/// Sets up the MPU, fault and exception priorities, the cycle counter and
/// SysTick, then switches thread mode to the PSP at the top of SRAM,
/// drops privileges and issues the start call. Never returns.
pub fn start(mut cp: cortex_m::Peripherals) -> ! {
    configure_mpu(&mut cp.MPU);
    cp.SCB.enable(Exception::MemoryManagement);

    unsafe {
        cp.SCB.set_priority(SystemHandler::SVCall, 0xFF);
        cp.SCB.set_priority(SystemHandler::PendSV, 0xFF);
        cp.SCB.set_priority(SystemHandler::SysTick, 0xFF);
    }

    cp.DCB.enable_trace();
    cp.DWT.enable_cycle_counter();

    configure_systick(&mut cp.SYST);

    unsafe {
        asm!(
            "msr psp, {top}",
            // thread mode: PSP, unprivileged
            "msr control, {control}",
            "isb",
            "svc 0",
            "udf #0",
            top = in(reg) SRAM_TOP,
            control = in(reg) 0b11u32,
            in("r0") &START_CALL as *const ServiceCall,
            in("r1") 0u32,
            options(noreturn)
        );
    }
}

/// Configure the SysTick timer for the scheduler tick.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

// ---------------------------------------------------------------------------
// SVCall handler (service gate)
// ---------------------------------------------------------------------------

/// SVCall exception handler. Passes the caller's stacked frame to
/// [`service_call`]; the tail branch keeps EXC_RETURN in LR.
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn SVCall() {
    naked_asm!(
        "mrs r0, psp",
        "b {dispatch}",
        dispatch = sym service_call,
    );
}

/// Stacked frame: `r0` points at the [`ServiceCall`], `r1` at a
/// [`ServiceReply`] or is null. The result word goes back into `r0`.
unsafe extern "C" fn service_call(frame: *mut u32) {
    let call = *(frame.read() as *const ServiceCall);
    let reply = frame.add(1).read() as *mut ServiceReply;

    let result = with_kernel(|kernel, port| kernel.dispatch(port, call));
    frame.write(return_word(&result));
    if !reply.is_null() {
        if let Ok(value) = result {
            reply.write(value);
        }
    }

    if with_kernel(|kernel, _| kernel.scheduler.needs_reschedule) {
        SCB::set_pendsv();
    }
}

// ---------------------------------------------------------------------------
// PendSV handler (context switch)
// ---------------------------------------------------------------------------

/// PendSV exception handler. Performs the actual context switch.
///
/// ## Sequence
/// 1. Push R4–R11, then EXC_RETURN, onto the outgoing task stack (PSP)
/// 2. [`Kernel::switch_context`] saves that PSP, schedules, reprograms the
///    MPU and returns the incoming PSP
/// 3. Pop EXC_RETURN and R4–R11 from the incoming stack
/// 4. Return from exception (hardware restores R0–R3, R12, LR, PC, xPSR)
#[unsafe(naked)]
#[no_mangle]
pub extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "stmdb r0!, {{r4-r11}}",
        "str lr, [r0, #-4]!",
        "bl {switch}",
        "ldr lr, [r0], #4",
        "ldmia r0!, {{r4-r11}}",
        "msr psp, r0",
        "bx lr",
        switch = sym pendsv_switch,
    );
}

extern "C" fn pendsv_switch(outgoing_sp: u32) -> u32 {
    with_kernel(|kernel, port| kernel.switch_context(port, outgoing_sp))
}

// ---------------------------------------------------------------------------
// SysTick handler
// ---------------------------------------------------------------------------

#[exception]
fn SysTick() {
    if with_kernel(|kernel, _| kernel.tick()) {
        SCB::set_pendsv();
    }
}

// ---------------------------------------------------------------------------
// Fault handlers
// ---------------------------------------------------------------------------

/// Configurable Fault Status Register; the low byte is the MMFSR.
const CFSR: *mut u32 = 0xE000_ED28 as *mut u32;

/// MPU violation: the offending task is terminated and another one runs.
#[exception]
fn MemoryManagement() {
    unsafe {
        // write-one-to-clear
        CFSR.write_volatile(0xFF);
    }
    with_kernel(|kernel, _| kernel.fault_current());
    SCB::set_pendsv();
}

#[exception]
unsafe fn HardFault(_frame: &ExceptionFrame) -> ! {
    loop {
        cortex_m::asm::bkpt();
    }
}
