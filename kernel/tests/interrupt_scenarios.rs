//! End-to-end interrupt delivery scenarios.

use malvern_kernel::boot_info::BootInfo;
use malvern_kernel::error::KernelError;
use malvern_kernel::hal::{Hal, NullHal};
use malvern_kernel::kernel::Kernel;
use malvern_kernel::proc::thread::{Intr, SchedPolicy, ThreadId, ThreadState};
use malvern_kernel::sync::rendez::{self, Rendez};

/// Each test gets its own HAL so interrupt state cannot leak between
/// concurrently running tests.
fn boot() -> (Kernel, &'static NullHal) {
    let hal: &'static NullHal = Box::leak(Box::new(NullHal::new()));
    (
        Kernel::new(&BootInfo::hosted(8 * 1024 * 1024), hal).unwrap(),
        hal,
    )
}

fn server_thread(k: &mut Kernel) -> ThreadId {
    let pid = k.proc_create("driver", None).unwrap();
    k.thread_create(pid, SchedPolicy::Fifo, 24).unwrap()
}

#[test]
fn isr_fanout_delivers_events_and_defers_unmask() {
    let (mut k, hal) = boot();
    let a = server_thread(&mut k);
    let b = server_thread(&mut k);

    // Register two interrupt servers for IRQ 29, events 1 and 2.
    k.sched.adopt(&mut k.threads, a).unwrap();
    k.sys_addinterruptserver(29, 1).unwrap();
    k.sched.adopt(&mut k.threads, b).unwrap();
    k.sys_addinterruptserver(29, 2).unwrap();

    // Both park waiting for events.
    let mut bed_a = Rendez::new();
    let mut bed_b = Rendez::new();
    k.sched.adopt(&mut k.threads, a).unwrap();
    let _ = rendez::task_sleep_interruptible(
        &mut k.threads,
        &mut k.sched,
        k.hal,
        &mut bed_a,
        Intr::EVENT,
        Intr::NONE,
    );
    k.sched.adopt(&mut k.threads, b).unwrap();
    let _ = rendez::task_sleep_interruptible(
        &mut k.threads,
        &mut k.sched,
        k.hal,
        &mut bed_b,
        Intr::EVENT,
        Intr::NONE,
    );

    // The device raises IRQ 29; the top half masks and queues DPC
    // work; the DPC thread fans the event out.
    hal.raise_irq(29);
    k.interrupt_top_half().unwrap();
    assert!(hal.irq_masked(29));
    k.service_kthreads().unwrap();

    assert_eq!(k.threads.get(a).unwrap().state, ThreadState::Ready);
    assert_eq!(k.threads.get(b).unwrap().state, ThreadState::Ready);

    // Each thread receives its own event bit.
    k.sched.adopt(&mut k.threads, a).unwrap();
    assert_eq!(k.sys_eventcheck().unwrap(), 1 << 1);
    k.sched.adopt(&mut k.threads, b).unwrap();
    assert_eq!(k.sys_eventcheck().unwrap(), 1 << 2);

    // The line stays masked until both servers unmask.
    k.sched.adopt(&mut k.threads, a).unwrap();
    k.sys_unmaskinterrupt(29).unwrap();
    assert!(hal.irq_masked(29));
    k.sched.adopt(&mut k.threads, b).unwrap();
    k.sys_unmaskinterrupt(29).unwrap();
    assert!(!hal.irq_masked(29));

    hal.clear_irq(29);
}

#[test]
fn interrupt_registration_requires_privilege() {
    let (mut k, _hal) = boot();
    let t = server_thread(&mut k);
    k.sched.adopt(&mut k.threads, t).unwrap();
    let pid = k.current_proc().unwrap();
    k.procs
        .get_mut(pid)
        .unwrap()
        .privileges
        .restrict(malvern_kernel::proc::privileges::PrivWhen::Now, malvern_kernel::proc::privileges::Priv::IO);
    assert_eq!(
        k.sys_addinterruptserver(29, 1).unwrap_err(),
        KernelError::PermissionDenied
    );
}

#[test]
fn timer_irq_drives_the_jiffy_clock() {
    let (mut k, hal) = boot();
    hal.enable_irq(malvern_kernel::interrupt::TIMER_IRQ);
    hal.raise_irq(malvern_kernel::interrupt::TIMER_IRQ);
    let before = k.timers.hardclock();
    k.interrupt_top_half().unwrap();
    assert_eq!(k.timers.hardclock(), before + 1);
    hal.clear_irq(malvern_kernel::interrupt::TIMER_IRQ);
}

#[test]
fn removed_server_stops_receiving() {
    let (mut k, hal) = boot();
    let t = server_thread(&mut k);
    k.sched.adopt(&mut k.threads, t).unwrap();
    let isr = k.sys_addinterruptserver(30, 4).unwrap();
    k.sys_reminterruptserver(isr).unwrap();

    hal.raise_irq(30);
    k.interrupt_top_half().unwrap();
    k.service_kthreads().unwrap();
    assert_eq!(k.sys_eventcheck().unwrap(), 0);
    hal.clear_irq(30);
}
