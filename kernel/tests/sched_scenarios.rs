//! End-to-end scheduling and synchronization scenarios.

use malvern_kernel::boot_info::BootInfo;
use malvern_kernel::error::{Errno, KernelError};
use malvern_kernel::hal::NullHal;
use malvern_kernel::kernel::Kernel;
use malvern_kernel::mm::{self, Prot, PAGE_SIZE, VM_USER_BASE};
use malvern_kernel::proc::thread::{Intr, SchedPolicy, ThreadId, ThreadState, WakeReason};
use malvern_kernel::sync::rendez::{self, Rendez};
use malvern_kernel::sync::rwlock::{LockRequest, RwLock};
use malvern_kernel::timer::JIFFIES_PER_SECOND;

static TEST_HAL: NullHal = NullHal::new();

fn boot() -> Kernel {
    Kernel::new(&BootInfo::hosted(8 * 1024 * 1024), &TEST_HAL).unwrap()
}

fn user_thread(k: &mut Kernel, policy: SchedPolicy, prio: u8) -> ThreadId {
    let pid = k.proc_create("t", None).unwrap();
    k.thread_create(pid, policy, prio).unwrap()
}

#[test]
fn priority_preemption_on_wakeup() {
    let mut k = boot();
    let t1 = user_thread(&mut k, SchedPolicy::Other, 10);
    let t2 = user_thread(&mut k, SchedPolicy::Rr, 20);
    let mut r = Rendez::new();

    // Both threads block on R.
    for &t in &[t1, t2] {
        k.sched.adopt(&mut k.threads, t).unwrap();
        let err = rendez::task_sleep(&mut k.threads, &mut k.sched, k.hal, &mut r).unwrap_err();
        assert_eq!(err, KernelError::WouldBlock);
    }
    assert_eq!(k.threads.get(t1).unwrap().state, ThreadState::Sleeping);
    assert_eq!(k.threads.get(t2).unwrap().state, ThreadState::Sleeping);

    // Wake R: the priority-20 thread gets the CPU, the priority-10
    // thread stays READY at its level.
    rendez::task_wakeup(&mut k.threads, &mut k.sched, &mut k.timers, &mut r).unwrap();
    k.sched.reschedule(&mut k.threads, k.hal).unwrap();
    assert_eq!(k.sched.current(), t2);
    assert_eq!(k.threads.get(t2).unwrap().state, ThreadState::Running);
    assert_eq!(k.threads.get(t1).unwrap().state, ThreadState::Ready);
    assert!(k.sched.in_queue(t1, 10));
    assert!(k.check_ready_queue_invariant());
}

#[test]
fn timed_sleep_reports_etimedout_after_five_jiffies() {
    let mut k = boot();
    let t = user_thread(&mut k, SchedPolicy::Rr, 20);
    let mut r = Rendez::new();

    // Sleep with a 50 ms timeout (5 jiffies at 100 Hz); no wakeup
    // arrives.
    k.sched.adopt(&mut k.threads, t).unwrap();
    let err = rendez::task_sleep_timeout(
        &mut k.threads,
        &mut k.sched,
        &mut k.timers,
        k.hal,
        &mut r,
        5,
        Intr::NONE,
        Intr::NONE,
    )
    .unwrap_err();
    assert_eq!(err, KernelError::WouldBlock);

    let start = k.timers.hardclock();
    while k.threads.get(t).unwrap().state == ThreadState::Sleeping {
        k.tick().unwrap();
        assert!(k.timers.hardclock() - start <= JIFFIES_PER_SECOND);
    }
    let elapsed = k.timers.hardclock() - start;
    assert!(elapsed >= 5, "woke after {} jiffies", elapsed);
    assert_eq!(
        k.threads.get_mut(t).unwrap().take_wake_reason(),
        Some(WakeReason::Timeout)
    );
    // The operation maps the timeout onto -ETIMEDOUT.
    assert_eq!(KernelError::TimedOut.errno(), Errno::ETIMEDOUT);
}

#[test]
fn sched_ready_unready_roundtrip_single_entry() {
    let mut k = boot();
    let t = user_thread(&mut k, SchedPolicy::Rr, 18);
    k.sched.sched_unready(&mut k.threads, t).unwrap();
    k.sched.sched_ready(&mut k.threads, t).unwrap();
    assert_eq!(k.sched.queue_len(18), 1);
    assert!(k.check_ready_queue_invariant());
}

#[test]
fn rwlock_drain_gates_and_hands_off() {
    let mut k = boot();
    let holder = user_thread(&mut k, SchedPolicy::Rr, 20);
    let drainer = user_thread(&mut k, SchedPolicy::Rr, 20);
    let late = user_thread(&mut k, SchedPolicy::Rr, 20);
    let mut lock = RwLock::new();

    let mut lock_as = |k: &mut Kernel, lock: &mut RwLock, tid, req| {
        k.sched.adopt(&mut k.threads, tid).unwrap();
        lock.lock(&mut k.threads, &mut k.sched, &mut k.timers, k.hal, req)
    };

    lock_as(&mut k, &mut lock, holder, LockRequest::Shared).unwrap();
    assert!(lock_as(&mut k, &mut lock, drainer, LockRequest::Drain).is_err());
    // New shared requests block while the drain is pending.
    assert!(lock_as(&mut k, &mut lock, late, LockRequest::Shared).is_err());

    lock_as(&mut k, &mut lock, holder, LockRequest::Release).unwrap();
    assert!(lock.held_exclusively_by(drainer));
    assert!(lock.is_draining());
    lock_as(&mut k, &mut lock, drainer, LockRequest::Drain).unwrap();
    // The late sharer is still gated.
    assert_eq!(k.threads.get(late).unwrap().state, ThreadState::Sleeping);

    lock_as(&mut k, &mut lock, drainer, LockRequest::Release).unwrap();
    assert!(lock.held_shared_by(late));
    lock_as(&mut k, &mut lock, late, LockRequest::Shared).unwrap();
    assert_eq!(lock.share_cnt(), 1);
    assert_eq!(lock.exclusive_cnt(), 0);
}

#[test]
fn futex_eagain_without_sleeping_and_single_wake() {
    let mut k = boot();
    let pid = k.proc_create("futexer", None).unwrap();
    let waiter = k.thread_create(pid, SchedPolicy::Rr, 20).unwrap();
    let other = k.thread_create(pid, SchedPolicy::Rr, 20).unwrap();
    let waker = k.thread_create(pid, SchedPolicy::Rr, 19).unwrap();

    // Give the process a mapped page and store 7 at uaddr.
    let pmap = k.procs.get(pid).unwrap().pmap.unwrap();
    let uaddr = VM_USER_BASE + 0x100;
    k.pmaps
        .enter_lazy(&mut k.frames, pmap, VM_USER_BASE, PAGE_SIZE, Prot::READ | Prot::WRITE)
        .unwrap();
    mm::write_user_u32(&mut k.pmaps, &mut k.frames, k.hal, pmap, uaddr, 7).unwrap();

    // Value mismatch: -EAGAIN, no sleep.
    k.sched.adopt(&mut k.threads, waiter).unwrap();
    let err = k.sys_futex_wait(uaddr, 5, None).unwrap_err();
    assert_eq!(err, KernelError::TryAgain);
    assert_eq!(err.errno(), Errno::EAGAIN);
    assert_eq!(k.threads.get(waiter).unwrap().state, ThreadState::Running);

    // Matching value parks; one wake releases exactly one waiter.
    mm::write_user_u32(&mut k.pmaps, &mut k.frames, k.hal, pmap, uaddr, 5).unwrap();
    assert!(k.sys_futex_wait(uaddr, 5, None).is_err());
    k.sched.adopt(&mut k.threads, other).unwrap();
    assert!(k.sys_futex_wait(uaddr, 5, None).is_err());

    // Waking is keyed by (process, address): issue it from a thread
    // of the same process.
    k.sched.adopt(&mut k.threads, waker).unwrap();
    let woken = k.sys_futex_wake(uaddr, 1).unwrap();
    assert_eq!(woken, 1);
    assert_eq!(k.threads.get(waiter).unwrap().state, ThreadState::Ready);
    assert_eq!(k.threads.get(other).unwrap().state, ThreadState::Sleeping);

    // The woken waiter's retried wait completes with success.
    k.sched.adopt(&mut k.threads, waiter).unwrap();
    k.sys_futex_wait(uaddr, 5, None).unwrap();
}

#[test]
fn quantum_rotation_preserves_invariant() {
    let mut k = boot();
    let a = user_thread(&mut k, SchedPolicy::Rr, 20);
    let b = user_thread(&mut k, SchedPolicy::Rr, 20);
    k.sched.reschedule(&mut k.threads, k.hal).unwrap();
    assert_eq!(k.sched.current(), a);

    // Run many jiffies; the two threads trade the CPU and the
    // queue/bitmap bookkeeping stays consistent throughout.
    let mut saw_b = false;
    for _ in 0..20 {
        k.tick().unwrap();
        assert!(k.check_ready_queue_invariant());
        if k.sched.current() == b {
            saw_b = true;
        }
    }
    assert!(saw_b);
}
