//! Kernel timers
//!
//! A timing wheel of one second of jiffies (100 slots at 100 Hz). An
//! armed timer lives in the slot of its absolute expiration modulo the
//! wheel size; expiration compares the full 64-bit jiffy count, so a
//! timeout longer than the wheel period simply stays in its slot until
//! the wheel passes it again with the clock caught up.
//!
//! The split mirrors the interrupt model: `top_half` runs from the
//! timer interrupt with interrupts disabled and only advances the
//! hardclock and notes whether anything is due; the timer kernel thread
//! runs `run_bottom_half` in thread context to unlink expired timers
//! and hand their actions (sleep wakeups, alarms) back to the caller.
//! Rearming is performed by the expiry action only.

use alloc::vec::Vec;

use crate::arena::Arena;
use crate::define_id;
use crate::error::{KernelError, KernelResult};
use crate::proc::thread::ThreadId;
use crate::proc::ProcId;

/// Scheduler clock rate.
pub const JIFFIES_PER_SECOND: u64 = 100;
pub const MICROSECONDS_PER_JIFFY: u64 = 10_000;
pub const NANOSECONDS_PER_JIFFY: u64 = 10_000_000;

/// Wheel size: one second of jiffies.
const WHEEL_SLOTS: usize = JIFFIES_PER_SECOND as usize;

/// Maximum number of armed timers.
const NR_TIMER: usize = 256;

define_id! {
    /// Handle into the timer table.
    TimerId
}

/// Relative time as passed in by user space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpec {
    pub sec: i64,
    pub nsec: i64,
}

impl TimeSpec {
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self { sec, nsec }
    }

    /// Convert to jiffies, rounding up so a non-zero timeout never
    /// becomes zero.
    pub fn to_jiffies(self) -> KernelResult<u64> {
        if self.sec < 0 || !(0..1_000_000_000).contains(&self.nsec) {
            return Err(KernelError::InvalidArgument);
        }
        let ns = self.sec as u64 * 1_000_000_000 + self.nsec as u64;
        Ok(ns.div_ceil(NANOSECONDS_PER_JIFFY))
    }
}

/// What an expired timer does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// End a `TaskSleepTimeout` with reason `Timeout`.
    SleepTimeout(ThreadId),
    /// Deliver SIGALRM to a process.
    Alarm(ProcId),
}

struct Timer {
    armed: bool,
    /// Absolute expiration in jiffies.
    expiration: u64,
    action: TimerAction,
}

/// Actions collected by one bottom-half pass.
#[derive(Debug, Default)]
pub struct Expirations {
    pub sleep_wakes: Vec<ThreadId>,
    pub alarms: Vec<ProcId>,
}

/// The timing wheel.
pub struct TimerWheel {
    timers: Arena<Timer>,
    slots: [Vec<TimerId>; WHEEL_SLOTS],
    hardclock: u64,
    /// Jiffy up to which the bottom half has scanned.
    scanned: u64,
    /// Set by the top half when the current slot holds a due timer.
    due: bool,
}

impl TimerWheel {
    pub fn new() -> Self {
        Self {
            timers: Arena::new("timer", NR_TIMER),
            slots: core::array::from_fn(|_| Vec::new()),
            hardclock: 0,
            scanned: 0,
            due: false,
        }
    }

    /// Current jiffy count.
    pub fn hardclock(&self) -> u64 {
        self.hardclock
    }

    pub fn armed_count(&self) -> usize {
        self.timers.len()
    }

    fn arm(&mut self, action: TimerAction, expiration: u64) -> KernelResult<TimerId> {
        let id = self
            .timers
            .insert(Timer {
                armed: true,
                expiration,
                action,
            })
            .map(TimerId)
            .map_err(|_| KernelError::ResourceExhausted { resource: "timer" })?;
        self.slots[(expiration % WHEEL_SLOTS as u64) as usize].push(id);
        Ok(id)
    }

    /// Arm a sleep-timeout timer `delta` jiffies from now. A zero delta
    /// still waits one jiffy; callers wanting an immediate error check
    /// before sleeping.
    pub fn arm_sleep_timeout(&mut self, tid: ThreadId, delta: u64) -> KernelResult<TimerId> {
        self.arm(TimerAction::SleepTimeout(tid), self.hardclock + delta.max(1))
    }

    /// Arm a SIGALRM timer `delta` jiffies from now.
    pub fn arm_alarm(&mut self, proc: ProcId, delta: u64) -> KernelResult<TimerId> {
        self.arm(TimerAction::Alarm(proc), self.hardclock + delta.max(1))
    }

    /// Disarm and free a timer. Harmless on an already-expired id.
    pub fn disarm(&mut self, id: TimerId) {
        if let Some(timer) = self.timers.remove(id.0) {
            let slot = (timer.expiration % WHEEL_SLOTS as u64) as usize;
            if let Some(pos) = self.slots[slot].iter().position(|&t| t == id) {
                self.slots[slot].swap_remove(pos);
            }
        }
    }

    /// Jiffies until `id` fires, if armed.
    pub fn remaining(&self, id: TimerId) -> Option<u64> {
        self.timers
            .get(id.0)
            .map(|t| t.expiration.saturating_sub(self.hardclock))
    }

    /// `TimerTopHalf`, wheel portion: advance the hardclock and report
    /// whether the timer thread has work. Runs with interrupts
    /// disabled; must not take actions itself.
    pub fn top_half(&mut self) -> bool {
        self.hardclock += 1;
        let slot = (self.hardclock % WHEEL_SLOTS as u64) as usize;
        if self.slots[slot]
            .iter()
            .any(|id| match self.timers.get(id.0) {
                Some(t) => t.armed && t.expiration <= self.hardclock,
                None => false,
            })
        {
            self.due = true;
        }
        self.due
    }

    /// Bottom half, run from the timer kernel thread: unlink every
    /// timer due by now and return the actions to perform. Catches up
    /// on all jiffies since the last scan so a delayed thread never
    /// skips a slot.
    pub fn run_bottom_half(&mut self) -> Expirations {
        let mut fired = Expirations::default();
        self.due = false;

        let from = self.scanned + 1;
        let to = self.hardclock;
        if from > to {
            return fired;
        }
        // More than one wheel revolution collapses to a single pass
        // over every slot.
        let span = (to - from + 1).min(WHEEL_SLOTS as u64);
        for jiffy in (to + 1 - span)..=to {
            let slot = (jiffy % WHEEL_SLOTS as u64) as usize;
            let mut keep = Vec::new();
            for id in core::mem::take(&mut self.slots[slot]) {
                let expired = match self.timers.get(id.0) {
                    Some(t) => t.armed && t.expiration <= self.hardclock,
                    None => continue,
                };
                if expired {
                    let timer = self.timers.remove(id.0).unwrap();
                    match timer.action {
                        TimerAction::SleepTimeout(tid) => fired.sleep_wakes.push(tid),
                        TimerAction::Alarm(proc) => fired.alarms.push(proc),
                    }
                } else {
                    keep.push(id);
                }
            }
            self.slots[slot] = keep;
        }
        self.scanned = to;
        fired
    }
}

impl Default for TimerWheel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(n: u32) -> ThreadId {
        ThreadId::from_u32(n)
    }

    #[test]
    fn timespec_conversion_rounds_up() {
        assert_eq!(TimeSpec::new(0, 50_000_000).to_jiffies().unwrap(), 5);
        assert_eq!(TimeSpec::new(0, 1).to_jiffies().unwrap(), 1);
        assert_eq!(TimeSpec::new(2, 0).to_jiffies().unwrap(), 200);
        assert!(TimeSpec::new(-1, 0).to_jiffies().is_err());
        assert!(TimeSpec::new(0, 1_000_000_000).to_jiffies().is_err());
    }

    #[test]
    fn timer_fires_at_expiration() {
        let mut wheel = TimerWheel::new();
        wheel.arm_sleep_timeout(tid(1), 3).unwrap();
        assert!(!wheel.top_half());
        assert!(!wheel.top_half());
        assert!(wheel.run_bottom_half().sleep_wakes.is_empty());
        assert!(wheel.top_half());
        let fired = wheel.run_bottom_half();
        assert_eq!(fired.sleep_wakes, [tid(1)]);
        assert_eq!(wheel.armed_count(), 0);
    }

    #[test]
    fn disarm_prevents_firing() {
        let mut wheel = TimerWheel::new();
        let id = wheel.arm_sleep_timeout(tid(1), 2).unwrap();
        wheel.disarm(id);
        for _ in 0..5 {
            wheel.top_half();
        }
        assert!(wheel.run_bottom_half().sleep_wakes.is_empty());
    }

    #[test]
    fn long_timeout_survives_wheel_revolution() {
        let mut wheel = TimerWheel::new();
        // 250 jiffies: two and a half revolutions of the wheel.
        wheel.arm_sleep_timeout(tid(7), 250).unwrap();
        for _ in 0..249 {
            wheel.top_half();
            assert!(wheel.run_bottom_half().sleep_wakes.is_empty());
        }
        wheel.top_half();
        assert_eq!(wheel.run_bottom_half().sleep_wakes, [tid(7)]);
    }

    #[test]
    fn delayed_bottom_half_catches_up() {
        let mut wheel = TimerWheel::new();
        wheel.arm_sleep_timeout(tid(1), 2).unwrap();
        wheel.arm_alarm(ProcId::from_u32(9), 4).unwrap();
        // Six ticks pass before the timer thread gets to run.
        for _ in 0..6 {
            wheel.top_half();
        }
        let fired = wheel.run_bottom_half();
        assert_eq!(fired.sleep_wakes, [tid(1)]);
        assert_eq!(fired.alarms, [ProcId::from_u32(9)]);
    }
}
