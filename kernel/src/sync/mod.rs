//! Synchronization primitives
//!
//! The primitives everything else rests on: [`Rendez`], the blocked
//! thread list behind `TaskSleep`/`TaskWakeup`; the reader/writer lock
//! with drain semantics; and futexes keyed on user virtual addresses.

pub mod futex;
pub mod rendez;
pub mod rwlock;

pub use futex::FutexTable;
pub use rendez::Rendez;
pub use rwlock::{LockRequest, RwLock};
