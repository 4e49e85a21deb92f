//! kev-rtos — event-driven microkernel
//!
//! Don't give every task a stack, give every task a resume point.
//!
//! Small cooperative kernel for microcontrollers, usable from interrupts:
//! - Priority events dispatched from four ready groups with a watermark
//!   for nested preemption
//! - Stackless coroutine tasks sharing one scratch region per task
//! - Software timers on a single hardware deadline
//! - Slab pools and message queues that wake waiters through events
//! - Index-linked intrusive lists in caller storage (no heap)
//!
//! Everything shared sits behind one `critical-section` mutex. Enable the
//! `cortex-m` feature on single-core ARM targets or `std` on a host.
//!
//! Author: Moroya Sakamoto

#![cfg_attr(not(test), no_std)]

pub mod config;
pub mod error;
pub mod event;
pub mod kernel;
pub mod list;
pub mod msgq;
pub mod port;
pub mod queue;
pub mod scheduler;
pub mod slab;
pub mod task;
pub mod timer;

pub use config::{log_violation, panic_on_violation, Config};
pub use error::{Error, Violation};
pub use event::{Callback, Event, EventId, Priority, Routine, Slot};
pub use kernel::{Kernel, KernelStats};
pub use list::{Cursor, Link, Links, NodeId, Pos, SList};
pub use msgq::MsgQueue;
pub use port::{Port, SoftPort};
pub use queue::{Fifo, Lifo};
pub use scheduler::Scheduler;
pub use slab::{Block, SlabPool, SlabRequest};
pub use task::{CallStatus, ScratchUsage, Task, TaskStack, MAX_ROUTINES};
pub use timer::{Tick, Timer, TimerQueue};
