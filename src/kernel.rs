//! Kernel — event table, scheduler and timer queue in one context
//!
//! All shared state sits behind one critical section. Callbacks never run
//! while it is held, so they can post, cancel, start timers and call into
//! tasks freely, and interrupts can do the same while a callback runs.
//!
//! ```
//! use kev_rtos::{EventId, Kernel, Priority, Slot, SoftPort};
//!
//! fn blink(_: &Kernel<'_>, _: EventId) {}
//!
//! let port = SoftPort::software();
//! let mut slots = [Slot::EMPTY; 8];
//! let kernel = Kernel::new(&mut slots, &port).unwrap();
//! let ev = kernel.event(blink, 0, Priority(10)).unwrap();
//! kernel.post(ev);
//! kernel.schedule();
//! assert_eq!(kernel.stats().dispatched, 1);
//! ```
//!
//! Author: Moroya Sakamoto

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex};
use log::{debug, trace, warn};

use crate::config::Config;
use crate::error::{Error, Violation};
use crate::event::{self, Action, Callback, Event, EventId, Ext, Invocation, Priority, Slot};
use crate::list::{Link, NodeId};
use crate::port::Port;
use crate::scheduler::Scheduler;
use crate::task::Routines;
use crate::timer::TimerQueue;

/// Kernel statistics
///
/// Counters wrap around at `u32::MAX`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelStats {
    /// Events queued by `post`
    pub posted: u32,
    /// Immediate events run inside `post`
    pub immediate: u32,
    /// Events dispatched by `schedule`
    pub dispatched: u32,
    /// Timers that expired
    pub timers_fired: u32,
}

/// Everything guarded by the critical section
pub(crate) struct State<'a> {
    pub(crate) slots: &'a mut [Slot<'a>],
    /// Slots handed out so far
    pub(crate) used: usize,
    pub(crate) sched: Scheduler,
    pub(crate) timers: TimerQueue,
    pub(crate) stats: KernelStats,
    /// Caller routines referenced by call records
    pub(crate) routines: Routines,
}

/// Kernel context
///
/// Built once from caller storage. On a target it lives in a `static`
/// for the life of the program; hosted code builds one per use.
pub struct Kernel<'a> {
    state: Mutex<RefCell<State<'a>>>,
    port: &'a dyn Port,
    config: Config,
}

impl<'a> Kernel<'a> {
    /// Kernel over `slots` with the default configuration
    pub fn new(slots: &'a mut [Slot<'a>], port: &'a dyn Port) -> Result<Self, Error> {
        Self::with_config(slots, port, Config::default())
    }

    /// Kernel over `slots` with explicit policy hooks
    pub fn with_config(
        slots: &'a mut [Slot<'a>],
        port: &'a dyn Port,
        config: Config,
    ) -> Result<Self, Error> {
        if slots.len() > NodeId::MAX_NODES {
            return Err(Error::table_too_large(slots.len()));
        }
        Ok(Self {
            state: Mutex::new(RefCell::new(State {
                slots,
                used: 0,
                sched: Scheduler::new(),
                timers: TimerQueue::new(),
                stats: KernelStats::default(),
                routines: Routines::new(),
            })),
            port,
            config,
        })
    }

    /// Run `f` inside the critical section with the kernel state
    pub(crate) fn lock<R>(&self, f: impl FnOnce(CriticalSection<'_>, &mut State<'a>) -> R) -> R {
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            f(cs, &mut state)
        })
    }

    /// Hand a violation to the configured hook. Never call under `lock`.
    pub(crate) fn report(&self, violation: Violation) {
        (self.config.on_violation)(violation);
    }

    /// Hardware port
    pub fn port(&self) -> &'a dyn Port {
        self.port
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Claim the next free slot
    pub(crate) fn register(
        &self,
        priority: Priority,
        action: Option<Action>,
        context: usize,
        ext: Ext<'a>,
    ) -> Option<EventId> {
        let id = self.lock(|_, st| {
            if st.used == st.slots.len() {
                return None;
            }
            let id = NodeId::new(st.used as u16);
            st.slots[st.used] = Slot::new(priority, action, context, ext);
            st.used += 1;
            Some(EventId(id))
        });
        if id.is_none() {
            warn!("event table full, registration refused");
        }
        id
    }

    /// Register a plain event
    pub fn event(&self, callback: Callback, context: usize, priority: Priority) -> Option<EventId> {
        self.register(priority, Some(Action::Call(callback)), context, Ext::Plain)
    }

    /// Post an event.
    ///
    /// Immediate events run before this returns. Anything else is queued
    /// in priority order unless it is already queued somewhere, in which
    /// case nothing happens.
    pub fn post<E: Event>(&self, event: E) {
        enum Outcome {
            Run(Invocation),
            Queued { pend: bool },
            AlreadyLinked,
        }

        let id = event.event_id();
        let outcome = self.lock(|_, st| {
            let slot = &st.slots[id.index()];
            if slot.priority.is_immediate() {
                st.stats.immediate = st.stats.immediate.wrapping_add(1);
                return Outcome::Run(event::resolve(st.slots, id.0));
            }
            if slot.link.is_linked() {
                return Outcome::AlreadyLinked;
            }
            st.stats.posted = st.stats.posted.wrapping_add(1);
            let pend = st.sched.enqueue(st.slots, id.0);
            Outcome::Queued { pend }
        });

        match outcome {
            Outcome::Run(invocation) => {
                trace!("event {} immediate", id.index());
                self.invoke(invocation);
            }
            Outcome::Queued { pend } => {
                trace!("event {} posted", id.index());
                if pend {
                    self.port.pend_schedule();
                }
            }
            Outcome::AlreadyLinked => debug!("event {} already linked, post ignored", id.index()),
        }
    }

    /// Withdraw a ready event before it runs. Returns false if it was not ready.
    pub fn cancel<E: Event>(&self, event: E) -> bool {
        let id = event.event_id();
        self.lock(|_, st| st.sched.cancel(st.slots, id.0))
    }

    /// Dispatch ready events above the current watermark, highest first.
    ///
    /// Called from the deferred-schedule interrupt, or from a main loop.
    /// A call made while a callback of priority `p` is running only runs
    /// events above `p`.
    pub fn schedule(&self) {
        let floor = self.lock(|_, st| st.sched.begin());
        let mut finished: Option<NodeId> = None;

        loop {
            let next = self.lock(|_, st| {
                if let Some(prev) = finished.take() {
                    settle(st.slots, prev);
                }
                match st.sched.pick(st.slots, floor) {
                    Some(id) => {
                        st.stats.dispatched = st.stats.dispatched.wrapping_add(1);
                        Some((id, event::resolve(st.slots, id)))
                    }
                    None => {
                        st.sched.finish(floor);
                        None
                    }
                }
            });
            let Some((id, invocation)) = next else {
                break;
            };
            trace!("dispatch event {}", id.index());
            self.invoke(invocation);
            finished = Some(id);
        }
    }

    /// Is any event waiting to be dispatched?
    pub fn scheduler_busy(&self) -> bool {
        self.lock(|_, st| st.sched.is_busy())
    }

    /// Run a resolved dispatch target
    pub(crate) fn invoke(&self, invocation: Invocation) {
        match invocation {
            Invocation::Call(callback, id) => callback(self, id),
            Invocation::Resume(routine, task, id) => routine(self, task, Some(id)),
            Invocation::Idle(id) => warn!("event {} has no callback", id.index()),
        }
    }

    /// Priority of an event
    pub fn priority<E: Event>(&self, event: E) -> Priority {
        self.with_slot(event, |slot| slot.priority)
    }

    /// Opaque context word given at registration
    pub fn context<E: Event>(&self, event: E) -> usize {
        self.with_slot(event, |slot| slot.context)
    }

    /// Queued in the scheduler and not yet running?
    pub fn is_ready<E: Event>(&self, event: E) -> bool {
        self.with_slot(event, |slot| slot.ready)
    }

    /// Owned by any queue (ready, timer, wait or listener)?
    pub fn is_linked<E: Event>(&self, event: E) -> bool {
        self.with_slot(event, |slot| slot.link.is_linked())
    }

    /// Dequeued by the scheduler and its callback not yet returned?
    pub fn is_running<E: Event>(&self, event: E) -> bool {
        self.with_slot(event, |slot| slot.link == Link::Running)
    }

    /// Number of registered events
    pub fn event_count(&self) -> usize {
        self.lock(|_, st| st.used)
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> KernelStats {
        self.lock(|_, st| st.stats)
    }

    fn with_slot<E: Event, R>(&self, event: E, f: impl FnOnce(&Slot<'a>) -> R) -> R {
        let id = event.event_id();
        self.lock(|_, st| f(&st.slots[id.index()]))
    }
}

/// Drop the running mark once a callback is done, unless it re-queued itself
fn settle(slots: &mut [Slot<'_>], id: NodeId) {
    let slot = &mut slots[id.index()];
    if slot.link == Link::Running {
        slot.link = Link::Unlinked;
    }
}
