//! Software timers on a single hardware deadline
//!
//! Every started timer sits in one queue sorted by absolute expiry. Only
//! the head is programmed into the hardware; when it fires the driver calls
//! [`Kernel::timeout_check`], which posts everything that is due and
//! re-arms for the next head.
//!
//! Ticks are a 64-bit signed count that never wraps in practice; expiry 0
//! is reserved for "disarmed" at the driver and is never queued.
//!
//! Author: Moroya Sakamoto

use log::{debug, trace};

use crate::error::Violation;
use crate::event::{Action, Callback, Event, EventId, Ext, Priority, Slot};
use crate::kernel::Kernel;
use crate::list::NodeId;
use crate::queue::Fifo;

/// Hardware tick count
pub type Tick = i64;

/// Handle to a timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Timer(pub(crate) EventId);

impl Event for Timer {
    fn event_id(self) -> EventId {
        self.0
    }
}

/// Started timers in ascending expiry order
#[derive(Debug, Default)]
pub struct TimerQueue {
    queue: Fifo,
}

impl TimerQueue {
    /// Empty queue
    pub const fn new() -> Self {
        Self { queue: Fifo::new() }
    }

    /// Queue `id` at `expiry`. Returns true if it became the head.
    ///
    /// Equal expiries fire in start order.
    pub fn insert(&mut self, slots: &mut [Slot<'_>], id: NodeId, expiry: Tick) -> bool {
        if let Ext::Timer { expiry: slot_expiry } = &mut slots[id.index()].ext {
            *slot_expiry = expiry;
        }
        self.queue.insert_ordered(slots, id, |slots, existing| {
            expiry < expiry_of(&slots[existing.index()])
        });
        self.queue.first() == Some(id)
    }

    /// Head of the queue
    pub fn head(&self) -> Option<NodeId> {
        self.queue.first()
    }

    /// Expiry of the head, 0 when empty
    pub fn head_expiry(&self, slots: &[Slot<'_>]) -> Tick {
        self.head().map_or(0, |id| expiry_of(&slots[id.index()]))
    }

    /// Pop the head if it is due at `now`
    pub fn pop_expired(&mut self, slots: &mut [Slot<'_>], now: Tick) -> Option<NodeId> {
        let head = self.head()?;
        if expiry_of(&slots[head.index()]) > now {
            return None;
        }
        self.queue.pop(slots)
    }

    /// Unlink `id`. Returns whether it was queued here.
    pub fn remove(&mut self, slots: &mut [Slot<'_>], id: NodeId) -> bool {
        self.queue.delete_node(slots, id)
    }

    /// Is any timer started?
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

fn expiry_of(slot: &Slot<'_>) -> Tick {
    match slot.ext {
        Ext::Timer { expiry } => expiry,
        _ => 0,
    }
}

impl<'a> Kernel<'a> {
    /// Register a timer whose expiry posts `callback`
    pub fn timer(&self, callback: Callback, context: usize, priority: Priority) -> Option<Timer> {
        self.register(
            priority,
            Some(Action::Call(callback)),
            context,
            Ext::Timer { expiry: 0 },
        )
        .map(Timer)
    }

    /// Start `timer` at an absolute tick.
    ///
    /// Ignored if the timer is already queued; stop it first to move it.
    /// A timer may restart itself from its own callback.
    pub fn timer_start_at(&self, timer: Timer, expiry: Tick) {
        let expiry = if expiry == 0 { 1 } else { expiry };
        let id = timer.event_id();
        let result = self.lock(|_, st| {
            let slot = &st.slots[id.index()];
            if !matches!(slot.ext, Ext::Timer { .. }) {
                return Err(Violation::NotATimer { index: id.index() });
            }
            if slot.link.is_linked() {
                return Ok(false);
            }
            if st.timers.insert(st.slots, id.0, expiry) {
                debug!("deadline -> {expiry}");
                self.port().set_expiry(expiry);
            }
            Ok(true)
        });
        match result {
            Ok(true) => trace!("timer {} started at {expiry}", id.index()),
            Ok(false) => debug!("timer {} already queued, start ignored", id.index()),
            Err(violation) => self.report(violation),
        }
    }

    /// Start `timer` `ms` milliseconds from now
    pub fn timer_start_ms(&self, timer: Timer, ms: u32) {
        let port = self.port();
        self.timer_start_at(timer, port.tick_get() + port.ms_to_tick(ms));
    }

    /// Start `timer` `us` microseconds from now
    pub fn timer_start_us(&self, timer: Timer, us: u32) {
        let port = self.port();
        self.timer_start_at(timer, port.tick_get() + port.us_to_tick(us));
    }

    /// Stop `timer`.
    ///
    /// A timer that already fired but has not run yet is withdrawn from
    /// the scheduler instead.
    pub fn timer_stop(&self, timer: Timer) {
        let id = timer.event_id();
        self.lock(|_, st| {
            let slot = &st.slots[id.index()];
            if !slot.link.is_linked() {
                return;
            }
            if slot.ready {
                st.sched.cancel(st.slots, id.0);
                return;
            }
            let was_head = st.timers.head() == Some(id.0);
            if st.timers.remove(st.slots, id.0) && was_head {
                let next = st.timers.head_expiry(st.slots);
                debug!("deadline -> {next}");
                self.port().set_expiry(next);
            }
        });
    }

    /// Last expiry `timer` was started at.
    ///
    /// A periodic timer restarts itself with `timer_expiry(t) + period`.
    pub fn timer_expiry(&self, timer: Timer) -> Tick {
        let id = timer.event_id();
        self.lock(|_, st| expiry_of(&st.slots[id.index()]))
    }

    /// Is `timer` waiting to expire?
    pub fn timer_is_active(&self, timer: Timer) -> bool {
        let id = timer.event_id();
        self.lock(|_, st| {
            let slot = &st.slots[id.index()];
            slot.link.is_linked() && !slot.ready
        })
    }

    /// Expire every timer due at `now`, in expiry order.
    ///
    /// Called by the tick driver from its expiry interrupt. Each due timer
    /// is posted with the critical section released, then the hardware
    /// deadline is moved to the next head (or disarmed).
    pub fn timeout_check(&self, now: Tick) {
        let mut drained = false;
        loop {
            let due = self.lock(|_, st| match st.timers.pop_expired(st.slots, now) {
                Some(id) => {
                    st.stats.timers_fired = st.stats.timers_fired.wrapping_add(1);
                    Some(id)
                }
                None => {
                    if drained {
                        let next = st.timers.head_expiry(st.slots);
                        debug!("deadline -> {next}");
                        self.port().set_expiry(next);
                    }
                    None
                }
            });
            let Some(id) = due else {
                break;
            };
            drained = true;
            trace!("timer {} expired at {now}", id.index());
            self.post(EventId(id));
        }
    }

    /// Expiry of the earliest started timer, 0 if none
    pub fn earliest_expiry(&self) -> Tick {
        self.lock(|_, st| st.timers.head_expiry(st.slots))
    }

    /// Read the clock and expire anything due.
    ///
    /// For tick drivers without an expiry interrupt, and for hosted loops.
    pub fn poll_timers(&self) {
        let earliest = self.earliest_expiry();
        if earliest == 0 {
            return;
        }
        let now = self.port().tick_get();
        if earliest <= now {
            self.timeout_check(now);
        }
    }

    /// One turn of a polling main loop: expire timers, then dispatch
    pub fn service(&self) {
        self.poll_timers();
        self.schedule();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Port, SoftPort};
    use std::cell::RefCell;
    use std::vec::Vec;

    std::thread_local! {
        static FIRED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    fn fire(kernel: &Kernel<'_>, ev: EventId) {
        let tag = kernel.context(ev);
        FIRED.with(|f| f.borrow_mut().push(tag));
    }

    fn take_fired() -> Vec<usize> {
        FIRED.with(|f| f.take())
    }

    #[test]
    fn test_fires_due_subset_in_order() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 4];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        take_fired();

        let t: Vec<Timer> = (0..4)
            .map(|i| kernel.timer(fire, i, Priority(10)).unwrap())
            .collect();
        kernel.timer_start_at(t[0], 300);
        kernel.timer_start_at(t[1], 100);
        kernel.timer_start_at(t[2], 200);
        kernel.timer_start_at(t[3], 500);
        assert_eq!(port.expiry(), 100);
        assert_eq!(kernel.earliest_expiry(), 100);

        kernel.timeout_check(300);
        kernel.schedule();
        assert_eq!(take_fired(), [1, 2, 0]);
        assert_eq!(port.expiry(), 500);
        assert_eq!(kernel.stats().timers_fired, 3);

        kernel.timeout_check(1000);
        kernel.schedule();
        assert_eq!(take_fired(), [3]);
        assert_eq!(port.expiry(), 0);
    }

    #[test]
    fn test_zero_expiry_clamped() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let t = kernel.timer(fire, 0, Priority(1)).unwrap();
        kernel.timer_start_at(t, 0);
        assert_eq!(kernel.timer_expiry(t), 1);
        assert_eq!(port.expiry(), 1);
    }

    #[test]
    fn test_start_while_queued_ignored() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let t = kernel.timer(fire, 0, Priority(1)).unwrap();
        kernel.timer_start_at(t, 50);
        kernel.timer_start_at(t, 10);
        assert_eq!(kernel.timer_expiry(t), 50);
        assert_eq!(port.arm_count(), 1);
    }

    #[test]
    fn test_stop_head_rearms() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 2];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let a = kernel.timer(fire, 0, Priority(1)).unwrap();
        let b = kernel.timer(fire, 1, Priority(1)).unwrap();
        kernel.timer_start_at(a, 10);
        kernel.timer_start_at(b, 20);

        kernel.timer_stop(a);
        assert!(!kernel.timer_is_active(a));
        assert_eq!(port.expiry(), 20);
        kernel.timer_stop(b);
        assert_eq!(port.expiry(), 0);
        kernel.timer_stop(b);
        assert_eq!(port.arm_count(), 3);
    }

    #[test]
    fn test_stop_after_fire_cancels_dispatch() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        take_fired();
        let t = kernel.timer(fire, 0, Priority(1)).unwrap();
        kernel.timer_start_at(t, 10);
        kernel.timeout_check(10);
        assert!(kernel.is_ready(t));
        kernel.timer_stop(t);
        kernel.schedule();
        assert!(take_fired().is_empty());
    }

    fn periodic(kernel: &Kernel<'_>, ev: EventId) {
        fire(kernel, ev);
        let timer = Timer(ev);
        kernel.timer_start_at(timer, kernel.timer_expiry(timer) + 100);
    }

    #[test]
    fn test_periodic_restart_from_callback() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        take_fired();
        let t = kernel.timer(periodic, 5, Priority(20)).unwrap();
        kernel.timer_start_ms(t, 0);
        assert_eq!(kernel.timer_expiry(t), 1);

        for _ in 0..3 {
            port.advance(100);
            kernel.service();
        }
        assert_eq!(take_fired(), [5, 5, 5]);
        assert_eq!(kernel.timer_expiry(t), 301);
        assert_eq!(port.expiry(), 301);
    }

    #[test]
    fn test_relative_start() {
        let port = SoftPort::new(8_000_000);
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let t = kernel.timer(fire, 0, Priority(1)).unwrap();
        port.set_now(1000);
        kernel.timer_start_us(t, 5);
        assert_eq!(kernel.timer_expiry(t), 1040);
        assert_eq!(port.tick_to_us(kernel.timer_expiry(t) - port.tick_get()), 5);
    }

    #[test]
    fn test_poll_before_due_is_noop() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let t = kernel.timer(fire, 0, Priority(1)).unwrap();
        kernel.timer_start_at(t, 10);
        port.set_now(9);
        kernel.poll_timers();
        assert!(kernel.timer_is_active(t));
        port.set_now(10);
        kernel.poll_timers();
        assert!(kernel.is_ready(t));
    }

    #[test]
    #[should_panic(expected = "not a timer")]
    fn test_start_plain_event_is_violation() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let ev = kernel.event(fire, 0, Priority(1)).unwrap();
        kernel.timer_start_at(Timer(ev), 10);
    }
}
