//! Priority-grouped event scheduler
//!
//! Four ready FIFOs (one per priority group, each kept in priority order),
//! a 4-bit ready map, and a watermark holding the priority of whatever is
//! dispatching right now. Only events strictly above the watermark a
//! `schedule()` call started with may run inside that call.
//!
//! The dispatch loop itself lives on [`Kernel`](crate::Kernel); this type
//! is the queue state it mutates under the critical section.
//!
//! Author: Moroya Sakamoto

use crate::event::{Priority, Slot};
use crate::list::{Link, NodeId};
use crate::queue::Fifo;

/// Highest non-empty group for every value of the ready map, 0xFF if none
const HIGHEST_READY_GROUP: [u8; 16] = [
    0xFF, 0, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3, 3, 3, 3, 3,
];

/// Watermark while nothing is dispatching (below every priority)
pub(crate) const IDLE_WATERMARK: i16 = -1;

/// Ready queues and dispatch watermark
///
/// Size: 4 × 8 (FIFOs) + 4 bytes
#[derive(Debug)]
pub struct Scheduler {
    /// Ready FIFO per priority group
    ready: [Fifo; Priority::GROUP_COUNT],
    /// Bit `g` set iff `ready[g]` is non-empty
    ready_map: u8,
    /// A deferred schedule has been requested and not yet started
    pending: bool,
    /// Priority currently dispatching, `IDLE_WATERMARK` when idle
    watermark: i16,
}

impl Scheduler {
    /// Idle scheduler
    pub const fn new() -> Self {
        Self {
            ready: [Fifo::new(), Fifo::new(), Fifo::new(), Fifo::new()],
            ready_map: 0,
            pending: false,
            watermark: IDLE_WATERMARK,
        }
    }

    /// Queue `id` in priority order and mark it ready.
    ///
    /// Returns true when the caller must request a deferred schedule: the
    /// event outranks the watermark and no request is outstanding yet.
    pub fn enqueue(&mut self, slots: &mut [Slot<'_>], id: NodeId) -> bool {
        let priority = slots[id.index()].priority;
        let group = priority.group();
        self.ready[group].insert_ordered(slots, id, |slots, existing| {
            slots[existing.index()].priority < priority
        });
        slots[id.index()].ready = true;
        self.ready_map |= 1 << group;

        if i16::from(priority.0) > self.watermark && !self.pending {
            self.pending = true;
            true
        } else {
            false
        }
    }

    /// Withdraw a ready event. Returns false if it was not queued here.
    pub fn cancel(&mut self, slots: &mut [Slot<'_>], id: NodeId) -> bool {
        let slot = &slots[id.index()];
        if !slot.link.is_linked() || !slot.ready {
            return false;
        }
        let group = slot.priority.group();
        let removed = self.ready[group].delete_node(slots, id);
        if self.ready[group].is_empty() {
            self.ready_map &= !(1 << group);
        }
        slots[id.index()].ready = false;
        removed
    }

    /// Dequeue the best ready event if it outranks `floor`.
    ///
    /// The event is marked running and the watermark rises to its priority.
    pub fn pick(&mut self, slots: &mut [Slot<'_>], floor: i16) -> Option<NodeId> {
        let group = self.highest_group()?;
        let head = self.ready[group].first()?;
        let priority = slots[head.index()].priority;
        if i16::from(priority.0) <= floor {
            return None;
        }

        self.ready[group].pop(slots);
        if self.ready[group].is_empty() {
            self.ready_map &= !(1 << group);
        }
        let slot = &mut slots[head.index()];
        slot.ready = false;
        slot.link = Link::Running;
        self.watermark = i16::from(priority.0);
        Some(head)
    }

    /// Highest group with a ready event
    pub fn highest_group(&self) -> Option<usize> {
        match HIGHEST_READY_GROUP[usize::from(self.ready_map & 0x0F)] {
            0xFF => None,
            group => Some(usize::from(group)),
        }
    }

    /// Start a dispatch pass: drop the pending request, return the floor
    pub fn begin(&mut self) -> i16 {
        self.pending = false;
        self.watermark
    }

    /// End a dispatch pass started at `floor`
    pub fn finish(&mut self, floor: i16) {
        self.watermark = floor;
    }

    /// Is any event ready?
    pub fn is_busy(&self) -> bool {
        self.ready_map != 0
    }

    /// Current watermark
    pub fn watermark(&self) -> i16 {
        self.watermark
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Ext, Priority};

    fn table(priorities: &[u8]) -> Vec<Slot<'static>> {
        priorities
            .iter()
            .map(|&p| Slot::new(Priority(p), None, 0, Ext::Plain))
            .collect()
    }

    fn n(i: u16) -> NodeId {
        NodeId::new(i)
    }

    fn drain(sched: &mut Scheduler, slots: &mut [Slot<'_>]) -> Vec<usize> {
        let floor = sched.begin();
        let mut order = Vec::new();
        while let Some(id) = sched.pick(slots, floor) {
            order.push(id.index());
            slots[id.index()].link = Link::Unlinked;
        }
        sched.finish(floor);
        order
    }

    #[test]
    fn test_highest_ready_table() {
        for map in 0u8..16 {
            let expected = (0..4).rev().find(|g| map & (1 << g) != 0);
            let mut sched = Scheduler::new();
            sched.ready_map = map;
            assert_eq!(sched.highest_group(), expected);
        }
    }

    #[test]
    fn test_group_order_then_fifo() {
        // A(10), B(10), C(200)
        let mut slots = table(&[10, 10, 200]);
        let mut sched = Scheduler::new();
        for i in 0..3 {
            sched.enqueue(&mut slots, n(i));
        }
        assert!(sched.is_busy());
        assert_eq!(drain(&mut sched, &mut slots), [2, 0, 1]);
        assert!(!sched.is_busy());
        assert_eq!(sched.watermark(), IDLE_WATERMARK);
    }

    #[test]
    fn test_priority_order_inside_group() {
        let mut slots = table(&[5, 40, 20, 40, 63]);
        let mut sched = Scheduler::new();
        for i in 0..5 {
            sched.enqueue(&mut slots, n(i));
        }
        assert_eq!(drain(&mut sched, &mut slots), [4, 1, 3, 2, 0]);
    }

    #[test]
    fn test_pending_requested_once() {
        let mut slots = table(&[10, 20]);
        let mut sched = Scheduler::new();
        assert!(sched.enqueue(&mut slots, n(0)));
        assert!(!sched.enqueue(&mut slots, n(1)));
        sched.begin();
        assert!(!sched.pending);
    }

    #[test]
    fn test_cancel_clears_ready_bit() {
        let mut slots = table(&[70, 10]);
        let mut sched = Scheduler::new();
        sched.enqueue(&mut slots, n(0));
        sched.enqueue(&mut slots, n(1));
        assert!(sched.cancel(&mut slots, n(0)));
        assert!(!slots[0].ready);
        assert!(slots[0].link.is_unlinked());
        assert_eq!(sched.highest_group(), Some(0));
        assert!(!sched.cancel(&mut slots, n(0)));
        assert_eq!(drain(&mut sched, &mut slots), [1]);
    }

    #[test]
    fn test_floor_cuts_off_lower_events() {
        let mut slots = table(&[100, 150, 90]);
        let mut sched = Scheduler::new();
        for i in 0..3 {
            sched.enqueue(&mut slots, n(i));
        }
        let picked = sched.pick(&mut slots, 100);
        assert_eq!(picked, Some(n(1)));
        assert_eq!(slots[1].link, Link::Running);
        assert_eq!(sched.watermark(), 150);
        assert_eq!(sched.pick(&mut slots, 100), None);
    }
}
