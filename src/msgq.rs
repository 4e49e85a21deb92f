//! Message queue with listener events
//!
//! A bounded FIFO of messages. A consumer that finds it empty leaves a
//! listener event behind; the next `push` posts it. There is usually one
//! consumer, so listeners are kept in a LIFO.
//!
//! Author: Moroya Sakamoto

use core::cell::RefCell;

use critical_section::Mutex;
use heapless::Deque;
use log::debug;

use crate::event::{Event, EventId};
use crate::kernel::Kernel;
use crate::list::NodeId;
use crate::queue::Lifo;

struct Inner<T, const N: usize> {
    msgs: Deque<T, N>,
    listeners: Lifo,
}

/// Bounded message queue of `N` messages
pub struct MsgQueue<T, const N: usize> {
    inner: Mutex<RefCell<Inner<T, N>>>,
}

impl<T, const N: usize> MsgQueue<T, N> {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                msgs: Deque::new(),
                listeners: Lifo::new(),
            })),
        }
    }

    /// Append `msg` and wake one listener.
    ///
    /// A full queue hands the message back.
    pub fn push(&self, kernel: &Kernel<'_>, msg: T) -> Result<(), T> {
        let listener: Option<NodeId> = kernel.lock(|cs, st| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            inner.msgs.push_back(msg)?;
            Ok(inner.listeners.pop(st.slots))
        })?;
        if let Some(id) = listener {
            kernel.post(EventId(id));
        }
        Ok(())
    }

    /// Take the oldest message.
    ///
    /// When the queue is empty, `listener` (if given and not queued
    /// anywhere) is registered to be posted by the next `push`.
    pub fn pop(&self, kernel: &Kernel<'_>, listener: Option<EventId>) -> Option<T> {
        kernel.lock(|cs, st| {
            let mut inner = self.inner.borrow_ref_mut(cs);
            if let Some(msg) = inner.msgs.pop_front() {
                return Some(msg);
            }
            if let Some(id) = listener {
                if st.slots[id.index()].link.is_linked() {
                    debug!("msgq: listener {} already linked", id.index());
                } else {
                    inner.listeners.push(st.slots, id.0);
                }
            }
            None
        })
    }

    /// Withdraw a listener that has not fired yet
    pub fn cancel_listen<E: Event>(&self, kernel: &Kernel<'_>, listener: E) -> bool {
        let id = listener.event_id();
        kernel.lock(|cs, st| {
            let slot = &st.slots[id.index()];
            if !slot.link.is_linked() || slot.ready {
                return false;
            }
            self.inner
                .borrow_ref_mut(cs)
                .listeners
                .delete_node(st.slots, id.0)
        })
    }

    /// Messages waiting
    pub fn len(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).msgs.len())
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of messages
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<T, const N: usize> Default for MsgQueue<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Priority, Slot};
    use crate::port::SoftPort;
    use std::cell::Cell;

    std::thread_local! {
        static WAKES: Cell<u32> = const { Cell::new(0) };
    }

    fn wake(_: &Kernel<'_>, _: EventId) {
        WAKES.with(|w| w.set(w.get() + 1));
    }

    #[test]
    fn test_fifo_order_and_capacity() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let q: MsgQueue<u32, 2> = MsgQueue::new();

        assert_eq!(q.push(&kernel, 1), Ok(()));
        assert_eq!(q.push(&kernel, 2), Ok(()));
        assert_eq!(q.push(&kernel, 3), Err(3));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(&kernel, None), Some(1));
        assert_eq!(q.pop(&kernel, None), Some(2));
        assert_eq!(q.pop(&kernel, None), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_listener_woken_by_push() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let q: MsgQueue<&str, 4> = MsgQueue::new();
        WAKES.with(|w| w.set(0));

        let consumer = kernel.event(wake, 0, Priority(40)).unwrap();
        assert_eq!(q.pop(&kernel, Some(consumer)), None);
        assert!(kernel.is_linked(consumer));
        // Registering twice is a no-op
        assert_eq!(q.pop(&kernel, Some(consumer)), None);

        q.push(&kernel, "ping").unwrap();
        assert!(kernel.is_ready(consumer));
        kernel.schedule();
        assert_eq!(WAKES.with(|w| w.get()), 1);
        assert_eq!(q.pop(&kernel, Some(consumer)), Some("ping"));
        assert!(!kernel.is_linked(consumer));
    }

    #[test]
    fn test_cancel_listen() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let q: MsgQueue<u8, 1> = MsgQueue::new();

        let consumer = kernel.event(wake, 0, Priority(40)).unwrap();
        q.pop(&kernel, Some(consumer));
        assert!(q.cancel_listen(&kernel, consumer));
        assert!(!q.cancel_listen(&kernel, consumer));
        q.push(&kernel, 9).unwrap();
        assert!(!kernel.is_ready(consumer));
    }
}
