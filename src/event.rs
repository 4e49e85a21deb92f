//! Events — the schedulable unit
//!
//! Every schedulable object is a [`Slot`] in the kernel's event table:
//! a link, a fixed priority, a ready flag, the action to run when it is
//! dispatched, an opaque context word, and an extension holding whatever
//! the heavier objects (timers, slab requests, tasks) carry on top.
//!
//! Author: Moroya Sakamoto

use crate::kernel::Kernel;
use crate::list::{Link, Links, NodeId};
use crate::slab::Block;
use crate::task::{Task, TaskStack};
use crate::timer::Tick;

/// Event priority (0 = lowest, 254 = highest queued, 255 = immediate)
///
/// The top two bits select one of four ready groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(pub u8);

impl Priority {
    /// Runs synchronously inside `post`, never queued
    pub const IMMEDIATE: Priority = Priority(0xFF);
    /// Base of the highest group `[192, 255)`
    pub const HIGHEST_GROUP: Priority = Priority(0xC0);
    /// Base of group `[128, 192)`
    pub const HIGH_GROUP: Priority = Priority(0x80);
    /// Base of group `[64, 128)`
    pub const MIDDLE_GROUP: Priority = Priority(0x40);
    /// Base of the lowest group `[0, 64)`
    pub const LOWER_GROUP: Priority = Priority(0x00);

    /// Number of ready groups
    pub const GROUP_COUNT: usize = 4;

    /// Ready group this priority belongs to
    pub const fn group(self) -> usize {
        (self.0 >> 6) as usize
    }

    /// Is this the immediate priority?
    pub const fn is_immediate(self) -> bool {
        self.0 == Self::IMMEDIATE.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Priority(value)
    }
}

/// Handle to a slot in the kernel's event table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventId(pub(crate) NodeId);

impl EventId {
    /// Index in the event table
    pub const fn index(self) -> usize {
        self.0.index()
    }
}

/// Anything that can be posted to or canceled from the scheduler
pub trait Event: Copy {
    /// Underlying event slot
    fn event_id(self) -> EventId;
}

impl Event for EventId {
    fn event_id(self) -> EventId {
        self
    }
}

/// Event callback
pub type Callback = fn(&Kernel<'_>, EventId);

/// Coroutine level routine; `event` is `None` on a direct call and the
/// waking event when resumed by the scheduler.
pub type Routine = fn(&Kernel<'_>, Task, Option<EventId>);

/// What a slot does when dispatched
#[derive(Clone, Copy)]
pub(crate) enum Action {
    /// Plain callback
    Call(Callback),
    /// Resume the owning task at this routine
    Resume(Routine),
    /// Resume another task at whatever routine it is currently running
    Inherit(Task),
}

/// Resolved dispatch target, ready to run outside the critical section
#[derive(Clone, Copy)]
pub(crate) enum Invocation {
    Call(Callback, EventId),
    Resume(Routine, Task, EventId),
    /// No callback installed (a finished task)
    Idle(EventId),
}

/// Per-kind extension of a slot
pub(crate) enum Ext<'a> {
    Plain,
    Timer { expiry: Tick },
    Slab { block: Option<Block> },
    /// Scratch region and call state, owned by the caller
    Task(&'a mut TaskStack<'a>),
}

/// One entry of the kernel's event table.
///
/// Size: at most 8 machine words
///
/// Storage only; the kernel fills slots in as objects are registered.
/// Declare the table with [`Slot::EMPTY`]:
///
/// ```
/// use kev_rtos::Slot;
/// let mut slots = [Slot::EMPTY; 16];
/// # let _ = &mut slots;
/// ```
pub struct Slot<'a> {
    pub(crate) link: Link,
    pub(crate) priority: Priority,
    pub(crate) ready: bool,
    pub(crate) action: Option<Action>,
    pub(crate) context: usize,
    pub(crate) ext: Ext<'a>,
}

impl<'a> Slot<'a> {
    /// Unused slot
    pub const EMPTY: Slot<'a> = Slot {
        link: Link::Unlinked,
        priority: Priority(0),
        ready: false,
        action: None,
        context: 0,
        ext: Ext::Plain,
    };

    pub(crate) fn new(priority: Priority, action: Option<Action>, context: usize, ext: Ext<'a>) -> Self {
        Self {
            link: Link::Unlinked,
            priority,
            ready: false,
            action,
            context,
            ext,
        }
    }
}

impl Links for [Slot<'_>] {
    fn link(&self, node: NodeId) -> Link {
        self[node.index()].link
    }

    fn set_link(&mut self, node: NodeId, link: Link) {
        self[node.index()].link = link;
    }
}

/// Work out what dispatching `id` means right now.
///
/// Inherited events follow their task's current routine, so this has to
/// run under the same critical section that dequeued the event.
pub(crate) fn resolve(slots: &[Slot<'_>], id: NodeId) -> Invocation {
    let event = EventId(id);
    match slots[id.index()].action {
        Some(Action::Call(callback)) => Invocation::Call(callback, event),
        Some(Action::Resume(routine)) => Invocation::Resume(routine, Task(event), event),
        Some(Action::Inherit(task)) => match slots[task.event_id().index()].action {
            Some(Action::Resume(routine)) => Invocation::Resume(routine, task, event),
            _ => Invocation::Idle(event),
        },
        None => Invocation::Idle(event),
    }
}
