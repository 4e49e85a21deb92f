//! Coroutine tasks — stackless calls on one scratch region
//!
//! A task is an event whose action is "resume this routine". Each routine
//! is a resumable state machine: it reads its resume point, does work,
//! and either returns to its caller with [`Kernel::task_return`] or
//! records where to pick up and returns to the scheduler.
//!
//! One caller-supplied byte region backs every nesting level. A level's
//! locals live at the current cursor; calling into a new level writes a
//! small call record after them (caller resume point, frame size, caller
//! routine) and moves the cursor past it. Returning reads the record back.
//! Nesting depth is therefore bounded only by the region. When a callee
//! that suspended finally returns, its caller is re-entered synchronously
//! at the recorded resume point.
//!
//! ```
//! use kev_rtos::{CallStatus, EventId, Kernel, Priority, Slot, SoftPort, Task, TaskStack};
//!
//! fn child(k: &Kernel<'_>, t: Task, _: Option<EventId>) {
//!     k.set_task_ret_val(t, 7);
//!     k.task_return(t);
//! }
//!
//! fn parent(k: &Kernel<'_>, t: Task, _: Option<EventId>) {
//!     if k.task_resume_point(t) == 0 {
//!         if k.task_call(t, 1, child) == CallStatus::Suspended {
//!             return;
//!         }
//!     }
//!     assert_eq!(k.task_ret_val(t), 7);
//!     k.task_return(t);
//! }
//!
//! let port = SoftPort::software();
//! let mut region = [0u8; 64];
//! let mut stack = TaskStack::new(&mut region);
//! let mut slots = [Slot::EMPTY; 2];
//! let kernel = Kernel::new(&mut slots, &port).unwrap();
//! let task = kernel.task(&mut stack, 0, Priority(20)).unwrap();
//! kernel.task_start(task, parent);
//! assert!(kernel.task_is_end(task));
//! ```
//!
//! Author: Moroya Sakamoto

use core::mem;

use heapless::Vec;
use log::{debug, trace};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::error::Violation;
use crate::event::{Action, Event, EventId, Ext, Priority, Routine, Slot};
use crate::kernel::Kernel;
use crate::queue::Lifo;
use crate::slab::SlabRequest;
use crate::timer::Timer;

/// Distinct routines that can sit suspended under a call, kernel-wide
pub const MAX_ROUTINES: usize = 32;

/// Scratch frames are rounded to the machine word
const WORD: usize = mem::size_of::<usize>();

/// Record index meaning "caller was not running a routine"
const NO_ROUTINE: u16 = u16::MAX;

/// Routines seen as callers, indexed by call records
pub(crate) type Routines = Vec<Routine, MAX_ROUTINES>;

/// Handle to a coroutine task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Task(pub(crate) EventId);

impl Event for Task {
    fn event_id(self) -> EventId {
        self.0
    }
}

/// Outcome of [`Kernel::task_call`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// The callee returned before `task_call` did; carry on
    Completed,
    /// The callee is waiting; return now, the caller is re-entered at its
    /// resume point when the callee returns
    Suspended,
    /// No call was made (the violation was reported); the caller carries
    /// on at the same level
    Refused,
}

/// Scratch region usage of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScratchUsage {
    /// Bytes held by the current level, everything below it and the call
    /// records between levels
    pub used: usize,
    /// Highest `used` seen
    pub peak: usize,
    /// Size of the (word-aligned) region
    pub capacity: usize,
}

/// Resume state of the running level
#[derive(Debug, Clone, Copy, Default)]
struct Level {
    /// 0 until the level first suspends
    resume: u8,
    /// Bytes of locals this level holds at the cursor
    frame: u16,
}

/// Caller level saved in the region by a call
///
/// Size: 8 bytes, padded to a word
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct Record {
    frame: u16,
    /// Index into the kernel's routine table, or `NO_ROUTINE`
    routine: u16,
    resume: u8,
    /// The caller is suspended on this call
    yielded: u8,
    _reserved: [u8; 2],
}

const RECORD: usize = mem::size_of::<Record>().next_multiple_of(WORD);

/// What popping a level left to do outside the critical section
enum Unwind {
    /// Back in a caller that will carry on by itself
    Returned,
    /// Back in a caller suspended on this call; re-enter it
    Resume(Routine),
    /// Outermost level returned; post these listeners
    Finished(Lifo),
}

/// Index of `routine` in the table, adding it if new
fn intern(routines: &mut Routines, routine: Routine) -> Result<u16, Violation> {
    let index = match routines.iter().position(|&r| r as usize == routine as usize) {
        Some(index) => index,
        None => {
            routines
                .push(routine)
                .map_err(|_| Violation::TooManyRoutines { max: MAX_ROUTINES })?;
            routines.len() - 1
        }
    };
    // MAX_ROUTINES is far below NO_ROUTINE
    Ok(index as u16)
}

/// Scratch region and call state of one task
///
/// Lives outside the slot table; the slot only holds a reference to it.
pub struct TaskStack<'a> {
    region: &'a mut [u8],
    /// Start of the current level's locals
    cur: usize,
    level: Level,
    ret_val: u32,
    /// Events posted when the task finishes
    notify: Lifo,
    peak: usize,
}

impl<'a> TaskStack<'a> {
    /// Wrap `region`, trimmed to start on a word boundary
    pub fn new(region: &'a mut [u8]) -> Self {
        let skip = region.as_ptr().align_offset(WORD).min(region.len());
        let (_, region) = region.split_at_mut(skip);
        Self {
            region,
            cur: 0,
            level: Level::default(),
            ret_val: 0,
            notify: Lifo::new(),
            peak: 0,
        }
    }

    /// Usable bytes after alignment
    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    fn reset(&mut self) {
        self.cur = 0;
        self.level = Level::default();
        self.ret_val = 0;
    }

    fn usage(&self) -> ScratchUsage {
        ScratchUsage {
            used: self.cur + usize::from(self.level.frame),
            peak: self.peak,
            capacity: self.region.len(),
        }
    }

    fn overflow(&self, requested: usize) -> Violation {
        Violation::ScratchOverflow {
            offset: self.cur,
            requested,
            capacity: self.region.len(),
        }
    }

    /// Reserve `size` bytes at the cursor. The first claim before the
    /// level suspends fixes its frame; returns true in that case.
    fn claim(&mut self, size: usize) -> Result<bool, Violation> {
        if self.level.resume != 0 {
            if self.cur + size > self.region.len() {
                return Err(self.overflow(size));
            }
            return Ok(false);
        }
        let aligned = size.next_multiple_of(WORD);
        let frame = u16::try_from(aligned).map_err(|_| self.overflow(size))?;
        if self.cur + aligned > self.region.len() {
            return Err(self.overflow(size));
        }
        self.level.frame = frame;
        self.peak = self.peak.max(self.cur + aligned);
        Ok(true)
    }

    fn bytes(&mut self, size: usize) -> &mut [u8] {
        &mut self.region[self.cur..self.cur + size]
    }

    /// Write the caller's record past its frame and make `routine` the
    /// current level. Returns the record's offset.
    fn push_frame(
        &mut self,
        action: &mut Option<Action>,
        resume_at: u8,
        caller: u16,
        routine: Routine,
    ) -> Result<usize, Violation> {
        let frame = usize::from(self.level.frame);
        let at = self.cur + frame;
        let overflow = self.overflow(frame + RECORD);
        if at + RECORD > self.region.len() {
            return Err(overflow);
        }
        let (record, _) = Record::mut_from_prefix(&mut self.region[at..]).map_err(|_| overflow)?;
        *record = Record {
            frame: self.level.frame,
            routine: caller,
            resume: resume_at,
            yielded: 0,
            _reserved: [0; 2],
        };
        self.cur = at + RECORD;
        self.level = Level::default();
        self.peak = self.peak.max(self.cur);
        *action = Some(Action::Resume(routine));
        Ok(at)
    }

    /// Flag the caller whose record sits at `at` as suspended if its
    /// callee is still live
    fn mark_suspended(&mut self, at: usize) -> bool {
        if self.cur <= at {
            return false;
        }
        match Record::mut_from_prefix(&mut self.region[at..]) {
            Ok((record, _)) => {
                record.yielded = 1;
                true
            }
            Err(_) => false,
        }
    }

    fn pop_frame(&mut self, action: &mut Option<Action>, routines: &[Routine]) -> Unwind {
        if self.cur < RECORD {
            self.reset();
            *action = None;
            return Unwind::Finished(mem::take(&mut self.notify));
        }
        let at = self.cur - RECORD;
        let Ok((record, _)) = Record::read_from_prefix(&self.region[at..]) else {
            return Unwind::Returned;
        };
        self.cur = at - usize::from(record.frame);
        self.level = Level {
            resume: record.resume,
            frame: record.frame,
        };
        let caller = routines.get(usize::from(record.routine)).copied();
        *action = caller.map(Action::Resume);
        match caller {
            Some(routine) if record.yielded != 0 => Unwind::Resume(routine),
            _ => Unwind::Returned,
        }
    }
}

/// Split a task slot into its action and stack
fn task_parts<'s, 'a>(
    slots: &'s mut [Slot<'a>],
    task: Task,
) -> Result<(&'s mut Option<Action>, &'s mut TaskStack<'a>), Violation> {
    let index = task.event_id().index();
    let slot = &mut slots[index];
    match &mut slot.ext {
        Ext::Task(stack) => Ok((&mut slot.action, &mut **stack)),
        _ => Err(Violation::NotATask { index }),
    }
}

/// Detach a task's listener list so it can be edited against the table
fn take_notify(slots: &mut [Slot<'_>], task: Task) -> Result<Lifo, Violation> {
    task_parts(slots, task).map(|(_, stack)| mem::take(&mut stack.notify))
}

fn put_notify(slots: &mut [Slot<'_>], task: Task, notify: Lifo) {
    if let Ok((_, stack)) = task_parts(slots, task) {
        stack.notify = notify;
    }
}

impl<'a> Kernel<'a> {
    /// Register a task running on `stack`.
    ///
    /// The stack is reset. The task is idle (and reports finished) until
    /// [`task_start`](Self::task_start).
    pub fn task(&self, stack: &'a mut TaskStack<'a>, context: usize, priority: Priority) -> Option<Task> {
        stack.reset();
        stack.notify = Lifo::new();
        self.register(priority, None, context, Ext::Task(stack)).map(Task)
    }

    /// Event that resumes `task` at whatever routine it is running
    pub fn task_event(&self, task: Task) -> Option<EventId> {
        self.inherit(task, Ext::Plain)
    }

    /// Timer that resumes `task` when it expires
    pub fn task_timer(&self, task: Task) -> Option<Timer> {
        self.inherit(task, Ext::Timer { expiry: 0 }).map(Timer)
    }

    /// Slab request that resumes `task` once it holds a block
    pub fn task_slab_request(&self, task: Task) -> Option<SlabRequest> {
        self.inherit(task, Ext::Slab { block: None }).map(SlabRequest)
    }

    fn inherit(&self, task: Task, ext: Ext<'a>) -> Option<EventId> {
        let index = task.event_id().index();
        let parent = self.lock(|_, st| {
            let slot = &st.slots[index];
            match slot.ext {
                Ext::Task(_) => Ok((slot.priority, slot.context)),
                _ => Err(Violation::NotATask { index }),
            }
        });
        match parent {
            Ok((priority, context)) => {
                self.register(priority, Some(Action::Inherit(task)), context, ext)
            }
            Err(violation) => {
                self.report(violation);
                None
            }
        }
    }

    /// Run `f` on a task's action and stack under the critical section
    fn with_task<R>(
        &self,
        task: Task,
        f: impl FnOnce(&mut Option<Action>, &mut TaskStack<'a>) -> Result<R, Violation>,
    ) -> Option<R> {
        let result = self.lock(|_, st| {
            let (action, stack) = task_parts(st.slots, task)?;
            f(action, stack)
        });
        match result {
            Ok(value) => Some(value),
            Err(violation) => {
                self.report(violation);
                None
            }
        }
    }

    /// Make `routine` the task's top level and run it now
    pub fn task_start(&self, task: Task, routine: Routine) {
        let started = self.with_task(task, |action, _| {
            *action = Some(Action::Resume(routine));
            Ok(())
        });
        if started.is_some() {
            trace!("task {} started", task.event_id().index());
            routine(self, task, None);
        }
    }

    /// Reset `task` to idle: empty scratch, no routine, listeners dropped
    /// without being posted
    pub fn task_reinit(&self, task: Task) {
        let result: Result<(), Violation> = self.lock(|_, st| {
            let mut notify = take_notify(st.slots, task)?;
            while notify.pop(st.slots).is_some() {}
            let (action, stack) = task_parts(st.slots, task)?;
            stack.reset();
            *action = None;
            Ok(())
        });
        if let Err(violation) = result {
            self.report(violation);
        }
    }

    /// Has the task finished (or never started)?
    pub fn task_is_end(&self, task: Task) -> bool {
        self.with_task(task, |action, _| Ok(action.is_none()))
            .unwrap_or(true)
    }

    /// Call `routine` one level down and wait for it.
    ///
    /// `resume_at` is where the calling routine continues. The callee runs
    /// before this returns. If it finished inline the result is
    /// [`CallStatus::Completed`] and the caller carries on; otherwise the
    /// caller must return and will be re-entered at `resume_at` once the
    /// callee calls [`task_return`](Self::task_return). When the region
    /// has no room for the callee the violation is reported and the result
    /// is [`CallStatus::Refused`].
    pub fn task_call(&self, task: Task, resume_at: u8, routine: Routine) -> CallStatus {
        let pushed: Result<usize, Violation> = self.lock(|_, st| {
            let (action, stack) = task_parts(st.slots, task)?;
            let caller = match *action {
                Some(Action::Resume(current)) => intern(&mut st.routines, current)?,
                _ => NO_ROUTINE,
            };
            stack.push_frame(action, resume_at, caller, routine)
        });
        let at = match pushed {
            Ok(at) => at,
            Err(violation) => {
                self.report(violation);
                return CallStatus::Refused;
            }
        };
        routine(self, task, None);

        let suspended = self
            .with_task(task, |_, stack| Ok(stack.mark_suspended(at)))
            .unwrap_or(false);
        if suspended {
            trace!("task {} suspended on call at {at}", task.event_id().index());
            CallStatus::Suspended
        } else {
            CallStatus::Completed
        }
    }

    /// Return from the current level.
    ///
    /// Pops back to the caller, re-entering it now if it was suspended on
    /// this call. Returning from the outermost level finishes the task and
    /// posts every end-wait listener.
    pub fn task_return(&self, task: Task) {
        let popped: Result<Unwind, Violation> = self.lock(|_, st| {
            let (action, stack) = task_parts(st.slots, task)?;
            Ok(stack.pop_frame(action, &st.routines))
        });
        let unwind = match popped {
            Ok(unwind) => unwind,
            Err(violation) => {
                self.report(violation);
                return;
            }
        };
        match unwind {
            Unwind::Returned => {}
            Unwind::Resume(routine) => routine(self, task, Some(task.event_id())),
            Unwind::Finished(mut listeners) => {
                debug!("task {} finished", task.event_id().index());
                while let Some(id) = self.lock(|_, st| listeners.pop(st.slots)) {
                    self.post(EventId(id));
                }
            }
        }
    }

    /// Record where the current level continues before returning to the
    /// scheduler
    pub fn task_yield(&self, task: Task, resume_at: u8) {
        self.with_task(task, |_, stack| {
            stack.level.resume = resume_at;
            Ok(())
        });
    }

    /// Resume point of the current level, 0 on first entry
    pub fn task_resume_point(&self, task: Task) -> u8 {
        self.with_task(task, |_, stack| Ok(stack.level.resume))
            .unwrap_or(0)
    }

    /// Borrow `size` bytes of the current level's locals.
    ///
    /// Before the level first suspends this also fixes the level's frame;
    /// afterwards the same bytes come back. `f` runs inside the critical
    /// section. Contents are whatever the region last held.
    pub fn with_scratch<R>(&self, task: Task, size: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        self.scratch(task, size, |bytes| Ok(f(bytes)))
    }

    /// Typed view of the current level's locals, see [`with_scratch`](Self::with_scratch)
    pub fn with_locals<T, R>(&self, task: Task, f: impl FnOnce(&mut T) -> R) -> Option<R>
    where
        T: FromBytes + IntoBytes + KnownLayout,
    {
        self.scratch(task, mem::size_of::<T>(), |bytes| {
            let (locals, _) = T::mut_from_prefix(bytes).map_err(|_| Violation::LocalsLayout {
                align: mem::align_of::<T>(),
            })?;
            Ok(f(locals))
        })
    }

    fn scratch<R>(
        &self,
        task: Task,
        size: usize,
        f: impl FnOnce(&mut [u8]) -> Result<R, Violation>,
    ) -> Option<R> {
        let (value, fresh) = self.with_task(task, |_, stack| {
            let fresh = stack.claim(size)?;
            let usage = stack.usage();
            let value = f(stack.bytes(size))?;
            Ok((value, fresh.then_some(usage)))
        })?;
        if let (Some(usage), Some(hook)) = (fresh, self.config().on_scratch) {
            hook(task, usage);
        }
        Some(value)
    }

    /// Scratch usage of `task`
    pub fn task_stack_usage(&self, task: Task) -> ScratchUsage {
        self.with_task(task, |_, stack| Ok(stack.usage()))
            .unwrap_or_default()
    }

    /// Set the value a callee hands back to its caller
    pub fn set_task_ret_val(&self, task: Task, value: u32) {
        self.with_task(task, |_, stack| {
            stack.ret_val = value;
            Ok(())
        });
    }

    /// Value last set by a callee; cleared when the task finishes
    pub fn task_ret_val(&self, task: Task) -> u32 {
        self.with_task(task, |_, stack| Ok(stack.ret_val))
            .unwrap_or(0)
    }

    /// Post `listener` once `task` finishes.
    ///
    /// Ignored if the listener is already queued somewhere.
    pub fn task_end_wait<E: Event>(&self, task: Task, listener: E) {
        let id = listener.event_id();
        let result: Result<bool, Violation> = self.lock(|_, st| {
            if st.slots[id.index()].link.is_linked() {
                return Ok(false);
            }
            let mut notify = take_notify(st.slots, task)?;
            notify.push(st.slots, id.0);
            put_notify(st.slots, task, notify);
            Ok(true)
        });
        match result {
            Ok(true) => {}
            Ok(false) => debug!("listener {} already linked, end wait ignored", id.index()),
            Err(violation) => self.report(violation),
        }
    }

    /// Withdraw a listener. False if it already fired or was never added.
    pub fn task_end_wait_cancel<E: Event>(&self, task: Task, listener: E) -> bool {
        let id = listener.event_id();
        let result: Result<bool, Violation> = self.lock(|_, st| {
            let slot = &st.slots[id.index()];
            if !slot.link.is_linked() || slot.ready {
                return Ok(false);
            }
            let mut notify = take_notify(st.slots, task)?;
            let removed = notify.delete_node(st.slots, id.0);
            put_notify(st.slots, task, notify);
            Ok(removed)
        });
        result.unwrap_or_else(|violation| {
            self.report(violation);
            false
        })
    }
}

impl Task {
    /// Slot index of the task's own event
    pub fn index(self) -> usize {
        self.0.index()
    }
}
