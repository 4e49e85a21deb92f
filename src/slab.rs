//! Slab pool — fixed-size blocks with an event wait queue
//!
//! Blocks are carved from one caller buffer. Free blocks form a LIFO whose
//! links live in the first two bytes of each block; an allocated block is
//! entirely the owner's. Requests that arrive while the pool is empty wait
//! in priority order and are handed the next freed block directly.
//!
//! Author: Moroya Sakamoto

use core::cell::RefCell;

use critical_section::Mutex;
use log::{debug, trace};

use crate::error::{Error, Violation};
use crate::event::{Action, Callback, Event, EventId, Ext, Priority, Slot};
use crate::kernel::Kernel;
use crate::list::{Link, Links, NodeId};
use crate::queue::{Fifo, Lifo};

/// In-band link encodings (everything below is a successor index)
const UNLINKED: u16 = 0xFFFF;
const LAST: u16 = 0xFFFE;
const RUNNING: u16 = 0xFFFD;

/// Bytes of in-band link at the start of a free block
pub const LINK_SIZE: usize = 2;

/// Handle to a block of a [`SlabPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block(NodeId);

impl Block {
    /// Block number inside its pool
    pub const fn index(self) -> usize {
        self.0.index()
    }
}

/// Handle to an allocation request event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlabRequest(pub(crate) EventId);

impl Event for SlabRequest {
    fn event_id(self) -> EventId {
        self.0
    }
}

/// The block buffer, doubling as link storage for the free list
struct Blocks<'b> {
    buf: &'b mut [u8],
    size: usize,
    count: usize,
}

impl Blocks<'_> {
    fn bytes(&mut self, block: NodeId) -> &mut [u8] {
        let start = block.index() * self.size;
        &mut self.buf[start..start + self.size]
    }
}

impl Links for Blocks<'_> {
    fn link(&self, node: NodeId) -> Link {
        let start = node.index() * self.size;
        let raw = u16::from_le_bytes([self.buf[start], self.buf[start + 1]]);
        match raw {
            UNLINKED => Link::Unlinked,
            LAST => Link::Linked(None),
            RUNNING => Link::Running,
            next if usize::from(next) < self.count => Link::Linked(Some(NodeId::new(next))),
            // Owner data in an allocated block
            _ => Link::Unlinked,
        }
    }

    fn set_link(&mut self, node: NodeId, link: Link) {
        let raw = match link {
            Link::Unlinked => UNLINKED,
            Link::Linked(None) => LAST,
            Link::Linked(Some(next)) => next.index() as u16,
            Link::Running => RUNNING,
        };
        let start = node.index() * self.size;
        self.buf[start..start + LINK_SIZE].copy_from_slice(&raw.to_le_bytes());
    }
}

struct Pool<'b> {
    blocks: Blocks<'b>,
    free: Lifo,
    free_count: usize,
    /// Request events, highest priority first
    waiters: Fifo,
}

impl Pool<'_> {
    fn check(&self, block: Block) -> Result<(), Violation> {
        if block.index() < self.blocks.count {
            Ok(())
        } else {
            Err(Violation::BadBlock {
                index: block.index(),
                count: self.blocks.count,
            })
        }
    }

    fn is_free(&self, block: Block) -> bool {
        self.free.iter(&self.blocks).any(|(_, node)| node == block.0)
    }

    fn release(&mut self, block: Block) {
        debug_assert!(!self.is_free(block), "slab: block {} freed twice", block.index());
        // Owner bytes may decode as a link
        self.blocks.set_link(block.0, Link::Unlinked);
        self.free.push(&mut self.blocks, block.0);
        self.free_count += 1;
    }

    fn take(&mut self) -> Option<Block> {
        let node = self.free.pop(&mut self.blocks)?;
        self.free_count -= 1;
        Some(Block(node))
    }
}

/// Fixed-size block pool
///
/// Shareable between interrupt and thread context; every operation runs
/// inside the critical section.
pub struct SlabPool<'b> {
    inner: Mutex<RefCell<Pool<'b>>>,
}

impl<'b> SlabPool<'b> {
    /// Carve `buf` into `block_count` blocks of `block_size` bytes, all free
    pub fn new(buf: &'b mut [u8], block_count: usize, block_size: usize) -> Result<Self, Error> {
        if block_size < LINK_SIZE {
            return Err(Error::BlockTooSmall {
                size: block_size,
                min: LINK_SIZE,
            });
        }
        if block_count > NodeId::MAX_NODES {
            return Err(Error::TooManyBlocks {
                count: block_count,
                max: NodeId::MAX_NODES,
            });
        }
        let needed = block_count
            .checked_mul(block_size)
            .filter(|&needed| needed <= buf.len())
            .ok_or(Error::BufferTooSmall {
                len: buf.len(),
                needed: block_count.saturating_mul(block_size),
            })?;
        debug!("slab: {block_count} blocks of {block_size} bytes ({needed} of {})", buf.len());

        let mut pool = Pool {
            blocks: Blocks {
                buf,
                size: block_size,
                count: block_count,
            },
            free: Lifo::new(),
            free_count: 0,
            waiters: Fifo::new(),
        };
        // Block 0 ends up on top
        for index in (0..block_count).rev() {
            pool.release(Block(NodeId::new(index as u16)));
        }
        Ok(Self {
            inner: Mutex::new(RefCell::new(pool)),
        })
    }

    /// Take a free block, `None` when the pool is empty
    pub fn alloc(&self) -> Option<Block> {
        critical_section::with(|cs| self.inner.borrow_ref_mut(cs).take())
    }

    /// Return a block.
    ///
    /// The highest-priority waiting request gets it directly and is
    /// posted; with nobody waiting it goes back on the free list.
    ///
    /// `block` must be allocated: freeing it twice corrupts the free list
    /// (caught by a debug assertion).
    pub fn free(&self, kernel: &Kernel<'_>, block: Block) {
        let result: Result<Option<NodeId>, Violation> = kernel.lock(|cs, st| {
            let mut pool = self.inner.borrow_ref_mut(cs);
            pool.check(block)?;
            debug_assert!(!pool.is_free(block), "slab: block {} freed twice", block.index());
            match pool.waiters.pop(st.slots) {
                Some(waiter) => {
                    hand_over(st.slots, waiter, block);
                    Ok(Some(waiter))
                }
                None => {
                    pool.release(block);
                    Ok(None)
                }
            }
        });
        match result {
            Ok(Some(waiter)) => {
                trace!("slab: block {} handed to request {}", block.index(), waiter.index());
                kernel.post(EventId(waiter));
            }
            Ok(None) => {}
            Err(violation) => kernel.report(violation),
        }
    }

    /// Return a block to the free list without waking anyone.
    ///
    /// Returns false, doing nothing, for a block of another pool. As with
    /// [`free`](Self::free), `block` must be allocated.
    pub fn free_quiet(&self, block: Block) -> bool {
        critical_section::with(|cs| {
            let mut pool = self.inner.borrow_ref_mut(cs);
            if pool.check(block).is_err() {
                return false;
            }
            pool.release(block);
            true
        })
    }

    /// Queue `request` for a block.
    ///
    /// Ignored if the request is already queued. If a block is free right
    /// now the best waiter (not necessarily `request`) gets it and is
    /// posted before this returns.
    pub fn wait(&self, kernel: &Kernel<'_>, request: SlabRequest) {
        let id = request.event_id();
        let result = kernel.lock(|cs, st| {
            let slot = &st.slots[id.index()];
            if !matches!(slot.ext, Ext::Slab { .. }) {
                return Err(Violation::NotASlabRequest { index: id.index() });
            }
            if slot.link.is_linked() {
                debug!("slab: request {} already queued", id.index());
                return Ok(None);
            }
            let priority = slot.priority;
            let mut guard = self.inner.borrow_ref_mut(cs);
            let pool = &mut *guard;
            pool.waiters.insert_ordered(st.slots, id.0, |slots, existing| {
                slots[existing.index()].priority < priority
            });

            let Some(block) = pool.take() else {
                return Ok(None);
            };
            match pool.waiters.pop(st.slots) {
                Some(waiter) => {
                    hand_over(st.slots, waiter, block);
                    Ok(Some(waiter))
                }
                None => {
                    pool.release(block);
                    Ok(None)
                }
            }
        });
        match result {
            Ok(Some(waiter)) => kernel.post(EventId(waiter)),
            Ok(None) => {}
            Err(violation) => kernel.report(violation),
        }
    }

    /// Withdraw a waiting request. False if it is not waiting here (it
    /// may already hold a block).
    pub fn cancel_wait(&self, kernel: &Kernel<'_>, request: SlabRequest) -> bool {
        let id = request.event_id();
        kernel.lock(|cs, st| {
            let slot = &st.slots[id.index()];
            if !slot.link.is_linked() || slot.ready {
                return false;
            }
            self.inner.borrow_ref_mut(cs).waiters.delete_node(st.slots, id.0)
        })
    }

    /// Borrow the bytes of an allocated block
    pub fn with_block<R>(&self, block: Block, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        critical_section::with(|cs| {
            let mut pool = self.inner.borrow_ref_mut(cs);
            pool.check(block).ok()?;
            Some(f(pool.blocks.bytes(block.0)))
        })
    }

    /// Bytes per block
    pub fn block_size(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).blocks.size)
    }

    /// Blocks in the pool
    pub fn block_count(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).blocks.count)
    }

    /// Blocks on the free list
    pub fn free_count(&self) -> usize {
        critical_section::with(|cs| self.inner.borrow_ref(cs).free_count)
    }

    /// Is any request waiting?
    pub fn has_waiters(&self) -> bool {
        critical_section::with(|cs| !self.inner.borrow_ref(cs).waiters.is_empty())
    }
}

fn hand_over(slots: &mut [Slot<'_>], waiter: NodeId, block: Block) {
    if let Ext::Slab { block: held } = &mut slots[waiter.index()].ext {
        *held = Some(block);
    }
}

impl<'a> Kernel<'a> {
    /// Register an allocation request whose callback runs once it holds a block
    pub fn slab_request(
        &self,
        callback: Callback,
        context: usize,
        priority: Priority,
    ) -> Option<SlabRequest> {
        self.register(
            priority,
            Some(Action::Call(callback)),
            context,
            Ext::Slab { block: None },
        )
        .map(SlabRequest)
    }

    /// Take the block handed to `request`, if any
    pub fn take_block<E: Event>(&self, request: E) -> Option<Block> {
        let id = request.event_id();
        let result = self.lock(|_, st| match &mut st.slots[id.index()].ext {
            Ext::Slab { block } => Ok(block.take()),
            _ => Err(Violation::NotASlabRequest { index: id.index() }),
        });
        result.unwrap_or_else(|violation| {
            self.report(violation);
            None
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{log_violation, Config};
    use crate::port::SoftPort;
    use std::cell::RefCell;
    use std::vec::Vec;

    std::thread_local! {
        static GRANTED: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    fn granted(kernel: &Kernel<'_>, ev: EventId) {
        let block = kernel.take_block(ev).expect("request woken without a block");
        let tag = kernel.context(ev);
        GRANTED.with(|g| g.borrow_mut().push((tag, block.index())));
    }

    fn take_granted() -> Vec<(usize, usize)> {
        GRANTED.with(|g| g.take())
    }

    #[test]
    fn test_geometry_checks() {
        let mut buf = [0u8; 16];
        assert_eq!(
            SlabPool::new(&mut buf, 4, 1).err(),
            Some(Error::BlockTooSmall { size: 1, min: 2 })
        );
        assert_eq!(
            SlabPool::new(&mut buf, 5, 4).err(),
            Some(Error::BufferTooSmall { len: 16, needed: 20 })
        );
        assert!(SlabPool::new(&mut buf, 4, 4).is_ok());
    }

    #[test]
    fn test_alloc_exactly_n_times() {
        let mut buf = [0u8; 24];
        let pool = SlabPool::new(&mut buf, 3, 8).unwrap();
        assert_eq!(pool.free_count(), 3);
        let blocks: Vec<Block> = (0..3).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(blocks.iter().map(|b| b.index()).collect::<Vec<_>>(), [0, 1, 2]);
        assert!(pool.alloc().is_none());
        assert_eq!(pool.free_count(), 0);
    }

    #[test]
    fn test_block_bytes_belong_to_owner() {
        let mut buf = [0u8; 16];
        let pool = SlabPool::new(&mut buf, 2, 8).unwrap();
        let a = pool.alloc().unwrap();
        pool.with_block(a, |bytes| bytes.fill(0x01)).unwrap();
        // 0x0101 decodes as an in-range index; freeing must not trip on it
        assert!(pool.free_quiet(a));
        let b = pool.alloc().unwrap();
        assert_eq!(a, b);
        let c = pool.alloc().unwrap();
        assert_ne!(b, c);
        assert!(pool.alloc().is_none());
    }

    #[test]
    fn test_wait_satisfied_immediately() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let mut buf = [0u8; 8];
        let pool = SlabPool::new(&mut buf, 1, 8).unwrap();
        take_granted();

        let w1 = kernel.slab_request(granted, 1, Priority(10)).unwrap();
        pool.wait(&kernel, w1);
        assert!(kernel.is_ready(w1));
        assert_eq!(pool.free_count(), 0);
        assert!(!pool.has_waiters());

        kernel.schedule();
        assert_eq!(take_granted(), [(1, 0)]);
    }

    #[test]
    fn test_free_hands_block_to_best_waiter() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 3];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let mut buf = [0u8; 8];
        let pool = SlabPool::new(&mut buf, 1, 8).unwrap();
        take_granted();

        let block = pool.alloc().unwrap();
        let low = kernel.slab_request(granted, 1, Priority(10)).unwrap();
        let high = kernel.slab_request(granted, 2, Priority(90)).unwrap();
        pool.wait(&kernel, low);
        pool.wait(&kernel, high);
        pool.wait(&kernel, high);
        assert!(pool.has_waiters());

        pool.free(&kernel, block);
        assert_eq!(pool.free_count(), 0);
        kernel.schedule();
        assert_eq!(take_granted(), [(2, 0)]);

        assert!(pool.cancel_wait(&kernel, low));
        assert!(!pool.cancel_wait(&kernel, low));
        pool.free(&kernel, block);
        assert_eq!(pool.free_count(), 1);
    }

    #[test]
    fn test_free_quiet_skips_waiters() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let mut buf = [0u8; 4];
        let pool = SlabPool::new(&mut buf, 1, 4).unwrap();

        let block = pool.alloc().unwrap();
        let req = kernel.slab_request(granted, 0, Priority(10)).unwrap();
        pool.wait(&kernel, req);
        assert!(pool.free_quiet(block));
        assert!(pool.has_waiters());
        assert_eq!(pool.free_count(), 1);
        assert!(!kernel.is_ready(req));
    }

    #[test]
    fn test_foreign_block_is_violation() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let config = Config::new().on_violation(log_violation);
        let kernel = Kernel::with_config(&mut slots, &port, config).unwrap();
        let mut big = [0u8; 32];
        let mut small = [0u8; 4];
        let pool_big = SlabPool::new(&mut big, 8, 4).unwrap();
        let pool_small = SlabPool::new(&mut small, 1, 4).unwrap();

        let foreign = (0..8).filter_map(|_| pool_big.alloc()).last().unwrap();
        assert!(pool_small.with_block(foreign, |_| ()).is_none());
        assert!(!pool_small.free_quiet(foreign));
        pool_small.free(&kernel, foreign);
        assert_eq!(pool_small.free_count(), 1);
    }

    #[test]
    #[should_panic(expected = "not a slab request")]
    fn test_wait_with_plain_event() {
        let port = SoftPort::software();
        let mut slots = [Slot::EMPTY; 1];
        let kernel = Kernel::new(&mut slots, &port).unwrap();
        let mut buf = [0u8; 4];
        let pool = SlabPool::new(&mut buf, 1, 4).unwrap();
        let ev = kernel.event(granted, 0, Priority(1)).unwrap();
        pool.wait(&kernel, SlabRequest(ev));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "freed twice")]
    fn test_double_free_caught() {
        let mut buf = [0u8; 16];
        let pool = SlabPool::new(&mut buf, 2, 8).unwrap();
        let a = pool.alloc().unwrap();
        assert!(pool.free_quiet(a));
        pool.free_quiet(a);
    }
}
