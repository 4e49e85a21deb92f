//! FIFO and LIFO queues over index-linked lists
//!
//! The FIFO caches its tail so pushes are O(1); the LIFO is a bare
//! stack used where order does not matter (wait lists with a single
//! consumer, completion listeners, free lists).
//!
//! Author: Moroya Sakamoto

use crate::list::{Chain, Iter, Link, Links, NodeId, Pos, SList};

/// First-in first-out queue
#[derive(Debug, Default)]
pub struct Fifo {
    list: SList,
    /// Last node, `None` while empty
    tail: Option<NodeId>,
}

impl Fifo {
    /// Empty queue
    pub const fn new() -> Self {
        Self {
            list: SList::new(),
            tail: None,
        }
    }

    /// Is the queue empty?
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Oldest node
    pub fn first(&self) -> Option<NodeId> {
        self.list.first()
    }

    /// Newest node
    pub fn last(&self) -> Option<NodeId> {
        self.tail
    }

    /// Append at the tail
    pub fn push<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) {
        let pos = self.tail_pos();
        self.insert_after(links, pos, node);
    }

    /// Remove from the head
    pub fn pop<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<NodeId> {
        self.delete_after(links, Pos::Head)
    }

    /// Iterate `(predecessor position, node)` pairs from the head
    pub fn iter<'l, L: Links + ?Sized>(&self, links: &'l L) -> Iter<'l, L> {
        self.list.iter(links)
    }

    /// Remove `node` wherever it sits. O(n).
    pub fn delete_node<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) -> bool {
        match self.list.position_of(links, node) {
            Some(pos) => self.delete_after(links, pos).is_some(),
            None => false,
        }
    }

    /// Insert `node` keeping the queue ordered.
    ///
    /// `before(links, existing)` says whether `node` belongs ahead of
    /// `existing`. The tail is checked first so the common case (the new
    /// node sorts last) is O(1); otherwise the queue is scanned from the
    /// head and `node` lands before the first node it beats. Nodes that
    /// compare equal keep their insertion order.
    pub fn insert_ordered<L, F>(&mut self, links: &mut L, node: NodeId, mut before: F)
    where
        L: Links + ?Sized,
        F: FnMut(&L, NodeId) -> bool,
    {
        let at_tail = match self.tail {
            None => true,
            Some(tail) => !before(&*links, tail),
        };
        if at_tail {
            self.push(links, node);
            return;
        }

        let shared: &L = links;
        let pos = self
            .list
            .iter(shared)
            .find(|&(_, existing)| before(shared, existing))
            .map(|(pos, _)| pos)
            .unwrap_or_else(|| self.tail_pos());
        self.insert_after(links, pos, node);
    }

    /// Move every node to the tail of `recv` in O(1), leaving `self` empty
    pub fn transfer_to<L: Links + ?Sized>(&mut self, links: &mut L, recv: &mut Fifo) {
        let (Some(first), Some(tail)) = (self.list.first(), self.tail) else {
            return;
        };
        match recv.tail {
            Some(recv_tail) => links.set_link(recv_tail, Link::Linked(Some(first))),
            None => recv.list = SList::new_at(first),
        }
        recv.tail = Some(tail);
        *self = Fifo::new();
    }

    fn tail_pos(&self) -> Pos {
        self.tail.map_or(Pos::Head, Pos::After)
    }
}

impl Chain for Fifo {
    fn next_at<L: Links + ?Sized>(&self, links: &L, pos: Pos) -> Option<NodeId> {
        self.list.next_at(links, pos)
    }

    fn insert_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos, node: NodeId) {
        let at_tail = pos == self.tail_pos();
        self.list.insert_after(links, pos, node);
        if at_tail {
            self.tail = Some(node);
        }
    }

    fn delete_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos) -> Option<NodeId> {
        let node = self.list.delete_after(links, pos)?;
        if self.tail == Some(node) {
            self.tail = match pos {
                Pos::Head => None,
                Pos::After(prev) => Some(prev),
            };
        }
        Some(node)
    }
}

/// Last-in first-out stack
#[derive(Debug, Default)]
pub struct Lifo {
    list: SList,
}

impl Lifo {
    /// Empty stack
    pub const fn new() -> Self {
        Self { list: SList::new() }
    }

    /// Is the stack empty?
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Top of the stack
    pub fn first(&self) -> Option<NodeId> {
        self.list.first()
    }

    /// Push on top
    pub fn push<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) {
        self.list.push_front(links, node);
    }

    /// Pop the top
    pub fn pop<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<NodeId> {
        self.list.pop_front(links)
    }

    /// Remove `node` wherever it sits. O(n).
    pub fn delete_node<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) -> bool {
        self.list.delete_node(links, node)
    }

    /// Iterate from the top
    pub fn iter<'l, L: Links + ?Sized>(&self, links: &'l L) -> Iter<'l, L> {
        self.list.iter(links)
    }

    /// Detach the whole stack in O(1), leaving `self` empty
    pub fn take(&mut self) -> Lifo {
        core::mem::take(self)
    }

    /// Move every node on top of `recv`, keeping their relative order
    pub fn transfer_to<L: Links + ?Sized>(&mut self, links: &mut L, recv: &mut Lifo) {
        self.list.transfer_to(links, &mut recv.list);
    }
}
