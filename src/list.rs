//! Index-linked intrusive singly-linked list
//!
//! Nodes live in caller storage (the kernel's event table, a slab buffer)
//! and are addressed by [`NodeId`]. A list only remembers where its chain
//! starts; every `next` link is stored by whatever implements [`Links`], so
//! the list itself never owns memory.
//!
//! Each node carries an explicit [`Link`] state instead of a self-pointer:
//! a node is in at most one list at a time, and `Linked` is the
//! authoritative "owned by some queue right now" flag.
//!
//! Author: Moroya Sakamoto

/// Index of a node inside its backing table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(u16);

impl NodeId {
    /// Largest table a list can address. The top encodings stay free for
    /// in-band link storage (see the slab pool).
    pub const MAX_NODES: usize = u16::MAX as usize - 3;

    /// Node at `index`
    pub const fn new(index: u16) -> Self {
        Self(index)
    }

    /// Table index of this node
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Link state of a single node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Link {
    /// Not in any list
    #[default]
    Unlinked,
    /// In a list; `None` marks the last node
    Linked(Option<NodeId>),
    /// Taken off a queue and currently executing
    Running,
}

impl Link {
    /// Is the node owned by some list?
    pub const fn is_linked(self) -> bool {
        matches!(self, Link::Linked(_))
    }

    /// Is the node free (neither queued nor running)?
    pub const fn is_unlinked(self) -> bool {
        matches!(self, Link::Unlinked)
    }

    /// Successor of a linked node
    pub const fn next(self) -> Option<NodeId> {
        match self {
            Link::Linked(next) => next,
            _ => None,
        }
    }
}

/// Storage of per-node links
pub trait Links {
    /// Current link of `node`
    fn link(&self, node: NodeId) -> Link;

    /// Overwrite the link of `node`
    fn set_link(&mut self, node: NodeId, link: Link);

    /// Successor of `node`, `None` at the end of the list or when unlinked
    fn next(&self, node: NodeId) -> Option<NodeId> {
        self.link(node).next()
    }
}

impl Links for [Link] {
    fn link(&self, node: NodeId) -> Link {
        self[node.index()]
    }

    fn set_link(&mut self, node: NodeId, link: Link) {
        self[node.index()] = link;
    }
}

/// A position in a list: the head, or the slot right after a node.
///
/// Insertions and removals are expressed relative to a position, which is
/// what lets a singly-linked list delete in O(1) once the predecessor is
/// known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pos {
    /// Before the first node
    Head,
    /// Right after the given node
    After(NodeId),
}

/// Lists that support relative insertion and removal.
///
/// [`SList`] implements this directly; the FIFO wraps it to keep its tail
/// cache coherent. [`Cursor`] works over either.
pub trait Chain {
    /// Node following `pos`
    fn next_at<L: Links + ?Sized>(&self, links: &L, pos: Pos) -> Option<NodeId>;

    /// Link `node` right after `pos`.
    ///
    /// `node` must not be linked elsewhere and `pos` must be in this list.
    fn insert_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos, node: NodeId);

    /// Unlink the node following `pos`, if any
    fn delete_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos) -> Option<NodeId>;
}

/// Singly-linked list head
#[derive(Debug, Default)]
pub struct SList {
    head: Option<NodeId>,
}

impl SList {
    /// Empty list
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// List whose chain already starts at `head`
    pub(crate) const fn new_at(head: NodeId) -> Self {
        Self { head: Some(head) }
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// First node
    pub fn first(&self) -> Option<NodeId> {
        self.head
    }

    /// Last node (walks the list)
    pub fn last<L: Links + ?Sized>(&self, links: &L) -> Option<NodeId> {
        self.iter(links).last().map(|(_, node)| node)
    }

    /// Push at the head
    pub fn push_front<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) {
        self.insert_after(links, Pos::Head, node);
    }

    /// Pop from the head
    pub fn pop_front<L: Links + ?Sized>(&mut self, links: &mut L) -> Option<NodeId> {
        self.delete_after(links, Pos::Head)
    }

    /// Iterate `(predecessor position, node)` pairs from the head
    pub fn iter<'l, L: Links + ?Sized>(&self, links: &'l L) -> Iter<'l, L> {
        Iter {
            links,
            prev: Pos::Head,
            cur: self.head,
        }
    }

    /// Position just before `node`, or `None` if `node` is not in the list
    pub fn position_of<L: Links + ?Sized>(&self, links: &L, node: NodeId) -> Option<Pos> {
        self.iter(links)
            .find(|&(_, n)| n == node)
            .map(|(prev, _)| prev)
    }

    /// Remove `node` wherever it sits. O(n).
    ///
    /// Returns false when `node` is not in this list.
    pub fn delete_node<L: Links + ?Sized>(&mut self, links: &mut L, node: NodeId) -> bool {
        match self.position_of(links, node) {
            Some(pos) => self.delete_after(links, pos).is_some(),
            None => false,
        }
    }

    /// Move every node of this list to the head of `recv`, keeping order.
    ///
    /// Walks this list once to find its tail.
    pub fn transfer_to<L: Links + ?Sized>(&mut self, links: &mut L, recv: &mut SList) {
        let Some(tail) = self.last(links) else {
            return;
        };
        links.set_link(tail, Link::Linked(recv.head));
        recv.head = self.head.take();
    }

    fn set_next_at<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos, next: Option<NodeId>) {
        match pos {
            Pos::Head => self.head = next,
            Pos::After(node) => links.set_link(node, Link::Linked(next)),
        }
    }
}

impl Chain for SList {
    fn next_at<L: Links + ?Sized>(&self, links: &L, pos: Pos) -> Option<NodeId> {
        match pos {
            Pos::Head => self.head,
            Pos::After(node) => links.next(node),
        }
    }

    fn insert_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos, node: NodeId) {
        debug_assert!(!links.link(node).is_linked(), "node already linked");
        let next = self.next_at(links, pos);
        links.set_link(node, Link::Linked(next));
        self.set_next_at(links, pos, Some(node));
    }

    fn delete_after<L: Links + ?Sized>(&mut self, links: &mut L, pos: Pos) -> Option<NodeId> {
        let node = self.next_at(links, pos)?;
        let next = links.next(node);
        self.set_next_at(links, pos, next);
        links.set_link(node, Link::Unlinked);
        Some(node)
    }
}

/// Iterator over a list that records each node's predecessor
pub struct Iter<'l, L: ?Sized> {
    links: &'l L,
    prev: Pos,
    cur: Option<NodeId>,
}

impl<L: Links + ?Sized> Iterator for Iter<'_, L> {
    type Item = (Pos, NodeId);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.cur?;
        let prev = self.prev;
        self.prev = Pos::After(cur);
        self.cur = self.links.next(cur);
        Some((prev, cur))
    }
}

/// Traversal cursor that tolerates edits at the current node.
///
/// The cursor holds positions, not borrows, so the list can be mutated
/// through it between steps. Removing the current node moves the cursor to
/// the successor; inserting puts the new node before the current one.
#[derive(Debug, Clone, Copy)]
pub struct Cursor {
    prev: Pos,
    cur: Option<NodeId>,
}

impl Cursor {
    /// Cursor on the first node of `list`
    pub fn front<C: Chain, L: Links + ?Sized>(list: &C, links: &L) -> Self {
        Self {
            prev: Pos::Head,
            cur: list.next_at(links, Pos::Head),
        }
    }

    /// Node under the cursor, `None` past the end
    pub fn current(&self) -> Option<NodeId> {
        self.cur
    }

    /// Position before the current node
    pub fn prev(&self) -> Pos {
        self.prev
    }

    /// Step to the next node
    pub fn move_next<L: Links + ?Sized>(&mut self, links: &L) {
        if let Some(cur) = self.cur {
            self.prev = Pos::After(cur);
            self.cur = links.next(cur);
        }
    }

    /// Unlink the current node and land on its successor
    pub fn remove_current<C: Chain, L: Links + ?Sized>(
        &mut self,
        list: &mut C,
        links: &mut L,
    ) -> Option<NodeId> {
        self.cur?;
        let removed = list.delete_after(links, self.prev);
        self.cur = list.next_at(links, self.prev);
        removed
    }

    /// Link `node` before the current node; the cursor stays on the current node
    pub fn insert_before<C: Chain, L: Links + ?Sized>(
        &mut self,
        list: &mut C,
        links: &mut L,
        node: NodeId,
    ) {
        list.insert_after(links, self.prev, node);
        self.prev = Pos::After(node);
    }
}
