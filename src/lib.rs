//! # handle-tree
//!
//! A sparse radix tree that hands out small, monotonically increasing integer
//! handles for shared objects, so the objects can be named compactly across a
//! wire protocol and resolved again on demand.
//!
//! Every node has the same fan-out `F` (120 by default) and covers an aligned
//! range of `F^k` handles. The tree starts as a single leaf covering `[0, F)`
//! and grows by *enclosing* its root in an `F` times wider parent whenever the
//! next handle falls outside it. Nodes are only created along the path of a
//! handle that is actually issued.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use handle_tree::HandleTable;
//!
//! let mut table: HandleTable<&str> = HandleTable::new();
//! let a = table.insert(Arc::new("a")).unwrap();
//! let b = table.insert(Arc::new("b")).unwrap();
//!
//! assert_eq!((a, b), (1, 2));
//! assert_eq!(*table.lookup(a).unwrap(), "a");
//! assert!(table.lookup(3).is_err());
//! ```
//!
//! Handles are never recycled: once issued, a handle resolves to its object for
//! the lifetime of the table.

#![deny(unsafe_code)]

mod error;
mod shared;
pub mod wire;

pub use error::{HandleError, Result};
pub use shared::SharedHandleTable;
pub use wire::{decode_wire_handle, encode_wire_handle, WireHandle, WIRE_HANDLE_LEN};

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing::{debug, trace, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Integer identifier handed out for an object.
pub type HandleId = u32;

/// Reserved value meaning "no handle"; never issued.
pub const NO_HANDLE: HandleId = 0;

/// Slots per node unless configured otherwise.
pub const DEFAULT_FAN_OUT: u32 = 120;

/// Largest accepted fan-out.
pub const MAX_FAN_OUT: u32 = 1 << 16;

/// Configuration for a [`HandleTable`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Number of slots in every node, in `2..=MAX_FAN_OUT`.
    pub fan_out: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fan_out: DEFAULT_FAN_OUT,
        }
    }
}

impl Config {
    fn validate(&self) -> Result<()> {
        if !(2..=MAX_FAN_OUT).contains(&self.fan_out) {
            return Err(HandleError::InvalidArgument(format!(
                "fan-out must be in 2..={MAX_FAN_OUT}, got {}",
                self.fan_out
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Object back-reference
// =============================================================================

/// Handle cached on the object itself.
///
/// Lets [`HandleTable::assign`] return the existing handle of an object that
/// was registered before. It does not keep the object alive and the table
/// never reads it during lookup.
#[derive(Debug, Default)]
pub struct HandleCell(AtomicU32);

impl HandleCell {
    pub const fn new() -> Self {
        Self(AtomicU32::new(NO_HANDLE))
    }

    /// The cached handle, if the object has been assigned one.
    pub fn get(&self) -> Option<HandleId> {
        match self.0.load(Ordering::Acquire) {
            NO_HANDLE => None,
            handle => Some(handle),
        }
    }

    fn set(&self, handle: HandleId) {
        self.0.store(handle, Ordering::Release);
    }
}

/// Objects that carry their own [`HandleCell`].
pub trait Handled {
    fn handle_cell(&self) -> &HandleCell;
}

// =============================================================================
// Nodes
// =============================================================================

enum Slot<T> {
    Empty,
    /// Only in leaves.
    Leaf(Arc<T>),
    /// Only in internal nodes.
    Inner(Box<TableNode<T>>),
}

/// Outcome of inserting into a subtree. `OutOfRange` never leaves this module.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Placement {
    Stored,
    OutOfRange,
}

/// A node covering the handles `[first, limit)`.
///
/// `limit - first` is `F^k` for some `k >= 1` and `first` is a multiple of it.
/// The node is a leaf iff `k == 1`. Bounds are `u64` because the root may need
/// to span past `HandleId::MAX` to cover the last few handles.
struct TableNode<T> {
    first: u64,
    limit: u64,
    slots: Box<[Slot<T>]>,
}

/// Reserve a node's slot array without aborting on allocation failure.
fn alloc_slots<T>(fan_out: usize) -> Result<Box<[Slot<T>]>> {
    #[cfg(test)]
    if alloc_failure::trips() {
        return Err(HandleError::OutOfMemory);
    }
    let mut slots = Vec::new();
    slots
        .try_reserve_exact(fan_out)
        .map_err(|_| HandleError::OutOfMemory)?;
    slots.resize_with(fan_out, || Slot::Empty);
    Ok(slots.into_boxed_slice())
}

impl<T> TableNode<T> {
    fn new(first: u64, limit: u64, fan_out: usize) -> Result<Self> {
        debug_assert!(first < limit);
        Ok(Self {
            first,
            limit,
            slots: alloc_slots(fan_out)?,
        })
    }

    #[inline]
    fn fan_out(&self) -> u64 {
        self.slots.len() as u64
    }

    #[inline]
    fn span(&self) -> u64 {
        self.limit - self.first
    }

    #[inline]
    fn is_leaf(&self) -> bool {
        self.span() == self.fan_out()
    }

    #[inline]
    fn covers(&self, handle: u64) -> bool {
        self.first <= handle && handle < self.limit
    }

    /// Handles covered by each slot.
    #[inline]
    fn scale(&self) -> u64 {
        self.span() / self.fan_out()
    }

    #[inline]
    fn slot_index(&self, handle: u64) -> usize {
        debug_assert!(self.covers(handle));
        ((handle - self.first) / self.scale()) as usize
    }

    #[inline]
    fn slot_range(&self, index: usize) -> (u64, u64) {
        let scale = self.scale();
        let first = self.first + index as u64 * scale;
        (first, first + scale)
    }

    fn depth(&self) -> usize {
        let fan_out = self.fan_out();
        let mut span = self.span();
        let mut depth = 1;
        while span > fan_out {
            span /= fan_out;
            depth += 1;
        }
        depth
    }

    /// Allocate an empty node `F` times wider than `self`, aligned so that
    /// `self` lines up with exactly one of its slots.
    ///
    /// This is the fallible half of enclosing; `self` is untouched on failure.
    fn enclosing_parent(&self) -> Result<Self> {
        let span = self
            .span()
            .checked_mul(self.fan_out())
            .ok_or(HandleError::Exhausted)?;
        let first = self.first - self.first % span;
        let limit = first.checked_add(span).ok_or(HandleError::Exhausted)?;
        Self::new(first, limit, self.slots.len())
    }

    /// Install `self` in `parent` (from [`enclosing_parent`](Self::enclosing_parent))
    /// and return the parent.
    fn enclose(self: Box<Self>, mut parent: Self) -> Box<Self> {
        debug_assert_eq!(parent.scale(), self.span());
        let index = parent.slot_index(self.first);
        parent.slots[index] = Slot::Inner(self);
        Box::new(parent)
    }

    /// Build every node from `[first, limit)` down to the leaf that stores
    /// `object` under `handle`.
    ///
    /// Nothing is linked into the tree until the whole path exists.
    fn detached_path(
        first: u64,
        limit: u64,
        fan_out: usize,
        handle: u64,
        object: &Arc<T>,
    ) -> Result<Box<Self>> {
        let mut node = Self::new(first, limit, fan_out)?;
        let index = node.slot_index(handle);
        node.slots[index] = if node.is_leaf() {
            Slot::Leaf(Arc::clone(object))
        } else {
            let (first, limit) = node.slot_range(index);
            Slot::Inner(Self::detached_path(first, limit, fan_out, handle, object)?)
        };
        Ok(Box::new(node))
    }

    fn insert(&mut self, handle: u64, object: &Arc<T>) -> Result<Placement> {
        if !self.covers(handle) {
            return Ok(Placement::OutOfRange);
        }
        let index = self.slot_index(handle);

        if self.is_leaf() {
            if !matches!(self.slots[index], Slot::Empty) {
                panic!("handle {handle} is already occupied");
            }
            self.slots[index] = Slot::Leaf(Arc::clone(object));
            return Ok(Placement::Stored);
        }

        if matches!(self.slots[index], Slot::Empty) {
            let (first, limit) = self.slot_range(index);
            let child = Self::detached_path(first, limit, self.slots.len(), handle, object)?;
            self.slots[index] = Slot::Inner(child);
            return Ok(Placement::Stored);
        }

        if self.insert_into_child(index, handle, object)? == Placement::Stored {
            return Ok(Placement::Stored);
        }

        // The child is narrower than its slot; widen it once and retry.
        warn!(
            handle,
            index,
            first = self.first,
            limit = self.limit,
            "child does not cover its slot, enclosing it"
        );
        let child_first = match &self.slots[index] {
            Slot::Inner(child) => child.first,
            _ => unreachable!("internal node slot {index} holds no child"),
        };
        self.enclose_child(index)?;
        match self.insert_into_child(index, handle, object) {
            Ok(Placement::Stored) => Ok(Placement::Stored),
            Ok(Placement::OutOfRange) => panic!(
                "handle {handle} still outside child {index} of [{}, {}) after enclosing",
                self.first, self.limit
            ),
            Err(err) => {
                self.unenclose_child(index, child_first);
                Err(err)
            }
        }
    }

    /// Undo [`enclose_child`](Self::enclose_child): put the node that started
    /// at `child_first` back into slot `index`.
    fn unenclose_child(&mut self, index: usize, child_first: u64) {
        let child = match &mut self.slots[index] {
            Slot::Inner(wide) => {
                let at = wide.slot_index(child_first);
                wide.take_child(at)
            }
            _ => None,
        };
        if let Some(child) = child {
            self.slots[index] = Slot::Inner(child);
        }
    }

    /// Detach the child node in slot `index`, if there is one.
    fn take_child(&mut self, index: usize) -> Option<Box<Self>> {
        match mem::replace(&mut self.slots[index], Slot::Empty) {
            Slot::Inner(child) => Some(child),
            other => {
                self.slots[index] = other;
                None
            }
        }
    }

    fn insert_into_child(
        &mut self,
        index: usize,
        handle: u64,
        object: &Arc<T>,
    ) -> Result<Placement> {
        match &mut self.slots[index] {
            Slot::Inner(child) => child.insert(handle, object),
            _ => unreachable!("internal node slot {index} holds no child"),
        }
    }

    fn enclose_child(&mut self, index: usize) -> Result<()> {
        let parent = match &self.slots[index] {
            Slot::Inner(child) => child.enclosing_parent()?,
            _ => unreachable!("internal node slot {index} holds no child"),
        };
        if let Slot::Inner(child) = mem::replace(&mut self.slots[index], Slot::Empty) {
            self.slots[index] = Slot::Inner(child.enclose(parent));
        }
        Ok(())
    }

    fn get(&self, handle: u64) -> Option<&Arc<T>> {
        let mut node = self;
        loop {
            if !node.covers(handle) {
                return None;
            }
            match &node.slots[node.slot_index(handle)] {
                Slot::Empty => return None,
                Slot::Leaf(object) => return Some(object),
                Slot::Inner(child) => node = &**child,
            }
        }
    }

    fn collect_stats(&self, stats: &mut TableStats) {
        stats.memory_bytes +=
            mem::size_of::<Self>() + self.slots.len() * mem::size_of::<Slot<T>>();
        if self.is_leaf() {
            stats.leaf_nodes += 1;
            return;
        }
        stats.inner_nodes += 1;
        for slot in self.slots.iter() {
            if let Slot::Inner(child) = slot {
                child.collect_stats(stats);
            }
        }
    }
}

// =============================================================================
// HandleTable
// =============================================================================

/// Shape and size of a [`HandleTable`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableStats {
    pub depth: usize,
    pub inner_nodes: usize,
    pub leaf_nodes: usize,
    pub handles: usize,
    /// Bytes held by nodes; the objects themselves are not counted.
    pub memory_bytes: usize,
}

/// Allocator of handles for shared objects.
///
/// The table holds one strong reference to every object it has issued a
/// handle for. It is not synchronized; see [`SharedHandleTable`] for the
/// locked variant.
pub struct HandleTable<T> {
    root: Option<Box<TableNode<T>>>,
    /// Next handle to issue. Reaches `HandleId::MAX + 1` once exhausted.
    next_handle: u64,
    fan_out: usize,
}

impl<T> HandleTable<T> {
    pub fn new() -> Self {
        Self {
            root: None,
            next_handle: 1,
            fan_out: DEFAULT_FAN_OUT as usize,
        }
    }

    pub fn with_config(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            root: None,
            next_handle: 1,
            fan_out: config.fan_out as usize,
        })
    }

    /// Issue a fresh handle for `object`.
    ///
    /// No deduplication: inserting the same object twice yields two handles.
    pub fn insert(&mut self, object: Arc<T>) -> Result<HandleId> {
        self.issue(&object)
    }

    /// Issue a handle for `object` unless it already carries one.
    ///
    /// The cached handle is returned as is, even if it was issued by another
    /// table.
    pub fn assign(&mut self, object: &Arc<T>) -> Result<HandleId>
    where
        T: Handled,
    {
        if let Some(handle) = object.handle_cell().get() {
            return Ok(handle);
        }
        let handle = self.issue(object)?;
        object.handle_cell().set(handle);
        Ok(handle)
    }

    fn issue(&mut self, object: &Arc<T>) -> Result<HandleId> {
        let handle = HandleId::try_from(self.next_handle).map_err(|_| HandleError::Exhausted)?;

        let mut grown = 0;
        if let Err(err) = self.place_growing(self.next_handle, object, &mut grown) {
            self.shrink_root(grown);
            return Err(err);
        }

        self.next_handle += 1;
        trace!(handle, "issued handle");
        Ok(handle)
    }

    /// Grow the root until it covers `handle`, then store `object` there.
    /// `grown` counts the levels added, including a freshly created root.
    fn place_growing(&mut self, handle: u64, object: &Arc<T>, grown: &mut usize) -> Result<()> {
        while !self.root.as_ref().is_some_and(|root| root.covers(handle)) {
            self.grow_root()?;
            *grown += 1;
        }
        if self.place(handle, object)? == Placement::OutOfRange {
            self.grow_root()?;
            *grown += 1;
            if self.place(handle, object)? == Placement::OutOfRange {
                panic!("handle {handle} outside the root after enclosing it");
            }
        }
        Ok(())
    }

    /// Drop the top `levels` of the tree after a failed insertion.
    ///
    /// The root always starts at 0, so every enclosed root sits in slot 0 of
    /// its parent. Unwinding a freshly created root leaves no root at all.
    fn shrink_root(&mut self, levels: usize) {
        for _ in 0..levels {
            if let Some(mut root) = self.root.take() {
                self.root = root.take_child(0);
            }
        }
        if levels > 0 {
            debug!(depth = self.depth(), "restored root after failed insertion");
        }
    }

    fn place(&mut self, handle: u64, object: &Arc<T>) -> Result<Placement> {
        match self.root.as_deref_mut() {
            Some(root) => root.insert(handle, object),
            None => Ok(Placement::OutOfRange),
        }
    }

    /// Create the root, or replace it with an enclosing parent.
    fn grow_root(&mut self) -> Result<()> {
        let parent = match self.root.as_deref() {
            Some(root) => root.enclosing_parent()?,
            None => {
                let root = TableNode::new(0, self.fan_out as u64, self.fan_out)?;
                self.root = Some(Box::new(root));
                return Ok(());
            }
        };
        if let Some(root) = self.root.take() {
            let root = root.enclose(parent);
            debug!(
                first = root.first,
                limit = root.limit,
                depth = root.depth(),
                "enclosed root"
            );
            self.root = Some(root);
        }
        Ok(())
    }

    /// Object registered under `handle`, borrowed from the table.
    pub fn get(&self, handle: HandleId) -> Option<&Arc<T>> {
        self.root.as_deref()?.get(u64::from(handle))
    }

    /// Object registered under `handle`, as a new strong reference.
    pub fn lookup(&self, handle: HandleId) -> Result<Arc<T>> {
        self.get(handle)
            .cloned()
            .ok_or(HandleError::NotFound(handle))
    }

    /// Decode a handle received from a peer and look it up.
    pub fn lookup_wire(&self, wire: WireHandle<'_>) -> Result<Arc<T>> {
        self.lookup(decode_wire_handle(wire)?)
    }

    pub fn contains(&self, handle: HandleId) -> bool {
        self.get(handle).is_some()
    }

    /// Number of handles issued so far.
    #[inline]
    pub fn len(&self) -> usize {
        (self.next_handle - 1) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.next_handle == 1
    }

    /// The handle the next insertion will receive, or `None` once exhausted.
    pub fn next_handle(&self) -> Option<HandleId> {
        HandleId::try_from(self.next_handle).ok()
    }

    pub fn fan_out(&self) -> u32 {
        self.fan_out as u32
    }

    /// Levels in the tree; 0 before the first insertion.
    pub fn depth(&self) -> usize {
        self.root.as_deref().map_or(0, TableNode::depth)
    }

    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats {
            depth: self.depth(),
            handles: self.len(),
            memory_bytes: mem::size_of::<Self>(),
            ..TableStats::default()
        };
        if let Some(root) = self.root.as_deref() {
            root.collect_stats(&mut stats);
        }
        stats
    }

    /// Issued handles and their objects, in ascending handle order.
    pub fn iter(&self) -> Iter<'_, T> {
        let mut stack = Vec::new();
        if let Some(root) = self.root.as_deref() {
            stack.push((root, 0));
        }
        Iter { stack }
    }
}

impl<T> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: fmt::Debug> fmt::Debug for HandleTable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

impl<'a, T> IntoIterator for &'a HandleTable<T> {
    type Item = (HandleId, &'a Arc<T>);
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

pub struct Iter<'a, T> {
    /// Nodes being walked, each with the next slot to visit.
    stack: Vec<(&'a TableNode<T>, usize)>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (HandleId, &'a Arc<T>);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (node, cursor) = self.stack.last_mut()?;
            let node: &'a TableNode<T> = *node;
            let index = *cursor;
            if index == node.slots.len() {
                self.stack.pop();
                continue;
            }
            *cursor += 1;

            match &node.slots[index] {
                Slot::Empty => {}
                Slot::Leaf(object) => {
                    return Some(((node.first + index as u64) as HandleId, object));
                }
                Slot::Inner(child) => self.stack.push((&**child, 0)),
            }
        }
    }
}



#[cfg(test)]
mod proptests;
