//! Multi-producer multi-consumer descriptor ring shared between processes
//!
//! The ring itself is two `repr(C)` blocks inside a port segment: a
//! [`RingNode`] header and a fixed array of [`RingCell`]s. Every process
//! builds its own [`DescriptorRing`] view over those blocks. Listeners are
//! cursors: each registered listener sees every cell pushed after its
//! registration exactly once, and a cell is recycled when the last
//! listener that saw it pops it.
//!
//! Structural mutation (push, register, unregister) is serialized by the
//! port mutex; pops only touch the per-cell reference counts and the
//! free-cell count, which are atomics, so a listener can drain without
//! taking the port lock.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{
    descriptor::BufferDescriptor,
    error::{PortError, Result},
};

/// One slot of the ring: a descriptor and the number of listeners that
/// still have to pop it
#[repr(C)]
pub struct RingCell {
    ref_count: AtomicU32,
    descriptor: BufferDescriptor,
}

impl RingCell {
    /// Number of registered listeners that have not yet popped this cell
    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// The descriptor stored in this cell
    pub fn descriptor(&self) -> BufferDescriptor {
        self.descriptor
    }
}

/// Fixed in-segment header of a descriptor ring
#[repr(C)]
pub struct RingNode {
    capacity: u32,
    registered_listeners: u32,
    free_cells: AtomicU32,
    write_p: AtomicU64,
}

/// Per-process view over a ring constructed in a shared segment
#[derive(Clone)]
pub struct DescriptorRing {
    node: *mut RingNode,
    cells: *mut RingCell,
}

unsafe impl Send for DescriptorRing {}

impl DescriptorRing {
    /// Initialize a freshly allocated ring node for `capacity` cells.
    ///
    /// # Safety
    ///
    /// `node` must point to writable zeroed memory inside the segment; the
    /// cell array must hold `capacity` zeroed cells.
    pub unsafe fn init_node(node: *mut RingNode, capacity: u32) {
        (*node).capacity = capacity;
        (*node).registered_listeners = 0;
        (*node).free_cells = AtomicU32::new(capacity);
        (*node).write_p = AtomicU64::new(0);
    }

    /// Build a view over a node and cell array previously constructed in a
    /// segment.
    ///
    /// # Safety
    ///
    /// Both pointers must stay valid for the lifetime of the view and of
    /// every listener created from it; `node` must have been initialized
    /// with [`init_node`].
    ///
    /// [`init_node`]: Self::init_node
    pub unsafe fn from_raw(node: *mut RingNode, cells: *mut RingCell) -> Self {
        Self { node, cells }
    }

    fn node(&self) -> &RingNode {
        unsafe { &*self.node }
    }

    fn cell(&self, position: u64) -> &RingCell {
        let index = (position % self.node().capacity as u64) as usize;
        unsafe { &*self.cells.add(index) }
    }

    /// Ring capacity in cells
    pub fn capacity(&self) -> u32 {
        self.node().capacity
    }

    /// Number of currently registered listeners
    pub fn registered_listeners(&self) -> u32 {
        self.node().registered_listeners
    }

    /// True when every registered listener has consumed every cell
    pub fn is_empty(&self) -> bool {
        let node = self.node();
        node.free_cells.load(Ordering::Acquire) == node.capacity
    }

    /// Enqueue a descriptor. The caller must hold the port mutex.
    ///
    /// Returns whether any listener will see the cell. Fails with
    /// `BufferFull` when the cell at the write cursor is still referenced
    /// by a lagging listener.
    pub fn push(&self, descriptor: &BufferDescriptor) -> Result<bool> {
        let node = self.node();
        let write_p = node.write_p.load(Ordering::Relaxed);
        let index = (write_p % node.capacity as u64) as usize;
        let cell_ptr = unsafe { self.cells.add(index) };
        let cell = unsafe { &*cell_ptr };

        if cell.ref_count.load(Ordering::Acquire) != 0 {
            return Err(PortError::buffer_full(node.capacity));
        }

        unsafe {
            std::ptr::addr_of_mut!((*cell_ptr).descriptor).write(*descriptor);
        }

        let listeners = node.registered_listeners;
        cell.ref_count.store(listeners, Ordering::Release);
        if listeners > 0 {
            node.free_cells.fetch_sub(1, Ordering::AcqRel);
        }
        node.write_p.store(write_p + 1, Ordering::Release);

        Ok(listeners > 0)
    }

    /// Register a new listener. The caller must hold the port mutex.
    ///
    /// The listener's cursor starts at the current write position, so it
    /// never observes history.
    pub fn register_listener(&self) -> RingListener {
        let read_p = self.node().write_p.load(Ordering::Acquire);
        unsafe {
            (*self.node).registered_listeners += 1;
        }
        RingListener {
            node: self.node,
            cells: self.cells,
            read_p,
        }
    }

    /// Unregister a listener, releasing every cell it has not consumed.
    /// The caller must hold the port mutex.
    pub fn unregister_listener(&self, listener: &mut RingListener) {
        listener.unregister();
    }

    /// Snapshot every still-referenced descriptor, oldest first.
    ///
    /// Used when a port fails, to hand back whatever was enqueued so outer
    /// layers can release the payload segments those descriptors point to.
    pub fn copy_pending(&self) -> Vec<BufferDescriptor> {
        let node = self.node();
        let write_p = node.write_p.load(Ordering::Acquire);
        let mut pending = Vec::new();
        for position in write_p.saturating_sub(node.capacity as u64)..write_p {
            let cell = self.cell(position);
            if cell.ref_count.load(Ordering::Acquire) > 0 {
                pending.push(cell.descriptor);
            }
        }
        pending
    }
}

/// A listener's read cursor into a ring
pub struct RingListener {
    node: *mut RingNode,
    cells: *mut RingCell,
    read_p: u64,
}

unsafe impl Send for RingListener {}

impl RingListener {
    fn node(&self) -> &RingNode {
        unsafe { &*self.node }
    }

    fn cell(&self, position: u64) -> &RingCell {
        let index = (position % self.node().capacity as u64) as usize;
        unsafe { &*self.cells.add(index) }
    }

    /// The next unconsumed descriptor, if any
    pub fn head(&self) -> Option<BufferDescriptor> {
        if self.read_p == self.node().write_p.load(Ordering::Acquire) {
            return None;
        }
        Some(self.cell(self.read_p).descriptor())
    }

    /// Consume the head cell. Returns whether the cell was freed (this was
    /// the last listener that had to pop it).
    pub fn pop(&mut self) -> Result<bool> {
        if self.read_p == self.node().write_p.load(Ordering::Acquire) {
            return Err(PortError::invalid_parameter(
                "listener",
                "pop with no pending descriptor",
            ));
        }

        let cell = self.cell(self.read_p);
        let previous = cell.ref_count.fetch_sub(1, Ordering::AcqRel);
        self.read_p += 1;

        match previous {
            0 => Err(PortError::corrupt("cell reference count underflow")),
            1 => {
                self.node().free_cells.fetch_add(1, Ordering::AcqRel);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Release every unconsumed cell and leave the ring. The caller must
    /// hold the port mutex.
    pub(crate) fn unregister(&mut self) {
        let write_p = self.node().write_p.load(Ordering::Acquire);
        while self.read_p != write_p {
            let cell = self.cell(self.read_p);
            if cell.ref_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.node().free_cells.fetch_add(1, Ordering::AcqRel);
            }
            self.read_p += 1;
        }
        unsafe {
            let node = &mut *self.node;
            node.registered_listeners = node.registered_listeners.saturating_sub(1);
        }
    }
}
