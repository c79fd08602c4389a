//! Per-process handle over a shared-memory port

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use crate::{
    config::LISTENERS_STATUS_SIZE,
    descriptor::{BufferDescriptor, SegmentId},
    error::{PortError, Result},
    ring::{DescriptorRing, RingCell, RingListener, RingNode},
    segment::{NamedMutex, SharedSegment},
    watchdog::{self, WatchedPort},
};

use super::{node::PortNode, OpenMode};

/// Outcome of a non-blocking push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushStatus {
    /// False when the ring was full and the descriptor was dropped
    pub pushed: bool,
    /// Whether any registered listener will see the descriptor
    pub listeners_active: bool,
}

/// Snapshot of a port's counters
#[derive(Debug, Clone)]
pub struct PortStats {
    pub port_id: u32,
    pub capacity: u32,
    pub num_listeners: u32,
    pub waiting_count: u32,
    pub ref_count: u32,
    pub overflows: u64,
}

/// A per-process handle on a shared-memory port.
///
/// Handles are cheap: the port state lives in the segment, and any number
/// of handles across any number of processes may refer to the same port.
/// The last handle to close a healthy port removes the segment and its
/// named mutex from the system.
pub struct Port {
    segment: Arc<SharedSegment>,
    node: *mut PortNode,
    ring: DescriptorRing,
    overflows_count: AtomicU64,
}

unsafe impl Send for Port {}
unsafe impl Sync for Port {}

impl Port {
    /// Build a handle over an attached segment and its port node,
    /// incrementing the node's reference counter and enrolling the port
    /// with the process watchdog.
    pub(crate) fn new(segment: Arc<SharedSegment>, node: *mut PortNode) -> Result<Self> {
        let node_ref = unsafe { &*node };
        let capacity = node_ref.max_buffer_descriptors;
        if capacity == 0 {
            return Err(PortError::corrupt("port has zero capacity"));
        }

        let cells =
            segment.ptr_from_offset::<RingCell>(node_ref.buffer_offset, capacity as usize)?;
        let ring_node = segment.ptr_from_offset::<RingNode>(node_ref.buffer_node_offset, 1)?;
        let ring = unsafe { DescriptorRing::from_raw(ring_node, cells) };
        if ring.capacity() != capacity {
            return Err(PortError::corrupt("ring capacity does not match port node"));
        }

        node_ref.ref_counter.fetch_add(1, Ordering::AcqRel);

        watchdog::add_port(WatchedPort {
            _segment: Arc::clone(&segment),
            node,
            ring: ring.clone(),
        });

        Ok(Self {
            segment,
            node,
            ring,
            overflows_count: AtomicU64::new(0),
        })
    }

    fn node(&self) -> &PortNode {
        unsafe { &*self.node }
    }

    pub(crate) fn node_ptr(&self) -> *mut PortNode {
        self.node
    }

    /// Try to enqueue a buffer descriptor.
    ///
    /// Never waits for space: when the ring is full the descriptor is
    /// dropped, the overflow counter is bumped and `pushed` is false.
    /// Waiting listeners are woken after the push; a ReadExclusive port
    /// wakes a single listener, and only on the empty-to-non-empty
    /// transition.
    pub fn try_push(&self, descriptor: &BufferDescriptor) -> Result<PushStatus> {
        let node = self.node();
        let guard = node.empty_cv_mutex.lock()?;
        if !node.is_port_ok.load(Ordering::Acquire) {
            return Err(PortError::port_not_ok(node.port_id));
        }

        let was_unicast = node.is_opened_read_exclusive;
        let was_empty = self.ring.is_empty();
        let was_someone_listening = node.waiting_count > 0;

        match self.ring.push(descriptor) {
            Ok(listeners_active) => {
                drop(guard);
                if was_someone_listening {
                    if was_unicast {
                        if was_empty {
                            node.empty_cv.notify_one();
                        }
                    } else {
                        node.empty_cv.notify_all();
                    }
                }
                Ok(PushStatus {
                    pushed: true,
                    listeners_active,
                })
            }
            Err(_) => {
                drop(guard);
                self.overflows_count.fetch_add(1, Ordering::Relaxed);
                Ok(PushStatus {
                    pushed: false,
                    listeners_active: false,
                })
            }
        }
    }

    /// Register a new listener on this port.
    ///
    /// The listener starts at the current write position and sees only
    /// descriptors pushed after this call. Dropping the listener releases
    /// its unconsumed cells; the separate [`unregister_listener`] call
    /// releases its slot in the status table.
    ///
    /// [`unregister_listener`]: Self::unregister_listener
    pub fn create_listener(&self) -> Result<Listener> {
        let node = self.node();
        let _guard = node.empty_cv_mutex.lock()?;
        if !node.is_port_ok.load(Ordering::Acquire) {
            return Err(PortError::port_not_ok(node.port_id));
        }
        if node.num_listeners as usize >= LISTENERS_STATUS_SIZE {
            return Err(PortError::listener_table_full(LISTENERS_STATUS_SIZE));
        }

        let index = node.num_listeners;
        unsafe {
            (*self.node).num_listeners = index + 1;
        }
        let inner = self.ring.register_listener();

        Ok(Listener {
            _segment: Arc::clone(&self.segment),
            node: self.node,
            inner,
            index,
        })
    }

    /// Release one listener slot in the status table
    pub fn unregister_listener(&self) -> Result<()> {
        let node = self.node();
        let _guard = node.empty_cv_mutex.lock()?;
        unsafe {
            (*self.node).num_listeners = node.num_listeners.saturating_sub(1);
        }
        Ok(())
    }

    /// Wait until the listener has a descriptor to pop or `is_closed`
    /// becomes true.
    ///
    /// Each individual wait is bounded by the port wait timeout; on every
    /// timeout the listener bumps its heartbeat counter so the watchdog
    /// can tell a slow listener from a dead one, then waits again.
    pub fn wait_pop(&self, listener: &Listener, is_closed: &AtomicBool) -> Result<()> {
        if listener.node != self.node {
            return Err(PortError::invalid_parameter(
                "listener",
                "listener does not belong to this port",
            ));
        }

        self.wait_pop_inner(listener, is_closed)
    }

    fn wait_pop_inner(&self, listener: &Listener, is_closed: &AtomicBool) -> Result<()> {
        let node = self.node();
        let mut guard = node.empty_cv_mutex.lock()?;
        if !node.is_port_ok.load(Ordering::Acquire) {
            return Err(PortError::port_not_ok(node.port_id));
        }

        let index = listener.index as usize;
        unsafe {
            let status = &mut (*self.node).listeners_status[index];
            status.set_waiting(true);
            status.set_counter(status.last_verified_counter() + 1);
            (*self.node).waiting_count += 1;
        }

        let wait = Duration::from_millis(node.port_wait_timeout_ms as u64);
        loop {
            match node.empty_cv.wait_timeout_while(guard, wait, || {
                is_closed.load(Ordering::Acquire) || listener.head().is_some()
            }) {
                Ok((g, true)) => {
                    guard = g;
                    break;
                }
                Ok((g, false)) => {
                    guard = g;
                    if !node.is_port_ok.load(Ordering::Acquire) {
                        self.leave_waiting_state(index);
                        return Err(PortError::port_not_ok(node.port_id));
                    }
                    unsafe {
                        let status = &mut (*self.node).listeners_status[index];
                        status.set_counter(status.last_verified_counter() + 1);
                    }
                }
                Err(e) => {
                    // The wait itself failed; restore the waiting state and
                    // mark the port unusable under a fresh lock if one can
                    // still be taken. Writes to is_port_ok are serialized by
                    // the port mutex; when the mutex itself is broken the
                    // flag is left for the next lock holder to discover.
                    if let Ok(_guard) = node.empty_cv_mutex.lock() {
                        self.leave_waiting_state(index);
                        node.is_port_ok.store(false, Ordering::Release);
                    }
                    return Err(e);
                }
            }
        }

        self.leave_waiting_state(index);
        drop(guard);
        Ok(())
    }

    /// Must be called with the port mutex held
    fn leave_waiting_state(&self, index: usize) {
        unsafe {
            (*self.node).waiting_count = (*self.node).waiting_count.saturating_sub(1);
            (*self.node).listeners_status[index].set_waiting(false);
        }
    }

    /// Remove the head descriptor from the listener's queue.
    ///
    /// Returns whether the ring cell was freed (every registered listener
    /// has now popped it).
    pub fn pop(&self, listener: &mut Listener) -> Result<bool> {
        if listener.node != self.node {
            return Err(PortError::invalid_parameter(
                "listener",
                "listener does not belong to this port",
            ));
        }
        listener.inner.pop()
    }

    /// Set the caller's close flag under the port mutex and wake every
    /// waiter, guaranteeing an in-flight [`wait_pop`] observes the flag.
    ///
    /// [`wait_pop`]: Self::wait_pop
    pub fn close_listener(&self, is_closed: &AtomicBool) -> Result<()> {
        let node = self.node();
        {
            let _guard = node.empty_cv_mutex.lock()?;
            is_closed.store(true, Ordering::Release);
        }
        node.empty_cv.notify_all();
        Ok(())
    }

    /// Verify that every currently waiting listener is making progress.
    ///
    /// Retries over at most the port's healthy-check timeout, sleeping one
    /// port wait timeout between attempts so waiting listeners get a
    /// chance to bump their heartbeat.
    pub fn healthy_check(&self) -> Result<()> {
        let node = self.node();
        if !node.is_port_ok.load(Ordering::Acquire) {
            return Err(PortError::port_not_ok(node.port_id));
        }

        let timeout = Duration::from_millis(node.healthy_check_timeout_ms as u64);
        let tick = Duration::from_millis(node.port_wait_timeout_ms as u64);
        let started = Instant::now();

        let mut all_progressed = false;
        while !all_progressed && started.elapsed() < timeout {
            {
                let _guard = node.empty_cv_mutex.lock()?;
                all_progressed = Self::check_status_all_listeners(node);
                if !node.is_port_ok.load(Ordering::Acquire) {
                    return Err(PortError::port_not_ok(node.port_id));
                }
            }
            if !all_progressed {
                thread::sleep(tick);
            }
        }

        if !all_progressed || !node.is_port_ok.load(Ordering::Acquire) {
            return Err(PortError::unhealthy(node.port_id));
        }
        Ok(())
    }

    fn check_status_all_listeners(node: &PortNode) -> bool {
        for i in 0..node.num_listeners as usize {
            let status = node.listeners_status[i];
            if status.is_waiting() && status.counter() == status.last_verified_counter() {
                return false;
            }
        }
        true
    }

    /// Whether the port is still usable
    pub fn is_port_ok(&self) -> bool {
        self.node().is_port_ok.load(Ordering::Acquire)
    }

    /// Port identifier inside its domain
    pub fn port_id(&self) -> u32 {
        self.node().port_id
    }

    /// Random identity assigned when the port was created
    pub fn uuid(&self) -> SegmentId {
        self.node().uuid
    }

    /// Mode this port is currently opened in, derived from its sharing
    /// flags
    pub fn open_mode(&self) -> OpenMode {
        let node = self.node();
        if node.is_opened_for_reading {
            if node.is_opened_read_exclusive {
                OpenMode::ReadExclusive
            } else {
                OpenMode::ReadShared
            }
        } else {
            OpenMode::Write
        }
    }

    /// Liveness bound configured at creation
    pub fn healthy_check_timeout_ms(&self) -> u32 {
        self.node().healthy_check_timeout_ms
    }

    /// Ring capacity configured at creation
    pub fn max_buffer_descriptors(&self) -> u32 {
        self.node().max_buffer_descriptors
    }

    /// Number of pushes dropped because the ring was full
    pub fn overflows_count(&self) -> u64 {
        self.overflows_count.load(Ordering::Relaxed)
    }

    /// Snapshot of the port's counters
    pub fn stats(&self) -> Result<PortStats> {
        let node = self.node();
        let _guard = node.empty_cv_mutex.lock()?;
        Ok(PortStats {
            port_id: node.port_id,
            capacity: node.max_buffer_descriptors,
            num_listeners: node.num_listeners,
            waiting_count: node.waiting_count,
            ref_count: node.ref_counter.load(Ordering::Acquire),
            overflows: self.overflows_count(),
        })
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        watchdog::remove_port(self.node);

        let node = self.node();
        if node.ref_counter.fetch_sub(1, Ordering::AcqRel) == 1
            && node.is_port_ok.load(Ordering::Acquire)
        {
            let segment_name = self.segment.name().to_string();
            let overflows = self.overflows_count();

            log::info!("port {} ({}) removed", node.port_id, segment_name);
            if overflows > 0 {
                log::warn!(
                    "port {} ({}) had {} overflows",
                    node.port_id,
                    segment_name,
                    overflows
                );
            }

            if let Err(e) = SharedSegment::remove(&segment_name) {
                log::warn!("failed to remove segment '{}': {}", segment_name, e);
            }
            if let Err(e) = NamedMutex::remove(&format!("{}_mutex", segment_name)) {
                log::warn!("failed to remove lock for '{}': {}", segment_name, e);
            }
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let node = self.node();
        f.debug_struct("Port")
            .field("port_id", &node.port_id)
            .field("uuid", &node.uuid)
            .field("open_mode", &self.open_mode())
            .field("capacity", &node.max_buffer_descriptors)
            .finish()
    }
}

/// A reader's cursor into a port, paired with its slot in the listener
/// status table.
///
/// Dropping the listener releases every cell it has not consumed.
pub struct Listener {
    /// Keeps the mapping alive even if every Port handle goes first
    _segment: Arc<SharedSegment>,
    node: *mut PortNode,
    inner: RingListener,
    index: u32,
}

unsafe impl Send for Listener {}

impl Listener {
    /// The next unconsumed descriptor, if any
    pub fn head(&self) -> Option<BufferDescriptor> {
        self.inner.head()
    }

    /// Slot of this listener in the port's status table
    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let node = unsafe { &*self.node };
        if let Ok(_guard) = node.empty_cv_mutex.lock() {
            self.inner.unregister();
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("index", &self.index)
            .field("head", &self.head())
            .finish()
    }
}
