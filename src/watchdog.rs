//! Process-wide liveness watchdog for open ports
//!
//! A single background thread, started lazily on first use, walks every
//! port this process has open and verifies the heartbeat counters of
//! waiting listeners. A listener that is merely slow bumps its counter on
//! every wait timeout; a listener whose process died while blocked cannot.
//! When a frozen listener is found the port is flipped to not-ok, the
//! still-enqueued descriptors are snapshotted, and the process failure
//! callback is invoked so outer layers can release the payload segments
//! those descriptors reference.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Condvar, Mutex,
    },
    thread,
    time::Duration,
};

use crate::{
    descriptor::BufferDescriptor,
    error::Result,
    port::node::{now_millis, PortNode},
    ring::DescriptorRing,
    segment::SharedSegment,
};

/// Callback invoked when a port is first declared not-ok.
///
/// Receives the still-enqueued descriptors and the port's domain name. It
/// runs on the watchdog thread while port locks are held, so it must not
/// open or close ports itself.
pub type FailureHandler = Box<dyn Fn(&[BufferDescriptor], &str) + Send + Sync + 'static>;

/// One entry in the watch list: enough shared state to probe the port
/// without owning a handle
pub(crate) struct WatchedPort {
    /// Keeps the mapping alive for the node and ring pointers
    pub(crate) _segment: Arc<SharedSegment>,
    pub(crate) node: *mut PortNode,
    pub(crate) ring: DescriptorRing,
}

unsafe impl Send for WatchedPort {}

/// Maximum sleep between watchdog ticks
const TICK: Duration = Duration::from_secs(1);

struct Watchdog {
    watched: Mutex<Vec<WatchedPort>>,
    wake: Mutex<bool>,
    wake_cv: Condvar,
    exit: AtomicBool,
    handler: Mutex<Option<FailureHandler>>,
    handler_set: AtomicBool,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

lazy_static::lazy_static! {
    static ref WATCHDOG: Watchdog = Watchdog::start();
}

impl Watchdog {
    fn start() -> Self {
        let handle = thread::Builder::new()
            .name("shmport-watchdog".to_string())
            .spawn(|| WATCHDOG.run())
            .map_err(|e| log::warn!("failed to start watchdog thread: {}", e))
            .ok();

        Self {
            watched: Mutex::new(Vec::new()),
            wake: Mutex::new(false),
            wake_cv: Condvar::new(),
            exit: AtomicBool::new(false),
            handler: Mutex::new(None),
            handler_set: AtomicBool::new(false),
            thread: Mutex::new(handle),
        }
    }

    fn run(&self) {
        loop {
            {
                let wake = self.wake.lock().unwrap();
                let (mut wake, _timed_out) = self
                    .wake_cv
                    .wait_timeout_while(wake, TICK, |woken| !*woken)
                    .unwrap();
                *wake = false;
            }

            if self.exit.load(Ordering::Acquire) {
                break;
            }

            self.tick();
        }
    }

    fn tick(&self) {
        let now = now_millis();
        let mut watched = self.watched.lock().unwrap();

        let mut i = 0;
        while i < watched.len() {
            let port = &watched[i];
            let node = unsafe { &*port.node };

            if now - node.last_check_time_ms.load(Ordering::Acquire)
                <= node.healthy_check_timeout_ms as i64
            {
                i += 1;
                continue;
            }

            match self.probe(port) {
                Ok(()) => {
                    i += 1;
                }
                Err(e) => {
                    node.is_port_ok.store(false, Ordering::Release);
                    log::warn!("port {} error: {}", node.port_id, e);
                    watched.remove(i);
                }
            }
        }
    }

    /// Probe one overdue port under its own mutex
    fn probe(&self, port: &WatchedPort) -> Result<()> {
        let node = unsafe { &*port.node };
        let _guard = node.empty_cv_mutex.lock()?;

        if Self::update_status_all_listeners(port.node) {
            return Ok(());
        }

        if node.is_port_ok.load(Ordering::Acquire) {
            node.is_port_ok.store(false, Ordering::Release);
            let pending = port.ring.copy_pending();
            let domain_name = node.domain_name();
            log::warn!(
                "port {}: listener frozen, handing back {} descriptors",
                node.port_id,
                pending.len()
            );
            let handler = self.handler.lock().unwrap();
            if let Some(handler) = handler.as_ref() {
                handler(&pending, &domain_name);
            }
        }

        Ok(())
    }

    /// Record progress for every waiting listener; false when one of them
    /// has a frozen heartbeat
    fn update_status_all_listeners(node: *mut PortNode) -> bool {
        let node_ref = unsafe { &*node };
        for i in 0..node_ref.num_listeners as usize {
            let status = node_ref.listeners_status[i];
            if status.is_waiting() {
                if status.counter() != status.last_verified_counter() {
                    unsafe {
                        (*node).listeners_status[i].set_last_verified_counter(status.counter());
                    }
                } else {
                    return false;
                }
            }
        }

        node_ref
            .last_check_time_ms
            .store(now_millis(), Ordering::Release);
        true
    }
}

/// Add a port to the watch list; called by every new Port handle
pub(crate) fn add_port(port: WatchedPort) {
    WATCHDOG.watched.lock().unwrap().push(port);
}

/// Remove one watch-list entry for this node; called on Port drop
pub(crate) fn remove_port(node: *mut PortNode) {
    let mut watched = WATCHDOG.watched.lock().unwrap();
    if let Some(position) = watched.iter().position(|port| port.node == node) {
        watched.remove(position);
    }
}

/// Install the process failure callback.
///
/// Only the first call has any effect; the callback stays immutable for
/// the life of the process.
pub fn set_failure_handler(handler: FailureHandler) {
    if !WATCHDOG.handler_set.load(Ordering::Acquire) {
        let mut slot = WATCHDOG.handler.lock().unwrap();
        // Checking handler_set twice looks odd but avoids a recursive
        // lock on the callback path.
        if !WATCHDOG.handler_set.load(Ordering::Acquire) {
            *slot = Some(handler);
            WATCHDOG.handler_set.store(true, Ordering::Release);
        }
    }
}

/// Force an immediate watchdog pass
pub fn wake_up() {
    {
        let mut wake = WATCHDOG.wake.lock().unwrap();
        *wake = true;
    }
    WATCHDOG.wake_cv.notify_one();
}

/// Stop the watchdog thread and wait for it to finish.
///
/// Intended for orderly process teardown; ports opened afterwards are no
/// longer supervised.
pub fn shutdown() {
    WATCHDOG.exit.store(true, Ordering::Release);
    wake_up();
    if let Some(handle) = WATCHDOG.thread.lock().unwrap().take() {
        if handle.join().is_err() {
            log::warn!("watchdog thread terminated abnormally");
        }
    }
}
