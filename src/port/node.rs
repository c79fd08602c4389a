//! Fixed in-segment control block of a shared-memory port

use std::{
    ptr::addr_of_mut,
    sync::atomic::{AtomicBool, AtomicI64, AtomicU32},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    config::{LISTENERS_STATUS_SIZE, MAX_DOMAIN_NAME_LENGTH},
    descriptor::SegmentId,
    error::Result,
    sync::{IpcCondvar, IpcMutex},
};

use super::OpenMode;

/// Wall-clock milliseconds, comparable across processes
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Per-listener liveness record, packed into one byte to keep the
/// 1024-entry table compact in the segment.
///
/// Bit 0 is the waiting flag; bits 1-3 hold the heartbeat counter the
/// listener bumps on every wait timeout; bits 4-6 hold the last counter
/// value the watchdog verified.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ListenerStatus {
    bits: u8,
}

impl ListenerStatus {
    const WAITING: u8 = 0x01;
    const COUNTER_SHIFT: u8 = 1;
    const VERIFIED_SHIFT: u8 = 4;
    const FIELD_MASK: u8 = 0x7;

    /// Whether the listener is currently blocked in a wait
    pub fn is_waiting(&self) -> bool {
        self.bits & Self::WAITING != 0
    }

    pub fn set_waiting(&mut self, waiting: bool) {
        if waiting {
            self.bits |= Self::WAITING;
        } else {
            self.bits &= !Self::WAITING;
        }
    }

    /// Heartbeat counter, bumped by the listener on every wait timeout
    pub fn counter(&self) -> u8 {
        (self.bits >> Self::COUNTER_SHIFT) & Self::FIELD_MASK
    }

    pub fn set_counter(&mut self, value: u8) {
        self.bits = (self.bits & !(Self::FIELD_MASK << Self::COUNTER_SHIFT))
            | ((value & Self::FIELD_MASK) << Self::COUNTER_SHIFT);
    }

    /// Last counter value the watchdog observed as progress
    pub fn last_verified_counter(&self) -> u8 {
        (self.bits >> Self::VERIFIED_SHIFT) & Self::FIELD_MASK
    }

    pub fn set_last_verified_counter(&mut self, value: u8) {
        self.bits = (self.bits & !(Self::FIELD_MASK << Self::VERIFIED_SHIFT))
            | ((value & Self::FIELD_MASK) << Self::VERIFIED_SHIFT);
    }
}

/// The fixed control block of one port, constructed in its segment under
/// the well-known name `port_node`.
///
/// All plain fields are serialized by `empty_cv_mutex`; `ref_counter`,
/// `last_check_time_ms` and `is_port_ok` are atomics readable without the
/// lock (lock-free readers treat `is_port_ok` as a hint and re-check under
/// the lock).
#[repr(C)]
pub struct PortNode {
    pub(crate) uuid: SegmentId,
    pub(crate) port_id: u32,

    pub(crate) empty_cv: IpcCondvar,
    pub(crate) empty_cv_mutex: IpcMutex,

    pub(crate) buffer_offset: u64,
    pub(crate) buffer_node_offset: u64,
    pub(crate) ref_counter: AtomicU32,

    pub(crate) waiting_count: u32,
    pub(crate) listeners_status: [ListenerStatus; LISTENERS_STATUS_SIZE],
    pub(crate) num_listeners: u32,

    pub(crate) last_check_time_ms: AtomicI64,
    pub(crate) healthy_check_timeout_ms: u32,
    pub(crate) port_wait_timeout_ms: u32,
    pub(crate) max_buffer_descriptors: u32,

    pub(crate) is_port_ok: AtomicBool,
    pub(crate) is_opened_read_exclusive: bool,
    pub(crate) is_opened_for_reading: bool,

    pub(crate) domain_name: [u8; MAX_DOMAIN_NAME_LENGTH + 1],
}

impl PortNode {
    /// Initialize a freshly allocated node in place.
    ///
    /// # Safety
    ///
    /// `this` must point to writable zeroed memory inside a shared mapping
    /// and must be initialized exactly once per segment lifetime. The
    /// buffer offsets are left at zero; the creator stores them after
    /// allocating the ring.
    pub(crate) unsafe fn init_at(
        this: *mut PortNode,
        port_id: u32,
        open_mode: OpenMode,
        healthy_check_timeout_ms: u32,
        max_buffer_descriptors: u32,
        domain_name: &str,
    ) -> Result<()> {
        IpcCondvar::init_at(addr_of_mut!((*this).empty_cv))?;
        IpcMutex::init_at(addr_of_mut!((*this).empty_cv_mutex))?;

        (*this).uuid = SegmentId::random();
        (*this).port_id = port_id;
        (*this).buffer_offset = 0;
        (*this).buffer_node_offset = 0;
        (*this).ref_counter = AtomicU32::new(0);

        (*this).waiting_count = 0;
        std::ptr::write_bytes(addr_of_mut!((*this).listeners_status), 0, 1);
        (*this).num_listeners = 0;

        (*this).last_check_time_ms = AtomicI64::new(now_millis());
        (*this).healthy_check_timeout_ms = healthy_check_timeout_ms;
        (*this).port_wait_timeout_ms = (healthy_check_timeout_ms / 3).max(1);
        (*this).max_buffer_descriptors = max_buffer_descriptors;

        (*this).is_port_ok = AtomicBool::new(true);
        (*this).is_opened_read_exclusive = open_mode == OpenMode::ReadExclusive;
        (*this).is_opened_for_reading = open_mode != OpenMode::Write;

        let bytes = domain_name.as_bytes();
        let len = bytes.len().min(MAX_DOMAIN_NAME_LENGTH);
        (*this).domain_name = [0; MAX_DOMAIN_NAME_LENGTH + 1];
        (&mut (*this).domain_name)[..len].copy_from_slice(&bytes[..len]);

        Ok(())
    }

    /// Domain name recorded at creation
    pub fn domain_name(&self) -> String {
        let len = self
            .domain_name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_DOMAIN_NAME_LENGTH);
        String::from_utf8_lossy(&self.domain_name[..len]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_status_bit_fields() {
        let mut status = ListenerStatus::default();
        assert!(!status.is_waiting());
        assert_eq!(status.counter(), 0);
        assert_eq!(status.last_verified_counter(), 0);

        status.set_waiting(true);
        status.set_counter(5);
        status.set_last_verified_counter(3);
        assert!(status.is_waiting());
        assert_eq!(status.counter(), 5);
        assert_eq!(status.last_verified_counter(), 3);

        // The three-bit fields wrap instead of bleeding into each other.
        status.set_counter(9);
        assert_eq!(status.counter(), 1);
        assert_eq!(status.last_verified_counter(), 3);
        assert!(status.is_waiting());

        status.set_waiting(false);
        assert!(!status.is_waiting());
        assert_eq!(status.counter(), 1);
    }

    #[test]
    fn test_status_fits_one_byte() {
        assert_eq!(std::mem::size_of::<ListenerStatus>(), 1);
    }
}
