//! Domain-scoped port opener
//!
//! A [`Domain`] isolates a set of ports under a short namespace string and
//! owns the open protocol: create-or-attach under a named mutex, health
//! verification and sharing enforcement on attach, and removal plus
//! re-creation when an existing segment turns out to be corrupt or
//! unhealthy.

use std::{
    mem::{align_of, size_of},
    sync::{atomic::Ordering, Arc},
};

use crate::{
    config::{
        DEFAULT_HEALTHY_CHECK_TIMEOUT_MS, DEFAULT_MAX_BUFFER_DESCRIPTORS, MAX_DOMAIN_NAME_LENGTH,
        PORT_NODE_OBJECT_NAME, SEGMENT_EXTRA_BYTES,
    },
    error::{PortError, Result},
    port::{node::PortNode, OpenMode, Port},
    ring::{DescriptorRing, RingCell, RingNode},
    segment::{NamedMutex, SharedSegment},
    watchdog::{self, FailureHandler},
};

/// Configuration for opening a port
#[derive(Debug, Clone)]
pub struct PortConfig {
    /// Identifies the port inside its domain
    pub port_id: u32,
    /// Ring capacity in descriptors; used only when the port is created
    pub max_buffer_descriptors: u32,
    /// Upper bound on listener freeze detection
    pub healthy_check_timeout_ms: u32,
    /// Sharing mode to open the port with
    pub open_mode: OpenMode,
}

impl PortConfig {
    /// Create a configuration with defaults for everything but the id
    pub fn new(port_id: u32) -> Self {
        Self {
            port_id,
            max_buffer_descriptors: DEFAULT_MAX_BUFFER_DESCRIPTORS,
            healthy_check_timeout_ms: DEFAULT_HEALTHY_CHECK_TIMEOUT_MS,
            open_mode: OpenMode::ReadShared,
        }
    }

    /// Set the ring capacity
    pub fn with_max_buffer_descriptors(mut self, max_buffer_descriptors: u32) -> Self {
        self.max_buffer_descriptors = max_buffer_descriptors;
        self
    }

    /// Set the healthy-check timeout
    pub fn with_healthy_check_timeout_ms(mut self, healthy_check_timeout_ms: u32) -> Self {
        self.healthy_check_timeout_ms = healthy_check_timeout_ms;
        self
    }

    /// Set the sharing mode
    pub fn with_open_mode(mut self, open_mode: OpenMode) -> Self {
        self.open_mode = open_mode;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_buffer_descriptors == 0 {
            return Err(PortError::invalid_parameter(
                "max_buffer_descriptors",
                "ring capacity must be greater than 0",
            ));
        }
        if self.healthy_check_timeout_ms == 0 {
            return Err(PortError::invalid_parameter(
                "healthy_check_timeout_ms",
                "timeout must be greater than 0",
            ));
        }
        Ok(())
    }
}

enum AttachOutcome {
    Opened(Port),
    Incompatible(String),
}

/// The global resources of one shared-memory domain.
///
/// Construction installs the process failure callback (first caller wins)
/// and validates the domain name, which is embedded in every segment name
/// and therefore kept short.
pub struct Domain {
    domain_name: String,
}

impl Domain {
    /// Create a domain handle and install the failure callback
    pub fn new(domain_name: impl Into<String>, on_failure: FailureHandler) -> Result<Self> {
        let domain_name = domain_name.into();
        if domain_name.len() > MAX_DOMAIN_NAME_LENGTH {
            return Err(PortError::domain_too_long(
                domain_name,
                MAX_DOMAIN_NAME_LENGTH,
            ));
        }

        watchdog::set_failure_handler(on_failure);

        Ok(Self { domain_name })
    }

    /// Namespace string of this domain
    pub fn name(&self) -> &str {
        &self.domain_name
    }

    fn segment_name(&self, port_id: u32) -> String {
        format!("{}_port{}", self.domain_name, port_id)
    }

    /// Open a shared-memory port: attach to it if it already exists in the
    /// system, create it otherwise.
    ///
    /// An existing port is health-checked first; a port that is corrupt or
    /// fails the check is removed and recreated. Attaching fails with
    /// `CannotOpen` when the requested mode collides with the modes the
    /// port is already opened in.
    pub fn open_port(&self, config: &PortConfig) -> Result<Port> {
        config.validate()?;

        let segment_name = self.segment_name(config.port_id);
        log::info!("opening port {}", segment_name);

        let _port_lock = NamedMutex::open_or_create_and_lock(&format!("{}_mutex", segment_name))?;

        let mut incompatible_reason = None;
        match self.attach_existing(&segment_name, config) {
            Ok(AttachOutcome::Opened(port)) => return Ok(port),
            Ok(AttachOutcome::Incompatible(reason)) => incompatible_reason = Some(reason),
            Err(e) => {
                log::debug!("attach to {} failed: {}", segment_name, e);
            }
        }

        if let Some(reason) = incompatible_reason {
            return Err(PortError::cannot_open(reason));
        }

        self.create_port(&segment_name, config)
    }

    /// Attach to an existing segment, verify it, and enforce sharing.
    ///
    /// Every failure past a successful open removes the segment so the
    /// caller can fall through to creation.
    fn attach_existing(&self, segment_name: &str, config: &PortConfig) -> Result<AttachOutcome> {
        let segment = match SharedSegment::open(segment_name) {
            Ok(segment) => Arc::new(segment),
            Err(e @ PortError::SegmentNotFound { .. }) => return Err(e),
            Err(e) => {
                log::warn!("segment {} unusable: {}", segment_name, e);
                SharedSegment::remove(segment_name)?;
                return Err(e);
            }
        };

        let node = match segment
            .find_named(PORT_NODE_OBJECT_NAME)
            .ok_or_else(|| PortError::corrupt(format!("{} has no port node", segment_name)))
            .and_then(|offset| segment.ptr_from_offset::<PortNode>(offset, 1))
        {
            Ok(node) => node,
            Err(e) => {
                log::warn!("port {}: couldn't find port node", config.port_id);
                SharedSegment::remove(segment_name)?;
                log::warn!("port {} removed", config.port_id);
                return Err(e);
            }
        };

        let port = match Port::new(Arc::clone(&segment), node) {
            Ok(port) => port,
            Err(e) => {
                SharedSegment::remove(segment_name)?;
                return Err(e);
            }
        };

        if let Err(e) = port.healthy_check() {
            let uuid = port.uuid();
            log::warn!(
                "existing port {} ({}) not healthy: {}",
                config.port_id,
                uuid,
                e
            );
            // Stale handles in other processes observe not-ok instead of
            // silently destroying the replacement segment on their drop.
            // Like every is_port_ok write, the flip happens under the port
            // mutex.
            unsafe {
                if let Ok(_guard) = (*node).empty_cv_mutex.lock() {
                    (*node).is_port_ok.store(false, Ordering::Release);
                }
            }
            drop(port);
            SharedSegment::remove(segment_name)?;
            log::warn!("port {} ({}) removed", config.port_id, uuid);
            return Err(e);
        }

        let (port_id, uuid, read_exclusive, for_reading) = unsafe {
            (
                (*node).port_id,
                (*node).uuid,
                (*node).is_opened_read_exclusive,
                (*node).is_opened_for_reading,
            )
        };

        let collides = (read_exclusive && config.open_mode != OpenMode::Write)
            || (for_reading && config.open_mode == OpenMode::ReadExclusive);
        if collides {
            let reason = format!(
                "{} ({}) because of an incompatible sharing mode (requested {})",
                port_id, uuid, config.open_mode
            );
            drop(port);
            return Ok(AttachOutcome::Incompatible(reason));
        }

        unsafe {
            (*node).is_opened_read_exclusive |= config.open_mode == OpenMode::ReadExclusive;
            (*node).is_opened_for_reading |= config.open_mode != OpenMode::Write;
        }

        log::info!("port {} ({}) opened {}", port_id, uuid, config.open_mode);

        Ok(AttachOutcome::Opened(port))
    }

    /// Create a fresh segment sized for the node, the ring and the
    /// allocator bookkeeping, and construct the port inside it
    fn create_port(&self, segment_name: &str, config: &PortConfig) -> Result<Port> {
        let payload_size = size_of::<PortNode>()
            + size_of::<RingCell>() * config.max_buffer_descriptors as usize
            + SEGMENT_EXTRA_BYTES;

        let segment = Arc::new(SharedSegment::create(segment_name, payload_size)?);

        match self.init_port(Arc::clone(&segment), config) {
            Ok(port) => {
                log::info!(
                    "port {} ({}) created {}",
                    config.port_id,
                    port.uuid(),
                    config.open_mode
                );
                Ok(port)
            }
            Err(e) => {
                log::error!(
                    "failed to create port segment {}: {}",
                    segment_name,
                    e
                );
                drop(segment);
                let _ = SharedSegment::remove(segment_name);
                Err(e)
            }
        }
    }

    fn init_port(&self, segment: Arc<SharedSegment>, config: &PortConfig) -> Result<Port> {
        let node_offset = segment.alloc_named(
            PORT_NODE_OBJECT_NAME,
            size_of::<PortNode>(),
            align_of::<PortNode>(),
        )?;
        let node = segment.ptr_from_offset::<PortNode>(node_offset, 1)?;
        unsafe {
            PortNode::init_at(
                node,
                config.port_id,
                config.open_mode,
                config.healthy_check_timeout_ms,
                config.max_buffer_descriptors,
                &self.domain_name,
            )?;
        }

        let cells_offset = segment.alloc(
            size_of::<RingCell>() * config.max_buffer_descriptors as usize,
            align_of::<RingCell>(),
        )?;
        let ring_node_offset = segment.alloc(size_of::<RingNode>(), align_of::<RingNode>())?;
        let ring_node = segment.ptr_from_offset::<RingNode>(ring_node_offset, 1)?;

        unsafe {
            (*node).buffer_offset = cells_offset;
            (*node).buffer_node_offset = ring_node_offset;
            DescriptorRing::init_node(ring_node, config.max_buffer_descriptors);
        }

        Port::new(segment, node)
    }
}

impl std::fmt::Debug for Domain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Domain")
            .field("domain_name", &self.domain_name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support;

    #[test]
    fn test_domain_name_length_ceiling() {
        let ok = Domain::new("sixteen_chars_ok", test_support::recording_handler());
        assert!(ok.is_ok());

        let err =
            Domain::new("seventeen_chars__", test_support::recording_handler()).unwrap_err();
        assert!(matches!(err, PortError::DomainTooLong { .. }));
    }

    #[test]
    fn test_create_then_attach() {
        let domain_name = test_support::unique_domain("glb");
        let domain = Domain::new(&domain_name, test_support::recording_handler()).unwrap();

        let config = PortConfig::new(3)
            .with_max_buffer_descriptors(8)
            .with_healthy_check_timeout_ms(1000)
            .with_open_mode(OpenMode::Write);

        let writer = domain.open_port(&config).unwrap();
        assert_eq!(writer.open_mode(), OpenMode::Write);
        assert_eq!(writer.max_buffer_descriptors(), 8);

        // Second open attaches to the same node.
        let reader = domain
            .open_port(&config.clone().with_open_mode(OpenMode::ReadShared))
            .unwrap();
        assert_eq!(reader.uuid(), writer.uuid());
        assert_eq!(reader.open_mode(), OpenMode::ReadShared);
        assert_eq!(reader.stats().unwrap().ref_count, 2);
    }

    #[test]
    fn test_corrupt_segment_is_removed_and_recreated() {
        let domain_name = test_support::unique_domain("cor");
        let domain = Domain::new(&domain_name, test_support::recording_handler()).unwrap();
        let segment_name = format!("{}_port9", domain_name);

        // A segment that exists but carries no port node.
        let bogus = SharedSegment::create(&segment_name, 1024).unwrap();
        drop(bogus);
        assert!(SharedSegment::exists(&segment_name));

        let port = domain
            .open_port(
                &PortConfig::new(9)
                    .with_max_buffer_descriptors(4)
                    .with_healthy_check_timeout_ms(1000),
            )
            .unwrap();
        assert!(port.is_port_ok());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let domain_name = test_support::unique_domain("cfg");
        let domain = Domain::new(&domain_name, test_support::recording_handler()).unwrap();

        let err = domain
            .open_port(&PortConfig::new(1).with_max_buffer_descriptors(0))
            .unwrap_err();
        assert!(matches!(err, PortError::InvalidParameter { .. }));
    }
}
