//! Error types and handling for shmport

/// Result type alias for shmport operations
pub type Result<T> = std::result::Result<T, PortError>;

/// Comprehensive error types for the shared-memory port layer
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    /// I/O related errors (shm objects, lock files, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Domain name exceeds the hard length ceiling
    #[error("domain name '{name}' too long (max {max} characters)")]
    DomainTooLong { name: String, max: usize },

    /// Operation attempted on a port previously marked not ok
    #[error("port {port_id} is marked as not ok")]
    PortNotOk { port_id: u32 },

    /// Descriptor ring is full; the push is dropped and counted
    #[error("descriptor ring full: capacity {capacity}")]
    BufferFull { capacity: u32 },

    /// Named segment does not exist
    #[error("segment not found: {name}")]
    SegmentNotFound { name: String },

    /// Segment exists but its contents are not usable
    #[error("corrupt segment: {message}")]
    Corrupt { message: String },

    /// Health check on an existing port timed out
    #[error("port {port_id} failed the healthy check")]
    Unhealthy { port_id: u32 },

    /// Port cannot be opened (sharing-mode collision or final failure)
    #[error("couldn't open port {reason}")]
    CannotOpen { reason: String },

    /// Listener status table is exhausted
    #[error("listener table full: max {max} listeners per port")]
    ListenerTableFull { max: usize },

    /// Insufficient space for an in-segment allocation
    #[error("insufficient space: requested {requested}, available {available}")]
    InsufficientSpace { requested: usize, available: usize },

    /// Invalid parameters or configuration
    #[error("invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Platform-specific errors (pthread, shm, flock)
    #[error("platform error: {message}")]
    Platform { message: String },
}

impl PortError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    /// Create a domain-too-long error
    pub fn domain_too_long(name: impl Into<String>, max: usize) -> Self {
        Self::DomainTooLong {
            name: name.into(),
            max,
        }
    }

    /// Create a port-not-ok error
    pub fn port_not_ok(port_id: u32) -> Self {
        Self::PortNotOk { port_id }
    }

    /// Create a buffer full error
    pub fn buffer_full(capacity: u32) -> Self {
        Self::BufferFull { capacity }
    }

    /// Create a segment not found error
    pub fn segment_not_found(name: impl Into<String>) -> Self {
        Self::SegmentNotFound { name: name.into() }
    }

    /// Create a corrupt segment error
    pub fn corrupt(message: impl Into<String>) -> Self {
        Self::Corrupt {
            message: message.into(),
        }
    }

    /// Create an unhealthy port error
    pub fn unhealthy(port_id: u32) -> Self {
        Self::Unhealthy { port_id }
    }

    /// Create a cannot-open error
    pub fn cannot_open(reason: impl Into<String>) -> Self {
        Self::CannotOpen {
            reason: reason.into(),
        }
    }

    /// Create a listener table full error
    pub fn listener_table_full(max: usize) -> Self {
        Self::ListenerTableFull { max }
    }

    /// Create an insufficient space error
    pub fn insufficient_space(requested: usize, available: usize) -> Self {
        Self::InsufficientSpace {
            requested,
            available,
        }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }
}

// Convert from common error types
impl From<std::io::Error> for PortError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::Error> for PortError {
    fn from(err: nix::Error) -> Self {
        Self::platform(format!("OS call failed: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = PortError::port_not_ok(7);
        assert!(matches!(err, PortError::PortNotOk { port_id: 7 }));

        let err = PortError::domain_too_long("a_very_long_domain", 16);
        assert!(matches!(err, PortError::DomainTooLong { .. }));

        let err = PortError::insufficient_space(1024, 512);
        assert!(matches!(err, PortError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_error_display() {
        let err = PortError::buffer_full(4);
        let display = format!("{}", err);
        assert!(display.contains("ring full"));
        assert!(display.contains("4"));

        let err = PortError::cannot_open("7 (0011223344556677) already opened ReadExclusive");
        assert!(format!("{}", err).contains("couldn't open port"));
    }
}
