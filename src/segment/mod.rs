//! Named shared-memory segments and open-protocol serialization
//!
//! A [`SharedSegment`] is a host-wide named memory region (POSIX shm)
//! carrying a small allocation header, a named-object table, and a bump
//! allocator, so fixed control blocks and arrays can be constructed inside
//! it and located again by other processes. A [`NamedMutex`] is a
//! string-keyed lock used only to serialize segment open/create, never on
//! the data plane.

pub mod named_mutex;
pub mod shmem;

pub use named_mutex::NamedMutex;
pub use shmem::SharedSegment;
