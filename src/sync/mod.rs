//! Synchronization primitives shared between processes
//!
//! Ports coordinate across process boundaries with primitives that live
//! *inside* the shared segment: a process-shared mutex and condition
//! variable laid out as plain `repr(C)` struct members, so every process
//! that maps the segment operates on the same kernel-visible object.

pub mod ipc;

pub use ipc::{IpcCondvar, IpcMutex, IpcMutexGuard};
