//! String-keyed inter-process mutex for open-protocol serialization
//!
//! Implemented as an advisory `flock` on a lock file derived from the key.
//! The kernel releases the lock when the holding process exits, so a crash
//! during port open never wedges the protocol.

use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
    os::unix::fs::OpenOptionsExt,
    path::PathBuf,
};

use crate::error::{PortError, Result};

/// An acquired named mutex; the lock is released on drop
pub struct NamedMutex {
    name: String,
    file: File,
}

impl NamedMutex {
    /// Create the lock file if needed and block until the lock is held
    pub fn open_or_create_and_lock(name: &str) -> Result<Self> {
        let path = Self::path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o600)
            .open(&path)
            .map_err(|e| PortError::from_io(e, "failed to open lock file"))?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if rc != 0 {
            return Err(PortError::platform(format!(
                "flock('{}') failed: {}",
                path.display(),
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            name: name.to_string(),
            file,
        })
    }

    /// Remove the lock file for this key.
    ///
    /// A held lock stays valid on its open descriptor; a missing file is
    /// not an error.
    pub fn remove(name: &str) -> Result<()> {
        match std::fs::remove_file(Self::path_for(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PortError::from_io(e, "failed to remove lock file")),
        }
    }

    /// Check whether the lock file for this key exists
    pub fn exists(name: &str) -> bool {
        Self::path_for(name).exists()
    }

    /// Key this mutex was opened with
    pub fn name(&self) -> &str {
        &self.name
    }

    fn path_for(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shmport_{}.lock", name))
    }
}

impl Drop for NamedMutex {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Duration};

    fn unique_name(tag: &str) -> String {
        format!("nm_test_{}_{}", tag, std::process::id())
    }

    #[test]
    fn test_lock_excludes_other_holders() {
        let name = unique_name("excl");
        let held = NamedMutex::open_or_create_and_lock(&name).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let contender_name = name.clone();
        let contender = thread::spawn(move || {
            let _lock = NamedMutex::open_or_create_and_lock(&contender_name).unwrap();
            tx.send(()).unwrap();
        });

        // The contender must stay blocked while we hold the lock.
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

        drop(held);
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        contender.join().unwrap();

        NamedMutex::remove(&name).unwrap();
        assert!(!NamedMutex::exists(&name));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        NamedMutex::remove(&unique_name("missing")).unwrap();
    }
}
