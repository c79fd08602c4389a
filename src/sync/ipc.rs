//! Process-shared pthread mutex and condition variable
//!
//! Both types are `repr(C)` wrappers meant to be embedded in a shared
//! segment and initialized in place exactly once, by the process that
//! creates the segment. They are never destroyed explicitly: the kernel
//! reclaims them when the segment is unlinked and the last mapping goes
//! away.

use std::{cell::UnsafeCell, mem::MaybeUninit, time::Duration};

use crate::error::{PortError, Result};

fn check(rc: libc::c_int, context: &str) -> Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(PortError::platform(format!(
            "{}: {}",
            context,
            std::io::Error::from_raw_os_error(rc)
        )))
    }
}

/// Inter-process mutex embeddable in a shared segment
#[repr(C)]
pub struct IpcMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
}

unsafe impl Send for IpcMutex {}
unsafe impl Sync for IpcMutex {}

impl IpcMutex {
    /// Initialize the mutex in place with the process-shared attribute.
    ///
    /// # Safety
    ///
    /// `this` must point to writable memory inside a mapping shared by all
    /// participating processes, and must be initialized only once per
    /// segment lifetime.
    pub unsafe fn init_at(this: *mut IpcMutex) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_mutexattr_t>::uninit();
        check(
            libc::pthread_mutexattr_init(attr.as_mut_ptr()),
            "pthread_mutexattr_init",
        )?;
        let rc = libc::pthread_mutexattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        if rc != 0 {
            libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
            return check(rc, "pthread_mutexattr_setpshared");
        }
        let rc = libc::pthread_mutex_init((*this).raw.get(), attr.as_ptr());
        libc::pthread_mutexattr_destroy(attr.as_mut_ptr());
        check(rc, "pthread_mutex_init")
    }

    /// Block until the mutex is acquired
    pub fn lock(&self) -> Result<IpcMutexGuard<'_>> {
        check(
            unsafe { libc::pthread_mutex_lock(self.raw.get()) },
            "pthread_mutex_lock",
        )?;
        Ok(IpcMutexGuard { mutex: self })
    }

    fn raw(&self) -> *mut libc::pthread_mutex_t {
        self.raw.get()
    }
}

/// RAII guard returned by [`IpcMutex::lock`]; unlocks on drop
pub struct IpcMutexGuard<'a> {
    mutex: &'a IpcMutex,
}

impl Drop for IpcMutexGuard<'_> {
    fn drop(&mut self) {
        // An unlock failure here would mean the mutex memory itself is
        // gone; nothing useful can be reported from a destructor.
        unsafe {
            libc::pthread_mutex_unlock(self.mutex.raw());
        }
    }
}

/// Inter-process condition variable embeddable in a shared segment
#[repr(C)]
pub struct IpcCondvar {
    raw: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for IpcCondvar {}
unsafe impl Sync for IpcCondvar {}

#[cfg(target_os = "linux")]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_MONOTONIC;
#[cfg(not(target_os = "linux"))]
const WAIT_CLOCK: libc::clockid_t = libc::CLOCK_REALTIME;

impl IpcCondvar {
    /// Initialize the condition variable in place with the process-shared
    /// attribute.
    ///
    /// # Safety
    ///
    /// Same contract as [`IpcMutex::init_at`].
    pub unsafe fn init_at(this: *mut IpcCondvar) -> Result<()> {
        let mut attr = MaybeUninit::<libc::pthread_condattr_t>::uninit();
        check(
            libc::pthread_condattr_init(attr.as_mut_ptr()),
            "pthread_condattr_init",
        )?;
        let rc =
            libc::pthread_condattr_setpshared(attr.as_mut_ptr(), libc::PTHREAD_PROCESS_SHARED);
        let rc = if rc == 0 {
            set_wait_clock(attr.as_mut_ptr())
        } else {
            rc
        };
        if rc != 0 {
            libc::pthread_condattr_destroy(attr.as_mut_ptr());
            return check(rc, "pthread_condattr configuration");
        }
        let rc = libc::pthread_cond_init((*this).raw.get(), attr.as_ptr());
        libc::pthread_condattr_destroy(attr.as_mut_ptr());
        check(rc, "pthread_cond_init")
    }

    /// Wake one waiter
    pub fn notify_one(&self) {
        unsafe {
            libc::pthread_cond_signal(self.raw.get());
        }
    }

    /// Wake all waiters
    pub fn notify_all(&self) {
        unsafe {
            libc::pthread_cond_broadcast(self.raw.get());
        }
    }

    /// Wait on the condition variable until `predicate` holds or `timeout`
    /// elapses. Returns the guard and whether the predicate held when the
    /// wait finished (it is re-checked on timeout, like a classic timed
    /// predicate wait).
    pub fn wait_timeout_while<'a, F>(
        &self,
        guard: IpcMutexGuard<'a>,
        timeout: Duration,
        mut predicate: F,
    ) -> Result<(IpcMutexGuard<'a>, bool)>
    where
        F: FnMut() -> bool,
    {
        let deadline = deadline_after(timeout);
        loop {
            if predicate() {
                return Ok((guard, true));
            }
            let rc = unsafe {
                libc::pthread_cond_timedwait(self.raw.get(), guard.mutex.raw(), &deadline)
            };
            if rc == libc::ETIMEDOUT {
                let met = predicate();
                return Ok((guard, met));
            }
            if rc != 0 {
                // The guard still owns the mutex; report the wait failure.
                return Err(PortError::platform(format!(
                    "pthread_cond_timedwait: {}",
                    std::io::Error::from_raw_os_error(rc)
                )));
            }
            // Spurious or signalled wakeup: re-check the predicate.
        }
    }
}

/// Timed waits measure against the monotonic clock where the platform
/// supports selecting it
#[cfg(target_os = "linux")]
unsafe fn set_wait_clock(attr: *mut libc::pthread_condattr_t) -> libc::c_int {
    libc::pthread_condattr_setclock(attr, WAIT_CLOCK)
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_wait_clock(_attr: *mut libc::pthread_condattr_t) -> libc::c_int {
    0
}

fn deadline_after(timeout: Duration) -> libc::timespec {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(WAIT_CLOCK, &mut now);
    }
    let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
    libc::timespec {
        tv_sec: now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        thread,
        time::Instant,
    };

    struct SyncPair {
        mutex: IpcMutex,
        condvar: IpcCondvar,
    }

    fn make_pair() -> Arc<SyncPair> {
        let pair = Arc::new(SyncPair {
            mutex: IpcMutex {
                raw: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
            condvar: IpcCondvar {
                raw: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            },
        });
        unsafe {
            IpcMutex::init_at(&pair.mutex as *const _ as *mut IpcMutex).unwrap();
            IpcCondvar::init_at(&pair.condvar as *const _ as *mut IpcCondvar).unwrap();
        }
        pair
    }

    #[test]
    fn test_mutex_mutual_exclusion() {
        let pair = make_pair();
        let counter = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let pair = Arc::clone(&pair);
            let counter = Arc::clone(&counter);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = pair.mutex.lock().unwrap();
                    let v = counter.load(Ordering::Relaxed);
                    counter.store(v + 1, Ordering::Relaxed);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 4000);
    }

    #[test]
    fn test_timed_wait_times_out() {
        let pair = make_pair();
        let guard = pair.mutex.lock().unwrap();
        let start = Instant::now();
        let (_guard, met) = pair
            .condvar
            .wait_timeout_while(guard, Duration::from_millis(50), || false)
            .unwrap();
        assert!(!met);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn test_notify_wakes_waiter() {
        let pair = make_pair();
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let pair = Arc::clone(&pair);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                let guard = pair.mutex.lock().unwrap();
                let (_guard, met) = pair
                    .condvar
                    .wait_timeout_while(guard, Duration::from_secs(5), || {
                        flag.load(Ordering::Acquire)
                    })
                    .unwrap();
                met
            })
        };

        thread::sleep(Duration::from_millis(20));
        {
            let _guard = pair.mutex.lock().unwrap();
            flag.store(true, Ordering::Release);
        }
        pair.condvar.notify_all();

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_predicate_checked_before_waiting() {
        let pair = make_pair();
        let guard = pair.mutex.lock().unwrap();
        let (_guard, met) = pair
            .condvar
            .wait_timeout_while(guard, Duration::from_secs(5), || true)
            .unwrap();
        assert!(met);
    }
}
