//! CPU affinity for pinned workers.
//!
//! Pinning is applied once at worker-thread startup and never renegotiated.
//! Only Linux is supported; elsewhere the request is logged and ignored.

#[cfg(target_os = "linux")]
use tracing::debug;
use tracing::warn;

/// Pins the calling thread to `core`.
///
/// Returns `true` if the pin took effect.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(core: usize) -> bool {
    // CPU_SET indexes past the fixed-size bitmask for out-of-range cores.
    if core >= libc::CPU_SETSIZE as usize {
        warn!(
            core,
            max = libc::CPU_SETSIZE,
            "core outside cpu_set_t range, continuing unpinned"
        );
        return false;
    }

    // SAFETY: cpu_set_t is a plain bitmask struct; zeroed is a valid empty
    // set, and `core` is in range per the check above.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core, &mut set);

        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc == 0 {
            debug!(core, "thread pinned");
            true
        } else {
            warn!(
                core,
                errno = *libc::__errno_location(),
                "sched_setaffinity failed, continuing unpinned"
            );
            false
        }
    }
}

/// Pinning is not supported on this platform; logs and continues.
#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(core: usize) -> bool {
    warn!(core, "CPU pinning not supported on this platform");
    false
}
