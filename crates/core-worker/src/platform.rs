//! CPU affinity.
//!
//! Workers, streamer threads and the master are pinned to a contiguous core
//! range starting at `core_offset`; nothing migrates after startup. Thread
//! pinning has no safe or portable stdlib equivalent, so the Linux path goes
//! through `pthread_setaffinity_np`. Elsewhere pinning degrades to a logged
//! no-op, which only costs determinism of cache placement.

use anyhow::{Result, bail};

#[cfg(target_os = "linux")]
pub fn pin_current_thread(core_id: usize) -> Result<()> {
    // SAFETY: cpu_set_t is a plain bitset; pthread_self is the calling
    // thread. The call mutates only the zeroed set on our stack.
    let rc = unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(core_id, &mut set);
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };
    if rc != 0 {
        bail!("pin to core {core_id} failed: errno {rc}");
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(core_id: usize) -> Result<()> {
    tracing::debug!(target: "worker", core_id, "thread pinning unavailable on this platform");
    Ok(())
}

/// Pin if possible; pinning failure (e.g. constrained cpuset in CI) is
/// logged, not fatal.
pub fn pin_or_warn(core_id: usize, role: &str) {
    if let Err(e) = pin_current_thread(core_id) {
        tracing::warn!(target: "worker", core_id, role, error = %e, "running unpinned");
    }
}
