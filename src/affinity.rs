//! CPU core pinning for capture and processing threads.

use crate::error::{Error, Result};

/// Pin the calling thread to a single CPU core.
///
/// Continuous multi-gigabit ingest is sensitive to the capture thread
/// migrating between cores; pinning keeps its cache and NUMA placement
/// stable.
pub fn bind_to_core(core: usize) -> Result<()> {
    // SAFETY: cpu_set_t is plain data; sched_setaffinity only reads it.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        if core >= libc::CPU_SETSIZE as usize {
            return Err(Error::InvalidArgument(format!(
                "core {core} out of range (max {})",
                libc::CPU_SETSIZE - 1
            )));
        }
        libc::CPU_SET(core, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
    }
    tracing::debug!(core, "thread pinned");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_rejects_absurd_core() {
        assert!(bind_to_core(usize::MAX).is_err());
    }

    #[test]
    fn test_bind_to_core_zero() {
        // Core 0 can be masked out of a constrained cpuset, so only log
        // a failure here.
        if let Err(e) = bind_to_core(0) {
            eprintln!("core 0 not available: {e}");
        }
    }
}
