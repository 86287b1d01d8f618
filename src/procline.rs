//! Best-effort process-title updates.
//!
//! The master advances through the phases `(initialized)`, `(starting)`,
//! `(started)`, `managing <pids>` and `(shutting down)` so operators can read
//! the pool state out of `ps`. `PR_SET_NAME` caps the title at 15 bytes, so
//! long pid lists are truncated; the full phase is also emitted at trace
//! level.

/// Update the process title to `respool <phase>`.
pub fn set(phase: &str) {
    tracing::trace!(phase, "procline");

    #[cfg(target_os = "linux")]
    {
        let title = format!("respool {phase}");
        let mut bytes = title.into_bytes();
        bytes.truncate(15);
        if let Ok(name) = std::ffi::CString::new(bytes) {
            // SAFETY: name is NUL-terminated and outlives the call
            unsafe {
                libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0);
            }
        }
    }
}
