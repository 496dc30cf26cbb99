//! Platform-specific thread ID retrieval.

/// Current thread id as an opaque u64.
///
/// Used only to label trace lines; two lines carry the same id iff they were
/// produced by the same thread.
#[cfg(unix)]
#[inline]
pub fn id() -> u64 {
    unsafe { libc::pthread_self() as u64 }
}

#[cfg(not(unix))]
pub fn id() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|v| *v)
}

/// Hex form used in the trace prefix: zero-padded to 8 digits when the id
/// fits in 32 bits, 16 digits otherwise.
pub fn hex_id(tid: u64) -> String {
    if tid <= u64::from(u32::MAX) {
        format!("{:08x}", tid)
    } else {
        format!("{:016x}", tid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_is_consistent() {
        assert_eq!(id(), id());
    }

    #[test]
    fn test_hex_id_width() {
        assert_eq!(hex_id(0x1a), "0000001a");
        assert_eq!(hex_id(0xdead_beef), "deadbeef");
        assert_eq!(hex_id(0x1_0000_0000), "0000000100000000");
    }
}
