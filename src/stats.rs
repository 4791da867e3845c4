use core::sync::atomic::{AtomicI64, Ordering};

// Diagnostic counters for OS-level mappings. These are advisory numbers
// kept with relaxed atomics, not a correctness feature; the shutdown
// tests use them to observe that every mapping was returned.
pub struct StatCount {
    current: AtomicI64,
    peak: AtomicI64,
    total: AtomicI64,
}

impl StatCount {
    pub const fn new() -> StatCount {
        StatCount {
            current: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            total: AtomicI64::new(0),
        }
    }

    pub fn increase(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        self.total.fetch_add(amount, Ordering::Relaxed);
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);
    }

    pub fn decrease(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        self.current.fetch_sub(amount, Ordering::Relaxed);
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

// Bytes and distinct ranges currently mapped from the OS.
pub static MAPPED_BYTES: StatCount = StatCount::new();
pub static MAPPED_RANGES: StatCount = StatCount::new();

/// Bytes currently mapped from the OS, including alignment padding.
pub fn mapped_bytes() -> usize {
    MAPPED_BYTES.current().max(0) as usize
}

/// Peak of [`mapped_bytes`] over the life of the process.
pub fn mapped_bytes_peak() -> usize {
    MAPPED_BYTES.peak().max(0) as usize
}

/// Number of distinct OS mappings currently held.
pub fn mapped_ranges() -> usize {
    MAPPED_RANGES.current().max(0) as usize
}
