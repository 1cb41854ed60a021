use parking_lot::Mutex;
use std::fs;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the process heap-usage reading used for admission control.
/// Injected so tests and other platforms can substitute the procfs reader.
pub trait MemoryProbe: Send + Sync {
    /// Current heap allocation of this process in bytes, or `None` when no
    /// reading is available.
    fn heap_alloc_bytes(&self) -> Option<u64>;
}

/// Reads resident set size (`VmRSS`) from `/proc/self/status`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn heap_alloc_bytes(&self) -> Option<u64> {
        let status = fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss_kb(&status).map(|kb| kb * 1024)
    }
}

fn parse_vm_rss_kb(status: &str) -> Option<u64> {
    status.lines().find_map(|line| {
        line.strip_prefix("VmRSS:")?
            .split_whitespace()
            .next()?
            .parse::<u64>()
            .ok()
    })
}

#[derive(Debug, Clone, Copy)]
struct MemSnapshot {
    heap_alloc_bytes: u64,
    refreshed_at: Instant,
}

/// Cached memory snapshot, refreshed from the probe at most once per TTL.
/// Admission checks read the cache; staleness within the TTL is tolerated
/// so the hot insert path never pays for a procfs read.
pub(crate) struct MemGauge {
    probe: Arc<dyn MemoryProbe>,
    ttl: Duration,
    snapshot: Mutex<Option<MemSnapshot>>,
}

impl MemGauge {
    pub(crate) fn new(probe: Arc<dyn MemoryProbe>, ttl: Duration) -> Self {
        Self {
            probe,
            ttl,
            snapshot: Mutex::new(None),
        }
    }

    /// Cached heap allocation in bytes, refreshing first if the snapshot is
    /// missing or older than the TTL. `None` means the probe has no reading.
    pub(crate) fn heap_alloc_bytes(&self) -> Option<u64> {
        let mut snapshot = self.snapshot.lock();

        let stale = snapshot.is_none_or(|s| s.refreshed_at.elapsed() >= self.ttl);
        if stale {
            *snapshot = self.probe.heap_alloc_bytes().map(|heap_alloc_bytes| MemSnapshot {
                heap_alloc_bytes,
                refreshed_at: Instant::now(),
            });
        }

        snapshot.map(|s| s.heap_alloc_bytes)
    }
}
