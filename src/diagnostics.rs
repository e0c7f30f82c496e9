//! Optional allocation-tracking side map, compiled in only under the
//! `diagnostics` feature so release builds pay nothing for it.
//!
//! Backed by `dashmap` rather than a single-writer-locked map: allocations
//! and frees happen from arbitrary threads and the sharded map avoids
//! turning this bolt-on diagnostic into a new point of contention on the
//! allocator's hot path.

use dashmap::DashMap;

/// Maps a live cell's address to the source location that allocated it.
#[derive(Debug, Default)]
pub struct RecordMap {
    inner: DashMap<usize, &'static str>,
}

impl RecordMap {
    pub fn new() -> Self {
        Self { inner: DashMap::new() }
    }

    pub fn record(&self, addr: usize, site: &'static str) {
        self.inner.insert(addr, site);
    }

    pub fn erase(&self, addr: usize) {
        self.inner.remove(&addr);
    }

    pub fn clear(&self) {
        self.inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Every still-live allocation site, for leak dumps.
    pub fn live_sites(&self) -> Vec<&'static str> {
        self.inner.iter().map(|e| *e.value()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_and_erases() {
        let map = RecordMap::new();
        map.record(0x1000, "src/bucket.rs:1");
        assert_eq!(map.len(), 1);
        map.erase(0x1000);
        assert!(map.is_empty());
    }

    #[test]
    fn live_sites_reflects_current_contents() {
        let map = RecordMap::new();
        map.record(0x1000, "a");
        map.record(0x2000, "b");
        let mut sites = map.live_sites();
        sites.sort_unstable();
        assert_eq!(sites, vec!["a", "b"]);
    }
}
