//! Buffer cache.
//!
//! The buffer cache is a bounded pool of in-memory copies of disk sectors,
//! kept in most-recently-used order. Caching sectors in memory reduces the
//! number of device transfers and provides a synchronization point for
//! sectors used by multiple threads.
//!
//! Interface:
//! * To copy bytes out of a sector, call `read`.
//! * To copy bytes into a sector, call `write`; the entry becomes dirty and
//!   is written back to the device no earlier than eviction or `flush_all`.
//! * For a sector that was just allocated and has no meaningful content on
//!   disk, call `create`; the entry starts as all zero bytes and no device
//!   read is issued.
//! * When the underlying sector is freed, call `remove` to drop the entry
//!   without writing it back.
//!
//! Every operation takes the cache-wide lock for its whole duration, device
//! I/O included, so a hit never races with an eviction of the same entry.
//! A hit never issues device I/O.

use std::sync::Arc;

use arrayvec::ArrayVec;
use log::{debug, warn};

use crate::device::BlockDevice;
use crate::param::{CACHE_MAX, SECTOR_SIZE};

struct CacheEntry {
    sector: u32,
    /// In-memory copy has diverged from disk.
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

impl CacheEntry {
    fn new(sector: u32) -> Box<Self> {
        Box::new(Self {
            sector,
            dirty: false,
            data: [0; SECTOR_SIZE],
        })
    }
}

/// Entries ordered most-recently-used first. The `ArrayVec` capacity is the
/// cache bound: admission of a 65th entry evicts the eldest.
type Entries = ArrayVec<Box<CacheEntry>, CACHE_MAX>;

pub(crate) struct BufCache {
    dev: Arc<dyn BlockDevice>,
    entries: spin::Mutex<Entries>,
}

impl BufCache {
    pub(crate) fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: spin::Mutex::new(ArrayVec::new()),
        }
    }

    /// Copy `dest.len()` bytes out of sector `sector` starting at `offset`.
    /// Admits the sector (reading it from the device) on a miss.
    pub(crate) fn read(&self, sector: u32, dest: &mut [u8], offset: usize) {
        assert!(offset + dest.len() <= SECTOR_SIZE);
        if dest.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        self.admit(&mut entries, sector, true);
        dest.copy_from_slice(&entries[0].data[offset..offset + dest.len()]);
    }

    /// Copy `src` into sector `sector` starting at `offset` and mark the
    /// entry dirty. Admits the sector on a miss, reading the device so the
    /// bytes around the write survive.
    pub(crate) fn write(&self, sector: u32, src: &[u8], offset: usize) {
        assert!(offset + src.len() <= SECTOR_SIZE);
        if src.is_empty() {
            return;
        }
        let mut entries = self.entries.lock();
        self.admit(&mut entries, sector, true);
        let entry = &mut entries[0];
        entry.data[offset..offset + src.len()].copy_from_slice(src);
        entry.dirty = true;
    }

    /// Admit a freshly allocated sector without reading the device; its
    /// content is all zero bytes. Creating a sector that is already cached
    /// is recovered by clearing the entry's dirty flag.
    pub(crate) fn create(&self, sector: u32) {
        let mut entries = self.entries.lock();
        if let Some(i) = position(&entries, sector) {
            warn!("bio: create of cached sector {}", sector);
            entries[i].dirty = false;
            return;
        }
        if entries.is_full() {
            self.evict(&mut entries);
        }
        entries.insert(0, CacheEntry::new(sector));
    }

    /// Drop the entry for `sector` without writing it back. No-op when the
    /// sector is not cached.
    pub(crate) fn remove(&self, sector: u32) {
        let mut entries = self.entries.lock();
        if let Some(i) = position(&entries, sector) {
            entries.remove(i);
        }
    }

    /// Write every dirty entry back to the device. Membership and recency
    /// order are unchanged.
    pub(crate) fn flush_all(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter_mut() {
            if entry.dirty {
                self.dev.write_sector(entry.sector, &entry.data);
                entry.dirty = false;
            }
        }
    }

    /// Flush dirty entries and drop everything.
    pub(crate) fn shutdown(&self) {
        let mut entries = self.entries.lock();
        for entry in entries.iter() {
            if entry.dirty {
                self.dev.write_sector(entry.sector, &entry.data);
            }
        }
        entries.clear();
    }

    /// Make `sector` the most-recently-used entry, admitting it first when
    /// absent. `populate` selects whether a miss reads the device or starts
    /// from zero bytes.
    fn admit(&self, entries: &mut Entries, sector: u32, populate: bool) {
        if let Some(i) = position(entries, sector) {
            let entry = entries.remove(i);
            entries.insert(0, entry);
            return;
        }
        if entries.is_full() {
            self.evict(entries);
        }
        let mut entry = CacheEntry::new(sector);
        if populate {
            self.dev.read_sector(sector, &mut entry.data);
        }
        entries.insert(0, entry);
    }

    /// Drop the least-recently-used entry, writing it back first if dirty.
    fn evict(&self, entries: &mut Entries) {
        let victim = entries.pop().expect("evict: empty cache");
        if victim.dirty {
            self.dev.write_sector(victim.sector, &victim.data);
        }
        debug!("bio: evicted sector {}", victim.sector);
    }

    #[cfg(test)]
    fn cached_sectors(&self) -> Vec<u32> {
        self.entries.lock().iter().map(|e| e.sector).collect()
    }
}

fn position(entries: &Entries, sector: u32) -> Option<usize> {
    entries.iter().position(|e| e.sector == sector)
}
