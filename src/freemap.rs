//! Free-sector bitmap.
//!
//! One bit per disk sector, set while the sector is in use. The bitmap is
//! held in memory while the file system is mounted and persisted in a file
//! whose inode lives at `FREE_MAP_SECTOR`; `store` and `load` move it through
//! the ordinary inode layer. Sector 0 holds that inode and is marked in use
//! forever, which is what lets a zero sector pointer mean "absent" everywhere
//! else.

use std::sync::Arc;

use log::debug;

use crate::fs::FsInner;
use crate::inode;
use crate::param::{FREE_MAP_SECTOR, ROOT_DIR_SECTOR};

pub(crate) struct FreeMap {
    inner: spin::Mutex<FreeMapInner>,
}

struct FreeMapInner {
    bits: Vec<u8>,
    sectors: u32,
    loaded: bool,
}

impl FreeMap {
    pub(crate) fn new(sectors: u32) -> Self {
        Self {
            inner: spin::Mutex::new(FreeMapInner {
                bits: Vec::new(),
                sectors,
                loaded: false,
            }),
        }
    }

    /// Bytes the bitmap occupies when serialized.
    pub(crate) fn len_bytes(&self) -> usize {
        let inner = self.inner.lock();
        (inner.sectors as usize + 7) / 8
    }

    /// Start from a fresh bitmap with only the free map's own inode sector
    /// and the root directory sector in use.
    pub(crate) fn format(&self) {
        let mut inner = self.inner.lock();
        let len = (inner.sectors as usize + 7) / 8;
        inner.bits = vec![0; len];
        inner.loaded = true;
        inner.mark(FREE_MAP_SECTOR);
        inner.mark(ROOT_DIR_SECTOR);
    }

    /// Claim a free sector, or `None` when the disk is full. Sector 0 is
    /// never handed out.
    pub(crate) fn allocate(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        debug_assert!(inner.loaded, "free map used before load");
        for sector in 1..inner.sectors {
            let m = 1 << (sector % 8);
            if inner.bits[sector as usize / 8] & m == 0 {
                inner.bits[sector as usize / 8] |= m;
                return Some(sector);
            }
        }
        None
    }

    /// Return `sector` to the free pool.
    pub(crate) fn release(&self, sector: u32) {
        let mut inner = self.inner.lock();
        let m = 1 << (sector % 8);
        assert_ne!(
            inner.bits[sector as usize / 8] & m,
            0,
            "freeing free sector {}",
            sector
        );
        inner.bits[sector as usize / 8] &= !m;
    }

    /// Number of sectors currently free.
    pub(crate) fn free_count(&self) -> u32 {
        let inner = self.inner.lock();
        (0..inner.sectors)
            .filter(|s| inner.bits[*s as usize / 8] & (1 << (s % 8)) == 0)
            .count() as u32
    }

    fn snapshot(&self) -> Vec<u8> {
        self.inner.lock().bits.clone()
    }

    fn install(&self, bits: Vec<u8>) {
        let mut inner = self.inner.lock();
        assert_eq!(bits.len(), (inner.sectors as usize + 7) / 8);
        inner.bits = bits;
        inner.loaded = true;
    }
}

impl FreeMapInner {
    fn mark(&mut self, sector: u32) {
        self.bits[sector as usize / 8] |= 1 << (sector % 8);
    }
}

/// Write the bitmap into its backing file. A first pass of zero bytes forces
/// every data sector of the file to be materialized, so the snapshot written
/// by the second pass already accounts for the file's own sectors.
pub(crate) fn store(fs: &Arc<FsInner>) {
    let len = fs.freemap.len_bytes();
    let file = inode::open(fs, FREE_MAP_SECTOR);
    let zeros = vec![0u8; len];
    let written = file.write_at(&zeros, 0);
    assert_eq!(written, len, "free map store");
    let snapshot = fs.freemap.snapshot();
    let written = file.write_at(&snapshot, 0);
    assert_eq!(written, len, "free map store");
    debug!("freemap: stored, {} sectors free", fs.freemap.free_count());
}

/// Read the bitmap back from its backing file.
pub(crate) fn load(fs: &Arc<FsInner>) {
    let len = fs.freemap.len_bytes();
    let mut bits = vec![0u8; len];
    let file = inode::open(fs, FREE_MAP_SECTOR);
    let read = file.read_at(&mut bits, 0);
    assert_eq!(read, len, "free map truncated");
    fs.freemap.install(bits);
    debug!("freemap: loaded, {} sectors free", fs.freemap.free_count());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_reserves_metadata_sectors() {
        let map = FreeMap::new(64);
        map.format();
        assert_eq!(map.free_count(), 62);
        // First-fit allocation starts right after the reserved sectors.
        assert_eq!(map.allocate(), Some(2));
        assert_eq!(map.allocate(), Some(3));
        map.release(2);
        assert_eq!(map.allocate(), Some(2));
        assert_eq!(map.free_count(), 60);
    }

    #[test]
    fn exhaustion_returns_none() {
        let map = FreeMap::new(10);
        map.format();
        for _ in 0..8 {
            assert!(map.allocate().is_some());
        }
        assert_eq!(map.allocate(), None);
    }

    #[test]
    #[should_panic(expected = "freeing free sector")]
    fn double_release_panics() {
        let map = FreeMap::new(16);
        map.format();
        let s = map.allocate().unwrap();
        map.release(s);
        map.release(s);
    }
}
