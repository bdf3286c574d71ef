//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! structure occupies exactly one sector and indexes the object's data
//! through 12 direct sector pointers, one single-indirect pointer, and one
//! double-indirect pointer. A pointer value of 0 means the sector has never
//! been materialized: such holes read as zero bytes and consume no disk
//! space until something touches them, at which point the index walk
//! allocates the missing level and registers a zeroed cache entry for it.
//!
//! The open-inode table maps a sector id to the single shared in-memory
//! inode for that sector, so opening the same sector twice yields the same
//! object. The in-memory inode carries book-keeping that never reaches the
//! disk: the number of openers, a deferred-removal flag, and the count of
//! handles currently denying writes. Dropping the last handle de-registers
//! the inode and, when removal was requested, walks the whole pointer tree
//! returning every sector to the free map and purging it from the cache.
//!
//! The table's lock doubles as the inode-layer lock: it serializes whole
//! `read_at`/`write_at` calls and every allocate-and-link step of the index
//! walk, so two writers cannot race a hole into double allocation. Lock
//! order is inode table first, then free map or buffer cache; never the
//! reverse.

use std::convert::TryInto;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use log::debug;
use spin::MutexGuard;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::FsInner;
use crate::param::{
    INODE_MAGIC, MAX_FILE_SIZE, NDIRECT, NINDIRECT, SECTOR_SIZE,
};

/// On-disk inode. Host byte order; the rest of the sector is unused padding
/// and stays zero.
#[repr(C)]
#[derive(Clone, AsBytes, FromBytes)]
struct DiskInode {
    /// Object length in bytes.
    length: i64,
    /// Nonzero for directories.
    is_dir: u32,
    /// Direct data sector pointers.
    direct: [u32; NDIRECT],
    /// Single-indirect sector pointer.
    indirect: u32,
    /// Double-indirect sector pointer.
    double_indirect: u32,
    /// Must be `INODE_MAGIC`.
    magic: u32,
}

const_assert!(core::mem::size_of::<DiskInode>() <= SECTOR_SIZE);

// Byte offsets of the pointer slots inside the inode sector; the index walk
// patches single slots in place through the cache.
const DIRECT_OFFSET: usize = 12;
const INDIRECT_OFFSET: usize = DIRECT_OFFSET + 4 * NDIRECT;
const DOUBLE_INDIRECT_OFFSET: usize = INDIRECT_OFFSET + 4;

const_assert!(DOUBLE_INDIRECT_OFFSET + 8 == core::mem::size_of::<DiskInode>());

impl DiskInode {
    fn zeroed() -> Self {
        Self {
            length: 0,
            is_dir: 0,
            direct: [0; NDIRECT],
            indirect: 0,
            double_indirect: 0,
            magic: 0,
        }
    }
}

/// Shared in-memory inode. All fields except `sector` are guarded by the
/// open-inode table lock; they are atomics only so the object is `Sync`.
pub(crate) struct InodeShared {
    sector: u32,
    open_count: AtomicI32,
    removed: AtomicBool,
    deny_write_count: AtomicI32,
}

pub(crate) struct Itable {
    inner: spin::Mutex<std::collections::HashMap<u32, Arc<InodeShared>>>,
}

impl Itable {
    pub(crate) fn new() -> Self {
        Self {
            inner: spin::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// The inode-layer lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, std::collections::HashMap<u32, Arc<InodeShared>>> {
        self.inner.lock()
    }
}

/// A handle on an open inode. Handles sharing a sector share one in-memory
/// inode; `reopen` (or `clone`) adds an opener and dropping removes one.
pub struct Inode {
    fs: Arc<FsInner>,
    ino: Arc<InodeShared>,
}

/// Open the inode stored at `sector`, joining the already-open object if
/// there is one.
pub(crate) fn open(fs: &Arc<FsInner>, sector: u32) -> Inode {
    let mut table = fs.itable.lock();
    let ino = match table.get(&sector) {
        Some(ino) => {
            ino.open_count.fetch_add(1, Ordering::Relaxed);
            Arc::clone(ino)
        }
        None => {
            let ino = Arc::new(InodeShared {
                sector,
                open_count: AtomicI32::new(1),
                removed: AtomicBool::new(false),
                deny_write_count: AtomicI32::new(0),
            });
            table.insert(sector, Arc::clone(&ino));
            ino
        }
    };
    drop(table);
    Inode {
        fs: Arc::clone(fs),
        ino,
    }
}

/// Throw away a staged but never-linked inode, returning its sectors to the
/// free map. Used to back out of a failed create.
pub(crate) fn discard(fs: &FsInner, sector: u32) {
    let _table = fs.itable.lock();
    release_blocks(fs, sector);
}

/// Initialize an on-disk inode of `length` bytes at `sector` and stage it in
/// the cache. No data sectors are materialized; they appear on first touch.
pub(crate) fn create(fs: &FsInner, sector: u32, length: u64, is_dir: bool) {
    assert!(length as usize <= MAX_FILE_SIZE);
    let _table = fs.itable.lock();
    fs.cache.create(sector);
    let mut di = DiskInode::zeroed();
    di.length = length as i64;
    di.is_dir = is_dir as u32;
    di.magic = INODE_MAGIC;
    write_disk_inode(fs, sector, &di);
}

impl Inode {
    pub(crate) fn fs(&self) -> &Arc<FsInner> {
        &self.fs
    }

    /// Sector id of the inode block.
    pub fn inumber(&self) -> u32 {
        self.ino.sector
    }

    pub fn is_dir(&self) -> bool {
        let _table = self.fs.itable.lock();
        read_disk_inode(&self.fs, self.ino.sector).is_dir != 0
    }

    /// Object length in bytes.
    pub fn length(&self) -> u64 {
        let _table = self.fs.itable.lock();
        read_disk_inode(&self.fs, self.ino.sector).length as u64
    }

    /// Add an opener and return a new handle on the same inode.
    pub fn reopen(&self) -> Inode {
        let _table = self.fs.itable.lock();
        self.ino.open_count.fetch_add(1, Ordering::Relaxed);
        Inode {
            fs: Arc::clone(&self.fs),
            ino: Arc::clone(&self.ino),
        }
    }

    /// Mark the inode for deletion once the last opener lets go. The object
    /// stays fully usable through existing handles until then.
    pub fn remove(&self) {
        let _table = self.fs.itable.lock();
        self.ino.removed.store(true, Ordering::Relaxed);
    }

    /// Disable writes through any handle. Must be balanced by `allow_write`
    /// before this opener closes.
    pub fn deny_write(&self) {
        let _table = self.fs.itable.lock();
        let denials = self.ino.deny_write_count.fetch_add(1, Ordering::Relaxed) + 1;
        assert!(denials <= self.ino.open_count.load(Ordering::Relaxed));
    }

    /// Re-enable writes previously denied by this opener.
    pub fn allow_write(&self) {
        let _table = self.fs.itable.lock();
        let denials = self.ino.deny_write_count.fetch_sub(1, Ordering::Relaxed);
        assert!(denials > 0);
    }

    /// Read up to `buf.len()` bytes starting at byte `offset`. Returns the
    /// number of bytes read, which is short when the read runs off the end
    /// of the object.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        let _table = self.fs.itable.lock();
        let length = read_disk_inode(&self.fs, self.ino.sector).length as u64;
        let mut done = 0;
        while done < buf.len() {
            let pos = offset + done as u64;
            let sector = match byte_to_sector(&self.fs, self.ino.sector, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (buf.len() - done)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_off);
            if chunk == 0 {
                break;
            }
            self.fs.cache.read(sector, &mut buf[done..done + chunk], sector_off);
            done += chunk;
        }
        done
    }

    /// Write `buf` starting at byte `offset`, extending the object as
    /// needed. Returns the number of bytes written: 0 while writes are
    /// denied, and short when the write would pass the maximum object size.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        let _table = self.fs.itable.lock();
        if self.ino.deny_write_count.load(Ordering::Relaxed) > 0 {
            return 0;
        }
        if offset >= MAX_FILE_SIZE as u64 {
            return 0;
        }
        let len = buf.len().min(MAX_FILE_SIZE - offset as usize);
        if len == 0 {
            return 0;
        }

        // Growth: publish the new length before the data lands, so the
        // per-sector writes below see every offset as in bounds.
        let mut di = read_disk_inode(&self.fs, self.ino.sector);
        let end = offset + len as u64;
        if end > di.length as u64 {
            di.length = end as i64;
            write_disk_inode(&self.fs, self.ino.sector, &di);
        }
        let length = di.length as u64;

        let mut done = 0;
        while done < len {
            let pos = offset + done as u64;
            let sector = match byte_to_sector(&self.fs, self.ino.sector, pos) {
                Some(sector) => sector,
                None => break,
            };
            let sector_off = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (len - done)
                .min((length - pos) as usize)
                .min(SECTOR_SIZE - sector_off);
            if chunk == 0 {
                break;
            }
            self.fs.cache.write(sector, &buf[done..done + chunk], sector_off);
            done += chunk;
        }
        done
    }
}

impl Clone for Inode {
    fn clone(&self) -> Self {
        self.reopen()
    }
}

impl Drop for Inode {
    /// Drop one opener. The last one out de-registers the inode and, when
    /// removal was requested, frees every sector it owns.
    fn drop(&mut self) {
        let mut table = self.fs.itable.lock();
        if self.ino.open_count.fetch_sub(1, Ordering::Relaxed) != 1 {
            return;
        }
        table.remove(&self.ino.sector);
        if self.ino.removed.load(Ordering::Relaxed) {
            debug!("inode: freeing removed inode {}", self.ino.sector);
            release_blocks(&self.fs, self.ino.sector);
        }
    }
}

/// Map byte offset `pos` inside the inode at `inode_sector` to the data
/// sector holding it, materializing absent index levels on the way down.
/// `None` when `pos` lies past the end of the object.
///
/// Must be called with the open-inode table lock held.
fn byte_to_sector(fs: &FsInner, inode_sector: u32, pos: u64) -> Option<u32> {
    let di = read_disk_inode(fs, inode_sector);
    if pos >= di.length as u64 {
        return None;
    }
    let index = (pos / SECTOR_SIZE as u64) as usize;
    let sector = if index < NDIRECT {
        load_or_alloc(fs, inode_sector, DIRECT_OFFSET + 4 * index)
    } else if index < NDIRECT + NINDIRECT {
        let single = load_or_alloc(fs, inode_sector, INDIRECT_OFFSET);
        load_or_alloc(fs, single, 4 * (index - NDIRECT))
    } else {
        let k = index - NDIRECT - NINDIRECT;
        let double = load_or_alloc(fs, inode_sector, DOUBLE_INDIRECT_OFFSET);
        let single = load_or_alloc(fs, double, 4 * (k / NINDIRECT));
        load_or_alloc(fs, single, 4 * (k % NINDIRECT))
    };
    Some(sector)
}

/// Load the sector pointer stored at byte `offset` of sector `block`. An
/// empty slot gets a fresh sector from the free map, the patched slot goes
/// back through the cache, and the new sector is staged as zero bytes.
fn load_or_alloc(fs: &FsInner, block: u32, offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    fs.cache.read(block, &mut raw, offset);
    let ptr = u32::from_ne_bytes(raw);
    if ptr != 0 {
        return ptr;
    }
    let fresh = fs.freemap.allocate().expect("out of disk sectors");
    fs.cache.write(block, &fresh.to_ne_bytes(), offset);
    fs.cache.create(fresh);
    fresh
}

fn read_disk_inode(fs: &FsInner, sector: u32) -> DiskInode {
    let mut di = DiskInode::zeroed();
    fs.cache.read(sector, di.as_bytes_mut(), 0);
    assert_eq!(di.magic, INODE_MAGIC, "inode {}: bad magic", sector);
    di
}

fn write_disk_inode(fs: &FsInner, sector: u32, di: &DiskInode) {
    fs.cache.write(sector, di.as_bytes(), 0);
}

/// Return every sector owned by the inode at `inode_sector` to the free map:
/// direct sectors, both indirect trees, and finally the inode sector itself.
/// Freed sectors are purged from the cache without write-back.
///
/// Must be called with the open-inode table lock held.
fn release_blocks(fs: &FsInner, inode_sector: u32) {
    let di = read_disk_inode(fs, inode_sector);
    for &sector in di.direct.iter() {
        if sector != 0 {
            free_sector(fs, sector);
        }
    }
    if di.indirect != 0 {
        release_indirect(fs, di.indirect);
    }
    if di.double_indirect != 0 {
        for sector in read_ptr_block(fs, di.double_indirect).iter() {
            if *sector != 0 {
                release_indirect(fs, *sector);
            }
        }
        free_sector(fs, di.double_indirect);
    }
    free_sector(fs, inode_sector);
}

fn release_indirect(fs: &FsInner, block: u32) {
    for sector in read_ptr_block(fs, block).iter() {
        if *sector != 0 {
            free_sector(fs, *sector);
        }
    }
    free_sector(fs, block);
}

fn free_sector(fs: &FsInner, sector: u32) {
    fs.freemap.release(sector);
    fs.cache.remove(sector);
}

fn read_ptr_block(fs: &FsInner, block: u32) -> [u32; NINDIRECT] {
    let mut raw = [0u8; SECTOR_SIZE];
    fs.cache.read(block, &mut raw, 0);
    let mut ptrs = [0u32; NINDIRECT];
    for (ptr, chunk) in ptrs.iter_mut().zip(raw.chunks_exact(4)) {
        *ptr = u32::from_ne_bytes(chunk.try_into().unwrap());
    }
    ptrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::{MAX_FILE_SIZE, ROOT_DIR_SECTOR};
    use crate::test_util::fresh_fs;

    #[test]
    fn disk_inode_layout_is_pinned() {
        let mut di = DiskInode::zeroed();
        di.length = 0x0102030405060708;
        di.direct[0] = 0xaabbccdd;
        di.indirect = 0x11111111;
        di.double_indirect = 0x22222222;
        di.magic = INODE_MAGIC;

        let bytes = di.as_bytes();
        assert_eq!(bytes.len(), 72);
        assert_eq!(
            u32::from_ne_bytes(bytes[DIRECT_OFFSET..DIRECT_OFFSET + 4].try_into().unwrap()),
            0xaabbccdd
        );
        assert_eq!(
            u32::from_ne_bytes(bytes[INDIRECT_OFFSET..INDIRECT_OFFSET + 4].try_into().unwrap()),
            0x11111111
        );
        assert_eq!(
            u32::from_ne_bytes(
                bytes[DOUBLE_INDIRECT_OFFSET..DOUBLE_INDIRECT_OFFSET + 4]
                    .try_into()
                    .unwrap()
            ),
            0x22222222
        );
    }

    #[test]
    fn open_shares_one_object() {
        let fs = fresh_fs();
        let a = open(fs.inner(), ROOT_DIR_SECTOR);
        let b = open(fs.inner(), ROOT_DIR_SECTOR);
        assert!(Arc::ptr_eq(&a.ino, &b.ino));
        assert_eq!(a.ino.open_count.load(Ordering::Relaxed), 2);

        drop(a);
        assert_eq!(b.ino.open_count.load(Ordering::Relaxed), 1);
        drop(b);
        assert!(fs.inner().itable.lock().is_empty());
    }

    #[test]
    fn read_after_write() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);

        assert_eq!(ino.write_at(b"hello", 0), 5);
        let mut out = [0u8; 5];
        assert_eq!(ino.read_at(&mut out, 0), 5);
        assert_eq!(&out, b"hello");
        assert_eq!(ino.length(), 5);
    }

    #[test]
    fn sparse_write_reads_back_zero_filled() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);

        assert_eq!(ino.write_at(b"X", 1000), 1);
        assert_eq!(ino.length(), 1001);

        let mut out = vec![0xffu8; 1001];
        assert_eq!(ino.read_at(&mut out, 0), 1001);
        assert!(out[..1000].iter().all(|b| *b == 0));
        assert_eq!(out[1000], b'X');
    }

    #[test]
    fn write_into_double_indirect_range() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);

        // First byte indexed through the double-indirect tree.
        let offset = ((NDIRECT + NINDIRECT) * SECTOR_SIZE) as u64;
        let pattern: Vec<u8> = (0..SECTOR_SIZE).map(|i| (i % 251) as u8).collect();
        assert_eq!(ino.write_at(&pattern, offset), SECTOR_SIZE);
        assert_eq!(ino.length(), offset + SECTOR_SIZE as u64);

        let mut out = vec![0u8; SECTOR_SIZE];
        assert_eq!(ino.read_at(&mut out, offset), SECTOR_SIZE);
        assert_eq!(out, pattern);
    }

    #[test]
    fn write_is_clipped_at_max_file_size() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);

        // A write ending exactly at the limit succeeds in full.
        let tail = (MAX_FILE_SIZE - SECTOR_SIZE) as u64;
        assert_eq!(ino.write_at(&[7u8; SECTOR_SIZE], tail), SECTOR_SIZE);
        assert_eq!(ino.length(), MAX_FILE_SIZE as u64);

        // Anything past the limit is clipped or rejected.
        assert_eq!(ino.write_at(&[7u8; 8], MAX_FILE_SIZE as u64), 0);
        assert_eq!(ino.write_at(&[7u8; 8], tail + SECTOR_SIZE as u64 - 4), 4);
    }

    #[test]
    fn deferred_removal_frees_blocks_on_last_close() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);
        assert_eq!(ino.write_at(&[1u8; 3 * SECTOR_SIZE], 0), 3 * SECTOR_SIZE);

        let free_before = fs.inner().freemap.free_count();
        let second = ino.reopen();
        ino.remove();
        drop(ino);

        // Still fully usable through the surviving handle.
        let mut out = [0u8; 4];
        assert_eq!(second.read_at(&mut out, 0), 4);
        assert_eq!(out, [1; 4]);
        assert_eq!(fs.inner().freemap.free_count(), free_before);

        drop(second);
        // Inode sector plus three data sectors returned.
        assert_eq!(fs.inner().freemap.free_count(), free_before + 4);
    }

    #[test]
    fn removal_frees_the_whole_pointer_tree() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let ino = open(fs.inner(), sector);

        // Touch a direct sector, an indirect sector, and a double-indirect
        // sector so all three levels have structure to tear down.
        assert_eq!(ino.write_at(&[1], 0), 1);
        assert_eq!(ino.write_at(&[2], (NDIRECT * SECTOR_SIZE) as u64), 1);
        assert_eq!(
            ino.write_at(&[3], ((NDIRECT + NINDIRECT) * SECTOR_SIZE) as u64),
            1
        );

        let free_before = fs.inner().freemap.free_count();
        ino.remove();
        drop(ino);

        // 3 data sectors + 1 indirect + (1 double-indirect + 1 nested
        // indirect) + the inode sector.
        assert_eq!(fs.inner().freemap.free_count(), free_before + 7);
    }

    #[test]
    fn deny_write_blocks_writers_until_allowed() {
        let fs = fresh_fs();
        let sector = fs.inner().freemap.allocate().unwrap();
        create(fs.inner(), sector, 0, false);
        let writer = open(fs.inner(), sector);
        let denier = writer.reopen();

        denier.deny_write();
        assert_eq!(writer.write_at(b"no", 0), 0);
        assert_eq!(writer.length(), 0);

        denier.allow_write();
        assert_eq!(writer.write_at(b"ok", 0), 2);
    }
}
