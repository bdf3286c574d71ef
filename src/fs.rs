//! File-system lifecycle and namespace operations.
//!
//! `FileSys` owns the pieces every operation needs: the buffer cache over
//! the block device, the open-inode table, and the free-sector map. Path
//! operations canonicalize their argument, walk the components from the
//! root directory, and hand the last step to the directory layer.

use std::sync::Arc;
use std::thread;

use log::{debug, info};

use crate::bio::BufCache;
use crate::device::BlockDevice;
use crate::dir::{self, Dir};
use crate::file::File;
use crate::freemap::{self, FreeMap};
use crate::inode::{self, Inode, Itable};
use crate::param::{DIRSIZ, FREE_MAP_SECTOR, MAX_FILE_SIZE, ROOT_DIR_SECTOR};
use crate::path;
use crate::FsError;

pub(crate) struct FsInner {
    pub(crate) cache: BufCache,
    pub(crate) itable: Itable,
    pub(crate) freemap: FreeMap,
}

/// A mounted file system.
pub struct FileSys {
    inner: Arc<FsInner>,
}

impl FileSys {
    /// Mount the file system on `dev`. With `format` set, lay down a fresh
    /// image first: an empty free map backed by the file at sector 0 and an
    /// empty root directory at sector 1.
    pub fn new(dev: Arc<dyn BlockDevice>, format: bool) -> FileSys {
        let sectors = dev.sector_count();
        assert!(sectors >= 8, "device too small for a file system");
        let inner = Arc::new(FsInner {
            cache: BufCache::new(dev),
            itable: Itable::new(),
            freemap: FreeMap::new(sectors),
        });
        if format {
            info!("fs: formatting, {} sectors", sectors);
            inner.freemap.format();
            inode::create(&inner, FREE_MAP_SECTOR, inner.freemap.len_bytes() as u64, false);
            dir::create(&inner, ROOT_DIR_SECTOR, ROOT_DIR_SECTOR);
            freemap::store(&inner);
        } else {
            freemap::load(&inner);
        }
        FileSys { inner }
    }

    /// Push all pending state to the device: the free map through the inode
    /// layer, then every dirty cache entry.
    pub fn flush(&self) {
        freemap::store(&self.inner);
        self.inner.cache.flush_all();
    }

    /// Unmount. Equivalent to dropping the handle; flushing happens either
    /// way.
    pub fn shutdown(self) {}

    /// Create a file of `initial_size` bytes at `name`. The size only sets
    /// the length; data sectors appear when they are first touched.
    pub fn create(&self, name: &str, initial_size: u64) -> Result<(), FsError> {
        if initial_size > MAX_FILE_SIZE as u64 {
            return Err(FsError::TooLarge);
        }
        self.make(name, false, initial_size)
    }

    /// Create an empty directory at `name`.
    pub fn create_dir(&self, name: &str) -> Result<(), FsError> {
        self.make(name, true, 0)
    }

    /// Remove the file or empty directory at `name`. Sectors are reclaimed
    /// once the last open handle on it is dropped.
    pub fn remove(&self, name: &str) -> Result<(), FsError> {
        let path = path::absolute(name).ok_or(FsError::InvalidPath)?;
        let parts = path::tokenize(&path);
        let (last, parents) = parts.split_last().ok_or(FsError::InvalidPath)?;
        let parent = Dir::open(self.resolve(parents)?)?;
        parent.remove(last)
    }

    /// Open the file at `name`. Directories are refused; use `open_dir`.
    pub fn open(&self, name: &str) -> Result<File, FsError> {
        let inode = self.open_inode(name)?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory);
        }
        Ok(File::new(inode))
    }

    /// Open the directory at `name`.
    pub fn open_dir(&self, name: &str) -> Result<Dir, FsError> {
        Dir::open(self.open_inode(name)?)
    }

    /// Resolve `name` to its inode, whatever its kind.
    pub fn open_inode(&self, name: &str) -> Result<Inode, FsError> {
        let path = path::absolute(name).ok_or(FsError::InvalidPath)?;
        self.resolve(&path::tokenize(&path))
    }

    /// Number of free sectors on the device.
    pub fn free_sectors(&self) -> u32 {
        self.inner.freemap.free_count()
    }

    pub(crate) fn inner(&self) -> &Arc<FsInner> {
        &self.inner
    }

    /// Walk `parts` from the root. An empty walk is the root itself; every
    /// interior component must name a directory.
    fn resolve(&self, parts: &[String]) -> Result<Inode, FsError> {
        let mut cur = inode::open(&self.inner, ROOT_DIR_SECTOR);
        for part in parts {
            let dir = Dir::open(cur)?;
            cur = dir.lookup(part).ok_or(FsError::NotFound)?;
        }
        Ok(cur)
    }

    fn make(&self, name: &str, is_dir: bool, initial_size: u64) -> Result<(), FsError> {
        let path = path::absolute(name).ok_or(FsError::InvalidPath)?;
        let parts = path::tokenize(&path);
        let (last, parents) = parts.split_last().ok_or(FsError::InvalidPath)?;
        if last.len() > DIRSIZ {
            return Err(FsError::InvalidPath);
        }
        let parent = Dir::open(self.resolve(parents)?)?;

        let fs = &self.inner;
        let sector = fs.freemap.allocate().expect("free map exhausted");
        // Undo the speculative inode (and anything it already indexes) if
        // the directory refuses the name.
        let sector = scopeguard::guard(sector, move |sector| {
            debug!("fs: create of {} failed, releasing sector {}", name, sector);
            inode::discard(fs, sector);
        });
        if is_dir {
            dir::create(&self.inner, *sector, parent.inumber());
        } else {
            inode::create(&self.inner, *sector, initial_size, false);
        }
        parent.add(last, *sector)?;
        let _ = scopeguard::ScopeGuard::into_inner(sector);
        Ok(())
    }
}

impl Drop for FileSys {
    fn drop(&mut self) {
        if thread::panicking() {
            return;
        }
        freemap::store(&self.inner);
        self.inner.cache.shutdown();
        debug!("fs: unmounted");
    }
}
