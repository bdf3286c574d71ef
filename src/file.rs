//! File handles.
//!
//! A `File` couples an open inode with a position and composes the inode
//! operations into the usual sequential interface. Handles on the same
//! underlying file share the inode but keep independent positions.

use crate::inode::Inode;

pub struct File {
    inode: Inode,
    pos: u64,
    denied: bool,
}

impl File {
    pub(crate) fn new(inode: Inode) -> Self {
        Self {
            inode,
            pos: 0,
            denied: false,
        }
    }

    /// Read from the current position, advancing it by the bytes read.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let read = self.inode.read_at(buf, self.pos);
        self.pos += read as u64;
        read
    }

    /// Write at the current position, advancing it by the bytes written.
    pub fn write(&mut self, buf: &[u8]) -> usize {
        let written = self.inode.write_at(buf, self.pos);
        self.pos += written as u64;
        written
    }

    /// Read at an explicit offset without moving the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> usize {
        self.inode.read_at(buf, offset)
    }

    /// Write at an explicit offset without moving the position.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> usize {
        self.inode.write_at(buf, offset)
    }

    pub fn length(&self) -> u64 {
        self.inode.length()
    }

    pub fn seek(&mut self, pos: u64) {
        self.pos = pos;
    }

    pub fn tell(&self) -> u64 {
        self.pos
    }

    /// Block writes to the underlying inode through any handle. Idempotent
    /// per handle; undone by `allow_write` or by dropping this handle.
    pub fn deny_write(&mut self) {
        if !self.denied {
            self.denied = true;
            self.inode.deny_write();
        }
    }

    /// Withdraw this handle's write denial.
    pub fn allow_write(&mut self) {
        if self.denied {
            self.denied = false;
            self.inode.allow_write();
        }
    }

    /// A fresh handle on the same file, with its own position at 0.
    pub fn reopen(&self) -> File {
        File::new(self.inode.reopen())
    }

    pub fn inode(&self) -> &Inode {
        &self.inode
    }
}

impl Drop for File {
    fn drop(&mut self) {
        self.allow_write();
    }
}
