use std::{
    fs::File,
    path::{Path, PathBuf},
};

use log::debug;
use memmap2::MmapMut;

use crate::error::Error;

pub(crate) const OFF_WIDTH: u64 = 4;
pub(crate) const POS_WIDTH: u64 = 8;
/// Width of one index entry: a relative offset and a store position.
pub(crate) const ENT_WIDTH: u64 = OFF_WIDTH + POS_WIDTH;

/// The offset index of a segment.
///
/// A memory-mapped file of fixed 12-byte entries, each mapping a relative
/// offset (`absolute - segment base`) to the byte position of the record's
/// frame in the store. The file is pre-allocated to its configured maximum
/// so the mapping never has to grow; `size` tracks the in-use prefix.
///
/// On a clean close the file is truncated back to `size`, which is what
/// lets the next opener find the last entry by looking at the final 12
/// bytes of the file.
#[derive(Debug)]
pub(crate) struct Index {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
    /// Byte length of the in-use prefix. Mutation is serialized by the
    /// log's write lock; see `Segment::append`.
    size: u64,
}

impl Index {
    pub(crate) fn new(path: &Path, max_index_bytes: u64) -> Result<Self, Error> {
        if max_index_bytes < ENT_WIDTH {
            return Err(Error::IndexTooSmall(max_index_bytes));
        }

        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        // The length left behind by the previous clean close is the number
        // of bytes actually holding entries.
        let size = file.metadata()?.len();
        file.set_len(max_index_bytes)?;

        let mmap = unsafe { MmapMut::map_mut(&file) }?;

        Ok(Self {
            file,
            mmap,
            path: path.to_path_buf(),
            size,
        })
    }

    /// Read entry number `n`, or the last entry when `n == -1`.
    pub(crate) fn read(&self, n: i64) -> Result<(u32, u64), Error> {
        if self.size == 0 {
            return Err(Error::Eof);
        }

        let entry = if n == -1 {
            self.size / ENT_WIDTH - 1
        } else {
            n as u64
        };

        let start = entry * ENT_WIDTH;
        if start + ENT_WIDTH > self.size {
            return Err(Error::Eof);
        }

        let start = start as usize;
        let off = u32::from_be_bytes(
            self.mmap[start..start + OFF_WIDTH as usize]
                .try_into()
                .expect("entry slice is exactly four bytes"),
        );
        let pos = u64::from_be_bytes(
            self.mmap[start + OFF_WIDTH as usize..start + ENT_WIDTH as usize]
                .try_into()
                .expect("entry slice is exactly eight bytes"),
        );

        Ok((off, pos))
    }

    /// Append an entry, failing with [`Error::Eof`] when the mapping is full.
    pub(crate) fn write(&mut self, off: u32, pos: u64) -> Result<(), Error> {
        if self.size + ENT_WIDTH > self.mmap.len() as u64 {
            return Err(Error::Eof);
        }

        let start = self.size as usize;
        self.mmap[start..start + OFF_WIDTH as usize].copy_from_slice(&off.to_be_bytes());
        self.mmap[start + OFF_WIDTH as usize..start + ENT_WIDTH as usize]
            .copy_from_slice(&pos.to_be_bytes());
        self.size += ENT_WIDTH;

        Ok(())
    }

    /// Sync the mapping, flush file metadata, and truncate the file back to
    /// the in-use length. The mapping itself is released on drop.
    pub(crate) fn close(&mut self) -> Result<(), Error> {
        self.mmap.flush()?;
        self.file.sync_all()?;
        self.file.set_len(self.size)?;
        debug!("index {} truncated to {} bytes", self.path.display(), self.size);
        Ok(())
    }

    pub(crate) fn name(&self) -> &Path {
        &self.path
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn rejects_capacity_below_one_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let err = Index::new(&tmp.path().join("tiny.index"), ENT_WIDTH - 1).unwrap_err();
        assert!(matches!(err, Error::IndexTooSmall(11)));
    }

    #[test]
    fn empty_index_reads_eof() {
        let tmp = tempfile::tempdir().unwrap();
        let index = Index::new(&tmp.path().join("empty.index"), 1024).unwrap();
        assert!(matches!(index.read(-1), Err(Error::Eof)));
        assert!(matches!(index.read(0), Err(Error::Eof)));
    }

    #[test]
    fn write_read() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = Index::new(&tmp.path().join("rw.index"), 1024).unwrap();

        let entries = [(0u32, 0u64), (1, 10)];
        for (off, pos) in entries {
            index.write(off, pos).unwrap();
            assert_eq!(index.read(off as i64).unwrap(), (off, pos));
        }

        assert_eq!(index.read(-1).unwrap(), (1, 10));
        // One past the in-use prefix.
        assert!(matches!(index.read(entries.len() as i64), Err(Error::Eof)));
    }

    #[test]
    fn write_past_capacity_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = Index::new(&tmp.path().join("full.index"), 2 * ENT_WIDTH).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 19).unwrap();
        assert!(matches!(index.write(2, 38), Err(Error::Eof)));
    }

    #[test]
    fn close_reopen_preserves_last_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reopen.index");

        let mut index = Index::new(&path, 1024).unwrap();
        index.write(0, 0).unwrap();
        index.write(1, 10).unwrap();
        index.close().unwrap();
        drop(index);

        // The close truncated the file down to two entries.
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * ENT_WIDTH);

        let index = Index::new(&path, 1024).unwrap();
        assert_eq!(index.read(-1).unwrap(), (1, 10));
        assert_eq!(index.read(0).unwrap(), (0, 0));
        assert_eq!(index.size(), 2 * ENT_WIDTH);
    }
}
