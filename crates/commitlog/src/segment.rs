use std::{
    fs::{self, File},
    path::{Path, PathBuf},
};

use keelson_api::Record;
use log::debug;
use prost::Message as _;

use crate::{config::Config, error::Error, index::Index, store::Store};

/// A contiguous slice of the log: one store file paired with one index
/// file, both named after the segment's base offset.
///
/// Every record in the store has a matching index entry, and
/// `next_offset == base_offset + number_of_entries` at all times.
#[derive(Debug)]
pub(crate) struct Segment {
    store: Store,
    index: Index,
    store_path: PathBuf,
    pub(crate) base_offset: u64,
    pub(crate) next_offset: u64,
    config: Config,
}

impl Segment {
    /// Open or create the segment with `base_offset` in `dir`.
    ///
    /// If the index already holds entries, the next offset resumes after
    /// the last of them.
    pub(crate) fn new(dir: &Path, base_offset: u64, config: Config) -> Result<Self, Error> {
        let store_path = dir.join(format!("{base_offset}.store"));
        let store_file = File::options()
            .read(true)
            .append(true)
            .create(true)
            .open(&store_path)?;
        let store = Store::new(store_file)?;

        let index_path = dir.join(format!("{base_offset}.index"));
        let index = Index::new(&index_path, config.segment.max_index_bytes)?;

        let next_offset = match index.read(-1) {
            Ok((off, _)) => base_offset + u64::from(off) + 1,
            Err(Error::Eof) => base_offset,
            Err(e) => return Err(e),
        };
        debug!("segment {base_offset}: next offset {next_offset}");

        Ok(Self {
            store,
            index,
            store_path,
            base_offset,
            next_offset,
            config,
        })
    }

    /// Append a record, assigning it the segment's next offset.
    ///
    /// Fails with [`Error::SegmentMaxed`] while at capacity so the log can
    /// roll over to a fresh segment.
    pub(crate) fn append(&mut self, mut record: Record) -> Result<u64, Error> {
        if self.is_maxed() {
            return Err(Error::SegmentMaxed);
        }

        let offset = self.next_offset;
        record.offset = offset;

        let (_, pos) = self.store.append(&record.encode_to_vec())?;
        self.index.write((offset - self.base_offset) as u32, pos)?;
        self.next_offset += 1;

        Ok(offset)
    }

    /// Read the record at an absolute `offset`.
    pub(crate) fn read(&self, offset: u64) -> Result<Record, Error> {
        let relative = offset
            .checked_sub(self.base_offset)
            .ok_or(Error::OffsetOutOfRange(offset))?;

        let (_, pos) = match self.index.read(relative as i64) {
            Err(Error::Eof) => return Err(Error::OffsetOutOfRange(offset)),
            res => res?,
        };

        let payload = self.store.read(pos)?;
        Record::decode(&payload[..]).map_err(|source| Error::Decode { offset, source })
    }

    /// Whether either half of the pair is at capacity.
    pub(crate) fn is_maxed(&self) -> bool {
        self.store.size() >= self.config.segment.max_store_bytes
            || self.index.size() >= self.config.segment.max_index_bytes
    }

    pub(crate) fn flush_store(&self) -> Result<(), Error> {
        self.store.flush()?;
        Ok(())
    }

    pub(crate) fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub(crate) fn store_size(&self) -> u64 {
        self.store.size()
    }

    /// Close both halves, truncating the index down to its in-use length.
    pub(crate) fn close(&mut self) -> Result<(), Error> {
        self.index.close()?;
        self.store.close()?;
        Ok(())
    }

    /// Close, then delete both files.
    pub(crate) fn remove(&mut self) -> Result<(), Error> {
        self.close()?;
        fs::remove_file(self.index.name())?;
        fs::remove_file(&self.store_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{config::SegmentConfig, index::ENT_WIDTH};

    fn record(value: &[u8]) -> Record {
        Record {
            value: value.to_vec(),
            ..Default::default()
        }
    }

    fn config(max_store_bytes: u64, max_index_bytes: u64) -> Config {
        Config {
            segment: SegmentConfig {
                max_store_bytes,
                max_index_bytes,
                initial_offset: 0,
            },
        }
    }

    #[test]
    fn append_read_and_index_rollover() {
        let tmp = tempfile::tempdir().unwrap();
        let want = record(b"hello world");

        let mut segment = Segment::new(tmp.path(), 16, config(1024, 3 * ENT_WIDTH)).unwrap();
        assert_eq!(segment.next_offset, 16);
        assert!(!segment.is_maxed());

        for i in 0..3u64 {
            let off = segment.append(want.clone()).unwrap();
            assert_eq!(off, 16 + i);

            let got = segment.read(off).unwrap();
            assert_eq!(got.value, want.value);
            assert_eq!(got.offset, off);
        }

        // Index is full after three entries.
        assert!(segment.is_maxed());
        assert!(matches!(
            segment.append(want.clone()),
            Err(Error::SegmentMaxed)
        ));
    }

    #[test]
    fn store_capacity_maxes_segment() {
        let tmp = tempfile::tempdir().unwrap();
        let want = record(b"hello world");
        // Three encoded records fill the store exactly.
        let frame = want.encode_to_vec().len() as u64 + crate::store::LEN_WIDTH;

        let mut segment = Segment::new(tmp.path(), 0, config(3 * frame, 1024)).unwrap();
        for _ in 0..3 {
            segment.append(want.clone()).unwrap();
        }
        assert!(segment.is_maxed());
        assert!(matches!(segment.append(want), Err(Error::SegmentMaxed)));
    }

    #[test]
    fn reopen_resumes_next_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let want = record(b"hello world");
        let cfg = config(1024, 1024);

        let mut segment = Segment::new(tmp.path(), 5, cfg).unwrap();
        for _ in 0..4 {
            segment.append(want.clone()).unwrap();
        }
        segment.close().unwrap();
        drop(segment);

        let segment = Segment::new(tmp.path(), 5, cfg).unwrap();
        assert_eq!(segment.next_offset, 9);
        assert_eq!(segment.read(8).unwrap().value, want.value);
    }

    #[test]
    fn out_of_range_reads() {
        let tmp = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(tmp.path(), 10, config(1024, 1024)).unwrap();
        segment.append(record(b"x")).unwrap();

        assert!(matches!(
            segment.read(9),
            Err(Error::OffsetOutOfRange(9))
        ));
        assert!(matches!(
            segment.read(11),
            Err(Error::OffsetOutOfRange(11))
        ));
    }

    #[test]
    fn remove_deletes_both_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut segment = Segment::new(tmp.path(), 0, config(1024, 1024)).unwrap();
        segment.append(record(b"x")).unwrap();
        segment.remove().unwrap();

        assert!(!tmp.path().join("0.store").exists());
        assert!(!tmp.path().join("0.index").exists());
    }
}
