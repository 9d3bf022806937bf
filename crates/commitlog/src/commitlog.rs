use std::{
    fs::{self, File},
    io::{self, Read},
    path::{Path, PathBuf},
};

use keelson_api::Record;
use log::debug;
use parking_lot::RwLock;

use crate::{config::Config, error::Error, segment::Segment};

/// An ordered collection of segments with a single active tail.
///
/// All appends target the segment with the highest base offset; when it
/// fills up, a fresh segment is started at the next offset. Reads locate
/// the owning segment by base offset and delegate.
///
/// Appends take the write lock, reads the read lock.
pub struct Log {
    dir: PathBuf,
    inner: RwLock<Inner>,
}

struct Inner {
    config: Config,
    /// Ordered by base offset, strictly increasing. Never empty; the last
    /// element is the active segment.
    segments: Vec<Segment>,
}

impl Inner {
    fn active(&self) -> &Segment {
        self.segments.last().expect("log always has an active segment")
    }

    fn active_mut(&mut self) -> &mut Segment {
        self.segments.last_mut().expect("log always has an active segment")
    }
}

impl Log {
    /// Open the log in `dir`, building a segment per base offset found on
    /// disk, or a single empty segment at the configured initial offset.
    pub fn new(dir: impl Into<PathBuf>, config: Config) -> Result<Self, Error> {
        let dir = dir.into();
        let config = config.with_defaults();
        fs::create_dir_all(&dir)?;

        let segments = Self::load_segments(&dir, config)?;

        Ok(Self {
            dir,
            inner: RwLock::new(Inner { config, segments }),
        })
    }

    fn load_segments(dir: &Path, config: Config) -> Result<Vec<Segment>, Error> {
        // Each base offset appears twice in the listing, once per half of
        // the pair.
        let mut base_offsets = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(offset) = stem.parse::<u64>() else {
                continue;
            };
            base_offsets.push(offset);
        }
        base_offsets.sort_unstable();
        base_offsets.dedup();

        let mut segments = Vec::with_capacity(base_offsets.len().max(1));
        for base_offset in base_offsets {
            segments.push(Segment::new(dir, base_offset, config)?);
        }
        if segments.is_empty() {
            debug!("starting fresh log at offset {}", config.segment.initial_offset);
            segments.push(Segment::new(dir, config.segment.initial_offset, config)?);
        }

        Ok(segments)
    }

    /// Append a record, rolling over to a new segment when the active one
    /// is at capacity. Returns the offset assigned to the record.
    pub fn append(&self, record: Record) -> Result<u64, Error> {
        let mut inner = self.inner.write();

        if inner.active().is_maxed() {
            let base_offset = inner.active().next_offset;
            debug!("rolling over to segment {base_offset}");
            let config = inner.config;
            let segment = Segment::new(&self.dir, base_offset, config)?;
            inner.segments.push(segment);
        }

        inner.active_mut().append(record)
    }

    /// Read the record at `offset`.
    pub fn read(&self, offset: u64) -> Result<Record, Error> {
        let inner = self.inner.read();
        let segment = inner
            .segments
            .iter()
            .find(|s| s.base_offset <= offset && offset < s.next_offset)
            .ok_or(Error::OffsetOutOfRange(offset))?;
        segment.read(offset)
    }

    /// Close every segment in order, truncating their indexes.
    pub fn close(&self) -> Result<(), Error> {
        let mut inner = self.inner.write();
        for segment in &mut inner.segments {
            segment.close()?;
        }
        Ok(())
    }

    /// Close the log and delete its directory.
    pub fn remove(&self) -> Result<(), Error> {
        self.close()?;
        fs::remove_dir_all(&self.dir)?;
        Ok(())
    }

    /// Remove everything and start over, empty, at the configured initial
    /// offset.
    pub fn reset(&self) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let initial_offset = inner.config.segment.initial_offset;
        self.reset_locked(&mut inner, initial_offset)
    }

    /// Like [`Log::reset`], but first moves the initial offset. Used when
    /// rebuilding from a snapshot whose first record is past zero.
    pub fn reset_to(&self, initial_offset: u64) -> Result<(), Error> {
        let mut inner = self.inner.write();
        inner.config.segment.initial_offset = initial_offset;
        self.reset_locked(&mut inner, initial_offset)
    }

    fn reset_locked(&self, inner: &mut Inner, initial_offset: u64) -> Result<(), Error> {
        for segment in &mut inner.segments {
            segment.close()?;
        }
        fs::remove_dir_all(&self.dir)?;
        fs::create_dir_all(&self.dir)?;
        inner.segments = vec![Segment::new(&self.dir, initial_offset, inner.config)?];
        Ok(())
    }

    pub fn lowest_offset(&self) -> u64 {
        self.inner.read().segments[0].base_offset
    }

    /// The offset of the most recent record, or `base_offset - 1` (clamped
    /// to zero) when the log is empty.
    pub fn highest_offset(&self) -> u64 {
        let inner = self.inner.read();
        inner.active().next_offset.saturating_sub(1)
    }

    /// Drop every segment whose records all have offsets at or below
    /// `lowest`, deleting their files.
    ///
    /// The log is never left without an active segment: if truncation
    /// consumes every segment, an empty one is created at the old next
    /// offset so appends continue without a gap.
    pub fn truncate(&self, lowest: u64) -> Result<(), Error> {
        let mut inner = self.inner.write();
        let next_offset = inner.active().next_offset;

        let mut kept = Vec::with_capacity(inner.segments.len());
        for mut segment in inner.segments.drain(..) {
            if segment.next_offset <= lowest + 1 {
                segment.remove()?;
            } else {
                kept.push(segment);
            }
        }
        if kept.is_empty() {
            kept.push(Segment::new(&self.dir, next_offset, inner.config)?);
        }
        inner.segments = kept;

        Ok(())
    }

    /// A reader over the raw bytes of every segment's store, in base-offset
    /// order. Buffered writes are flushed first, so the stream reflects
    /// everything appended before the call.
    pub fn reader(&self) -> Result<LogReader, Error> {
        let inner = self.inner.read();

        let mut parts = Vec::with_capacity(inner.segments.len());
        for segment in &inner.segments {
            segment.flush_store()?;
            parts.push(Part {
                file: File::open(segment.store_path())?,
                remaining: segment.store_size(),
            });
        }

        Ok(LogReader { parts })
    }
}

/// Sequential reader over the store bytes of a log, segment by segment.
///
/// Bounded at creation time: bytes appended afterwards are not observed.
pub struct LogReader {
    parts: Vec<Part>,
}

struct Part {
    file: File,
    remaining: u64,
}

impl Read for LogReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(part) = self.parts.first_mut() {
            if part.remaining == 0 {
                self.parts.remove(0);
                continue;
            }
            let want = buf.len().min(part.remaining as usize);
            let n = part.file.read(&mut buf[..want])?;
            if n == 0 {
                // Store shorter than its recorded size; treat as exhausted.
                self.parts.remove(0);
                continue;
            }
            part.remaining -= n as u64;
            return Ok(n);
        }
        Ok(0)
    }
}
