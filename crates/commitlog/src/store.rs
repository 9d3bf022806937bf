use std::{
    fs::File,
    io::{self, BufWriter, Write as _},
    os::unix::fs::FileExt as _,
};

use parking_lot::Mutex;

/// Width of the length prefix framing every record payload.
pub(crate) const LEN_WIDTH: u64 = 8;

/// The append-only data file of a segment.
///
/// Entries are framed as an 8-byte big-endian length followed by that many
/// payload bytes. Writes go through a buffered writer; reads may address any
/// absolute position and flush the buffer first, so a position handed out by
/// [`Store::append`] is immediately readable.
#[derive(Debug)]
pub(crate) struct Store {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    buf: BufWriter<File>,
    /// Bytes written, including any still sitting in the buffer.
    size: u64,
}

impl Store {
    pub(crate) fn new(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self {
            inner: Mutex::new(Inner {
                buf: BufWriter::new(file),
                size,
            }),
        })
    }

    /// Append `payload`, returning the number of bytes written (framing
    /// included) and the position at which the frame starts.
    pub(crate) fn append(&self, payload: &[u8]) -> io::Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let pos = inner.size;

        inner.buf.write_all(&(payload.len() as u64).to_be_bytes())?;
        inner.buf.write_all(payload)?;

        let written = LEN_WIDTH + payload.len() as u64;
        inner.size += written;

        Ok((written, pos))
    }

    /// Read the payload of the frame starting at `pos`.
    pub(crate) fn read(&self, pos: u64) -> io::Result<Vec<u8>> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;

        let file = inner.buf.get_ref();
        let mut len = [0u8; LEN_WIDTH as usize];
        file.read_exact_at(&mut len, pos)?;

        let mut payload = vec![0u8; u64::from_be_bytes(len) as usize];
        file.read_exact_at(&mut payload, pos + LEN_WIDTH)?;

        Ok(payload)
    }

    /// Read raw bytes at an absolute `offset`, filling `buf` entirely.
    pub(crate) fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut inner = self.inner.lock();
        inner.buf.flush()?;
        inner.buf.get_ref().read_exact_at(buf, offset)?;
        Ok(buf.len())
    }

    /// Flush buffered bytes down to the file.
    pub(crate) fn flush(&self) -> io::Result<()> {
        self.inner.lock().buf.flush()
    }

    /// Flush and release the handle. The file itself closes on drop.
    pub(crate) fn close(&self) -> io::Result<()> {
        self.flush()
    }

    pub(crate) fn size(&self) -> u64 {
        self.inner.lock().size
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;

    use super::*;

    const PAYLOAD: &[u8] = b"hello world";
    const WIDTH: u64 = PAYLOAD.len() as u64 + LEN_WIDTH;

    fn open(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .unwrap()
    }

    #[test]
    fn append_read() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(open(&tmp.path().join("append_read.store"))).unwrap();

        for i in 1..4u64 {
            let (written, pos) = store.append(PAYLOAD).unwrap();
            assert_eq!(written, WIDTH);
            assert_eq!(pos + written, WIDTH * i);
        }

        let mut pos = 0;
        for _ in 1..4 {
            assert_eq!(store.read(pos).unwrap(), PAYLOAD);
            pos += WIDTH;
        }
    }

    #[test]
    fn read_at() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(open(&tmp.path().join("read_at.store"))).unwrap();
        store.append(PAYLOAD).unwrap();

        let mut len = [0u8; LEN_WIDTH as usize];
        assert_eq!(store.read_at(&mut len, 0).unwrap(), LEN_WIDTH as usize);
        assert_eq!(u64::from_be_bytes(len), PAYLOAD.len() as u64);

        let mut payload = vec![0u8; PAYLOAD.len()];
        store.read_at(&mut payload, LEN_WIDTH).unwrap();
        assert_eq!(payload, PAYLOAD);
    }

    #[test]
    fn out_of_range_read_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(open(&tmp.path().join("oob.store"))).unwrap();
        store.append(PAYLOAD).unwrap();
        assert!(store.read(WIDTH).is_err());
    }

    #[test]
    fn size_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("reopen.store");

        let store = Store::new(open(&path)).unwrap();
        store.append(PAYLOAD).unwrap();
        assert_eq!(store.size(), WIDTH);
        store.close().unwrap();
        drop(store);

        let store = Store::new(open(&path)).unwrap();
        assert_eq!(store.size(), WIDTH);
        assert_eq!(store.read(0).unwrap(), PAYLOAD);
    }
}
