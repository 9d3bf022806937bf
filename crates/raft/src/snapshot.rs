use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::{proto, Error};

const SNAPSHOT_FILE_EXT: &str = ".snap";
const META_LEN_WIDTH: usize = 8;

/// Identity and provenance of a stored snapshot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub id: String,
    /// Last log index covered by the snapshot.
    pub index: u64,
    /// Term of that entry.
    pub term: u64,
    /// Cluster membership as of the snapshot.
    pub servers: Vec<SnapshotServer>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotServer {
    pub id: String,
    pub address: String,
}

impl SnapshotMeta {
    pub fn configuration(&self) -> proto::Configuration {
        proto::Configuration {
            servers: self
                .servers
                .iter()
                .map(|s| proto::Server {
                    id: s.id.clone(),
                    address: s.address.clone(),
                })
                .collect(),
        }
    }
}

/// Destination for the bytes of a snapshot being taken.
///
/// The snapshot only becomes visible to [`SnapshotStore::list`] once
/// `close` succeeds; `cancel` discards everything written so far.
pub trait SnapshotSink: Write + Send {
    fn id(&self) -> &str;

    fn close(self: Box<Self>) -> Result<(), Error>;

    fn cancel(self: Box<Self>) -> Result<(), Error>;
}

/// Storage for finished snapshots.
pub trait SnapshotStore: Send + Sync + 'static {
    /// Start writing a snapshot covering the log up to `index`.
    fn create(
        &self,
        index: u64,
        term: u64,
        configuration: &proto::Configuration,
    ) -> Result<Box<dyn SnapshotSink>, Error>;

    /// Stored snapshots, most recent first.
    fn list(&self) -> Result<Vec<SnapshotMeta>, Error>;

    /// Open a stored snapshot for reading its state bytes.
    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>), Error>;
}

/// [`SnapshotStore`] persisting each snapshot as a single file
/// `<term>-<index>.snap` containing a length-prefixed JSON header followed
/// by the raw state bytes. Retains the most recent `retain` snapshots.
#[derive(Clone, Debug)]
pub struct FileSnapshotStore {
    dir: PathBuf,
    retain: usize,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, retain: usize) -> Result<Self, Error> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            retain: retain.max(1),
        })
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}{SNAPSHOT_FILE_EXT}"))
    }

    fn read_meta(path: &Path) -> Result<(SnapshotMeta, File), Error> {
        let mut file = File::open(path)?;
        let mut len = [0u8; META_LEN_WIDTH];
        file.read_exact(&mut len)?;
        let mut meta = vec![0u8; u64::from_be_bytes(len) as usize];
        file.read_exact(&mut meta)?;
        let meta = serde_json::from_slice(&meta).map_err(Error::storage)?;
        Ok((meta, file))
    }

    fn reap(&self) -> Result<(), Error> {
        for stale in self.list()?.into_iter().skip(self.retain) {
            debug!(id = %stale.id, "reaping old snapshot");
            fs::remove_file(self.path_for(&stale.id))?;
        }
        Ok(())
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn create(
        &self,
        index: u64,
        term: u64,
        configuration: &proto::Configuration,
    ) -> Result<Box<dyn SnapshotSink>, Error> {
        let meta = SnapshotMeta {
            id: format!("{term}-{index}"),
            index,
            term,
            servers: configuration
                .servers
                .iter()
                .map(|s| SnapshotServer {
                    id: s.id.clone(),
                    address: s.address.clone(),
                })
                .collect(),
        };

        let mut file = NamedTempFile::new_in(&self.dir)?;
        let header = serde_json::to_vec(&meta).map_err(Error::storage)?;
        file.write_all(&(header.len() as u64).to_be_bytes())?;
        file.write_all(&header)?;

        Ok(Box::new(FileSnapshotSink {
            store: self.clone(),
            meta,
            file,
        }))
    }

    fn list(&self) -> Result<Vec<SnapshotMeta>, Error> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(SNAPSHOT_FILE_EXT) {
                continue;
            }
            match Self::read_meta(&path) {
                Ok((meta, _)) => metas.push(meta),
                Err(e) => warn!(path = %path.display(), "skipping unreadable snapshot: {e}"),
            }
        }
        metas.sort_by(|a, b| (b.index, b.term).cmp(&(a.index, a.term)));
        Ok(metas)
    }

    fn open(&self, id: &str) -> Result<(SnapshotMeta, Box<dyn Read + Send>), Error> {
        let (meta, file) = Self::read_meta(&self.path_for(id))?;
        Ok((meta, Box::new(file)))
    }
}

struct FileSnapshotSink {
    store: FileSnapshotStore,
    meta: SnapshotMeta,
    file: NamedTempFile,
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl SnapshotSink for FileSnapshotSink {
    fn id(&self) -> &str {
        &self.meta.id
    }

    fn close(mut self: Box<Self>) -> Result<(), Error> {
        self.file.flush()?;
        self.file.as_file().sync_all()?;
        let path = self.store.path_for(&self.meta.id);
        self.file.persist(&path).map_err(|e| Error::Io(e.error))?;
        self.store.reap()
    }

    fn cancel(self: Box<Self>) -> Result<(), Error> {
        // NamedTempFile removes itself on drop.
        Ok(())
    }
}
