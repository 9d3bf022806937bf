use std::path::Path;

use crate::Error;

pub(crate) const KEY_CURRENT_TERM: &[u8] = b"current_term";
pub(crate) const KEY_VOTED_FOR: &[u8] = b"voted_for";
pub(crate) const KEY_LAST_APPLIED: &[u8] = b"last_applied";

/// Durable key-value storage for the small set of values that must survive
/// restarts: the current term, the vote cast in it, and the apply cursor.
pub trait StableStore: Send + Sync + 'static {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error>;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error>;

    fn set_u64(&self, key: &[u8], value: u64) -> Result<(), Error> {
        self.set(key, &value.to_be_bytes())
    }

    fn get_u64(&self, key: &[u8]) -> Result<Option<u64>, Error> {
        let Some(bytes) = self.get(key)? else {
            return Ok(None);
        };
        let bytes: [u8; 8] = bytes
            .try_into()
            .map_err(|_| Error::Storage("stable store holds a malformed u64".into()))?;
        Ok(Some(u64::from_be_bytes(bytes)))
    }
}

/// [`StableStore`] backed by an embedded B+tree database.
#[derive(Debug, Clone)]
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sled::open(path).map_err(Error::storage)?;
        Ok(Self { db })
    }
}

impl StableStore for SledStore {
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        self.db.insert(key, value).map_err(Error::storage)?;
        self.db.flush().map_err(Error::storage)?;
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        let value = self.db.get(key).map_err(Error::storage)?;
        Ok(value.map(|v| v.to_vec()))
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sled_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SledStore::new(tmp.path().join("stable")).unwrap();

        assert_eq!(store.get_u64(KEY_CURRENT_TERM).unwrap(), None);
        store.set_u64(KEY_CURRENT_TERM, 3).unwrap();
        assert_eq!(store.get_u64(KEY_CURRENT_TERM).unwrap(), Some(3));

        store.set(KEY_VOTED_FOR, b"node-1").unwrap();
        assert_eq!(store.get(KEY_VOTED_FOR).unwrap().as_deref(), Some(&b"node-1"[..]));
    }

    #[test]
    fn sled_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("stable");

        let store = SledStore::new(&path).unwrap();
        store.set_u64(KEY_CURRENT_TERM, 7).unwrap();
        drop(store);

        let store = SledStore::new(&path).unwrap();
        assert_eq!(store.get_u64(KEY_CURRENT_TERM).unwrap(), Some(7));
    }
}
