//! Local blob store: a small key/value surface for chain links and
//! tail summaries.

use crate::errors::Result;
use crate::kid::LinkId;
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Mutex;

/// Object type for cached sigchain tail summaries, keyed by uid hex.
pub const DB_SIG_CHAIN_TAIL_PUBLIC: u16 = 1;

/// Object type for chain link bodies, keyed by link-id hex.
pub const DB_CHAIN_LINK: u16 = 2;

/// A typed store key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DbKey {
    pub typ: u16,
    pub key: String,
}

impl DbKey {
    pub fn new(typ: u16, key: impl Into<String>) -> Self {
        Self {
            typ,
            key: key.into(),
        }
    }

    pub fn chain_link(id: &LinkId) -> Self {
        Self::new(DB_CHAIN_LINK, id.to_hex())
    }
}

/// The persistence contract: blobs in, blobs out. Absent keys are
/// `Ok(None)`, not errors.
pub trait LocalDb: Send + Sync {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &DbKey, value: &[u8]) -> Result<()>;
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemDb {
    map: Mutex<HashMap<(u16, String), Vec<u8>>>,
}

impl MemDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.lock().expect("poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LocalDb for MemDb {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        let map = self.map.lock().expect("poisoned");
        Ok(map.get(&(key.typ, key.key.clone())).cloned())
    }

    fn put(&self, key: &DbKey, value: &[u8]) -> Result<()> {
        let mut map = self.map.lock().expect("poisoned");
        map.insert((key.typ, key.key.clone()), value.to_vec());
        Ok(())
    }
}

/// Filesystem store: one file per key, under a per-type subdirectory.
///
/// Keys here are always hex strings, so they are filename-safe as is.
#[derive(Debug)]
pub struct FsDb {
    dir: PathBuf,
}

impl FsDb {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn filename(&self, key: &DbKey) -> PathBuf {
        self.dir.join(format!("{:04x}", key.typ)).join(&key.key)
    }
}

impl LocalDb for FsDb {
    fn get(&self, key: &DbKey) -> Result<Option<Vec<u8>>> {
        match fs::read(self.filename(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &DbKey, value: &[u8]) -> Result<()> {
        let filename = self.filename(key);
        if let Some(parent) = filename.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(filename, value)?;
        Ok(())
    }
}
