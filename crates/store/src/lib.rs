//! Durable embedded store for the relay.
//!
//! A single `sled::Db` is opened once by [`Store::open`] and handed to each
//! sub-store as an independent named tree. Sub-stores never open the file
//! themselves — sled's exclusive file lock makes a second open hang, so
//! there must be exactly one owner.

mod blocks;
mod keys;
mod queue;

pub use blocks::BlockStore;
pub use keys::{KeyRegistry, PendingKey};
pub use queue::{MessageQueue, QueuedMessage};

use std::fmt;
use std::path::Path;

#[derive(Debug)]
pub enum Error {
    Sled(sled::Error),
    Encode,
    Decode,
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sled(e) => write!(f, "store io error: {e}"),
            Self::Encode => write!(f, "failed to encode record"),
            Self::Decode => write!(f, "failed to decode record"),
        }
    }
}

impl From<sled::Error> for Error {
    fn from(e: sled::Error) -> Self {
        Self::Sled(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|_| Error::Encode)?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|_| Error::Decode)
}

/// Owns the single embedded K/V file and the three independent namespaces
/// built on top of it. Dropping the store closes the file.
pub struct Store {
    db: sled::Db,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn blocks(&self) -> Result<BlockStore> {
        BlockStore::open(&self.db)
    }

    pub fn queue(&self) -> Result<MessageQueue> {
        MessageQueue::open(&self.db)
    }

    pub fn keys(&self) -> Result<KeyRegistry> {
        KeyRegistry::open(&self.db)
    }

    /// Flush all namespaces to disk. Called before process exit, after the
    /// hub and sub-stores have drained.
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let blocks = store.blocks().unwrap();
        let queue = store.queue().unwrap();
        let keys = store.keys().unwrap();

        blocks.block("a", "b").unwrap();
        queue.enqueue("a", "b", b"hello", 1000).unwrap();
        keys.register_pending(&[9u8; 32], "pinch:a@host").unwrap();

        assert!(blocks.is_blocked("a", "b").unwrap());
        assert_eq!(queue.count("a").unwrap(), 1);
        assert!(!keys.is_approved(&[9u8; 32]).unwrap());
    }
}
