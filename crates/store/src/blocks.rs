use crate::Result;

/// Per-recipient blocklist. Consulted on every routing decision, so
/// `is_blocked` must be cheap; sled trees are already backed by an
/// in-memory page cache so a point lookup does not touch disk on the hot
/// path once warm.
pub struct BlockStore {
    tree: sled::Tree,
}

impl BlockStore {
    pub(crate) fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("blocks")?,
        })
    }

    fn key(blocker: &str, blocked: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(blocker.len() + blocked.len() + 1);
        key.extend_from_slice(blocker.as_bytes());
        key.push(0);
        key.extend_from_slice(blocked.as_bytes());
        key
    }

    pub fn block(&self, blocker: &str, blocked: &str) -> Result<()> {
        self.tree.insert(Self::key(blocker, blocked), &[])?;
        Ok(())
    }

    pub fn unblock(&self, blocker: &str, blocked: &str) -> Result<()> {
        self.tree.remove(Self::key(blocker, blocked))?;
        Ok(())
    }

    pub fn is_blocked(&self, blocker: &str, blocked: &str) -> Result<bool> {
        Ok(self.tree.contains_key(Self::key(blocker, blocked))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, BlockStore) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = BlockStore::open(&db).unwrap();
        (dir, store)
    }

    #[test]
    fn block_and_unblock_are_idempotent() {
        let (_dir, store) = store();
        store.block("r", "s").unwrap();
        store.block("r", "s").unwrap();
        assert!(store.is_blocked("r", "s").unwrap());

        store.unblock("r", "s").unwrap();
        store.unblock("r", "s").unwrap();
        assert!(!store.is_blocked("r", "s").unwrap());
    }

    #[test]
    fn block_is_directional() {
        let (_dir, store) = store();
        store.block("r", "s").unwrap();
        assert!(!store.is_blocked("s", "r").unwrap());
    }

    #[test]
    fn block_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = sled::open(dir.path()).unwrap();
            let store = BlockStore::open(&db).unwrap();
            store.block("r", "s").unwrap();
            db.flush().unwrap();
        }
        let db = sled::open(dir.path()).unwrap();
        let store = BlockStore::open(&db).unwrap();
        assert!(store.is_blocked("r", "s").unwrap());
    }
}
