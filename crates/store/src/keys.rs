use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{decode, encode, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingKey {
    pub public_key: [u8; 32],
    pub derived_address: String,
    pub claim_code: String,
    pub created_at_nanos: i64,
}

/// Locked-mode admission control: a pending set awaiting human claim, and a
/// flat approved set. Three trees: pending keys by public key, a claim-code
/// index for O(1) lookup by code, and approved keys.
pub struct KeyRegistry {
    pending: sled::Tree,
    claim_codes: sled::Tree,
    approved: sled::Tree,
}

impl KeyRegistry {
    pub(crate) fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            pending: db.open_tree("pending_keys")?,
            claim_codes: db.open_tree("claim_codes")?,
            approved: db.open_tree("approved_keys")?,
        })
    }

    /// Insert or refresh a pending record. A second `register` for an
    /// already-pending key overwrites it with a fresh claim code,
    /// invalidating the previous one.
    pub fn register_pending(&self, public_key: &[u8; 32], derived_address: &str) -> Result<String> {
        self.register_pending_at(public_key, derived_address, now_nanos())
    }

    pub fn register_pending_at(
        &self,
        public_key: &[u8; 32],
        derived_address: &str,
        created_at_nanos: i64,
    ) -> Result<String> {
        if let Some(old) = self.pending.get(public_key)? {
            let old: PendingKey = decode(&old)?;
            self.claim_codes.remove(old.claim_code.as_bytes())?;
        }

        let claim_code = generate_claim_code();
        let record = PendingKey {
            public_key: *public_key,
            derived_address: derived_address.to_string(),
            claim_code: claim_code.clone(),
            created_at_nanos,
        };

        self.pending.insert(public_key, encode(&record)?)?;
        self.claim_codes.insert(claim_code.as_bytes(), public_key)?;
        Ok(claim_code)
    }

    /// Atomically move a pending record to the approved set. Idempotent:
    /// a second claim of the same code finds no claim-code entry and
    /// returns `None`.
    pub fn claim(&self, claim_code: &str) -> Result<Option<String>> {
        let Some(public_key) = self.claim_codes.remove(claim_code.as_bytes())? else {
            return Ok(None);
        };

        let Some(pending) = self.pending.remove(&public_key)? else {
            return Ok(None);
        };

        let record: PendingKey = decode(&pending)?;
        self.approved.insert(&public_key, &[])?;
        Ok(Some(record.derived_address))
    }

    pub fn is_approved(&self, public_key: &[u8; 32]) -> Result<bool> {
        Ok(self.approved.contains_key(public_key)?)
    }

    /// Two-phase sweep: collect pending keys older than `ttl_nanos`, then
    /// delete them along with their claim-code index entries.
    pub fn sweep_pending(&self, now_nanos: i64, ttl_nanos: i64) -> Result<usize> {
        let mut expired = Vec::new();

        for item in self.pending.iter() {
            let (key, value) = item?;
            let record: PendingKey = decode(&value)?;
            if now_nanos - record.created_at_nanos > ttl_nanos {
                expired.push((key, record.claim_code));
            }
        }

        let count = expired.len();
        for (key, claim_code) in expired {
            self.pending.remove(&key)?;
            self.claim_codes.remove(claim_code.as_bytes())?;
        }

        Ok(count)
    }
}

fn generate_claim_code() -> String {
    let mut bytes = [0u8; 4];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}

fn now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
