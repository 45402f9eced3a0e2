use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{decode, encode, Result};

const SEQ_LEN: usize = 8;
const TS_LEN: usize = 8;
const COMPOSITE_LEN: usize = TS_LEN + SEQ_LEN;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct QueueRecord {
    enqueued_at_nanos: i64,
    sender: String,
    envelope: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub key: Vec<u8>,
    pub enqueued_at_nanos: i64,
    pub sender: String,
    pub envelope: Vec<u8>,
}

pub enum EnqueueOutcome {
    Enqueued,
    QueueFull,
}

/// Per-recipient ordered durable queue. Entries live in one sled tree,
/// namespaced by a `recipient \0 composite-key` prefix so a single tree
/// serves every recipient's sub-bucket while keeping scans cheap.
pub struct MessageQueue {
    tree: sled::Tree,
    seq: sled::Tree,
    /// Per-recipient live entry count, keyed by recipient. Maintained
    /// separately from `tree` so `enqueue_capped` can reserve a slot with
    /// one atomic compare-and-swap instead of a scan-then-insert — see
    /// `try_reserve`.
    counts: sled::Tree,
}

impl MessageQueue {
    pub(crate) fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            tree: db.open_tree("queue")?,
            seq: db.open_tree("queue_seq")?,
            counts: db.open_tree("queue_counts")?,
        })
    }

    fn prefix(recipient: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(recipient.len() + 1);
        prefix.extend_from_slice(recipient.as_bytes());
        prefix.push(0);
        prefix
    }

    fn composite_key(recipient: &str, enqueued_at_nanos: i64, seq: u64) -> Vec<u8> {
        let mut key = Self::prefix(recipient);
        key.extend_from_slice(&(enqueued_at_nanos as u64).to_be_bytes());
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    /// Durable, per-recipient monotonic sequence, disambiguating enqueues
    /// that land on the same nanosecond timestamp.
    fn next_seq(&self, recipient: &str) -> Result<u64> {
        let key = recipient.as_bytes();
        let updated = self.seq.fetch_and_update(key, |old| {
            let next = old
                .map(|bytes| {
                    let mut buf = [0u8; SEQ_LEN];
                    buf.copy_from_slice(bytes);
                    u64::from_be_bytes(buf)
                })
                .unwrap_or(0)
                + 1;
            Some(next.to_be_bytes().to_vec())
        })?;

        let previous = updated
            .map(|bytes| {
                let mut buf = [0u8; SEQ_LEN];
                buf.copy_from_slice(&bytes);
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0);

        Ok(previous + 1)
    }

    /// Atomically claims one slot in `recipient`'s sub-bucket if its live
    /// count is below `max_per_agent`, returning whether the claim
    /// succeeded. Spec §4.6 requires the cap check and the slot claim to
    /// behave as a single write transaction; sled's `TransactionalTree`
    /// cannot range-scan, so instead of check-then-insert against `tree`
    /// (which two concurrent callers could both pass before either had
    /// inserted, overrunning the cap) this does a single
    /// compare-and-swap on a per-recipient counter, the same atomic
    /// primitive `next_seq` already uses above.
    fn try_reserve(&self, recipient: &str, max_per_agent: usize) -> Result<bool> {
        let key = recipient.as_bytes();
        let reserved = std::cell::Cell::new(false);

        self.counts.fetch_and_update(key, |old| {
            let current = decode_count(old);
            if current as usize >= max_per_agent {
                reserved.set(false);
                old.map(|bytes| bytes.to_vec())
            } else {
                reserved.set(true);
                Some((current + 1).to_be_bytes().to_vec())
            }
        })?;

        Ok(reserved.get())
    }

    /// Releases one previously-claimed slot for `recipient`. Called
    /// whenever an entry actually leaves `tree` (`remove`, `sweep`), never
    /// speculatively.
    fn release(&self, recipient: &str) -> Result<()> {
        let key = recipient.as_bytes();
        self.counts.fetch_and_update(key, |old| {
            Some(decode_count(old).saturating_sub(1).to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    pub fn enqueue(
        &self,
        recipient: &str,
        sender: &str,
        envelope: &[u8],
        enqueued_at_nanos: i64,
    ) -> Result<EnqueueOutcome> {
        self.enqueue_capped(recipient, sender, envelope, enqueued_at_nanos, usize::MAX)
    }

    pub fn enqueue_capped(
        &self,
        recipient: &str,
        sender: &str,
        envelope: &[u8],
        enqueued_at_nanos: i64,
        max_per_agent: usize,
    ) -> Result<EnqueueOutcome> {
        if !self.try_reserve(recipient, max_per_agent)? {
            return Ok(EnqueueOutcome::QueueFull);
        }

        let seq = self.next_seq(recipient)?;
        let key = Self::composite_key(recipient, enqueued_at_nanos, seq);
        let record = QueueRecord {
            enqueued_at_nanos,
            sender: sender.to_string(),
            envelope: envelope.to_vec(),
        };

        self.tree.insert(key, encode(&record)?)?;
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Non-destructive read of up to `batch_size` entries in ascending
    /// (chronological) key order. Expired entries are skipped, not deleted;
    /// the sweeper owns deletion.
    pub fn flush_batch(
        &self,
        recipient: &str,
        batch_size: usize,
        now_nanos: i64,
        ttl_nanos: i64,
    ) -> Result<Vec<QueuedMessage>> {
        let prefix = Self::prefix(recipient);
        let mut out = Vec::with_capacity(batch_size);

        for item in self.tree.scan_prefix(&prefix) {
            let (key, value) = item?;
            let record: QueueRecord = match decode(&value) {
                Ok(record) => record,
                Err(_) => {
                    log::warn!("skipping corrupt queue entry for {recipient}");
                    continue;
                }
            };

            if now_nanos - record.enqueued_at_nanos > ttl_nanos {
                continue;
            }

            out.push(QueuedMessage {
                key: key.to_vec(),
                enqueued_at_nanos: record.enqueued_at_nanos,
                sender: record.sender,
                envelope: record.envelope,
            });

            if out.len() >= batch_size {
                break;
            }
        }

        Ok(out)
    }

    /// Idempotent: removing an already-absent key releases no slot.
    pub fn remove(&self, recipient: &str, key: &[u8]) -> Result<()> {
        if self.tree.remove(key)?.is_some() {
            self.release(recipient)?;
        }
        Ok(())
    }

    pub fn count(&self, recipient: &str) -> Result<usize> {
        Ok(decode_count(self.counts.get(recipient.as_bytes())?.as_deref()) as usize)
    }

    /// Delete every entry across all recipients older than `ttl_nanos`,
    /// returning the cleaned count per recipient. Two-phase: collect keys
    /// first, then delete — sled's scan iterator is invalidated by
    /// concurrent removal, so deleting mid-scan can skip keys.
    pub fn sweep(&self, now_nanos: i64, ttl_nanos: i64) -> Result<HashMap<String, usize>> {
        let mut expired: Vec<sled::IVec> = Vec::new();
        let mut cleaned: HashMap<String, usize> = HashMap::new();

        for item in self.tree.iter() {
            let (key, value) = item?;
            let record: QueueRecord = match decode(&value) {
                Ok(record) => record,
                Err(_) => {
                    expired.push(key);
                    continue;
                }
            };

            if now_nanos - record.enqueued_at_nanos > ttl_nanos {
                expired.push(key);
            }
        }

        for key in expired {
            let recipient = recipient_of(&key);
            self.tree.remove(&key)?;
            if let Some(recipient) = recipient {
                *cleaned.entry(recipient.clone()).or_insert(0) += 1;
                self.release(&recipient)?;
            }
        }

        Ok(cleaned)
    }
}

fn recipient_of(key: &[u8]) -> Option<String> {
    let separator = key.len().checked_sub(COMPOSITE_LEN)?.checked_sub(1)?;
    std::str::from_utf8(&key[..separator]).ok().map(str::to_string)
}

fn decode_count(bytes: Option<&[u8]>) -> u64 {
    bytes
        .map(|b| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(b);
            u64::from_be_bytes(buf)
        })
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> (tempfile::TempDir, MessageQueue) {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let queue = MessageQueue::open(&db).unwrap();
        (dir, queue)
    }

    #[test]
    fn enqueue_preserves_chronological_order() {
        let (_dir, queue) = queue();
        queue.enqueue("bob", "alice", b"1", 100).unwrap();
        queue.enqueue("bob", "alice", b"2", 100).unwrap();
        queue.enqueue("bob", "alice", b"3", 200).unwrap();

        let batch = queue.flush_batch("bob", 10, 1_000_000, i64::MAX).unwrap();
        let envelopes: Vec<&[u8]> = batch.iter().map(|m| m.envelope.as_slice()).collect();
        assert_eq!(envelopes, vec![b"1".as_slice(), b"2".as_slice(), b"3".as_slice()]);
    }

    #[test]
    fn enqueue_respects_cap() {
        let (_dir, queue) = queue();
        for i in 0..5 {
            let outcome = queue.enqueue_capped("bob", "alice", &[i], i as i64, 5).unwrap();
            assert!(matches!(outcome, EnqueueOutcome::Enqueued));
        }
        let outcome = queue.enqueue_capped("bob", "alice", &[9], 9, 5).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::QueueFull));
        assert_eq!(queue.count("bob").unwrap(), 5);
    }

    #[test]
    fn remove_is_idempotent_on_missing_key() {
        let (_dir, queue) = queue();
        queue.remove("bob", b"nonexistent-key-1234567").unwrap();
    }

    #[test]
    fn flush_batch_skips_expired_without_deleting() {
        let (_dir, queue) = queue();
        queue.enqueue("bob", "alice", b"old", 0).unwrap();
        queue.enqueue("bob", "alice", b"new", 1_000_000_000).unwrap();

        let batch = queue.flush_batch("bob", 10, 1_000_000_000, 500_000_000).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].envelope, b"new");
        assert_eq!(queue.count("bob").unwrap(), 2);
    }

    #[test]
    fn sweep_deletes_expired_and_reports_per_recipient() {
        let (_dir, queue) = queue();
        queue.enqueue("bob", "alice", b"old", 0).unwrap();
        queue.enqueue("carol", "alice", b"old", 0).unwrap();
        queue.enqueue("bob", "alice", b"new", 1_000_000_000).unwrap();

        let cleaned = queue.sweep(1_000_000_000, 500_000_000).unwrap();
        assert_eq!(cleaned.get("bob").copied(), Some(1));
        assert_eq!(cleaned.get("carol").copied(), Some(1));
        assert_eq!(queue.count("bob").unwrap(), 1);
        assert_eq!(queue.count("carol").unwrap(), 0);
    }

    #[test]
    fn queues_are_independent_per_recipient() {
        let (_dir, queue) = queue();
        queue.enqueue("bob", "alice", b"for-bob", 0).unwrap();
        queue.enqueue("carol", "alice", b"for-carol", 0).unwrap();
        assert_eq!(queue.count("bob").unwrap(), 1);
        assert_eq!(queue.count("carol").unwrap(), 1);
    }

    /// P9: `count(R) <= max-per-agent` must hold even when many senders
    /// race to enqueue for the same recipient near the cap.
    #[test]
    fn concurrent_enqueues_never_overrun_the_cap() {
        let (_dir, queue) = queue();
        let queue = std::sync::Arc::new(queue);
        let cap = 20;

        std::thread::scope(|scope| {
            for i in 0..(cap * 4) {
                let queue = queue.clone();
                scope.spawn(move || {
                    queue.enqueue_capped("bob", "alice", &[i as u8], i as i64, cap).unwrap();
                });
            }
        });

        assert!(queue.count("bob").unwrap() <= cap);
        assert_eq!(queue.count("bob").unwrap(), queue.flush_batch("bob", cap * 4, i64::MAX, i64::MAX).unwrap().len());
    }
}
