use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::RwLock;

use codec::{decode, encode, Envelope, Payload};
use store::{BlockStore, EnqueueOutcome as StoreEnqueueOutcome, MessageQueue};

use crate::error::RegisterError;
use crate::rate_limiter::RateLimiter;
use crate::session::{EnqueueOutcome, Session};

/// The system has no address of its own; envelopes it originates (queue
/// status, queue full) carry this as `from-address`.
const RELAY_ORIGIN: &str = "";

pub struct HubConfig {
    pub queue_max_per_agent: usize,
    pub queue_ttl_nanos: i64,
    pub flush_batch_size: usize,
    pub rate_limit_sustained: f64,
    pub rate_limit_burst: f64,
}

/// Single authoritative owner of the routing table. Mutations go through a
/// read-write lock rather than a dedicated event-loop task; both styles are
/// equivalent under the spec as long as the stale-unregister rule holds.
pub struct Hub {
    routing: RwLock<AHashMap<String, Arc<Session>>>,
    rate_limiter: RateLimiter,
    blocks: BlockStore,
    queue: MessageQueue,
    config: HubConfig,
}

impl Hub {
    pub fn new(blocks: BlockStore, queue: MessageQueue, config: HubConfig) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_sustained, config.rate_limit_burst);
        Self {
            routing: RwLock::new(AHashMap::new()),
            rate_limiter,
            blocks,
            queue,
            config,
        }
    }

    /// Inserts `session` into the routing table, then replays any queued
    /// messages for its address. A second authenticated attempt for an
    /// address already mapped is rejected, not evicted.
    pub fn register(&self, session: Arc<Session>, now_nanos: i64) -> Result<(), RegisterError> {
        {
            let mut table = self.routing.write();
            if table.contains_key(&session.address) {
                return Err(RegisterError::AddressInUse);
            }
            table.insert(session.address.clone(), session.clone());
        }

        self.flush(&session, now_nanos);
        Ok(())
    }

    /// Must not remove a replacement session that has already taken over
    /// this address — only the exact session instance that registered may
    /// unregister itself.
    pub fn unregister(&self, session: &Arc<Session>) {
        let mut table = self.routing.write();
        if let Some(current) = table.get(&session.address) {
            if current.id == session.id {
                table.remove(&session.address);
            }
        }
        drop(table);

        self.rate_limiter.remove(&session.address);
    }

    pub fn lookup(&self, address: &str) -> Option<Arc<Session>> {
        self.routing.read().get(address).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.routing.read().len()
    }

    /// The hot path. Never panics, never blocks on a stuck recipient: a
    /// full or closed outbound buffer falls back to the durable queue.
    pub fn route_message(&self, sender: &Arc<Session>, raw: &[u8], now_nanos: i64) {
        let mut envelope = match decode(raw) {
            Ok(envelope) => envelope,
            Err(_) => {
                log::debug!("dropping malformed envelope from {}", sender.address);
                return;
            }
        };

        envelope.rewrite_from(&sender.address);

        if !self.rate_limiter.allow(&sender.address) {
            log::trace!("rate-limited {}", sender.address);
            return;
        }

        match &envelope.payload {
            Payload::Block { target_address, .. } => {
                if let Err(e) = self.blocks.block(&sender.address, target_address) {
                    log::warn!("block-store write failed: {e}");
                }
                return;
            }
            Payload::Unblock { target_address, .. } => {
                if let Err(e) = self.blocks.unblock(&sender.address, target_address) {
                    log::warn!("block-store write failed: {e}");
                }
                return;
            }
            _ => {}
        }

        let to_address = envelope.header.to_address.clone();
        if to_address.is_empty() {
            return;
        }

        match self.blocks.is_blocked(&to_address, &sender.address) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                log::warn!("block-store read failed: {e}");
                return;
            }
        }

        let raw = encode(&envelope).unwrap_or_else(|_| raw.to_vec());

        let deliverable = self.lookup(&to_address).filter(|recipient| !recipient.is_flushing());

        let Some(recipient) = deliverable else {
            self.enqueue_or_notify(sender, &to_address, &raw, now_nanos);
            return;
        };

        match recipient.outbound.try_enqueue(raw.clone()) {
            EnqueueOutcome::Enqueued => {}
            EnqueueOutcome::Full | EnqueueOutcome::Closed => {
                self.enqueue_or_notify(sender, &to_address, &raw, now_nanos);
            }
        }
    }

    fn enqueue_or_notify(&self, sender: &Arc<Session>, to_address: &str, raw: &[u8], now_nanos: i64) {
        let outcome = self
            .queue
            .enqueue_capped(to_address, &sender.address, raw, now_nanos, self.config.queue_max_per_agent);

        let full = match outcome {
            Ok(StoreEnqueueOutcome::Enqueued) => false,
            Ok(StoreEnqueueOutcome::QueueFull) => true,
            Err(e) => {
                log::warn!("message-queue write failed, treating as queue-full: {e}");
                true
            }
        };

        if full {
            self.notify_queue_full(sender, to_address, now_nanos);
        }
    }

    fn notify_queue_full(&self, sender: &Arc<Session>, to_address: &str, now_nanos: i64) {
        let envelope = Envelope::new(
            RELAY_ORIGIN,
            sender.address.clone(),
            Vec::new(),
            now_nanos,
            Payload::QueueFull {
                recipient_address: to_address.to_string(),
                reason: "recipient queue is at capacity".to_string(),
            },
        );

        if let Ok(bytes) = encode(&envelope) {
            sender.outbound.try_enqueue(bytes);
        }
    }

    /// Replays queued messages in enqueue order, marking the session
    /// `flushing` for the duration so concurrently-arriving live traffic is
    /// enqueued instead of interleaved ahead of the backlog (P4).
    fn flush(&self, session: &Arc<Session>, now_nanos: i64) {
        let pending = match self.queue.count(&session.address) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("message-queue count failed during flush: {e}");
                return;
            }
        };

        if pending == 0 {
            return;
        }

        session.set_flushing(true);

        let status = Envelope::new(
            RELAY_ORIGIN,
            session.address.clone(),
            Vec::new(),
            now_nanos,
            Payload::QueueStatus { pending_count: pending as i64 },
        );
        if let Ok(bytes) = encode(&status) {
            session.outbound.try_enqueue(bytes);
        }

        loop {
            let batch = match self.queue.flush_batch(
                &session.address,
                self.config.flush_batch_size,
                now_nanos,
                self.config.queue_ttl_nanos,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    log::warn!("message-queue flush-batch failed: {e}");
                    break;
                }
            };

            if batch.is_empty() {
                break;
            }

            let mut stalled = false;
            for entry in batch {
                match session.outbound.try_enqueue(entry.envelope) {
                    EnqueueOutcome::Enqueued => {
                        if let Err(e) = self.queue.remove(&session.address, &entry.key) {
                            log::warn!("message-queue remove failed after handoff: {e}");
                        }
                    }
                    EnqueueOutcome::Full | EnqueueOutcome::Closed => {
                        stalled = true;
                        break;
                    }
                }
            }

            if stalled {
                break;
            }
        }

        session.set_flushing(false);
    }
}
