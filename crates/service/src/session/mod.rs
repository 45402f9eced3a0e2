use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const OUTBOUND_CAPACITY: usize = 16;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    Full,
    /// The buffer has been closed (the session is tearing down). Callers
    /// must treat this the same as success from their own point of view —
    /// never panic or retry because the destination just disappeared.
    Closed,
}

/// Bounded queue of opaque outbound frames awaiting a websocket write.
/// `try_enqueue` on a closed buffer is a silent no-op.
pub struct OutboundBuffer {
    sender: mpsc::Sender<Vec<u8>>,
    closed: AtomicBool,
}

impl OutboundBuffer {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(OUTBOUND_CAPACITY);
        (
            Arc::new(Self {
                sender,
                closed: AtomicBool::new(false),
            }),
            receiver,
        )
    }

    pub fn try_enqueue(&self, frame: Vec<u8>) -> EnqueueOutcome {
        if self.closed.load(Ordering::Acquire) {
            return EnqueueOutcome::Closed;
        }

        match self.sender.try_send(frame) {
            Ok(()) => EnqueueOutcome::Enqueued,
            Err(mpsc::error::TrySendError::Full(_)) => EnqueueOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.store(true, Ordering::Release);
                EnqueueOutcome::Closed
            }
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// One authenticated client's lifecycle from auth-success to teardown.
/// Identity is the `id`, not the address: a later connection to the same
/// address is a distinct `Session`, which is what lets the hub's
/// stale-unregister rule distinguish "this session" from "whatever
/// currently occupies this address".
pub struct Session {
    pub id: u64,
    pub address: String,
    pub outbound: Arc<OutboundBuffer>,
    pub cancellation: CancellationToken,
    flushing: AtomicBool,
}

impl Session {
    pub fn new(address: String) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (outbound, receiver) = OutboundBuffer::new();
        let session = Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            address,
            outbound,
            cancellation: CancellationToken::new(),
            flushing: AtomicBool::new(false),
        });
        (session, receiver)
    }

    /// Read on the hot routing path; must stay lock-free.
    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    /// Written only from the flush loop, at begin and end.
    pub fn set_flushing(&self, value: bool) {
        self.flushing.store(value, Ordering::Release);
    }

    pub fn cancel(&self) {
        self.outbound.close();
        self.cancellation.cancel();
    }
}
