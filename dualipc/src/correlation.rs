//! Correlation table pairing outstanding invocations with their replies

use crate::message::{CorrelationId, InvokeFrame, Reply};
use crate::{Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;

/// Continuation run exactly once with the reply (or a local failure such as a timeout)
pub type Continuation = Box<dyn FnOnce(Result<Reply>) + Send>;

/// Draw a correlation id uniformly from the double-safe integer range
pub fn random_correlation_id() -> CorrelationId {
    CorrelationId::new(rand::thread_rng().gen_range(-CorrelationId::MAX..=CorrelationId::MAX))
}

/// Pending invocations owned by one endpoint
pub struct CorrelationTable {
    entries: Mutex<HashMap<CorrelationId, Continuation>>,
    collision_retries: u32,
}

impl CorrelationTable {
    pub fn new(collision_retries: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            collision_retries,
        }
    }

    /// Allocate an id that is not currently outstanding and park `continuation` under it
    pub fn register(&self, continuation: Continuation) -> Result<CorrelationId> {
        let mut entries = self.entries.lock();
        for _ in 0..=self.collision_retries {
            let id = random_correlation_id();
            if entries.contains_key(&id) {
                tracing::warn!("Correlation id {} collided with a live entry, redrawing", id);
                continue;
            }
            entries.insert(id, continuation);
            return Ok(id);
        }

        Err(Error::runtime_msg(format!(
            "no free correlation id after {} attempts",
            self.collision_retries + 1
        )))
    }

    /// Remove the entry for `id`, if it is still outstanding
    pub fn take(&self, id: CorrelationId) -> Option<Continuation> {
        self.entries.lock().remove(&id)
    }

    /// Complete the invocation `frame.id` with `frame` read as its reply
    ///
    /// Hands the frame back when no invocation is waiting on that id, in
    /// which case it is a request from the peer. The continuation runs after
    /// the table lock is released, so it may register new invocations.
    pub fn complete(&self, frame: InvokeFrame) -> Option<InvokeFrame> {
        match self.take(frame.id) {
            Some(continuation) => {
                continuation(Ok(frame.into_reply()));
                None
            }
            None => Some(frame),
        }
    }

    /// Evict `id` and fail its continuation with a timeout
    pub fn expire(&self, id: CorrelationId, duration_ms: u64) -> bool {
        match self.take(id) {
            Some(continuation) => {
                tracing::debug!("Invocation {} expired after {}ms", id, duration_ms);
                continuation(Err(Error::timeout(format!("invocation {id}"), duration_ms)));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: CorrelationId) -> bool {
        self.entries.lock().contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.entries.lock().len()
    }
}
