//! Request correlation for in-flight generations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::InferenceError;

/// Outcome delivered to a waiting caller.
pub type Reply = Result<String, InferenceError>;

/// Identifies one outstanding generation.
///
/// The chunk index alone is not unique when two callers generate for the
/// same index, so every registration also gets a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CorrelationKey {
    pub chunk_index: usize,
    pub request_id: u64,
}

/// Map from outstanding request to the caller awaiting its reply.
///
/// Each entry is resolved at most once; late or duplicate replies for a
/// key that is no longer present are discarded.
#[derive(Debug, Default)]
pub struct CorrelationMap {
    next_id: AtomicU64,
    pending: Mutex<HashMap<CorrelationKey, oneshot::Sender<Reply>>>,
}

impl CorrelationMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<CorrelationKey, oneshot::Sender<Reply>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new outstanding request for `chunk_index`.
    pub fn register(&self, chunk_index: usize) -> (CorrelationKey, oneshot::Receiver<Reply>) {
        let key = CorrelationKey {
            chunk_index,
            request_id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        let (tx, rx) = oneshot::channel();
        self.entries().insert(key, tx);
        (key, rx)
    }

    /// Resolve the entry for `key`.
    ///
    /// Returns false when no caller is waiting for it.
    pub fn resolve(&self, key: CorrelationKey, reply: Reply) -> bool {
        let Some(tx) = self.entries().remove(&key) else {
            debug!(
                chunk_index = key.chunk_index,
                request_id = key.request_id,
                "Discarding reply with no waiting caller"
            );
            return false;
        };
        // The caller may have given up already.
        tx.send(reply).is_ok()
    }

    /// Drop the entry for `key` without replying.
    pub fn remove(&self, key: CorrelationKey) -> bool {
        self.entries().remove(&key).is_some()
    }

    /// Reject every outstanding entry. Returns how many were rejected.
    pub fn reject_all(&self, error: impl Fn() -> InferenceError) -> usize {
        let drained: Vec<_> = self.entries().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_delivers_to_matching_caller() {
        let map = CorrelationMap::new();
        let (first, first_rx) = map.register(0);
        let (second, second_rx) = map.register(1);

        assert!(map.resolve(second, Ok("b".to_string())));
        assert!(map.resolve(first, Ok("a".to_string())));

        assert_eq!(first_rx.await.unwrap().unwrap(), "a");
        assert_eq!(second_rx.await.unwrap().unwrap(), "b");
        assert!(map.is_empty());
    }

    #[tokio::test]
    async fn test_same_chunk_index_gets_distinct_keys() {
        let map = CorrelationMap::new();
        let (a, a_rx) = map.register(4);
        let (b, b_rx) = map.register(4);
        assert_ne!(a, b);

        map.resolve(b, Ok("second".to_string()));
        map.resolve(a, Ok("first".to_string()));
        assert_eq!(a_rx.await.unwrap().unwrap(), "first");
        assert_eq!(b_rx.await.unwrap().unwrap(), "second");
    }

    #[test]
    fn test_duplicate_reply_discarded() {
        let map = CorrelationMap::new();
        let (key, _rx) = map.register(0);
        assert!(map.resolve(key, Ok("once".to_string())));
        assert!(!map.resolve(key, Ok("twice".to_string())));
    }

    #[tokio::test]
    async fn test_reject_all_empties_map() {
        let map = CorrelationMap::new();
        let receivers: Vec<_> = (0..3).map(|i| map.register(i).1).collect();

        assert_eq!(map.reject_all(|| InferenceError::Cancelled), 3);
        assert_eq!(map.len(), 0);
        for rx in receivers {
            assert!(matches!(rx.await.unwrap(), Err(InferenceError::Cancelled)));
        }
    }
}
