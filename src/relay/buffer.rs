//! Per-user debounce buffer for batching rapid messages into one prompt.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

type FlushFn<T> = Arc<dyn Fn(i64, Vec<T>) + Send + Sync>;

struct Pending<T> {
    items: Vec<T>,
    timer: JoinHandle<()>,
}

/// Accumulates a user's consecutive items for a quiet period, then hands
/// the whole batch to the flush callback.
///
/// Every `submit` for a user cancels and restarts that user's timer, so the
/// window slides forward while the user keeps typing. At most one timer is
/// live per user at any instant; the entry is evicted when the timer fires
/// or the buffer is cancelled.
pub struct DebounceBuffer<T> {
    quiet: Duration,
    flush: FlushFn<T>,
    pending: Arc<Mutex<HashMap<i64, Pending<T>>>>,
}

impl<T: Send + 'static> DebounceBuffer<T> {
    /// Create a buffer that calls `flush(user_id, items)` after `quiet` of
    /// inactivity for that user.
    pub fn new<F>(quiet: Duration, flush: F) -> Self
    where
        F: Fn(i64, Vec<T>) + Send + Sync + 'static,
    {
        Self {
            quiet,
            flush: Arc::new(flush),
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Append an item to the user's batch and restart their quiet timer.
    pub async fn submit(&self, user_id: i64, item: T) {
        let mut pending = self.pending.lock().await;
        match pending.get_mut(&user_id) {
            Some(entry) => {
                entry.items.push(item);
                // Replace the timer, never let two coexist.
                entry.timer.abort();
                entry.timer = self.spawn_timer(user_id);
            }
            None => {
                pending.insert(
                    user_id,
                    Pending {
                        items: vec![item],
                        timer: self.spawn_timer(user_id),
                    },
                );
            }
        }
    }

    /// Discard the user's batch and cancel their timer.
    /// Returns true if there was anything to cancel.
    pub async fn cancel(&self, user_id: i64) -> bool {
        let mut pending = self.pending.lock().await;
        match pending.remove(&user_id) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    /// Number of items currently buffered for the user.
    pub async fn pending_count(&self, user_id: i64) -> usize {
        let pending = self.pending.lock().await;
        pending.get(&user_id).map(|e| e.items.len()).unwrap_or(0)
    }

    fn spawn_timer(&self, user_id: i64) -> JoinHandle<()> {
        let quiet = self.quiet;
        let map = self.pending.clone();
        let flush = self.flush.clone();

        tokio::spawn(async move {
            sleep(quiet).await;
            // Atomically take the batch. If a concurrent cancel emptied it
            // between expiry and hand-off, this fire is a no-op.
            let items = {
                let mut pending = map.lock().await;
                pending.remove(&user_id).map(|e| e.items)
            };
            if let Some(items) = items
                && !items.is_empty()
            {
                flush(user_id, items);
            }
        })
    }
}
