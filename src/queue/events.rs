use super::task::TaskRecord;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

/// Identifies one subscription so it can be cancelled later
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Fan-out of task snapshots to interested observers.
///
/// Every state or progress change produces one `TaskRecord` clone per
/// subscriber, delivered over an unbounded channel so the queue never blocks
/// on a slow consumer. A dropped receiver is pruned on the next emit;
/// `unsubscribe` removes it eagerly and is idempotent.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    subscribers: Mutex<HashMap<u64, mpsc::UnboundedSender<TaskRecord>>>,
    next_id: AtomicU64,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<TaskRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().unwrap().insert(id, tx);
        (SubscriptionId(id), rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id.0);
    }

    pub fn emit(&self, snapshot: &TaskRecord) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|_, tx| tx.send(snapshot.clone()).is_ok());
    }

    /// Drop all subscriptions, closing every receiver
    pub fn close(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
