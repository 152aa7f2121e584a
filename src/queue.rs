use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// A bounded FIFO of pending work items.
///
/// Unlike a plain channel this queue is open for non-blocking access from all
///  sides: callers push, the writer loop pops, and the reaper periodically
///  drains and re-fills it while sweeping for expired items. Only a single
///  task may block in [`PendingQueue::pop`] at any instant (the writer loop,
///  or the connection driver between connections); everyone else uses the
///  `try_` variants.
pub struct PendingQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
}

impl<T> PendingQueue<T> {
    pub fn new(capacity: usize) -> PendingQueue<T> {
        PendingQueue {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            notify: Notify::new(),
        }
    }

    /// Appends an item, or hands it back if the queue is at capacity.
    pub fn try_push(&self, item: T) -> Result<(), T> {
        let mut items = self.items.lock().unwrap();
        if items.len() >= self.capacity {
            return Err(item);
        }
        items.push_back(item);
        drop(items);
        self.notify.notify_one();
        Ok(())
    }

    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().unwrap().pop_front()
    }

    /// Waits for the next item. Cancellation-safe: an item is only removed
    ///  from the queue in the same poll that returns it.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().unwrap().is_empty()
    }
}
