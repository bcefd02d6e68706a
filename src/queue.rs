//! Global priority queue of queued request ids. Ordered by (priority desc,
//! submitted-at asc, sequence asc) with a bounded skip-ahead window so a
//! saturated provider at the head does not block runnable work behind it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

#[derive(Clone, Debug)]
pub struct QueuedItem {
    pub id: String,
    pub provider: String,
    pub priority: i64,
    pub submitted_at_ms: u64,
    seq: u64,
}

impl QueuedItem {
    fn sort_key(&self) -> (i64, u64, u64) {
        // Negated priority so larger priorities sort first.
        (-self.priority, self.submitted_at_ms, self.seq)
    }
}

#[derive(Debug)]
pub struct PriorityQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    notify: Notify,
    seq: AtomicU64,
    max_depth: usize,
    skip_ahead: usize,
}

#[derive(Debug, PartialEq, Eq)]
pub struct QueueFull;

impl PriorityQueue {
    pub fn new(max_depth: usize, skip_ahead: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            max_depth,
            skip_ahead,
        }
    }

    pub fn push(
        &self,
        id: String,
        provider: String,
        priority: i64,
        submitted_at_ms: u64,
    ) -> Result<(), QueueFull> {
        let item = QueuedItem {
            id,
            provider,
            priority,
            submitted_at_ms,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        {
            let mut items = self.items.lock().expect("queue lock");
            if items.len() >= self.max_depth {
                return Err(QueueFull);
            }
            let key = item.sort_key();
            let position = items.partition_point(|existing| existing.sort_key() <= key);
            items.insert(position, item);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority item whose provider can currently run,
    /// looking at most `skip_ahead` positions past the head. Returns `None`
    /// when nothing in the window is runnable.
    pub fn pop_runnable(&self, mut runnable: impl FnMut(&QueuedItem) -> bool) -> Option<QueuedItem> {
        let mut items = self.items.lock().expect("queue lock");
        let window = items.len().min(self.skip_ahead.saturating_add(1));
        for index in 0..window {
            if runnable(&items[index]) {
                return items.remove(index);
            }
        }
        None
    }

    /// Remove a specific id, used by cancellation. Returns true if the
    /// request was still queued.
    pub fn remove(&self, id: &str) -> bool {
        let mut items = self.items.lock().expect("queue lock");
        let before = items.len();
        items.retain(|item| item.id != id);
        items.len() < before
    }

    pub fn depth(&self) -> usize {
        self.items.lock().expect("queue lock").len()
    }

    pub fn depth_for(&self, provider: &str) -> usize {
        self.items
            .lock()
            .expect("queue lock")
            .iter()
            .filter(|item| item.provider == provider)
            .count()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    /// Wake one idle worker; also used when a provider slot frees up.
    pub fn wake(&self) {
        self.notify.notify_one();
    }

    pub async fn wait_for_work(&self) {
        self.notify.notified().await;
    }
}
