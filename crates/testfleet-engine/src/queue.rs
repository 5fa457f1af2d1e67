/*!
 * Allocation queue.
 *
 * FIFO of the devices that can be handed out. Items are unique by key.
 * `poll` scans in insertion order and removes the first match under the
 * queue lock, so two pollers can never receive the same item.
 *
 * Blocked pollers park on a [`Notify`]. Every `add` wakes all of them; each
 * rescans and at most one wins any given item, the rest park again.
 */
use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Items stored in an [`AllocationQueue`]
pub trait Keyed {
    /// Unique key of the item
    fn key(&self) -> &str;
}

/// Blocking, predicate-filtered FIFO with unique entries
#[derive(Debug)]
pub struct AllocationQueue<T> {
    items: Mutex<VecDeque<T>>,
    added: Notify,
}

impl<T> Default for AllocationQueue<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            added: Notify::new(),
        }
    }
}

impl<T: Keyed + Clone> AllocationQueue<T> {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item unless one with the same key is queued
    ///
    /// Returns whether the item was added.
    pub fn add(&self, item: T) -> bool {
        {
            let mut items = self.items.lock();
            if items.iter().any(|queued| queued.key() == item.key()) {
                return false;
            }
            trace!("Queued {}", item.key());
            items.push_back(item);
        }
        self.added.notify_waiters();
        true
    }

    /// Remove the item with this key
    pub fn remove(&self, key: &str) -> Option<T> {
        let mut items = self.items.lock();
        let index = items.iter().position(|queued| queued.key() == key)?;
        items.remove(index)
    }

    /// Whether an item with this key is queued
    pub fn contains(&self, key: &str) -> bool {
        self.items.lock().iter().any(|queued| queued.key() == key)
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Copy of the queued items in order
    pub fn snapshot(&self) -> Vec<T> {
        self.items.lock().iter().cloned().collect()
    }

    /// Remove and return the first item matching `predicate`, without waiting
    pub fn try_poll<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut items = self.items.lock();
        let index = items.iter().position(|item| predicate(item))?;
        items.remove(index)
    }

    /// Remove and return the first item matching `predicate`
    ///
    /// Waits up to `timeout` for a match to be added. A zero timeout scans
    /// once.
    pub async fn poll<F>(&self, mut predicate: F, timeout: Duration) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let deadline = Instant::now() + timeout;
        loop {
            let added = self.added.notified();
            tokio::pin!(added);
            // register before scanning so an add in between is not missed
            added.as_mut().enable();

            if let Some(item) = self.try_poll(&mut predicate) {
                return Some(item);
            }
            if tokio::time::timeout_at(deadline, added).await.is_err() {
                return None;
            }
        }
    }

    /// Remove and return the first item, waiting up to `timeout`
    pub async fn take(&self, timeout: Duration) -> Option<T> {
        self.poll(|_| true, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    struct Item(String, u32);

    impl Keyed for Item {
        fn key(&self) -> &str {
            &self.0
        }
    }

    fn item(key: &str, weight: u32) -> Item {
        Item(key.to_string(), weight)
    }

    #[test]
    fn test_add_is_unique() {
        let queue = AllocationQueue::new();
        assert!(queue.add(item("a", 1)));
        assert!(!queue.add(item("a", 2)));
        assert!(queue.add(item("b", 1)));
        assert_eq!(queue.len(), 2);
        assert!(queue.contains("a"));

        assert_eq!(queue.remove("a"), Some(item("a", 1)));
        assert_eq!(queue.remove("a"), None);
        assert!(!queue.contains("a"));
    }

    #[test]
    fn test_try_poll_is_fifo_with_predicate() {
        let queue = AllocationQueue::new();
        queue.add(item("a", 1));
        queue.add(item("b", 2));
        queue.add(item("c", 2));

        assert_eq!(queue.try_poll(|i| i.1 == 2), Some(item("b", 2)));
        assert_eq!(queue.try_poll(|i| i.1 == 3), None);
        assert_eq!(queue.snapshot(), vec![item("a", 1), item("c", 2)]);
    }

    #[test]
    fn test_take_without_waiting() {
        let queue = AllocationQueue::new();
        queue.add(item("a", 1));
        assert_eq!(tokio_test::block_on(queue.take(Duration::ZERO)), Some(item("a", 1)));
        assert_eq!(tokio_test::block_on(queue.take(Duration::ZERO)), None);
    }

    #[tokio::test]
    async fn test_poll_times_out() {
        let queue: AllocationQueue<Item> = AllocationQueue::new();
        let start = Instant::now();
        assert_eq!(queue.poll(|_| true, Duration::from_millis(30)).await, None);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(queue.take(Duration::ZERO).await, None);
    }

    #[tokio::test]
    async fn test_poll_wakes_on_matching_add() {
        let queue = Arc::new(AllocationQueue::new());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .poll(|i: &Item| i.1 == 7, Duration::from_secs(5))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.add(item("x", 1));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        queue.add(item("y", 7));
        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, Some(item("y", 7)));
        // the non-matching item stays queued
        assert_eq!(queue.snapshot(), vec![item("x", 1)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_item_has_single_winner() {
        let queue = Arc::new(AllocationQueue::new());
        let pollers: Vec<_> = (0..8)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.take(Duration::from_millis(200)).await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add(item("only", 1));

        let mut winners = 0;
        for poller in pollers {
            if poller.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert!(queue.is_empty());
    }
}
