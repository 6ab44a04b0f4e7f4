use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::debug;

use crate::crawler::task::TaskPack;

/// Bounded in-memory queue between the intake endpoint and the workers.
///
/// Admission blocks for at most a fixed window per batch, which turns a
/// saturated pool into rejected work instead of a stalled caller.
pub struct TaskQueue {
    /// Producer side, used by intake
    sender: mpsc::Sender<TaskPack>,

    /// Consumer side, shared by every worker
    receiver: Mutex<mpsc::Receiver<TaskPack>>,
}

impl TaskQueue {
    /// Create a queue holding at most `capacity` packs
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);

        Self {
            sender,
            receiver: Mutex::new(receiver),
        }
    }

    /// Enqueue packs one at a time until `window` elapses.
    ///
    /// Returns the admitted packs, which are always a prefix of `packs`:
    /// once one pack misses the window, the rest of the batch is dropped.
    pub async fn admit(&self, packs: Vec<TaskPack>, window: Duration) -> Vec<TaskPack> {
        let deadline = Instant::now() + window;
        let total = packs.len();
        let mut admitted = Vec::with_capacity(total);

        for pack in packs {
            match timeout_at(deadline, self.sender.reserve()).await {
                Ok(Ok(permit)) => {
                    permit.send(pack.clone());
                    admitted.push(pack);
                },
                Ok(Err(_)) => {
                    debug!("Intake queue closed, dropping remaining packs");
                    break;
                },
                Err(_) => {
                    debug!("Admission window elapsed after {} of {} packs", admitted.len(), total);
                    break;
                }
            }
        }

        admitted
    }

    /// Wait for the next pack
    pub async fn dequeue(&self) -> Option<TaskPack> {
        self.receiver.lock().await.recv().await
    }

    /// Number of packs waiting for a worker
    pub fn depth(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packs(ids: std::ops::Range<i64>) -> Vec<TaskPack> {
        ids.map(|id| TaskPack {
            task_id: id,
            domain: "example.com".to_string(),
            urlpath: format!("/{}", id),
            follow_links: false,
        })
        .collect()
    }

    #[tokio::test]
    async fn test_admits_everything_with_room() {
        let queue = TaskQueue::new(10);
        let admitted = queue.admit(packs(0..3), Duration::from_millis(100)).await;

        assert_eq!(admitted, packs(0..3));
        assert_eq!(queue.depth(), 3);
        assert_eq!(queue.dequeue().await.unwrap().task_id, 0);
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_full_queue_admits_prefix_within_window() {
        let queue = TaskQueue::new(2);
        assert_eq!(queue.admit(packs(100..102), Duration::from_millis(50)).await.len(), 2);

        let submitted = packs(0..5);
        let started = Instant::now();
        let admitted = queue.admit(submitted.clone(), Duration::from_millis(200)).await;

        assert!(admitted.len() < submitted.len());
        assert_eq!(admitted[..], submitted[..admitted.len()]);
        // The window bounds the whole batch, not each item
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(queue.depth(), 2);
    }

    #[tokio::test]
    async fn test_draining_consumer_unblocks_admission() {
        let queue = std::sync::Arc::new(TaskQueue::new(1));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..3 {
                    seen.push(queue.dequeue().await.unwrap().task_id);
                }
                seen
            })
        };

        let admitted = queue.admit(packs(0..3), Duration::from_secs(2)).await;
        assert_eq!(admitted.len(), 3);
        assert_eq!(consumer.await.unwrap(), vec![0, 1, 2]);
    }
}
