//! 内存任务队列
//!
//! 每个命名队列一个互斥保护的优先级堆，出队按优先级降序、
//! 同优先级按创建时间先进先出。容量达到max_pending时入队立即失败，
//! 给生产者明确的背压信号。出队任务持有租约，租约到期未确认的任务
//! 会被后台回收重新投递（至少一次投递语义）。

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{debug, warn};

use jobcenter_core::{JobCenterError, JobCenterResult};
use jobcenter_domain::ports::TaskQueue;
use jobcenter_domain::{QueueConfig, Task};

#[derive(Debug, Clone)]
struct QueueItem {
    weight: i32,
    created_at: DateTime<Utc>,
    seq: u64,
    task: Task,
}

impl PartialEq for QueueItem {
    fn eq(&self, other: &Self) -> bool {
        self.task.id == other.task.id
    }
}

impl Eq for QueueItem {}

impl Ord for QueueItem {
    fn cmp(&self, other: &Self) -> Ordering {
        // 优先级高的排前面，相同优先级按创建时间排序，再按入队序号
        self.weight
            .cmp(&other.weight)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct NamedQueue {
    config: RwLock<QueueConfig>,
    heap: Mutex<BinaryHeap<QueueItem>>,
    notify: Notify,
}

struct InFlight {
    queue_name: String,
    item: QueueItem,
    lease_deadline: Instant,
}

pub struct MemoryTaskQueue {
    queues: RwLock<HashMap<String, Arc<NamedQueue>>>,
    in_flight: Mutex<HashMap<i64, InFlight>>,
    seq: AtomicU64,
    lease_timeout: Duration,
}

impl MemoryTaskQueue {
    pub fn new(lease_timeout: Duration) -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            seq: AtomicU64::new(1),
            lease_timeout,
        }
    }

    async fn get_queue(&self, queue_name: &str) -> JobCenterResult<Arc<NamedQueue>> {
        let queues = self.queues.read().await;
        queues
            .get(queue_name)
            .cloned()
            .ok_or_else(|| JobCenterError::queue_not_found(queue_name))
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, AtomicOrdering::Relaxed)
    }

    async fn push_item(&self, queue: &NamedQueue, item: QueueItem) {
        let queue_name = item.task.queue_name.clone();
        {
            let mut heap = queue.heap.lock().await;
            heap.push(item);
            metrics::gauge!("jobcenter_queue_depth", "queue" => queue_name).set(heap.len() as f64);
        }
        queue.notify.notify_one();
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn register(&self, config: &QueueConfig) -> JobCenterResult<()> {
        let mut queues = self.queues.write().await;
        match queues.get(&config.name) {
            Some(existing) => {
                *existing.config.write().await = config.clone();
                debug!("Updated queue config: {}", config.name);
            }
            None => {
                queues.insert(
                    config.name.clone(),
                    Arc::new(NamedQueue {
                        config: RwLock::new(config.clone()),
                        heap: Mutex::new(BinaryHeap::new()),
                        notify: Notify::new(),
                    }),
                );
                debug!(
                    "Registered queue '{}' (max_workers={}, max_pending={})",
                    config.name, config.max_workers, config.max_pending
                );
            }
        }
        Ok(())
    }

    async fn enqueue(&self, task: &Task) -> JobCenterResult<()> {
        let queue = self.get_queue(&task.queue_name).await?;

        let max_pending = {
            let config = queue.config.read().await;
            if !config.enabled {
                return Err(JobCenterError::Validation(format!(
                    "队列 {} 已禁用",
                    task.queue_name
                )));
            }
            config.max_pending
        };

        {
            let mut heap = queue.heap.lock().await;
            if heap.len() >= max_pending as usize {
                warn!(
                    "Queue '{}' is full ({}/{}), rejecting task {}",
                    task.queue_name,
                    heap.len(),
                    max_pending,
                    task.id
                );
                return Err(JobCenterError::QueueFull {
                    queue: task.queue_name.clone(),
                    max_pending,
                });
            }

            heap.push(QueueItem {
                weight: task.priority.weight(),
                created_at: task.created_at,
                seq: self.next_seq(),
                task: task.clone(),
            });
            metrics::gauge!("jobcenter_queue_depth", "queue" => task.queue_name.clone())
                .set(heap.len() as f64);
        }
        metrics::counter!("jobcenter_tasks_enqueued", "queue" => task.queue_name.clone())
            .increment(1);
        queue.notify.notify_one();

        debug!("Enqueued task {} to '{}'", task.id, task.queue_name);
        Ok(())
    }

    async fn dequeue(&self, queue_name: &str, wait: Duration) -> JobCenterResult<Option<Task>> {
        let queue = self.get_queue(queue_name).await?;
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut heap = queue.heap.lock().await;
                if let Some(item) = heap.pop() {
                    metrics::gauge!("jobcenter_queue_depth", "queue" => queue_name.to_string())
                        .set(heap.len() as f64);
                    drop(heap);

                    let task = item.task.clone();
                    let mut in_flight = self.in_flight.lock().await;
                    in_flight.insert(
                        task.id,
                        InFlight {
                            queue_name: queue_name.to_string(),
                            item,
                            lease_deadline: Instant::now() + self.lease_timeout,
                        },
                    );
                    metrics::counter!("jobcenter_tasks_dequeued", "queue" => queue_name.to_string())
                        .increment(1);
                    return Ok(Some(task));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // 等待新任务或超时，唤醒后重新检查堆
            let _ = tokio::time::timeout(deadline - now, queue.notify.notified()).await;
        }
    }

    async fn ack(&self, task_id: i64) -> JobCenterResult<()> {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.remove(&task_id).is_none() {
            debug!("Ack for unknown task {}", task_id);
        }
        Ok(())
    }

    async fn nack(&self, task_id: i64) -> JobCenterResult<()> {
        let entry = {
            let mut in_flight = self.in_flight.lock().await;
            in_flight.remove(&task_id)
        };

        match entry {
            Some(entry) => {
                let queue = self.get_queue(&entry.queue_name).await?;
                // 保留原始序号，使任务回到同优先级队头
                self.push_item(&queue, entry.item).await;
                debug!("Nacked task {} back to '{}'", task_id, entry.queue_name);
                Ok(())
            }
            None => {
                warn!("Nack for unknown task {}", task_id);
                Ok(())
            }
        }
    }

    async fn remove(&self, task_id: i64) -> JobCenterResult<bool> {
        let queues: Vec<Arc<NamedQueue>> = {
            let queues = self.queues.read().await;
            queues.values().cloned().collect()
        };

        for queue in queues {
            let mut heap = queue.heap.lock().await;
            let before = heap.len();
            if before == 0 {
                continue;
            }
            let items: Vec<QueueItem> = heap.drain().filter(|i| i.task.id != task_id).collect();
            let removed = items.len() < before;
            *heap = items.into_iter().collect();
            if removed {
                debug!("Removed task {} from queue", task_id);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn pending_count(&self, queue_name: &str) -> JobCenterResult<usize> {
        let queue = self.get_queue(queue_name).await?;
        let heap = queue.heap.lock().await;
        Ok(heap.len())
    }

    async fn in_flight_count(&self, queue_name: &str) -> JobCenterResult<usize> {
        let in_flight = self.in_flight.lock().await;
        Ok(in_flight
            .values()
            .filter(|e| e.queue_name == queue_name)
            .count())
    }

    async fn purge(&self, queue_name: &str) -> JobCenterResult<usize> {
        let queue = self.get_queue(queue_name).await?;
        let mut heap = queue.heap.lock().await;
        let purged = heap.len();
        heap.clear();
        Ok(purged)
    }

    async fn reclaim_expired(&self) -> JobCenterResult<Vec<i64>> {
        let now = Instant::now();
        let expired: Vec<(i64, InFlight)> = {
            let mut in_flight = self.in_flight.lock().await;
            let ids: Vec<i64> = in_flight
                .iter()
                .filter(|(_, e)| e.lease_deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| in_flight.remove(&id).map(|e| (id, e)))
                .collect()
        };

        let mut reclaimed = Vec::with_capacity(expired.len());
        for (task_id, entry) in expired {
            warn!(
                "Task {} lease expired on queue '{}', requeueing",
                task_id, entry.queue_name
            );
            let queue = self.get_queue(&entry.queue_name).await?;
            self.push_item(&queue, entry.item).await;
            reclaimed.push(task_id);
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcenter_domain::{ExecutorKind, Priority, TaskSpec, TaskType};

    fn make_queue() -> MemoryTaskQueue {
        MemoryTaskQueue::new(Duration::from_secs(600))
    }

    fn make_task(id: i64, queue: &str, priority: Priority) -> Task {
        let mut task = TaskSpec::new(format!("task-{id}"), TaskType::Command, ExecutorKind::Shell)
            .queue(queue)
            .priority(priority)
            .into_task(None, None);
        task.id = id;
        task
    }

    async fn register(queue: &MemoryTaskQueue, name: &str, max_pending: u32) {
        queue
            .register(&QueueConfig::new(name, 5, max_pending))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_priority_ordering() {
        let queue = make_queue();
        register(&queue, "default", 100).await;

        queue
            .enqueue(&make_task(1, "default", Priority::Low))
            .await
            .unwrap();
        queue
            .enqueue(&make_task(2, "default", Priority::Critical))
            .await
            .unwrap();
        queue
            .enqueue(&make_task(3, "default", Priority::Normal))
            .await
            .unwrap();

        let first = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let second = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let third = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(first.id, 2);
        assert_eq!(second.id, 3);
        assert_eq!(third.id, 1);
    }

    #[tokio::test]
    async fn test_fifo_within_same_priority() {
        let queue = make_queue();
        register(&queue, "default", 100).await;

        let mut earlier = make_task(1, "default", Priority::Normal);
        let mut later = make_task(2, "default", Priority::Normal);
        earlier.created_at = Utc::now() - chrono::Duration::seconds(10);
        later.created_at = Utc::now();

        // 后创建的先入队，仍应先出先创建的
        queue.enqueue(&later).await.unwrap();
        queue.enqueue(&earlier).await.unwrap();

        let first = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, 1);
    }

    #[tokio::test]
    async fn test_backpressure_rejects_at_capacity() {
        let queue = make_queue();
        register(&queue, "small", 3).await;

        for id in 1..=3 {
            queue
                .enqueue(&make_task(id, "small", Priority::Normal))
                .await
                .unwrap();
        }

        let err = queue
            .enqueue(&make_task(4, "small", Priority::Normal))
            .await
            .unwrap_err();
        assert!(matches!(err, JobCenterError::QueueFull { .. }));
        // 拒绝不增加等待数
        assert_eq!(queue.pending_count("small").await.unwrap(), 3);

        // 消费一个之后重新提交成功
        queue
            .dequeue("small", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        queue
            .enqueue(&make_task(4, "small", Priority::Normal))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dequeue_timeout_returns_none() {
        let queue = make_queue();
        register(&queue, "empty", 10).await;

        let start = Instant::now();
        let result = queue
            .dequeue("empty", Duration::from_millis(50))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_dequeue_unknown_queue_fails() {
        let queue = make_queue();
        let err = queue
            .dequeue("missing", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, JobCenterError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn test_ack_clears_in_flight() {
        let queue = make_queue();
        register(&queue, "default", 10).await;
        queue
            .enqueue(&make_task(1, "default", Priority::Normal))
            .await
            .unwrap();

        let task = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.in_flight_count("default").await.unwrap(), 1);

        queue.ack(task.id).await.unwrap();
        assert_eq!(queue.in_flight_count("default").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_nack_returns_to_head_of_priority_class() {
        let queue = make_queue();
        register(&queue, "default", 10).await;

        let mut first = make_task(1, "default", Priority::Normal);
        let mut second = make_task(2, "default", Priority::Normal);
        first.created_at = Utc::now() - chrono::Duration::seconds(5);
        second.created_at = Utc::now();
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let task = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, 1);

        // 拒收后应回到队头，下一次出队仍是同一个任务
        queue.nack(task.id).await.unwrap();
        let again = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, 1);
    }

    #[tokio::test]
    async fn test_remove_queued_task() {
        let queue = make_queue();
        register(&queue, "default", 10).await;
        queue
            .enqueue(&make_task(1, "default", Priority::Normal))
            .await
            .unwrap();
        queue
            .enqueue(&make_task(2, "default", Priority::Normal))
            .await
            .unwrap();

        assert!(queue.remove(1).await.unwrap());
        assert!(!queue.remove(1).await.unwrap());
        assert_eq!(queue.pending_count("default").await.unwrap(), 1);

        let task = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, 2);
    }

    #[tokio::test]
    async fn test_lease_expiry_requeues_task() {
        let queue = MemoryTaskQueue::new(Duration::from_millis(20));
        register(&queue, "default", 10).await;
        queue
            .enqueue(&make_task(1, "default", Priority::Normal))
            .await
            .unwrap();

        let task = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.id, 1);

        // 租约到期前不回收
        assert!(queue.reclaim_expired().await.unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let reclaimed = queue.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, vec![1]);

        // 回收后任务可以再次出队
        let again = queue
            .dequeue("default", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.id, 1);
    }

    #[tokio::test]
    async fn test_blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(make_queue());
        register(&queue, "default", 10).await;

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue("default", Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue
            .enqueue(&make_task(1, "default", Priority::Normal))
            .await
            .unwrap();

        let task = consumer.await.unwrap().unwrap().unwrap();
        assert_eq!(task.id, 1);
    }
}
