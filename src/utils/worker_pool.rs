// Copyright 2025 the tidenet authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt::Debug;
use std::future::Future;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error};

use crate::utils::panic_message;
use crate::Shutdown;

/// Worker pool tuning parameters.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Per-worker task queue capacity.
    pub channel_capacity: usize,
    /// Number of workers, each owning one queue.
    pub num_workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
            num_workers: 4,
        }
    }
}

/// A fixed set of workers with one bounded queue each.
///
/// Tasks sent to the same queue run strictly in order on a single worker,
/// which is what preserves per-connection message ordering when the queue
/// index is derived from the connection id. A worker never abandons its
/// queue: each one runs under a supervisor that joins the loop task and, if
/// it died unwinding, starts a replacement loop on the same receiver, so
/// tasks enqueued behind a panic keep both their order and their worker.
#[derive(Debug)]
pub struct WorkerPool<T> {
    queues: Vec<async_channel::Sender<T>>,
    _shutdown_complete_tx: mpsc::Sender<()>,
}

impl<T: Send + Debug + 'static> WorkerPool<T> {
    pub fn new<F, Fut>(
        notify_shutdown: broadcast::Sender<()>,
        shutdown_complete_tx: mpsc::Sender<()>,
        handler: F,
        config: WorkerPoolConfig,
    ) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static + Clone,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut queues = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let (sender, receiver) = async_channel::bounded(config.channel_capacity);
            queues.push(sender);
            Self::supervise(id, receiver, notify_shutdown.clone(), handler.clone());
        }

        WorkerPool {
            queues,
            _shutdown_complete_tx: shutdown_complete_tx,
        }
    }

    /// Enqueues a task on the given worker's queue, waiting while it is full.
    pub async fn send(&self, task: T, worker_id: usize) -> Result<(), async_channel::SendError<T>> {
        self.queues
            .get(worker_id)
            .expect("no queue for worker index")
            .send(task)
            .await
    }

    pub fn worker_count(&self) -> usize {
        self.queues.len()
    }

    fn supervise<F, Fut>(
        id: usize,
        receiver: async_channel::Receiver<T>,
        notify_shutdown: broadcast::Sender<()>,
        handler: F,
    ) where
        F: Fn(T) -> Fut + Send + Sync + 'static + Clone,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            loop {
                let loop_task = tokio::spawn(Self::work(
                    id,
                    receiver.clone(),
                    Shutdown::new(notify_shutdown.subscribe()),
                    handler.clone(),
                ));
                match loop_task.await {
                    // clean exit: shutdown observed or queue gone
                    Ok(()) => break,
                    Err(err) if err.is_panic() => {
                        let reason = panic_message(&*err.into_panic());
                        error!(worker_id = id, reason, "worker loop died, starting a replacement");
                    }
                    Err(_) => break,
                }
            }
            debug!(worker_id = id, "worker supervisor done");
        });
    }

    async fn work<F, Fut>(
        id: usize,
        receiver: async_channel::Receiver<T>,
        mut shutdown: Shutdown,
        handler: F,
    ) where
        F: Fn(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        debug!(worker_id = id, "worker up");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    receiver.close();
                    break;
                }
                task = receiver.recv() => match task {
                    Ok(task) => handler(task).await,
                    Err(_) => return,
                }
            }
        }
        // the queue is closed; whatever made it in before the signal still runs
        while let Ok(task) = receiver.try_recv() {
            handler(task).await;
        }
        debug!(worker_id = id, "worker finished its backlog");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    fn recording_pool(
        config: WorkerPoolConfig,
    ) -> (WorkerPool<u32>, Arc<Mutex<Vec<u32>>>) {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, _) = mpsc::channel(1);

        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let pool = WorkerPool::new(
            notify_shutdown,
            shutdown_complete_tx,
            move |task: u32| {
                let sink = sink.clone();
                async move {
                    if task == 13 {
                        panic!("task 13 is cursed");
                    }
                    sink.lock().unwrap().push(task);
                }
            },
            config,
        );
        (pool, seen)
    }

    #[tokio::test]
    async fn test_send_routes_to_named_queue() {
        let (pool, seen) = recording_pool(WorkerPoolConfig::default());

        pool.send(1, 0).await.unwrap();
        pool.send(2, 1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(pool.worker_count(), 4);
    }

    #[tokio::test]
    async fn test_same_queue_preserves_order() {
        let (pool, seen) = recording_pool(WorkerPoolConfig::default());

        for n in 0..100u32 {
            pool.send(n + 100, 2).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            (100..200).collect::<Vec<_>>().as_slice()
        );
    }

    #[tokio::test]
    async fn test_worker_respawns_on_its_queue_after_panic() {
        let (pool, seen) = recording_pool(WorkerPoolConfig {
            channel_capacity: 8,
            num_workers: 2,
        });

        pool.send(13, 0).await.unwrap();
        pool.send(7, 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(seen.lock().unwrap().as_slice(), &[7]);
    }
}
