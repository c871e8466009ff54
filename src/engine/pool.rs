//! Fixed-size worker pools over a bounded task queue
//!
//! Every pool in the engine has the same shape: a feeder pushes tasks into a
//! bounded queue and closes it when the task source is exhausted, a fixed set
//! of long-lived workers pull tasks until the queue is closed, and results flow
//! through a capacity-one channel. A closer task joins every worker before it
//! drops the last result sender, so the consumer simply drains the returned
//! receiver until it yields `None`.

use futures::future::join_all;
use log::error;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

/// Sender handed to pool handlers for emitting results
pub type ResultSender<U> = mpsc::Sender<U>;

/// A named pool of `workers` concurrent tasks
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    workers: usize,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run `handler` for every task produced by `tasks`.
    ///
    /// The task source is consumed lazily by a feeder task, so a generator can
    /// keep producing while workers are already busy. Submission only waits
    /// when `queue_capacity` tasks are pending. Must be called from within a
    /// tokio runtime.
    pub fn run<I, T, U, F, Fut>(&self, tasks: I, queue_capacity: usize, handler: F) -> mpsc::Receiver<U>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T, ResultSender<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (task_tx, task_rx) = mpsc::channel::<T>(queue_capacity.max(1));
        let (result_tx, result_rx) = mpsc::channel::<U>(1);

        let tasks = tasks.into_iter();
        tokio::spawn(async move {
            for task in tasks {
                if task_tx.send(task).await.is_err() {
                    break;
                }
            }
            // dropping task_tx closes the queue
        });

        let task_rx = Arc::new(Mutex::new(task_rx));
        let handler = Arc::new(handler);
        let handles: Vec<JoinHandle<()>> = (0..self.workers)
            .map(|_| {
                let task_rx = task_rx.clone();
                let results = result_tx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        // one idle worker waits on the queue at a time; the
                        // lock is released before the handler runs
                        let next = {
                            let mut queue = task_rx.lock().await;
                            queue.recv().await
                        };
                        match next {
                            Some(task) => handler(task, results.clone()).await,
                            None => break,
                        }
                    }
                })
            })
            .collect();

        let name = self.name;
        tokio::spawn(async move {
            for joined in join_all(handles).await {
                if let Err(e) = joined {
                    error!("{} worker failed: {}", name, e);
                }
            }
            drop(result_tx);
        });

        result_rx
    }

    /// Run the pool and collect every result
    pub async fn collect<I, T, U, F, Fut>(&self, tasks: I, queue_capacity: usize, handler: F) -> Vec<U>
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
        T: Send + 'static,
        U: Send + 'static,
        F: Fn(T, ResultSender<U>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut results_rx = self.run(tasks, queue_capacity, handler);
        let mut results = Vec::new();
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_processes_every_task() {
        let pool = WorkerPool::new("test", 8);
        let mut results = pool
            .collect(0..1000u64, 1000, |x, tx| async move {
                let _ = tx.send(x * 2).await;
            })
            .await;
        results.sort_unstable();
        assert_eq!(results, (0..1000u64).map(|x| x * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_pool_with_no_tasks_closes() {
        let pool = WorkerPool::new("empty", 3);
        let results: Vec<u32> = pool
            .collect(Vec::<u32>::new(), 0, |x, tx| async move {
                let _ = tx.send(x).await;
            })
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_handler_may_emit_several_results() {
        let pool = WorkerPool::new("fanout", 2);
        let results = pool
            .collect(vec![1usize, 2, 3], 1, |n, tx| async move {
                for i in 0..n {
                    let _ = tx.send(i).await;
                }
            })
            .await;
        assert_eq!(results.len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_nested_pools_drain_fully() {
        let outer = WorkerPool::new("outer", 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let sums = outer
            .collect(0..10usize, 10, move |n, tx| {
                let counter = counter.clone();
                async move {
                    let inner = WorkerPool::new("inner", 3);
                    let parts = inner
                        .collect(0..n, n, move |i, tx| async move {
                            let _ = tx.send(i).await;
                        })
                        .await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = tx.send(parts.into_iter().sum::<usize>()).await;
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 10);
        assert_eq!(sums.iter().sum::<usize>(), (0..10usize).map(|n| n * n.saturating_sub(1) / 2).sum::<usize>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_handlers_run_concurrently() {
        // every handler waits for all the others, so a worker holding the
        // queue while it handles a task would never let the rest start
        let pool = WorkerPool::new("barrier", 4);
        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        let shared = barrier.clone();
        let run = pool.collect(0..4u32, 4, move |x, tx| {
            let barrier = shared.clone();
            async move {
                barrier.wait().await;
                let _ = tx.send(x).await;
            }
        });

        let mut results = tokio::time::timeout(std::time::Duration::from_secs(10), run)
            .await
            .expect("handlers were serialized");
        results.sort_unstable();
        assert_eq!(results, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_worker_count_is_at_least_one() {
        assert_eq!(WorkerPool::new("zero", 0).workers(), 1);
    }
}
