use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::scheduler::JobQueue;

/// Claim jobs from `queue` until it is closed and drained or `cancel` fires,
/// running `handle` on each one. A job already claimed is always finished.
/// Returns the number of jobs claimed.
pub async fn drain_queue<J, F, Fut>(
    queue: &JobQueue<J>,
    cancel: &CancellationToken,
    mut handle: F,
) -> u64
where
    F: FnMut(J) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut claimed = 0;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = queue.recv() => next,
        };
        let Some(job) = next else {
            break;
        };
        claimed += 1;
        handle(job).await;
    }
    claimed
}

/// One worker's share of the pool's active count. Released explicitly when
/// the worker returns, or on drop if it panicked or was aborted.
struct ActiveSlot<J: Send + 'static> {
    active: Arc<AtomicUsize>,
    queue: JobQueue<J>,
    released: bool,
}

impl<J: Send + 'static> ActiveSlot<J> {
    async fn release(&mut self) {
        self.released = true;
        release(&self.active, &self.queue).await;
    }
}

impl<J: Send + 'static> Drop for ActiveSlot<J> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::debug!("Last worker died, closing job queue");
            let queue = self.queue.clone();
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move { queue.close().await });
            }
        }
    }
}

async fn release<J>(active: &AtomicUsize, queue: &JobQueue<J>) {
    if active.fetch_sub(1, Ordering::SeqCst) == 1 {
        tracing::debug!("No workers left, closing job queue");
        queue.close().await;
    }
}

/// A set of tasks consuming one shared [`JobQueue`].
///
/// When the last worker exits the queue is closed, so a producer never
/// waits on a queue nobody will drain again. Call [`WorkerPool::seal`]
/// once every worker has been spawned.
pub struct WorkerPool<J, R> {
    queue: JobQueue<J>,
    cancel: CancellationToken,
    tasks: JoinSet<R>,
    active: Arc<AtomicUsize>,
    sealed: bool,
}

impl<J, R> WorkerPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    pub fn new(queue: JobQueue<J>, cancel: CancellationToken) -> Self {
        Self {
            queue,
            cancel,
            tasks: JoinSet::new(),
            // Held by the pool itself until sealed.
            active: Arc::new(AtomicUsize::new(1)),
            sealed: false,
        }
    }

    /// Start a worker. It receives its own handle to the queue and the
    /// run's cancellation token.
    pub fn spawn<F, Fut>(&mut self, worker: F)
    where
        F: FnOnce(JobQueue<J>, CancellationToken) -> Fut,
        Fut: Future<Output = R> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let fut = worker(self.queue.clone(), self.cancel.clone());
        let mut slot = ActiveSlot {
            active: self.active.clone(),
            queue: self.queue.clone(),
            released: false,
        };
        self.tasks.spawn(async move {
            let report = fut.await;
            slot.release().await;
            report
        });
    }

    /// Declare that no more workers will be spawned.
    pub async fn seal(&mut self) {
        if !self.sealed {
            self.sealed = true;
            release(&self.active, &self.queue).await;
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every worker to exit and collect their results.
    pub async fn join(mut self) -> Vec<R> {
        self.seal().await;
        let mut reports = Vec::with_capacity(self.tasks.len());
        while let Some(result) = self.tasks.join_next().await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => tracing::error!(error = %e, "Worker task panicked"),
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_counts_claimed_jobs() {
        let (tx, queue) = JobQueue::bounded(10);
        for i in 0..3 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        let claimed = drain_queue(&queue, &CancellationToken::new(), |j| {
            seen.push(j);
            async {}
        })
        .await;
        assert_eq!(claimed, 3);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn drain_stops_on_cancel() {
        let (tx, queue) = JobQueue::<u32>::bounded(10);
        let cancel = CancellationToken::new();
        cancel.cancel();
        tx.send(1).await.unwrap();

        let claimed = drain_queue(&queue, &cancel, |_| async {}).await;
        assert_eq!(claimed, 0);
    }

    #[tokio::test]
    async fn pool_joins_all_workers() {
        let (tx, queue) = JobQueue::bounded(4);
        let mut pool: WorkerPool<u32, u64> = WorkerPool::new(queue, CancellationToken::new());
        for _ in 0..3 {
            pool.spawn(|q, c| async move { drain_queue(&q, &c, |_| async {}).await });
        }
        pool.seal().await;
        assert_eq!(pool.len(), 3);

        for i in 0..20 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let reports = pool.join().await;
        assert_eq!(reports.len(), 3);
        assert_eq!(reports.iter().sum::<u64>(), 20);
    }

    #[tokio::test]
    async fn queue_closes_when_every_worker_is_gone() {
        let (tx, queue) = JobQueue::<u32>::bounded(1);
        let mut pool: WorkerPool<u32, ()> = WorkerPool::new(queue, CancellationToken::new());
        // Workers that exit without consuming anything.
        pool.spawn(|_q, _c| async {});
        pool.spawn(|_q, _c| async {});
        pool.seal().await;

        // May already be rejected if the workers were quick.
        let _ = tx.send(1).await;
        let second = tokio::time::timeout(Duration::from_secs(1), tx.send(2))
            .await
            .expect("producer must not hang on an abandoned queue");
        assert_eq!(second, Err(2));
        pool.join().await;
    }

    #[tokio::test]
    async fn queue_closes_when_every_worker_panics() {
        let (tx, queue) = JobQueue::<u32>::bounded(1);
        let mut pool: WorkerPool<u32, ()> = WorkerPool::new(queue, CancellationToken::new());
        for _ in 0..2 {
            pool.spawn(|_q, _c| async {
                if true {
                    panic!("worker crashed");
                }
            });
        }
        pool.seal().await;

        let _ = tx.send(1).await;
        let second = tokio::time::timeout(Duration::from_secs(1), tx.send(2))
            .await
            .expect("producer must not hang after every worker panicked");
        assert_eq!(second, Err(2));
        assert!(pool.join().await.is_empty());
    }

    #[tokio::test]
    async fn worker_started_after_close_exits_immediately() {
        let (tx, queue) = JobQueue::<u32>::bounded(4);
        drop(tx);

        let mut pool: WorkerPool<u32, u64> = WorkerPool::new(queue, CancellationToken::new());
        pool.spawn(|q, c| async move { drain_queue(&q, &c, |_| async {}).await });
        let reports = tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("worker must not block on a closed queue");
        assert_eq!(reports, vec![0]);
    }
}
