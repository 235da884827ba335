use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

/// Producer half of the shared job queue.
///
/// The queue closes once every `JobSender` is dropped.
#[derive(Debug)]
pub struct JobSender<T> {
    tx: mpsc::Sender<T>,
}

impl<T> Clone for JobSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> JobSender<T> {
    /// Push a job, waiting while the queue is full. Returns the job back if
    /// the queue has been closed from the consumer side.
    pub async fn send(&self, job: T) -> Result<(), T> {
        self.tx.send(job).await.map_err(|e| e.0)
    }
}

/// Consumer half of the shared job queue.
///
/// Cloning yields another consumer of the same queue. Each job is handed to
/// exactly one consumer, in the order it was pushed.
#[derive(Debug)]
pub struct JobQueue<T> {
    rx: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for JobQueue<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T> JobQueue<T> {
    /// Create a queue holding at most `capacity` unclaimed jobs.
    pub fn bounded(capacity: usize) -> (JobSender<T>, JobQueue<T>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            JobSender { tx },
            JobQueue {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }

    /// Claim the next job. Returns `None` once the queue is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        self.rx.lock().await.recv().await
    }

    /// Stop accepting new jobs. Jobs already queued can still be claimed.
    pub async fn close(&self) {
        self.rx.lock().await.close();
    }
}
