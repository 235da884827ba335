use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::container;
use crate::node::NodeHandle;
use crate::remote::{RemoteExecutor, RemoteSession};
use crate::router::{ResultSinks, Tracker};
use crate::scheduler::{CommandTemplate, Job, JobQueue};
use crate::worker::pool::{drain_queue, WorkerPool};

/// What one worker did before it exited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub node: String,
    pub slot: usize,
    pub connected: bool,
    pub processed: u64,
}

/// State shared by every worker of a run.
pub struct WorkerContext<E> {
    pub executor: Arc<E>,
    pub template: Arc<CommandTemplate>,
    /// Provisioned image to run each job in, if any.
    pub image_name: Option<Arc<str>>,
    pub sinks: ResultSinks,
    pub tracker: Arc<Tracker>,
}

impl<E> Clone for WorkerContext<E> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            template: self.template.clone(),
            image_name: self.image_name.clone(),
            sinks: self.sinks.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

/// One concurrency slot on one node. Owns a single connection for its
/// whole lifetime.
pub struct Worker<E> {
    node: Arc<NodeHandle>,
    slot: usize,
    ctx: WorkerContext<E>,
}

impl<E: RemoteExecutor> Worker<E> {
    pub fn new(node: Arc<NodeHandle>, slot: usize, ctx: WorkerContext<E>) -> Self {
        Self { node, slot, ctx }
    }

    /// Connect, then execute jobs from `queue` until it is drained or the
    /// run is cancelled. A worker that cannot connect reports a fatal error
    /// and never touches the queue.
    pub async fn run(self, queue: JobQueue<Job>, cancel: CancellationToken) -> WorkerReport {
        let hostname = self.node.hostname().to_string();
        let mut report = WorkerReport {
            node: hostname.clone(),
            slot: self.slot,
            connected: false,
            processed: 0,
        };

        let connected = tokio::select! {
            _ = cancel.cancelled() => return report,
            connected = self.ctx.executor.connect(self.node.config()) => connected,
        };
        let session = match connected {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(node = %hostname, slot = self.slot, error = %e, "Worker failed to connect");
                self.ctx.tracker.record_node_failure(&hostname);
                self.ctx.sinks.fatal(e.to_string()).await;
                return report;
            }
        };
        report.connected = true;
        tracing::debug!(node = %hostname, slot = self.slot, "Worker connected");

        let this = &self;
        let session = &session;
        report.processed = drain_queue(&queue, &cancel, move |job| this.process(session, job)).await;

        tracing::debug!(node = %hostname, slot = self.slot, processed = report.processed, "Worker finished");
        report
    }

    async fn process(&self, session: &E::Session, job: Job) {
        let mut command = self.ctx.template.render(&job.token);

        if let Some(image_name) = &self.ctx.image_name {
            let home_dir = match self.node.home_dir(session).await {
                Ok(dir) => dir,
                Err(e) => {
                    tracing::warn!(node = %self.node.hostname(), seq = job.seq, error = %e, "Dropping job");
                    self.ctx.tracker.record_dropped();
                    self.ctx
                        .sinks
                        .info(format!("Dropped job {} ({}): {}\n", job.seq, job.token, e))
                        .await;
                    return;
                }
            };
            command = container::wrap_command(home_dir, image_name, &command);
        }

        tracing::trace!(node = %self.node.hostname(), seq = job.seq, command = %command, "Executing job");
        let output = session.execute(&command).await;
        if output.success() {
            self.ctx.sinks.success(output.stdout).await;
        } else {
            self.ctx.sinks.failure(output.stderr).await;
        }
    }
}

/// Spawn `jobs_per_node` workers for every node into a sealed pool.
pub async fn spawn_workers<E: RemoteExecutor>(
    nodes: &[Arc<NodeHandle>],
    jobs_per_node: usize,
    ctx: WorkerContext<E>,
    queue: JobQueue<Job>,
    cancel: CancellationToken,
) -> WorkerPool<Job, WorkerReport> {
    let mut pool = WorkerPool::new(queue, cancel);
    for node in nodes {
        for slot in 0..jobs_per_node {
            let worker = Worker::new(node.clone(), slot, ctx.clone());
            pool.spawn(move |queue, cancel| worker.run(queue, cancel));
        }
    }
    pool.seal().await;
    tracing::info!(workers = pool.len(), nodes = nodes.len(), "Workers started");
    pool
}
