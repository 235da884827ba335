use std::sync::Arc;

use serde::Serialize;
use tokio::io::AsyncBufRead;
use tokio_util::sync::CancellationToken;

use crate::bootstrap::Bootstrapper;
use crate::config::{ClusterConfig, FailurePolicy, RunConfig};
use crate::error::{FleetError, Result};
use crate::node::NodeHandle;
use crate::provision::{generate_image_name, Provisioner};
use crate::remote::RemoteExecutor;
use crate::router::{Console, ResultRouter, Tracker};
use crate::scheduler::{CommandTemplate, IngestMode, Job, JobQueue, JobSource};
use crate::worker::{spawn_workers, WorkerContext, WorkerReport};

/// Final accounting of a `run`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub submitted: u64,
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Jobs claimed by a worker but never executed.
    pub dropped: u64,
    pub failed_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_name: Option<String>,
}

impl RunReport {
    /// True when every submitted job produced an outcome.
    pub fn is_complete(&self) -> bool {
        self.completed == self.submitted && self.dropped == 0
    }
}

/// The fleet of nodes a command is distributed across.
pub struct Cluster<E> {
    nodes: Vec<Arc<NodeHandle>>,
    executor: Arc<E>,
}

impl<E: RemoteExecutor> Cluster<E> {
    pub fn new(config: &ClusterConfig, executor: Arc<E>) -> Self {
        Self {
            nodes: NodeHandle::from_configs(&config.servers),
            executor,
        }
    }

    pub fn nodes(&self) -> &[Arc<NodeHandle>] {
        &self.nodes
    }

    /// Install podman on every node.
    pub async fn setup(&self, console: &dyn Console) -> Result<()> {
        Bootstrapper::new(self.executor.clone())
            .setup_all(&self.nodes, console)
            .await
    }

    /// Distribute one job per input line across the fleet.
    ///
    /// Startup and shutdown happen in a fixed order:
    ///
    /// 1. Provision the image, if one is configured
    /// 2. Start the result router before anything can produce output
    /// 3. Start the workers, then the job source
    /// 4. The source finishes and closes the queue
    /// 5. Workers drain the queue and exit; only then are the sinks closed
    /// 6. The router's drain loops finish
    ///
    /// A fatal event under [`FailurePolicy::Abort`]
    /// or a cancelled `cancel` stops ingestion and claiming; jobs already
    /// running are allowed to finish.
    pub async fn run<R>(
        &self,
        config: &RunConfig,
        input: R,
        console: Arc<dyn Console>,
        cancel: CancellationToken,
    ) -> Result<RunReport>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        config.validate()?;

        let image_name = match &config.image_tar {
            Some(image_tar) => {
                let image_name = generate_image_name();
                Provisioner::new(self.executor.clone(), config.provision_concurrency)
                    .provision(&self.nodes, image_tar, &image_name, console.as_ref(), &cancel)
                    .await?;
                Some(image_name)
            }
            None => None,
        };

        let tracker = Tracker::new();
        let (sinks, router) =
            ResultRouter::start(console.clone(), tracker.clone(), config.failure_policy, cancel.clone());

        let template = CommandTemplate::new(config.command.clone());
        if !template.has_placeholder() {
            tracing::warn!(command = %config.command, "Command has no {{}} placeholder, every job runs it unchanged");
        }

        let (tx, queue) = JobQueue::<Job>::bounded(config.queue_capacity);
        let ctx = WorkerContext {
            executor: self.executor.clone(),
            template: Arc::new(template),
            image_name: image_name.as_deref().map(Arc::from),
            sinks: sinks.clone(),
            tracker: tracker.clone(),
        };
        let pool = spawn_workers(
            &self.nodes,
            config.jobs_per_node,
            ctx,
            queue,
            cancel.clone(),
        )
        .await;

        let source = JobSource::new(input, IngestMode::for_progress(config.show_percentage));
        let ingested = source.run(tx, &tracker, &sinks, &cancel).await;

        let reports: Vec<WorkerReport> = pool.join().await;
        drop(sinks);
        let summary = router.finish().await;

        let submitted = ingested?;
        let connected = reports.iter().filter(|r| r.connected).count();
        tracing::info!(
            submitted,
            workers = reports.len(),
            connected,
            completed = summary.progress.completed,
            "Run finished"
        );

        if let Some(first) = summary.fatal_messages.first() {
            if config.failure_policy == FailurePolicy::Abort {
                return Err(FleetError::Aborted(first.clone()));
            }
        }
        if cancel.is_cancelled() {
            return Err(FleetError::Cancelled);
        }

        Ok(RunReport {
            submitted,
            completed: summary.progress.completed,
            succeeded: summary.progress.succeeded,
            failed: summary.progress.failed,
            dropped: tracker.dropped(),
            failed_nodes: tracker.failed_nodes(),
            image_name,
        })
    }
}
