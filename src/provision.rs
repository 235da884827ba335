//! Image provisioning ahead of a containerised run.
//!
//! Every node receives the image tarball over SCP, loads it into podman and
//! tags it under a run-specific name. At most `concurrency` nodes are
//! provisioned at once so large transfers do not saturate the uplink.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::container;
use crate::error::{FleetError, Result};
use crate::node::NodeHandle;
use crate::remote::{run_checked, RemoteExecutor, RemoteSession};
use crate::router::Console;

/// Random tag for the image of one run, e.g. `task-417`.
pub fn generate_image_name() -> String {
    format!("task-{}", rand::thread_rng().gen_range(0..1000))
}

/// Image reference from the first line of `podman load` output, e.g.
/// `Loaded image: docker.io/library/ubuntu:22.04`.
pub fn parse_loaded_image(stdout: &str) -> Option<&str> {
    stdout.lines().next()?.split_whitespace().nth(2)
}

/// Concurrency counters for the provisioning phase.
#[derive(Debug, Default)]
pub struct ProvisionStats {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
}

/// Marks one node as in flight until dropped, including when its
/// provisioning unit is cancelled mid-step.
struct InFlight<'a>(&'a ProvisionStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ProvisionStats {
    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    /// Highest number of nodes provisioned simultaneously.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

pub struct Provisioner<E> {
    executor: Arc<E>,
    concurrency: usize,
    stats: Arc<ProvisionStats>,
}

impl<E: RemoteExecutor> Provisioner<E> {
    pub fn new(executor: Arc<E>, concurrency: usize) -> Self {
        Self {
            executor,
            concurrency: concurrency.max(1),
            stats: Arc::new(ProvisionStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ProvisionStats> {
        self.stats.clone()
    }

    /// Provision `image_tar` as `image_name` on every node.
    ///
    /// Returns after all nodes acknowledged, or on the first failure. A
    /// failure cancels the provisioning units still running.
    pub async fn provision(
        &self,
        nodes: &[Arc<NodeHandle>],
        image_tar: &Path,
        image_name: &str,
        console: &dyn Console,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let total = nodes.len();
        if total == 0 {
            return Ok(());
        }

        tracing::info!(nodes = total, concurrency = self.concurrency, image = image_name, "Provisioning image");

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let units = cancel.child_token();
        let (ack_tx, mut ack_rx) = mpsc::channel::<(String, Result<()>)>(total);
        let mut tasks = JoinSet::new();

        for node in nodes {
            let node = node.clone();
            let executor = self.executor.clone();
            let stats = self.stats.clone();
            let permits = permits.clone();
            let units = units.clone();
            let ack_tx = ack_tx.clone();
            let image_tar: PathBuf = image_tar.to_path_buf();
            let image_name = image_name.to_string();

            tasks.spawn(async move {
                let hostname = node.hostname().to_string();
                let result = tokio::select! {
                    _ = units.cancelled() => Err(FleetError::Cancelled),
                    result = async {
                        let _permit = match permits.acquire_owned().await {
                            Ok(permit) => permit,
                            Err(e) => return Err(FleetError::Internal(e.to_string())),
                        };
                        let _in_flight = stats.enter();
                        provision_node(executor.as_ref(), &node, &image_tar, &image_name).await
                    } => result,
                };
                let _ = ack_tx.send((hostname, result)).await;
            });
        }
        drop(ack_tx);

        let mut done = 0;
        while done < total {
            let Some((hostname, result)) = ack_rx.recv().await else {
                return Err(FleetError::Internal(
                    "provisioning units exited without acknowledging".to_string(),
                ));
            };
            match result {
                Ok(()) => {
                    done += 1;
                    self.stats.completed.fetch_add(1, Ordering::SeqCst);
                    console.app_output(&format!("\r{}/{} nodes completed image setup", done, total));
                }
                Err(FleetError::Cancelled) => {
                    units.cancel();
                    while tasks.join_next().await.is_some() {}
                    return Err(FleetError::Cancelled);
                }
                Err(e) => {
                    tracing::error!(node = %hostname, error = %e, "Provisioning failed");
                    units.cancel();
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    console.app_output("\n");
                    return Err(FleetError::Provision {
                        node: hostname,
                        source: Box::new(e),
                    });
                }
            }
        }
        console.app_output("\n");

        while tasks.join_next().await.is_some() {}
        Ok(())
    }
}

async fn provision_node<E: RemoteExecutor>(
    executor: &E,
    node: &NodeHandle,
    image_tar: &Path,
    image_name: &str,
) -> Result<()> {
    let hostname = node.hostname();
    let session = executor.connect(node.config()).await?;

    let remote_tar = session.transfer_file(image_tar).await?;
    tracing::debug!(node = %hostname, remote_tar = %remote_tar, "Image transferred");

    let home_dir = node.home_dir(&session).await?;
    let podman = container::podman_cmd(home_dir);

    let load_cmd = format!("{} load -i {}", podman, remote_tar);
    let stdout = run_checked(&session, hostname, &load_cmd).await?;
    let loaded = parse_loaded_image(&stdout).ok_or_else(|| FleetError::RemoteCommand {
        node: hostname.to_string(),
        command: load_cmd.clone(),
        stderr: format!("unexpected podman load output: {:?}", stdout.trim()),
    })?;

    let tag_cmd = format!("{} tag {} {}", podman, loaded, container::image_ref(image_name));
    run_checked(&session, hostname, &tag_cmd).await?;

    tracing::info!(node = %hostname, image = %loaded, tag = image_name, "Image ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_format() {
        for _ in 0..50 {
            let name = generate_image_name();
            let n: u32 = name.strip_prefix("task-").unwrap().parse().unwrap();
            assert!(n < 1000);
        }
    }

    #[test]
    fn parses_loaded_image_reference() {
        let out = "Loaded image: docker.io/library/ubuntu:22.04\n";
        assert_eq!(parse_loaded_image(out), Some("docker.io/library/ubuntu:22.04"));
        assert_eq!(parse_loaded_image("Loaded\n"), None);
        assert_eq!(parse_loaded_image(""), None);
    }
}
