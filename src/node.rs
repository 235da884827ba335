use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::config::NodeConfig;
use crate::error::{FleetError, Result};
use crate::remote::RemoteSession;

/// Runtime view of one node, shared by all of its workers and its
/// provisioning unit.
///
/// The home directory is resolved at most once per node: concurrent callers
/// wait on the same query instead of each issuing their own.
#[derive(Debug)]
pub struct NodeHandle {
    config: NodeConfig,
    home_dir: OnceCell<String>,
}

impl NodeHandle {
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let home_dir = match config.home_dir.clone() {
            Some(dir) => OnceCell::new_with(Some(dir)),
            None => OnceCell::new(),
        };
        Arc::new(Self { config, home_dir })
    }

    pub fn from_configs(configs: &[NodeConfig]) -> Vec<Arc<Self>> {
        configs.iter().cloned().map(Self::new).collect()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn hostname(&self) -> &str {
        &self.config.hostname
    }

    /// Home directory if it is already known.
    pub fn cached_home_dir(&self) -> Option<&str> {
        self.home_dir.get().map(String::as_str)
    }

    /// Return the node's home directory, querying it with `echo $HOME` over
    /// `session` the first time. A failed query leaves the cell empty so a
    /// later caller may try again.
    pub async fn home_dir<S>(&self, session: &S) -> Result<&str>
    where
        S: RemoteSession + ?Sized,
    {
        let dir = self
            .home_dir
            .get_or_try_init(|| async {
                let output = session.execute("echo $HOME").await;
                if !output.success() {
                    return Err(FleetError::HomeDir {
                        node: self.config.hostname.clone(),
                        reason: output.stderr.trim().to_string(),
                    });
                }
                let dir = output.stdout.trim().to_string();
                if dir.is_empty() {
                    return Err(FleetError::HomeDir {
                        node: self.config.hostname.clone(),
                        reason: "empty $HOME".to_string(),
                    });
                }
                tracing::debug!(node = %self.config.hostname, home_dir = %dir, "Resolved home directory");
                Ok(dir)
            })
            .await?;
        Ok(dir.as_str())
    }
}
