use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// Capacity of the shared job queue. Ingestion blocks once this many jobs
/// are waiting to be claimed.
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Number of nodes that may receive an image at the same time.
pub const DEFAULT_PROVISION_CONCURRENCY: usize = 2;

fn default_port() -> u16 {
    22
}

/// Connection parameters for one remote host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    pub ssh_key_file: PathBuf,
    /// Precomputed home directory. When absent it is queried over SSH the
    /// first time a worker or provisioning step needs it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_dir: Option<String>,
}

impl NodeConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: default_port(),
            username: username.into(),
            ssh_key_file: PathBuf::from("~/.ssh/id_rsa"),
            home_dir: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ssh_key_file = path.into();
        self
    }

    pub fn with_home_dir(mut self, home_dir: impl Into<String>) -> Self {
        self.home_dir = Some(home_dir.into());
        self
    }
}

/// Contents of the cluster YAML file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub servers: Vec<NodeConfig>,
}

impl ClusterConfig {
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self> {
        let config: ClusterConfig =
            serde_yaml::from_str(text).map_err(|source| FleetError::ConfigParse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FleetError::ConfigRead {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_yaml(&text, path)?;
        tracing::debug!(path = %path.display(), servers = config.servers.len(), "Loaded cluster config");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.servers.is_empty() {
            return Err(FleetError::InvalidConfig(
                "no servers listed under `servers`".to_string(),
            ));
        }
        for server in &self.servers {
            if server.hostname.trim().is_empty() {
                return Err(FleetError::InvalidConfig(
                    "server entry with empty hostname".to_string(),
                ));
            }
            if server.username.trim().is_empty() {
                return Err(FleetError::InvalidConfig(format!(
                    "server {} has no username",
                    server.hostname
                )));
            }
        }
        Ok(())
    }
}

/// What to do when a node-level failure is reported during a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Cancel the whole run on the first node failure.
    #[default]
    Abort,
    /// Report the failure and let the remaining nodes finish the queue.
    KeepGoing,
}

/// Settings for one `run` invocation.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub command: String,
    pub jobs_per_node: usize,
    pub image_tar: Option<PathBuf>,
    pub show_percentage: bool,
    pub queue_capacity: usize,
    pub provision_concurrency: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            jobs_per_node: 1,
            image_tar: None,
            show_percentage: false,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            provision_concurrency: DEFAULT_PROVISION_CONCURRENCY,
            failure_policy: FailurePolicy::Abort,
        }
    }
}

impl RunConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    pub fn with_jobs_per_node(mut self, jobs_per_node: usize) -> Self {
        self.jobs_per_node = jobs_per_node;
        self
    }

    pub fn with_image_tar(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_tar = Some(path.into());
        self
    }

    pub fn with_show_percentage(mut self, show: bool) -> Self {
        self.show_percentage = show;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.command.is_empty() {
            return Err(FleetError::InvalidConfig("command must not be empty".to_string()));
        }
        if self.jobs_per_node == 0 {
            return Err(FleetError::InvalidConfig(
                "jobs-per-node must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 || self.provision_concurrency == 0 {
            return Err(FleetError::InvalidConfig(
                "queue capacity and provision concurrency must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
