//! Remote execution over SSH.
//!
//! Workers, the provisioning coordinator and the bootstrap procedure only
//! talk to nodes through the traits in this module:
//!
//! - [`RemoteExecutor`]: opens a [`RemoteSession`] to one node
//! - [`RemoteSession`]: runs commands and copies files into the staging dir
//!
//! [`ssh::SshExecutor`] is the production implementation. [`scp`] holds the
//! file-copy sink framing shared by every implementation.

pub mod scp;
pub mod ssh;

use std::path::Path;

use async_trait::async_trait;

use crate::config::NodeConfig;
use crate::error::{FleetError, Result};

pub use ssh::SshExecutor;

/// Remote directory that file transfers land in.
pub const STAGING_DIR: &str = "/tmp";

/// Captured result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the command never reported an exit status, e.g. the
    /// channel could not be opened.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }

    /// Output for a command that failed before or while running on the node.
    pub fn transport_failure(reason: impl std::fmt::Display) -> Self {
        Self {
            stdout: String::new(),
            stderr: reason.to_string(),
            exit_status: None,
        }
    }
}

#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command` through the node's shell. Never fails: transport errors
    /// come back as an unsuccessful [`CommandOutput`].
    async fn execute(&self, command: &str) -> CommandOutput;

    /// Copy a local file into [`STAGING_DIR`] on the node and return its
    /// remote path.
    async fn transfer_file(&self, local_path: &Path) -> Result<String>;
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync + 'static {
    type Session: RemoteSession + 'static;

    async fn connect(&self, node: &NodeConfig) -> Result<Self::Session>;
}

/// Run a command and turn a non-zero exit into an error naming the node.
pub async fn run_checked<S>(session: &S, node: &str, command: &str) -> Result<String>
where
    S: RemoteSession + ?Sized,
{
    let output = session.execute(command).await;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(FleetError::RemoteCommand {
            node: node.to_string(),
            command: command.to_string(),
            stderr: output.stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_requires_zero_exit() {
        let ok = CommandOutput {
            exit_status: Some(0),
            ..Default::default()
        };
        assert!(ok.success());

        let failed = CommandOutput {
            exit_status: Some(2),
            ..Default::default()
        };
        assert!(!failed.success());

        assert!(!CommandOutput::default().success());
    }

    #[test]
    fn transport_failure_carries_reason() {
        let out = CommandOutput::transport_failure("channel closed");
        assert!(!out.success());
        assert_eq!(out.stderr, "channel closed");
        assert!(out.stdout.is_empty());
    }
}
