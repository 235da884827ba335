use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::ChannelMsg;
use russh_keys::key;

use super::{scp, CommandOutput, RemoteExecutor, RemoteSession, STAGING_DIR};
use crate::config::NodeConfig;
use crate::error::{FleetError, Result};

/// Client handler that accepts any host key.
///
/// Nodes are addressed by the operator's own inventory file; host keys are
/// not pinned.
struct AcceptAnyHostKey;

#[async_trait]
impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Opens public-key authenticated SSH sessions.
#[derive(Clone)]
pub struct SshExecutor {
    config: Arc<client::Config>,
}

impl Default for SshExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SshExecutor {
    pub fn new() -> Self {
        Self {
            config: Arc::new(client::Config::default()),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

fn connect_error(node: &NodeConfig, reason: impl std::fmt::Display) -> FleetError {
    FleetError::Connect {
        node: node.hostname.clone(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    type Session = SshSession;

    async fn connect(&self, node: &NodeConfig) -> Result<SshSession> {
        let key_path = expand_home(&node.ssh_key_file);
        let key_pair = russh_keys::load_secret_key(&key_path, None).map_err(|e| {
            connect_error(
                node,
                format!("failed to read SSH key file {}: {}", key_path.display(), e),
            )
        })?;

        let mut handle = client::connect(
            self.config.clone(),
            (node.hostname.as_str(), node.port),
            AcceptAnyHostKey,
        )
        .await
        .map_err(|e| connect_error(node, e))?;

        let authenticated = handle
            .authenticate_publickey(node.username.clone(), Arc::new(key_pair))
            .await
            .map_err(|e| connect_error(node, e))?;
        if !authenticated {
            return Err(connect_error(node, "public key authentication rejected"));
        }

        tracing::debug!(node = %node.hostname, port = node.port, "SSH session established");
        Ok(SshSession {
            node: node.hostname.clone(),
            handle,
        })
    }
}

/// One authenticated SSH connection. Every command gets its own channel.
pub struct SshSession {
    node: String,
    handle: Handle<AcceptAnyHostKey>,
}

impl SshSession {
    async fn run(&self, command: &str) -> std::result::Result<CommandOutput, russh::Error> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_status,
        })
    }

    async fn copy_to_staging(&self, local_path: &Path) -> std::result::Result<String, String> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| e.to_string())?;
        channel
            .exec(true, format!("scp -qt {}", STAGING_DIR))
            .await
            .map_err(|e| e.to_string())?;

        // The framing is written into one end of an in-memory pipe while the
        // channel streams the other end to the remote sink.
        let (mut pipe_tx, pipe_rx) = tokio::io::duplex(64 * 1024);
        let path = local_path.to_path_buf();
        let framer = tokio::spawn(async move { scp::send_file(&mut pipe_tx, &path).await });

        channel.data(pipe_rx).await.map_err(|e| e.to_string())?;
        let name = framer
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())?;
        channel.eof().await.map_err(|e| e.to_string())?;

        let mut stderr = Vec::new();
        let mut exit_status = None;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        match exit_status {
            Some(0) => Ok(format!("{}/{}", STAGING_DIR, name)),
            other => Err(format!(
                "remote scp exited with {:?}: {}",
                other,
                String::from_utf8_lossy(&stderr).trim()
            )),
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn execute(&self, command: &str) -> CommandOutput {
        match self.run(command).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(node = %self.node, error = %e, "SSH command failed");
                CommandOutput::transport_failure(format!(
                    "failed to run command on {}: {}",
                    self.node, e
                ))
            }
        }
    }

    async fn transfer_file(&self, local_path: &Path) -> Result<String> {
        tracing::info!(node = %self.node, path = %local_path.display(), "Transferring file");
        self.copy_to_staging(local_path)
            .await
            .map_err(|reason| FleetError::Transfer {
                node: self.node.clone(),
                path: local_path.to_path_buf(),
                reason,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_home_replaces_tilde() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_home(Path::new("~/.ssh/id_rsa")),
            PathBuf::from("/home/tester/.ssh/id_rsa")
        );
        assert_eq!(
            expand_home(Path::new("/etc/keys/id")),
            PathBuf::from("/etc/keys/id")
        );
    }

    #[tokio::test]
    async fn connect_fails_on_missing_key() {
        let node = NodeConfig::new("127.0.0.1", "nobody").with_key_file("/nonexistent/key");
        let err = SshExecutor::new().connect(&node).await.err().unwrap();
        match err {
            FleetError::Connect { node, reason } => {
                assert_eq!(node, "127.0.0.1");
                assert!(reason.contains("SSH key file"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
