//! `setup`: install a rootless podman on every node.
//!
//! Nodes are prepared one after another. Each step runs over a single SSH
//! session; the first failing step aborts the whole setup.

use std::sync::Arc;

use crate::container::{self, PODMAN_BIN_DIR};
use crate::error::{FleetError, Result};
use crate::node::NodeHandle;
use crate::remote::{run_checked, RemoteExecutor, RemoteSession};
use crate::router::Console;

pub const PODMAN_URL: &str =
    "https://github.com/mgoltzsche/podman-static/releases/download/v5.2.2/podman-linux-amd64.tar.gz";

const CLEAR_LINE: &str = "\r\x1b[K";
const RULE: &str = "================================================";

pub const POLICY_JSON: &str = r#"{
    "default": [
        {
            "type": "insecureAcceptAnything"
        }
    ],
    "transports": {
        "docker-daemon": {
            "": [{"type": "insecureAcceptAnything"}]
        }
    }
}"#;

/// `containers.conf` pointing podman at the bundled runtime binaries.
pub fn containers_conf(crun_path: &str, conmon_path: &str, home_dir: &str) -> String {
    format!(
        "[engine]\nruntime = \"{}\"\nconmon_path = [\"{}\"]\nhelper_binaries_dir = [\"{}/{}/podman-linux-amd64/usr/local/lib/podman\"]\n",
        crun_path, conmon_path, home_dir, PODMAN_BIN_DIR
    )
}

/// Shell snippet writing `content` to `~/.config/containers/<name>`.
pub fn write_config_cmd(home_dir: &str, name: &str, content: &str) -> String {
    format!(
        "mkdir -p {home}/.config/containers\ncat <<'EOT' > {home}/.config/containers/{name}\n{content}\nEOT\n",
        home = home_dir,
        name = name,
        content = content
    )
}

pub struct Bootstrapper<E> {
    executor: Arc<E>,
}

impl<E: RemoteExecutor> Bootstrapper<E> {
    pub fn new(executor: Arc<E>) -> Self {
        Self { executor }
    }

    /// Set up every node in order, stopping at the first failure.
    pub async fn setup_all(&self, nodes: &[Arc<NodeHandle>], console: &dyn Console) -> Result<()> {
        for node in nodes {
            console.app_output(&format!("{}\nSetting up server: {}\n", RULE, node.hostname()));
            self.setup_node(node, console)
                .await
                .map_err(|e| FleetError::Bootstrap {
                    node: node.hostname().to_string(),
                    source: Box::new(e),
                })?;
            console.app_output(&format!(
                "{}Setup complete for {}\n{}\n",
                CLEAR_LINE,
                node.hostname(),
                RULE
            ));
        }
        Ok(())
    }

    pub async fn setup_node(&self, node: &NodeHandle, console: &dyn Console) -> Result<()> {
        let host = node.hostname();
        let session = self.executor.connect(node.config()).await?;

        check_prerequisites(&session, host, console).await?;
        let home_dir = node.home_dir(&session).await?.to_string();
        install_podman(&session, host, console).await?;
        write_configurations(&session, host, &home_dir, console).await?;
        verify_podman(&session, host, &home_dir, console).await?;

        tracing::info!(node = %host, "Node setup complete");
        Ok(())
    }
}

fn status(console: &dyn Console, message: &str, host: &str) {
    console.app_output(&format!("{}{} on {}\r", CLEAR_LINE, message, host));
}

async fn check_prerequisites<S: RemoteSession>(
    session: &S,
    host: &str,
    console: &dyn Console,
) -> Result<()> {
    let hostname = run_checked(session, host, "hostname").await?;
    status(console, &format!("Hostname: {}", hostname.trim()), host);

    let curl = run_checked(session, host, "which curl").await?;
    status(console, &format!("curl is installed: {}", curl.trim()), host);

    run_checked(session, host, "sudo -n true").await?;
    status(console, "Sudo permission granted", host);
    Ok(())
}

async fn install_podman<S: RemoteSession>(
    session: &S,
    host: &str,
    console: &dyn Console,
) -> Result<()> {
    let steps = [
        (
            format!("curl -fsSL -o podman.tar.gz {}", PODMAN_URL),
            "Successfully downloaded Podman",
        ),
        (
            format!(
                "mkdir -p ~/{dir} && tar -xzf podman.tar.gz -C ~/{dir}",
                dir = PODMAN_BIN_DIR
            ),
            "Successfully untarred Podman",
        ),
    ];
    for (cmd, message) in &steps {
        run_checked(session, host, cmd).await?;
        status(console, message, host);
    }
    Ok(())
}

async fn find_binary<S: RemoteSession>(
    session: &S,
    host: &str,
    name: &str,
    console: &dyn Console,
) -> Result<String> {
    let cmd = format!("find ~/{} -name {}", PODMAN_BIN_DIR, name);
    let output = run_checked(session, host, &cmd).await?;
    let path = output.lines().next().unwrap_or("").trim().to_string();
    if path.is_empty() {
        return Err(FleetError::RemoteCommand {
            node: host.to_string(),
            command: cmd,
            stderr: format!("{} not found in the podman bundle", name),
        });
    }
    status(console, &format!("{} location: {}", name, path), host);
    Ok(path)
}

async fn write_configurations<S: RemoteSession>(
    session: &S,
    host: &str,
    home_dir: &str,
    console: &dyn Console,
) -> Result<()> {
    let conmon = find_binary(session, host, "conmon", console).await?;
    let crun = find_binary(session, host, "crun", console).await?;

    let files = [
        ("containers.conf", containers_conf(&crun, &conmon, home_dir)),
        ("policy.json", POLICY_JSON.to_string()),
    ];
    for (name, content) in &files {
        run_checked(session, host, &write_config_cmd(home_dir, name, content)).await?;
        status(console, &format!("Set up {}", name), host);
    }
    Ok(())
}

async fn verify_podman<S: RemoteSession>(
    session: &S,
    host: &str,
    home_dir: &str,
    console: &dyn Console,
) -> Result<()> {
    let podman = container::podman_cmd(home_dir);
    let checks = [
        (format!("{} --version", podman), "Podman version"),
        (
            format!("{} run --rm docker.io/library/hello-world", podman),
            "Successfully ran Hello World container",
        ),
    ];
    for (cmd, message) in &checks {
        run_checked(session, host, cmd).await?;
        status(console, message, host);
    }
    Ok(())
}
