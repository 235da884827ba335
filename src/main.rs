use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

use fleetrun::config::{ClusterConfig, FailurePolicy, RunConfig};
use fleetrun::remote::SshExecutor;
use fleetrun::router::{Console, StdConsole};
use fleetrun::shutdown::install_shutdown_handler;
use fleetrun::{Cluster, RunReport};

#[derive(Parser, Debug)]
#[command(name = "fleetrun")]
#[command(version)]
#[command(about = "Run a command for every line of input across a fleet of SSH nodes")]
#[command(after_help = "Examples:
  fleetrun setup --config servers.yaml
  seq 100 | fleetrun run --config servers.yaml --command \"echo -n 'Hello {} from '; hostname\"
  seq 100 | fleetrun run --config servers.yaml --command \"echo {}\" --image-tar /tmp/ubuntu2204.tar")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Install rootless podman on every configured node
    Setup {
        /// Cluster file listing the nodes (YAML)
        #[arg(long)]
        config: PathBuf,
    },

    /// Run a command once per line of standard input
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Cluster file listing the nodes (YAML)
    #[arg(long)]
    config: PathBuf,

    /// Command to run; `{}` is replaced with the input line
    #[arg(long)]
    command: String,

    /// Number of concurrent jobs on each node
    #[arg(long, default_value = "1")]
    jobs_per_node: usize,

    /// Image tarball to load on every node and run each job in
    #[arg(long)]
    image_tar: Option<PathBuf>,

    /// Read all input first and show progress as a percentage
    #[arg(long)]
    show_percentage: bool,

    /// Keep running on the remaining nodes when a node cannot be reached
    #[arg(long)]
    keep_going: bool,

    /// Format of the final run report
    #[arg(long, short = 'o', default_value = "text")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

impl RunArgs {
    fn run_config(&self) -> RunConfig {
        let policy = if self.keep_going {
            FailurePolicy::KeepGoing
        } else {
            FailurePolicy::Abort
        };
        let mut config = RunConfig::new(self.command.clone())
            .with_jobs_per_node(self.jobs_per_node)
            .with_show_percentage(self.show_percentage)
            .with_failure_policy(policy);
        if let Some(image_tar) = &self.image_tar {
            config = config.with_image_tar(image_tar.clone());
        }
        config
    }
}

fn print_report(
    report: &RunReport,
    format: &OutputFormat,
    console: &dyn Console,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            console.app_output(&format!("{}\n", serde_json::to_string_pretty(report)?));
        }
        OutputFormat::Text => {
            if report.dropped > 0 {
                console.app_output(&format!(
                    "Dropped jobs: {} (claimed but never executed)\n",
                    report.dropped
                ));
            }
            if !report.failed_nodes.is_empty() {
                console.app_output(&format!(
                    "Unreachable nodes: {}\n",
                    report.failed_nodes.join(", ")
                ));
            }
        }
    }
    Ok(())
}

async fn run_setup(config: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let cluster_config = ClusterConfig::load(&config).await?;
    let cluster = Cluster::new(&cluster_config, Arc::new(SshExecutor::new()));
    cluster.setup(&StdConsole).await?;
    Ok(())
}

async fn run_jobs(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let cluster_config = ClusterConfig::load(&args.config).await?;
    let run_config = args.run_config();

    tracing::info!(
        nodes = cluster_config.servers.len(),
        jobs_per_node = run_config.jobs_per_node,
        image_tar = ?run_config.image_tar,
        "Starting run"
    );

    let cluster = Cluster::new(&cluster_config, Arc::new(SshExecutor::new()));
    let console: Arc<dyn Console> = Arc::new(StdConsole);
    let cancel = install_shutdown_handler();
    let input = BufReader::new(tokio::io::stdin());

    let report = cluster
        .run(&run_config, input, console.clone(), cancel)
        .await?;
    print_report(&report, &args.output, console.as_ref())?;
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Setup { config } => run_setup(config).await,
        Commands::Run(run_args) => run_jobs(run_args).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
