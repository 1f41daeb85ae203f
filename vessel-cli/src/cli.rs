//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use vessel_core::{PortMapping, RestartPolicy, VolumeMapping};
use vessel_runtime::IsolationMode;

#[derive(Parser)]
#[command(name = "vessel")]
#[command(about = "Single-host container runtime", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// State directory (overrides VESSEL_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Launch strategy: auto, isolated or simulated
    #[arg(long, global = true)]
    pub isolation: Option<IsolationMode>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and start a container, supervising it until it stops or Ctrl+C
    Run(RunArgs),

    /// List containers
    Ps,

    /// Show a container's log
    Logs {
        /// Container name
        name: String,

        /// Number of lines from the end
        #[arg(short = 'n', long, default_value_t = 50)]
        tail: usize,
    },

    /// Stop a running container, including one started by another `vessel`
    Stop {
        /// Container name
        name: String,
    },

    /// Print a container's record as JSON
    Inspect {
        /// Container name
        name: String,
    },

    /// Remove a stopped container and its files
    Rm {
        /// Container name
        name: String,
    },

    /// Report what this host supports
    Check,

    /// Show version information
    Version,
}

#[derive(Args)]
pub struct RunArgs {
    /// Container name
    #[arg(short, long)]
    pub name: Option<String>,

    /// JSON container spec; flags given here override its values
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Image directory under <state>/images
    #[arg(long)]
    pub image: Option<String>,

    /// Memory limit in MB
    #[arg(short, long)]
    pub memory: Option<u64>,

    /// CPU limit in percent of one core
    #[arg(long)]
    pub cpu: Option<f64>,

    /// Publish a port (HOST:CONTAINER)
    #[arg(short = 'p', long = "publish", value_parser = PortMapping::parse)]
    pub ports: Vec<PortMapping>,

    /// Bind a host directory (HOST:CONTAINER)
    #[arg(long = "volume", value_parser = VolumeMapping::parse)]
    pub volumes: Vec<VolumeMapping>,

    /// Set an environment variable (KEY=VALUE)
    #[arg(short, long)]
    pub env: Vec<String>,

    /// Restart policy: no, always, on-failure, unless-stopped
    #[arg(long)]
    pub restart: Option<RestartPolicy>,

    /// Health check command
    #[arg(long)]
    pub health_cmd: Option<String>,

    /// Seconds between health checks
    #[arg(long, default_value_t = 30)]
    pub health_interval: u64,

    /// Seconds before a health check times out
    #[arg(long, default_value_t = 10)]
    pub health_timeout: u64,

    /// Consecutive failures before the container is unhealthy
    #[arg(long, default_value_t = 3)]
    pub health_retries: u32,

    /// Command to run
    #[arg(last = true)]
    pub command: Vec<String>,
}
