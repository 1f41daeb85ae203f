use crate::cli::{Cli, Commands};
use anyhow::{Context, Result};
use vessel_runtime::{Runtime, RuntimeConfig};

pub mod check;
pub mod inspect;
pub mod logs;
pub mod ps;
pub mod rm;
pub mod run;
pub mod stop;

/// Dispatch command to appropriate handler
pub async fn dispatch(cli: Cli) -> Result<()> {
    let mut config = RuntimeConfig::from_env().context("Invalid VESSEL_* environment")?;
    if let Some(dir) = cli.state_dir {
        config = config.with_state_dir(dir);
    }
    if let Some(mode) = cli.isolation {
        config = config.with_isolation(mode);
    }

    match cli.command {
        Commands::Run(args) => run::execute(config, args).await,
        Commands::Ps => ps::execute(config),
        Commands::Logs { name, tail } => logs::execute(config, &name, tail),
        Commands::Stop { name } => stop::execute(config, &name).await,
        Commands::Inspect { name } => inspect::execute(config, &name),
        Commands::Rm { name } => rm::execute(config, &name).await,
        Commands::Check => {
            check::execute(&config);
            Ok(())
        }
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

/// Runtime over the configured state directory
fn open_runtime(config: RuntimeConfig) -> Result<Runtime> {
    let state_dir = config.state_dir.clone();
    Runtime::new(config)
        .with_context(|| format!("Failed to open runtime state in {}", state_dir.display()))
}

fn print_version() {
    println!("🚢 Vessel Container Runtime");
    println!("Version: {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Features:");
    println!("  • cgroup v1/v2 resource limits");
    println!("  • Namespace isolation via unshare/chroot");
    println!("  • Bridge networking and port mapping");
    println!("  • Health checks and restart policies");
}
