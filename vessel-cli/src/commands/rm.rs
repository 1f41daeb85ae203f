use anyhow::{Context, Result};
use vessel_runtime::RuntimeConfig;

pub async fn execute(config: RuntimeConfig, name: &str) -> Result<()> {
    let runtime = super::open_runtime(config)?;
    runtime
        .remove(name)
        .await
        .with_context(|| format!("Failed to remove container '{name}'"))?;
    println!("Removed {name}");
    Ok(())
}
