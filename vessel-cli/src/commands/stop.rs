use anyhow::{Context, Result};
use vessel_runtime::RuntimeConfig;

pub async fn execute(config: RuntimeConfig, name: &str) -> Result<()> {
    let runtime = super::open_runtime(config)?;
    runtime
        .stop(name)
        .await
        .with_context(|| format!("Failed to stop container '{name}'"))?;
    let status = runtime.get(name)?.status();
    println!("{name}: {status}");
    Ok(())
}
