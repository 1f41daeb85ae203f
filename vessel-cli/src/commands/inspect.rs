use anyhow::{Context, Result};
use vessel_runtime::RuntimeConfig;

pub fn execute(config: RuntimeConfig, name: &str) -> Result<()> {
    let runtime = super::open_runtime(config)?;
    let record = runtime
        .get(name)
        .with_context(|| format!("Cannot inspect '{name}'"))?
        .record();
    let json = serde_json::to_string_pretty(&record).context("Failed to encode record")?;
    println!("{json}");
    Ok(())
}
