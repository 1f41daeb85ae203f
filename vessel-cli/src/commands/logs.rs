use anyhow::{Context, Result};
use vessel_runtime::RuntimeConfig;

pub fn execute(config: RuntimeConfig, name: &str, tail: usize) -> Result<()> {
    let runtime = super::open_runtime(config)?;
    let logs = runtime
        .logs(name, tail)
        .with_context(|| format!("Cannot read logs of '{name}'"))?;
    println!("{logs}");
    Ok(())
}
