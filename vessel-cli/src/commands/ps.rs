use anyhow::Result;
use vessel_runtime::RuntimeConfig;

pub fn execute(config: RuntimeConfig) -> Result<()> {
    let runtime = super::open_runtime(config)?;
    let records = runtime.list();

    println!(
        "{:<20} {:<14} {:<10} {:<8} {:<9} COMMAND",
        "NAME", "ID", "STATUS", "PID", "RESTARTS"
    );
    for record in &records {
        let pid = record
            .pid
            .map_or_else(|| "-".to_string(), |pid| pid.to_string());
        println!(
            "{:<20} {:<14} {:<10} {:<8} {:<9} {}",
            record.name(),
            record.id,
            record.status,
            pid,
            record.restart_count,
            record.spec.command
        );
    }

    if records.is_empty() {
        println!("No containers");
    }
    Ok(())
}
