use anyhow::{Context, Result, bail};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use vessel_core::{ContainerSpec, ContainerStatus, HealthCheckSpec, RestartPolicy, parse_env};
use vessel_runtime::{ChannelObserver, RuntimeConfig};

use crate::cli::RunArgs;

pub async fn execute(config: RuntimeConfig, args: RunArgs) -> Result<()> {
    let spec = build_spec(args)?;
    let runtime = super::open_runtime(config)?;

    let (observer, mut events) = ChannelObserver::new();
    runtime.observe(Arc::new(observer));

    let name = spec.name.clone();
    let policy = spec.restart_policy;
    let container = runtime
        .create(spec)
        .with_context(|| format!("Failed to create container '{name}'"))?;
    runtime
        .start(&name)
        .await
        .with_context(|| format!("Failed to start container '{name}'"))?;
    info!("Container {} ({}) running. Press Ctrl+C to stop...", name, container.id());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Stopping container...");
                break;
            }
            Some(note) = events.recv() => {
                if note.container != name {
                    continue;
                }
                if note.message.starts_with("Restart limit reached") {
                    break;
                }
                if note.status == Some(ContainerStatus::Stopped) && !restarts_on_exit(policy) {
                    break;
                }
            }
        }
    }

    runtime.shutdown().await;
    let status = container.status();
    println!("{name}: {status}");
    if status == ContainerStatus::Error {
        bail!("container '{name}' ended in error state; see `vessel logs {name}`");
    }
    Ok(())
}

/// Whether the restart monitor brings an exited process back
const fn restarts_on_exit(policy: RestartPolicy) -> bool {
    matches!(policy, RestartPolicy::Always | RestartPolicy::UnlessStopped)
}

fn build_spec(args: RunArgs) -> Result<ContainerSpec> {
    let mut spec = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            ContainerSpec::from_json(&json)
                .with_context(|| format!("Invalid container spec in {}", path.display()))?
        }
        None => {
            let Some(name) = args.name.clone() else {
                bail!("--name is required without --config");
            };
            ContainerSpec::new(name, String::new())
        }
    };

    if let Some(name) = args.name {
        spec.name = name;
    }
    if !args.command.is_empty() {
        spec.command = args
            .command
            .iter()
            .map(String::as_str)
            .map(quote_word)
            .collect::<Vec<_>>()
            .join(" ");
    }
    if spec.command.trim().is_empty() {
        bail!("a command is required after `--`");
    }

    if let Some(image) = args.image {
        spec.image = Some(image);
    }
    if let Some(memory) = args.memory {
        spec.mem_limit_mb = memory;
    }
    if let Some(cpu) = args.cpu {
        spec.cpu_limit_percent = cpu;
    }
    if let Some(policy) = args.restart {
        spec.restart_policy = policy;
    }
    spec.ports.extend(args.ports);
    spec.volumes.extend(args.volumes);
    spec.env.extend(args.env.iter().map(String::as_str).map(parse_env));

    if let Some(cmd) = args.health_cmd {
        spec.health_check = Some(HealthCheckSpec {
            cmd,
            interval: Duration::from_secs(args.health_interval),
            timeout: Duration::from_secs(args.health_timeout),
            retries: args.health_retries,
        });
    }

    spec.validate().context("Invalid container spec")?;
    Ok(spec)
}

/// Quote a word so command splitting gives it back unchanged
fn quote_word(word: &str) -> String {
    let plain = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if plain {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_words_stay_bare() {
        assert_eq!(quote_word("sleep"), "sleep");
        assert_eq!(quote_word("/bin/echo"), "/bin/echo");
    }

    #[test]
    fn words_with_spaces_and_quotes_are_quoted() {
        assert_eq!(quote_word("hello world"), "'hello world'");
        assert_eq!(quote_word("it's"), r"'it'\''s'");
        assert_eq!(quote_word(""), "''");
    }
}
