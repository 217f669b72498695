//! rstchart - Statechart runner
//!
//! Loads a statechart model and runs it in real time. Events are read from
//! stdin, one per line (`name` or `name {"key": value}`); emitted events are
//! written to stdout.

use rstchart_core::{Event, Model};
use rstchart_runtime::{load_interpreter, Config, Runner, RuntimeError};
use rstchart_storage::CheckpointStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout carries emitted events
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = match Config::load() {
        Ok(c) => {
            if let Ok(path) = std::env::var("RSTCHART_CONFIG") {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };

    let model_path = config.model.path.clone().ok_or(RuntimeError::NoModel)?;
    let model = Arc::new(Model::from_file(&model_path)?);

    tracing::info!("Starting rstchart");
    tracing::info!("  Model: {} ({})", model, model_path.display());
    tracing::info!("  Checksum: {}", model.checksum());
    tracing::info!(
        "  Clock: tick {}ms, speed x{}",
        config.clock.tick_ms,
        config.clock.speed
    );

    let store = if config.checkpoint.enabled {
        let store = Arc::new(CheckpointStore::open(&config.checkpoint.dir)?);
        tracing::info!(
            "  Checkpoints: {} (session {}, policy {:?})",
            config.checkpoint.dir.display(),
            config.checkpoint.session,
            config.checkpoint.policy()
        );
        Some(store)
    } else {
        tracing::info!("  Checkpoints: disabled");
        None
    };

    let interpreter = load_interpreter(Arc::clone(&model), &config, store.as_deref())?;
    tracing::info!("  Active: {}", interpreter.active_leaves().join(", "));

    let (runner, handle) = Runner::new(interpreter, &config, store);

    // Subscribe before the runner starts so no output is missed
    let printer = {
        let mut events = handle.subscribe();
        let format = config.output.format;
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => println!("{}", format.render(&event)),
                    Err(RecvError::Lagged(n)) => tracing::warn!("Dropped {} emitted events", n),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    let runner_task = tokio::spawn(runner.run());

    // A plain thread: a blocked stdin read must not hold up runtime shutdown
    let (lines_tx, mut lines) = mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            match line {
                Ok(line) => {
                    if lines_tx.send(line).is_err() {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let input = {
        let handle = handle.clone();
        tokio::spawn(async move {
            while let Some(line) = lines.recv().await {
                let event = match parse_event(&line) {
                    Ok(Some(event)) => event,
                    Ok(None) => continue,
                    Err(e) => {
                        tracing::warn!("Ignoring input '{}': {}", line.trim(), e);
                        continue;
                    }
                };
                match handle.fire(event).await {
                    Ok(_) => {}
                    Err(RuntimeError::ShuttingDown) => break,
                    Err(e) => tracing::warn!("Event failed: {}", e),
                }
            }
            tracing::debug!("Input closed");
        })
    };

    let signal = {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Received shutdown signal, stopping runner...");
            handle.shutdown().await;
        })
    };

    // Runs until shutdown or a final state
    let result = runner_task.await?;

    input.abort();
    signal.abort();
    drop(handle);
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;

    result?;
    tracing::info!("rstchart stopped");
    Ok(())
}

/// Parses an input line: `name` or `name <json object>`. Blank lines and
/// `#` comments yield `None`.
fn parse_event(line: &str) -> Result<Option<Event>, Box<dyn std::error::Error>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    match line.split_once(char::is_whitespace) {
        None => Ok(Some(Event::new(line))),
        Some((name, payload)) => {
            let payload: serde_json::Value = serde_json::from_str(payload.trim())?;
            Ok(Some(Event::from_json(name, &payload)?))
        }
    }
}
