//! Tether Runtime
//!
//! Minimal binary that boots one QuickJS environment, drives it from a few
//! host threads and shuts it down again.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread;
use tether_core::{EnvConfig, Environment, Reference, Value};
use tether_script::QuickJsEngine;

const WORKERS: usize = 4;
const ROUNDS: usize = 50;

fn load_config() -> Result<EnvConfig> {
    match std::env::var_os("TETHER_CONFIG") {
        Some(path) => EnvConfig::load(&path)
            .with_context(|| format!("loading {}", path.to_string_lossy())),
        None => Ok(EnvConfig::default()),
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    tracing::info!("Tether v{}", tether_core::VERSION);
    let config = load_config()?;
    let convention = config.trace_convention;
    let env = Environment::spawn(config, QuickJsEngine::new)
        .context("starting engine environment")?;

    let counter = Arc::new(env.run_scoped(|_| {
        let counter = Value::object()?;
        counter.set("hits", &Value::number(0.0)?)?;
        let bump = Value::function("bump", |args| {
            let this = args.this();
            let hits = this.get("hits")?.to_number_coerced()?;
            let next = Value::number(hits + 1.0)?;
            this.set("hits", &next)?;
            Ok(next)
        })?;
        counter.set("bump", &bump)?;
        Reference::new(&counter, false)
    })?);

    let workers: Vec<_> = (0..WORKERS)
        .map(|worker| {
            let counter = counter.clone();
            thread::spawn(move || -> Result<()> {
                for _ in 0..ROUNDS {
                    counter.run(|counter| counter.call_method("bump", &[]).map(drop))?;
                }
                tracing::debug!(worker, "worker finished");
                Ok(())
            })
        })
        .collect();
    for worker in workers {
        worker
            .join()
            .map_err(|_| anyhow::anyhow!("worker thread panicked"))??;
    }

    let hits = counter
        .run(|counter| counter.get("hits")?.to_number_coerced())?
        .context("counter was collected")?;
    tracing::info!(hits, expected = WORKERS * ROUNDS, "all workers done");

    // One deliberate failure to show the merged trace
    let failure = counter.run(|counter| counter.call_method("missing", &[]).map(drop));
    if let Err(fault) = failure {
        tracing::info!("expected fault:\n{}", fault.merged_trace(convention));
    }

    let stats = env.dispatcher().stats();
    tracing::info!(
        processed = stats.processed,
        inline = stats.inline,
        avg_batch = stats.average_batch_len,
        avg_drain_ms = stats.average_drain_ms,
        fastest_drain_ms = stats.drain_range_ms.0,
        slowest_drain_ms = stats.drain_range_ms.1,
        "dispatcher stats"
    );

    drop(counter);
    env.shutdown()?;
    tracing::info!("Runtime shut down cleanly");
    Ok(())
}
