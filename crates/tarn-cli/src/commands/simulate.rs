use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use clap::Args;
use parking_lot::Mutex;
use serde::Serialize;
use tarn_core::{ConnectionListener, DeathReason, PoolDefinition, PoolEntry, PoolsConfig};
use tarn_pool::PoolManager;
use tracing::{info, warn};

use crate::sim::{SimFactory, SimProfile};

#[derive(Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Pools TOML file (default: one pool named "demo")
    #[arg(short, long)]
    pub config: Option<String>,
    /// Shared sweep workers
    #[arg(long, default_value = "2")]
    pub workers: usize,
    /// Concurrent clients per pool
    #[arg(long, default_value = "8")]
    pub clients: usize,
    /// Length of the load run in milliseconds
    #[arg(long, default_value = "3000")]
    pub duration_ms: u64,
    /// Time each simulated command takes
    #[arg(long, default_value = "5")]
    pub hold_ms: u64,
    /// Time each simulated connect takes
    #[arg(long, default_value = "2")]
    pub connect_ms: u64,
    /// Fail every Nth connect (0 = never)
    #[arg(long, default_value = "0")]
    pub fail_every: u64,
    /// Fail every Nth command with a connection reset (0 = never)
    #[arg(long, default_value = "0")]
    pub fault_every: u64,
    /// How long shutdown waits for checkouts to drain
    #[arg(long, default_value = "1000")]
    pub drain_ms: u64,
    /// Include per-connection detail in the snapshots
    #[arg(long)]
    pub detail: bool,
}

/// Client-side outcome counts for one pool.
#[derive(Debug, Default)]
struct ClientTally {
    acquired: AtomicU64,
    refused: AtomicU64,
    failed: AtomicU64,
    fatal: AtomicU64,
}

#[derive(Debug, Serialize)]
struct ClientCounts {
    acquired: u64,
    refused: u64,
    failed: u64,
    fatal: u64,
}

impl ClientTally {
    fn counts(&self) -> ClientCounts {
        ClientCounts {
            acquired: self.acquired.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            fatal: self.fatal.load(Ordering::Relaxed),
        }
    }
}

/// Connection deaths by reason, across all pools.
#[derive(Default)]
struct DeathTally(Mutex<BTreeMap<String, u64>>);

impl ConnectionListener for DeathTally {
    fn on_death(&self, _alias: &str, _id: u64, reason: DeathReason) {
        *self.0.lock().entry(reason.to_string()).or_default() += 1;
    }
}

fn demo_pool() -> PoolEntry {
    PoolEntry {
        alias: "demo".to_string(),
        definition: PoolDefinition::new("sim://demo")
            .with_counts(2, 6)
            .with_prototype_count(2)
            .with_test_sql("SELECT 1")
            .with_fatal_error("connection reset"),
    }
}

pub async fn simulate(args: SimulateArgs) -> anyhow::Result<()> {
    let report = run(&args).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run(args: &SimulateArgs) -> anyhow::Result<serde_json::Value> {
    let entries = match &args.config {
        Some(path) => PoolsConfig::from_file(Path::new(path))?.pools,
        None => vec![demo_pool()],
    };
    anyhow::ensure!(!entries.is_empty(), "no pools configured");

    let profile = SimProfile {
        connect: Duration::from_millis(args.connect_ms),
        hold: Duration::from_millis(args.hold_ms),
        fail_every: args.fail_every,
        fault_every: args.fault_every,
    };
    let manager = Arc::new(PoolManager::new(args.workers));
    let deaths = Arc::new(DeathTally::default());

    for entry in &entries {
        let pool = manager.register_definition(
            &entry.alias,
            entry.definition.clone(),
            Arc::new(SimFactory::new(profile)),
        )?;
        pool.add_connection_listener(deaths.clone());
    }

    info!(
        pools = entries.len(),
        clients = args.clients,
        duration_ms = args.duration_ms,
        "simulation started"
    );

    let deadline = Instant::now() + Duration::from_millis(args.duration_ms);
    let mut tallies = BTreeMap::new();
    let mut clients = Vec::new();
    for entry in &entries {
        let tally = Arc::new(ClientTally::default());
        tallies.insert(entry.alias.clone(), tally.clone());
        for _ in 0..args.clients {
            let manager = manager.clone();
            let alias = entry.alias.clone();
            let tally = tally.clone();
            clients.push(tokio::task::spawn_blocking(move || {
                drive_client(&manager, &alias, &tally, deadline);
            }));
        }
    }
    for client in clients {
        if let Err(e) = client.await {
            warn!(error = %e, "simulated client ended abnormally");
        }
    }

    let mut pools = Vec::new();
    for entry in &entries {
        pools.push(manager.snapshot(&entry.alias, args.detail)?);
    }
    manager.shutdown(Duration::from_millis(args.drain_ms)).await;

    let clients: BTreeMap<String, ClientCounts> = tallies
        .into_iter()
        .map(|(alias, tally)| (alias, tally.counts()))
        .collect();
    let deaths = deaths.0.lock().clone();
    Ok(serde_json::json!({
        "pools": pools,
        "clients": clients,
        "deaths": deaths,
    }))
}

fn drive_client(manager: &PoolManager, alias: &str, tally: &ClientTally, deadline: Instant) {
    while Instant::now() < deadline {
        let conn = match manager.acquire(alias) {
            Ok(conn) => conn,
            Err(e) if e.is_capacity() => {
                tally.refused.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            Err(_) => {
                tally.failed.fetch_add(1, Ordering::Relaxed);
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
        };
        tally.acquired.fetch_add(1, Ordering::Relaxed);
        match conn.execute("SELECT 1") {
            Ok(_) => {}
            Err(tarn_core::PoolError::Fatal { .. }) => {
                tally.fatal.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                tally.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            config: None,
            workers: 1,
            clients: 4,
            duration_ms: 200,
            hold_ms: 1,
            connect_ms: 0,
            fail_every: 0,
            fault_every: 0,
            drain_ms: 100,
            detail: true,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn demo_run_serves_requests() {
        let report = run(&args()).await.unwrap();
        let pool = &report["pools"][0];
        assert_eq!(pool["alias"], "demo");
        assert!(pool["served"].as_u64().unwrap() > 0);
        assert!(pool["live"].as_u64().unwrap() <= 6);
        assert!(report["clients"]["demo"]["acquired"].as_u64().unwrap() > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn faults_are_reported_as_fatal() {
        let mut args = args();
        args.fault_every = 2;
        let report = run(&args).await.unwrap();
        assert!(report["clients"]["demo"]["fatal"].as_u64().unwrap() > 0);
        assert!(report["deaths"]["fatal error"].as_u64().unwrap() > 0);
    }
}
