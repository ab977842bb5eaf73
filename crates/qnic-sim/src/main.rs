//! qnic Simulator
//!
//! Brings up one interface over a loopback cable, opens it with the host
//! driver and runs the bench scenarios against it.
//!
//! # Usage
//!
//! ```bash
//! qnic-sim                         # every scenario, synchronous polling
//! qnic-sim --scenario rss --workers
//! qnic-sim --config nic.json --stats
//! qnic-sim --dump-config > nic.json
//! ```

use anyhow::Context;
use clap::Parser;
use qnic_common::NicConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scenarios;

use scenarios::{Scenario, Sim};

#[derive(Parser)]
#[command(name = "qnic-sim")]
#[command(version)]
#[command(about = "Loopback simulator for the qnic datapath", long_about = None)]
struct Cli {
    /// Interface configuration (JSON)
    #[arg(long, short, env = "QNIC_CONFIG")]
    config: Option<String>,

    /// Scenario to run
    #[arg(long, short, value_enum, default_value = "all")]
    scenario: Scenario,

    /// Drive the engines with worker threads instead of inline polling
    #[arg(long)]
    workers: bool,

    /// Print interface statistics as JSON when done
    #[arg(long)]
    stats: bool,

    /// Print the default configuration and exit
    #[arg(long)]
    dump_config: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if cli.dump_config {
        println!("{}", serde_json::to_string_pretty(&NicConfig::default())?);
        return Ok(());
    }

    tracing::info!("qnic-sim v{}", env!("CARGO_PKG_VERSION"));

    let config = match cli.config {
        Some(ref path) => {
            NicConfig::load(path).with_context(|| format!("loading config {}", path))?
        }
        None => NicConfig::default(),
    };

    let mut sim = Sim::new(config, cli.workers)?;
    let start = std::time::Instant::now();
    let scenarios = match cli.scenario {
        Scenario::All => Scenario::each().to_vec(),
        one => vec![one],
    };

    for scenario in scenarios {
        sim.run(scenario)
            .with_context(|| format!("scenario {:?} failed", scenario))?;
    }

    let stats = sim.finish();
    let elapsed = start.elapsed().as_secs_f64();
    tracing::info!(
        tx_packets = stats.tx.packets,
        rx_packets = stats.rx.packets,
        rx_dropped = stats.rx.dropped,
        interrupts = stats.interrupts,
        tx_gbps = format!("{:.3}", stats.tx.throughput_gbps(elapsed)),
        tx_mpps = format!("{:.3}", stats.tx.packet_rate_mpps(elapsed)),
        rx_gbps = format!("{:.3}", stats.rx.throughput_gbps(elapsed)),
        "all scenarios passed"
    );
    if cli.stats {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    Ok(())
}
