// ivguard - replay detection for authenticated-encryption transports
// CLI for exercising the replay cache and the validating dialer

use anyhow::Context;
use clap::Parser;

use ivguard::network::{allow_all, require_public_ip, ValidatingDialer};
use ivguard::security::{false_positive_rate, MAX_CAPACITY};
use ivguard::simulation::Simulation;

#[derive(Parser, Debug)]
#[command(name = "ivguard")]
#[command(version)]
#[command(about = "Replay detection for authenticated IVs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Drive a replay cache with concurrent simulated traffic
    Simulate {
        /// Replay cache capacity (0 disables the cache)
        #[arg(short, long, default_value_t = MAX_CAPACITY)]
        capacity: usize,

        /// Total number of requests
        #[arg(short, long, default_value = "100000")]
        requests: u64,

        /// Number of concurrent workers
        #[arg(short, long, default_value = "8")]
        workers: usize,

        /// Fraction of requests that resend an earlier IV
        #[arg(long, default_value = "0.1")]
        replay_ratio: f64,

        /// IV length in bytes
        #[arg(long, default_value = "32")]
        iv_len: usize,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to a target through the validating dialer
    Probe {
        /// Target address (host:port)
        address: String,

        /// SO_MARK applied to the outgoing socket (Linux only, 0 disables)
        #[arg(short, long, default_value = "0")]
        fwmark: u32,

        /// Allow loopback, private and other non-public targets
        #[arg(long)]
        allow_private: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let result = match args.command {
        Commands::Simulate {
            capacity,
            requests,
            workers,
            replay_ratio,
            iv_len,
            json,
        } => {
            let simulation = Simulation {
                capacity,
                requests,
                workers,
                replay_ratio,
                iv_len,
            };
            run_simulation(simulation, json).await
        }
        Commands::Probe {
            address,
            fwmark,
            allow_private,
        } => run_probe(&address, fwmark, allow_private).await,
    };

    if let Err(e) = result {
        eprintln!("❌ Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run_simulation(simulation: Simulation, json: bool) -> anyhow::Result<()> {
    let report = simulation.run().await.context("simulation failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("🛡️  Replay cache simulation");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("Capacity:            {}", simulation.capacity);
    println!("Requests:            {}", report.requests);
    println!("Accepted:            {}", report.accepted);
    println!("Rejected:            {}", report.rejected);
    println!(
        "Replays detected:    {} / {}",
        report.replays_detected, report.replays_sent
    );
    println!("Replays missed:      {}", report.replays_missed);
    println!("False positives:     {}", report.false_positives);
    println!(
        "False positive rate: {:.3e} observed, {:.3e} bound",
        report.observed_false_positive_rate(),
        false_positive_rate(simulation.capacity)
    );
    println!("Elapsed:             {} ms", report.elapsed_ms);

    Ok(())
}

async fn run_probe(address: &str, fwmark: u32, allow_private: bool) -> anyhow::Result<()> {
    let validator = if allow_private {
        allow_all()
    } else {
        require_public_ip()
    };

    let dialer = ValidatingDialer::new(validator, fwmark).context("invalid dialer config")?;

    println!("🔌 Connecting to {}...", address);
    let stream = dialer
        .dial(address)
        .await
        .with_context(|| format!("failed to connect to {}", address))?;

    println!(
        "✅ Connected {} -> {}",
        stream.local_addr()?,
        stream.peer_addr()?
    );

    Ok(())
}
