use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use itcoin_fbft::{generate_keys, setup_naive_replica, setup_replica};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "itcoin-fbft", about = "FBFT/ROAST block-production engine for a permissioned signet")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a trusted-dealer FROST key generation, writing one keypair file
    /// per participant plus the shared group key.
    Keygen {
        /// Threshold number of signers required to produce a signature.
        #[arg(long)]
        threshold: u16,

        /// Total number of replicas in the cluster.
        #[arg(long)]
        parties: u16,

        /// Directory to write `frost-key-<index>.json`/`frost-group.json` into.
        #[arg(long)]
        output: PathBuf,
    },

    /// Run a replica's cycle loop until SIGINT/SIGTERM.
    Run {
        /// Directory holding `miner.conf.json`, `bitcoin.conf`, and this
        /// replica's FROST keypair file.
        #[arg(long)]
        datadir: PathBuf,

        /// Run the naive (non-threshold) signing backend instead of ROAST/FROST.
        #[arg(long)]
        naive: bool,

        /// Truncate the durable fact log before resuming.
        #[arg(long)]
        reset: bool,

        /// Seed for the PRNG driving fair active-action selection.
        #[arg(long, default_value_t = 0)]
        rng_seed: u64,
    },

    /// Replay the durable fact log and print the recovered view/checkpoint,
    /// without starting the cycle loop.
    Resync {
        #[arg(long)]
        datadir: PathBuf,

        #[arg(long)]
        naive: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Keygen { threshold, parties, output } => {
            info!(threshold, parties, output = %output.display(), "generating FROST key shares");
            generate_keys(threshold, parties, &output).await?;
            info!("key shares written");
            Ok(())
        }

        Commands::Run { datadir, naive, reset, rng_seed } => {
            let builder = PrometheusBuilder::new();
            builder.install().map_err(|e| anyhow::anyhow!("installing metrics exporter: {e}"))?;

            let mut setup =
                if naive { setup_naive_replica(&datadir, reset, rng_seed).await? } else { setup_replica(&datadir, reset, rng_seed).await? };

            let (tx, rx) = watch::channel(false);
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => info!("received SIGTERM"),
                    _ = sigint.recv() => info!("received SIGINT"),
                }
                let _ = tx.send(true);
            });

            info!("replica starting");
            setup.replica.run(rx).await?;
            info!("replica shut down cleanly");
            Ok(())
        }

        Commands::Resync { datadir, naive } => {
            let setup = if naive { setup_naive_replica(&datadir, false, 0).await? } else { setup_replica(&datadir, false, 0).await? };
            let state = setup.replica.state();
            info!(view = state.view, checkpoint = state.h, "resync complete");
            Ok(())
        }
    }
}
