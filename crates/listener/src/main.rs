//! `listener run`: scan the bridge contract and relay TokensLocked events.
//! `listener checkpoint show|rollback`: inspect or move the checkpoint (listener must be stopped).

use alloy::primitives::Address;
use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use listener::{
    Checkpoint, CheckpointStore, DeadLetterPolicy, FileCheckpointStore, ListenerConfig, Scanner,
    DEFAULT_DESTINATION_CHAINS,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "listener", version, about = "Bridge TokensLocked listener")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan for events and relay them until interrupted.
    Run(RunArgs),
    /// Inspect or move the persisted checkpoint.
    Checkpoint {
        #[command(subcommand)]
        command: CheckpointCommand,
    },
}

#[derive(Debug, Subcommand)]
enum CheckpointCommand {
    Show {
        #[arg(long, env = "CHECKPOINT_PATH", default_value = "last_processed_block.json")]
        checkpoint_path: PathBuf,
    },
    /// Move the checkpoint to `--to`, backwards if needed. Blocks after it are rescanned.
    Rollback {
        #[arg(long)]
        to: u64,
        #[arg(long, env = "CHECKPOINT_PATH", default_value = "last_processed_block.json")]
        checkpoint_path: PathBuf,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, env = "ETHEREUM_RPC_URL")]
    rpc_url: String,
    #[arg(long, env = "RELAYER_API_URL")]
    relayer_url: String,
    #[arg(long, env = "BRIDGE_CONTRACT_ADDRESS")]
    contract: Address,
    #[arg(long, env = "SOURCE_CHAIN", default_value = "ethereum-sepolia")]
    source_chain: String,
    /// Seconds between polls once caught up.
    #[arg(long, env = "POLL_INTERVAL", default_value_t = 15)]
    poll_interval: u64,
    #[arg(long, env = "BLOCK_CHUNK_SIZE", default_value_t = 100)]
    chunk_size: u64,
    #[arg(long, env = "REORG_MARGIN", default_value_t = listener::DEFAULT_REORG_MARGIN)]
    reorg_margin: u64,
    /// Seconds before an RPC call counts as failed.
    #[arg(long, env = "RPC_TIMEOUT", default_value_t = 15)]
    rpc_timeout: u64,
    #[arg(long, env = "RELAY_MAX_ATTEMPTS", default_value_t = 5)]
    relay_max_attempts: u32,
    #[arg(long, env = "DEAD_LETTER_POLICY", value_enum, default_value_t = DeadLetterPolicy::Halt)]
    dead_letter_policy: DeadLetterPolicy,
    #[arg(long, env = "DEAD_LETTER_PATH")]
    dead_letter_path: Option<PathBuf>,
    /// Accepted destination chain ids, comma-separated.
    #[arg(long, env = "SUPPORTED_DESTINATION_CHAINS", value_delimiter = ',')]
    destination_chains: Vec<u64>,
    #[arg(long, env = "CHECKPOINT_PATH", default_value = "last_processed_block.json")]
    checkpoint_path: PathBuf,
    #[arg(long, env = "MAX_CONSECUTIVE_FAILURES", default_value_t = 10)]
    max_consecutive_failures: u32,
}

impl RunArgs {
    fn into_config(self) -> ListenerConfig {
        let defaults = ListenerConfig::default();
        let supported_destinations = if self.destination_chains.is_empty() {
            DEFAULT_DESTINATION_CHAINS.to_vec()
        } else {
            self.destination_chains
        };
        ListenerConfig {
            rpc_url: self.rpc_url,
            relayer_url: self.relayer_url,
            contract_address: self.contract,
            source_chain: self.source_chain,
            poll_interval: Duration::from_secs(self.poll_interval),
            max_chunk_span: self.chunk_size,
            reorg_margin: self.reorg_margin,
            rpc_timeout: Duration::from_secs(self.rpc_timeout),
            retry: listener::RetryConfig {
                max_attempts: self.relay_max_attempts,
                ..defaults.retry
            },
            backoff: listener::BackoffConfig {
                max_consecutive_failures: self.max_consecutive_failures,
                ..defaults.backoff
            },
            dead_letter_policy: self.dead_letter_policy,
            supported_destinations,
            checkpoint_path: self.checkpoint_path,
            dead_letter_path: self.dead_letter_path,
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Checkpoint { command } => match checkpoint(command) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(reason = %format!("{:#}", e), "checkpoint command failed");
                ExitCode::from(1)
            }
        },
    }
}

async fn run(args: RunArgs) -> ExitCode {
    let config = args.into_config();
    tracing::info!(
        contract = %config.contract_address,
        chunk_size = config.max_chunk_span,
        reorg_margin = config.reorg_margin,
        policy = ?config.dead_letter_policy,
        "starting listener"
    );
    let mut scanner = match Scanner::builder(config).build() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(reason = %e, "startup failed");
            return ExitCode::from(e.exit_code());
        }
    };

    let shutdown = scanner.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, finishing in-flight work");
            shutdown.trigger();
        }
    });

    match scanner.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(reason = %e, "listener stopped");
            ExitCode::from(e.exit_code())
        }
    }
}

fn checkpoint(command: CheckpointCommand) -> anyhow::Result<()> {
    match command {
        CheckpointCommand::Show { checkpoint_path } => {
            let store = FileCheckpointStore::open(&checkpoint_path)
                .with_context(|| format!("open {}", checkpoint_path.display()))?;
            match store.load()? {
                Some(c) => println!("{}", c.last_confirmed_block),
                None => println!("no checkpoint at {}", checkpoint_path.display()),
            }
        }
        CheckpointCommand::Rollback {
            to,
            checkpoint_path,
        } => {
            let mut store = FileCheckpointStore::open(&checkpoint_path)
                .with_context(|| format!("open {}", checkpoint_path.display()))?;
            store.rollback(Checkpoint::new(to))?;
            println!("checkpoint set to {}", to);
        }
    }
    Ok(())
}
