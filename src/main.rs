use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use tha_sentinel::action;
use tha_sentinel::config::{Config, LoggingConfig};
use tha_sentinel::ledger::{Amount, LedgerClient, WalletRpcClient};
use tha_sentinel::poll::{shutdown_channel, PollLoop};
use tha_sentinel::seen::SeenSet;

/// Watches node wallets and acts once on each qualifying transaction.
#[derive(Parser, Debug)]
#[command(name = "tha-sentinel", version, about)]
struct Cli {
    /// TOML config file. Falls back to env-only config when missing.
    #[arg(long, short, default_value = "tha-sentinel.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every configured watcher until Ctrl-C (default).
    Run,
    /// Print chain info from the node.
    Info,
    /// Send a single payment from a wallet.
    Send {
        /// Wallet to pay from; the node's default wallet when omitted.
        #[arg(long)]
        wallet: Option<String>,
        #[arg(long)]
        to: String,
        #[arg(long)]
        amount: Amount,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config_found = cli.config.exists();
    let mut config = if config_found {
        Config::load(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        Config::from_env()
    };

    init_logging(&config.logging);

    if !config_found {
        info!(path = %cli.config.display(), "no config file found, using env-only config");
    }
    info!("tha-sentinel v{} starting", env!("CARGO_PKG_VERSION"));

    prompt_missing_credentials(&mut config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(&config).await,
        Command::Info => chain_info(&config).await,
        Command::Send { wallet, to, amount } => send(&config, wallet.as_deref(), &to, amount).await,
    }
}

fn init_logging(logging: &LoggingConfig) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}

fn prompt_missing_credentials(config: &mut Config) -> Result<()> {
    if config.rpc.user.is_empty() {
        config.rpc.user = prompt("Enter RPC username: ")?;
    }
    if config.rpc.password.is_empty() {
        config.rpc.password = prompt("Enter RPC password: ")?;
    }
    config.require_credentials()?;
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

async fn run(config: &Config) -> Result<()> {
    config.validate()?;

    match WalletRpcClient::new(&config.endpoint(None)) {
        Ok(node) => match node.blockchain_info().await {
            Ok(chain) => info!(chain = %chain.chain, blocks = chain.blocks, "node reachable"),
            Err(e) => warn!(error = %e, "node probe failed, starting watchers anyway"),
        },
        Err(e) => warn!(error = %e, "could not build node probe client"),
    }

    let (shutdown_handle, shutdown) = shutdown_channel();
    let mut watchers = JoinSet::new();

    for watcher in &config.watchers {
        let endpoint = config.endpoint(watcher.wallet.as_deref());
        let client: Arc<dyn LedgerClient> = Arc::new(
            WalletRpcClient::new(&endpoint)
                .with_context(|| format!("building RPC client for {}", endpoint.url()))?,
        );
        let trigger = action::from_config(&watcher.action, client.clone(), config.query_timeout());

        let mut poll = PollLoop::new(
            watcher.name.clone(),
            client,
            watcher.policy(),
            trigger,
            watcher.poll_settings(config.query_timeout()),
        );
        if let Some(path) = &watcher.seen_path {
            poll = poll.with_seen(SeenSet::with_journal(path)?);
        }

        info!(watcher = %watcher.name, url = %endpoint.url(), "spawning watcher");
        watchers.spawn(poll.run(shutdown.clone()));
    }

    let mut failed = 0usize;
    loop {
        tokio::select! {
            joined = watchers.join_next() => match joined {
                None => break,
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    error!(error = %e, "watcher failed, stopping the rest");
                    failed += 1;
                    shutdown_handle.trigger();
                }
                Some(Err(e)) => {
                    error!(error = %e, "watcher task aborted, stopping the rest");
                    failed += 1;
                    shutdown_handle.trigger();
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down...");
                shutdown_handle.trigger();
            }
        }
    }

    if failed > 0 {
        bail!("{failed} watcher(s) stopped with errors");
    }
    info!("all watchers stopped");
    Ok(())
}

async fn chain_info(config: &Config) -> Result<()> {
    let node = WalletRpcClient::new(&config.endpoint(None))?;
    let chain = node
        .blockchain_info()
        .await
        .with_context(|| format!("getblockchaininfo on {}", node.url()))?;
    println!("chain:   {}", chain.chain);
    println!("blocks:  {}", chain.blocks);
    println!("headers: {}", chain.headers);
    println!("best:    {}", chain.best_block_hash);
    Ok(())
}

async fn send(config: &Config, wallet: Option<&str>, to: &str, amount: Amount) -> Result<()> {
    if !amount.is_positive() {
        bail!("amount must be positive, got {amount}");
    }
    let client = WalletRpcClient::new(&config.endpoint(wallet))?;
    let txid = client
        .send(to, amount)
        .await
        .with_context(|| format!("sending {amount} to {to}"))?;
    info!(to = to, amount = %amount, txid = %txid, "payment sent");
    println!("Transaction ID: {txid}");
    Ok(())
}
