//! Application entry: loads config and wallet, then runs swap rounds.

use std::sync::Arc;

use clap::{ArgAction, Parser};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use compressed_swap::config::Config;
use compressed_swap::structured_logging::DebugLog;
use compressed_swap::swap_engine::SwapEngine;
use compressed_swap::types::{BuildFlow, SwapMode};
use compressed_swap::wallet::WalletManager;

#[derive(Parser, Debug)]
#[command(name = "compressed_swap", about = "Swap compressed tokens through the aggregator")]
struct Cli {
    /// quote | dryrun | send
    #[arg(value_enum, default_value_t = SwapMode::DryRun)]
    mode: SwapMode,

    /// Append a timestamped trail to the debug log file
    #[arg(action = ArgAction::Set, default_value_t = false)]
    debug: bool,

    #[arg(long, default_value_t = 5)]
    rounds: u32,

    /// Use the aggregator's prebuilt `/swap` transaction
    #[arg(long)]
    use_transaction: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let cfg = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(category = e.category().label(), "{}", e);
            return Err(e.into());
        }
    };
    info!(
        rpc = %cfg.rpc_url,
        aggregator = %cfg.aggregator_url,
        input = %cfg.input_mint,
        output = %cfg.output_mint,
        amount = cfg.amount,
        mode = ?cli.mode,
        "Loaded config"
    );

    let wallet = Arc::new(WalletManager::from_file(&cfg.keypair_path)?);
    let log = DebugLog::new(&cfg.log_file, cli.debug);
    let flow = if cli.use_transaction {
        BuildFlow::Transaction
    } else {
        BuildFlow::Instructions
    };

    let engine = SwapEngine::new(cfg, wallet, flow, log)?;
    let summary = engine.run(cli.mode, cli.rounds).await;

    if summary.errors == summary.rounds && summary.rounds > 0 {
        anyhow::bail!("all {} rounds failed", summary.rounds);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_five_dry_runs() {
        let cli = Cli::try_parse_from(["compressed_swap"]).unwrap();
        assert_eq!(cli.mode, SwapMode::DryRun);
        assert!(!cli.debug);
        assert_eq!(cli.rounds, 5);
        assert!(!cli.use_transaction);
    }

    #[test]
    fn parses_positional_mode_and_debug_flag() {
        let cli = Cli::try_parse_from(["compressed_swap", "send", "true", "--rounds", "2"]).unwrap();
        assert_eq!(cli.mode, SwapMode::Send);
        assert!(cli.debug);
        assert_eq!(cli.rounds, 2);
    }

    #[test]
    fn rejects_unknown_mode() {
        assert!(Cli::try_parse_from(["compressed_swap", "yolo"]).is_err());
    }
}
