//! Round driver: setup, quote, build, size check, and optionally send.
//!
//! Every round is independent. A failing round is logged and counted, and the
//! next one starts from a fresh setup.

use std::sync::Arc;

use anyhow::{Context, Result};
use solana_sdk::{instruction::Instruction, pubkey::Pubkey};
use tracing::{error, info, info_span, warn, Instrument};

use crate::compression::{select_min_accounts_for_transfer, CompressedTokenAccount, CompressionClient};
use crate::config::{Config, StateTreeAccounts};
use crate::errors::SwapError;
use crate::light_instructions::decompress_instruction;
use crate::rpc_manager::RpcManager;
use crate::setup::{register_mint, reset_input_ata};
use crate::structured_logging::DebugLog;
use crate::swap_client::{QuoteRequest, QuoteResponse, SwapClient};
use crate::tx_builder::{BuiltTransaction, SwapTransactionBuilder};
use crate::tx_sender::{handle_send, TransactionSender};
use crate::types::{BuildFlow, RoundOutcome, RunSummary, SwapMode};
use crate::wallet::WalletManager;

pub struct SwapEngine {
    config: Config,
    wallet: Arc<WalletManager>,
    rpc: Arc<RpcManager>,
    swap_client: SwapClient,
    compression: CompressionClient,
    builder: SwapTransactionBuilder,
    sender: TransactionSender<RpcManager>,
    state_tree: StateTreeAccounts,
    flow: BuildFlow,
    log: DebugLog,
}

impl SwapEngine {
    pub fn new(
        config: Config,
        wallet: Arc<WalletManager>,
        flow: BuildFlow,
        log: DebugLog,
    ) -> Result<Self, SwapError> {
        let rpc = Arc::new(RpcManager::new_with_config(&config));
        let swap_client = SwapClient::new(&config)?;
        let compression = CompressionClient::new(
            config.compression_url.clone(),
            std::time::Duration::from_millis(config.http_timeout_ms),
        )?;
        let builder = SwapTransactionBuilder::new(wallet.clone(), rpc.client(), &config, log.clone())?;
        let sender = TransactionSender::new(rpc.clone(), config.send.clone(), log.clone());
        let state_tree = config.state_tree_accounts()?;
        Ok(Self {
            config,
            wallet,
            rpc,
            swap_client,
            compression,
            builder,
            sender,
            state_tree,
            flow,
            log,
        })
    }

    pub async fn run(&self, mode: SwapMode, rounds: u32) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(?mode, rounds, flow = ?self.flow, wallet = %self.wallet.pubkey(), "Starting swap rounds");

        for round in 1..=rounds {
            let span = info_span!("round", round);
            match self.run_round(mode).instrument(span).await {
                Ok(outcome) => {
                    info!(round, outcome = outcome.label(), "Round finished");
                    summary.record(&outcome);
                }
                Err(e) => {
                    error!(round, error = %format!("{:#}", e), "Round failed");
                    self.log.log(format!("Round {} failed: {:#}", round, e));
                    summary.record_error();
                }
            }
        }

        self.log.log_end();
        info!(?summary, "All rounds done");
        summary
    }

    pub async fn run_round(&self, mode: SwapMode) -> Result<RoundOutcome> {
        let input_mint = self.config.input_mint_pubkey()?;
        let output_mint = self.config.output_mint_pubkey()?;

        let mut inputs = Vec::new();
        if mode.builds_transaction() {
            self.setup(&input_mint).await.context("setup")?;
            inputs = self.compressed_inputs().await.context("compressed balance")?;
        }

        let request = QuoteRequest::from_config(&self.config, &input_mint, &output_mint);
        let quote = self.swap_client.quote(&request).await.context("quote")?;
        self.log.log(format!("Quote: {}", quote.raw));

        if mode == SwapMode::Quote {
            return Ok(RoundOutcome::Quoted {
                in_amount: quote.in_amount,
                out_amount: quote.out_amount,
            });
        }

        let built = self.build(&quote, &inputs).await.context("build")?;
        let max = self.config.max_transaction_size;
        if !built.fits(max) {
            warn!(size = built.size(), max, "Transaction too large, skipping round");
            self.log.log(format!("Transaction size {} exceeds {} bytes, skipping", built.size(), max));
            return Ok(RoundOutcome::Skipped {
                size: built.size(),
                max,
            });
        }
        info!(size = built.size(), signature = ?built.signature(), "Transaction signed");

        if !mode.submits() {
            return Ok(RoundOutcome::DryRun { size: built.size() });
        }

        let (_, last_valid_block_height) = self.builder.latest_blockhash().await.context("block height")?;
        let signature = built.signature();
        let record = handle_send(
            &self.sender,
            built.serialized,
            built.blockhash,
            last_valid_block_height,
        )
        .await
        .context("send")?;

        Ok(match (record, signature) {
            (Some(record), Some(signature)) => RoundOutcome::Confirmed {
                signature,
                failed: record
                    .transaction
                    .meta
                    .as_ref()
                    .map(|meta| meta.err.is_some())
                    .unwrap_or(false),
            },
            _ => RoundOutcome::NotConfirmed,
        })
    }

    /// Token pool for the input mint, then an empty and closed input ATA.
    async fn setup(&self, input_mint: &Pubkey) -> Result<(), SwapError> {
        let client = self.rpc.client();
        register_mint(client.as_ref(), &self.wallet, input_mint, &self.log).await?;
        let reset = reset_input_ata(client.as_ref(), &self.wallet, input_mint, &self.state_tree, &self.log).await?;
        info!(compressed = ?reset.compressed, closed = ?reset.closed, "Input ATA reset");
        Ok(())
    }

    /// Fewest compressed accounts covering the configured amount.
    async fn compressed_inputs(&self) -> Result<Vec<CompressedTokenAccount>, SwapError> {
        let mint = self.config.input_mint_pubkey()?;
        let accounts = self
            .compression
            .compressed_token_accounts(&self.wallet.pubkey(), &mint)
            .await?;
        let selected = select_min_accounts_for_transfer(&accounts, self.config.amount)?;
        let covered: u64 = selected.iter().map(|a| a.amount).sum();
        info!(
            accounts = accounts.len(),
            selected = selected.len(),
            covered,
            amount = self.config.amount,
            "Compressed input available"
        );
        Ok(selected)
    }

    async fn decompress(&self, inputs: &[CompressedTokenAccount]) -> Result<Instruction, SwapError> {
        let proof = self.compression.validity_proof(inputs).await?;
        let params = self.builder.params();
        decompress_instruction(
            &params.payer,
            &params.input_ata(),
            self.config.amount,
            inputs,
            &proof,
            &self.state_tree,
        )
    }

    async fn build(
        &self,
        quote: &QuoteResponse,
        inputs: &[CompressedTokenAccount],
    ) -> Result<BuiltTransaction, SwapError> {
        let user = self.wallet.pubkey();
        match self.flow {
            BuildFlow::Instructions => {
                let response = self.swap_client.swap_instructions(&user, quote).await?;
                let decompress = self.decompress(inputs).await?;
                self.builder.build(&response, Some(decompress)).await
            }
            BuildFlow::Transaction => {
                let response = self.swap_client.swap_transaction(&user, quote).await?;
                self.builder
                    .build_from_swap_transaction(
                        &response.swap_transaction,
                        response.last_valid_block_height,
                    )
                    .await
            }
        }
    }
}
