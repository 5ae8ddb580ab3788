//! Pre-round account hygiene: the input token account must start each round
//! empty and closed so the swap's own create/close pair stays balanced.
//! Leftover tokens are compressed back before the close, and the input mint
//! gets a token pool if it has none.

use async_trait::async_trait;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    instruction::Instruction,
    message::{v0::Message as MessageV0, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
};
use spl_associated_token_account::get_associated_token_address;
use spl_token::instruction::close_account;
use tracing::{info, warn};

use crate::config::StateTreeAccounts;
use crate::errors::{ErrorContext, SwapError};
use crate::light_instructions::{compress_instruction, create_token_pool_instruction, token_pool_address};
use crate::structured_logging::DebugLog;
use crate::wallet::WalletManager;

const REGISTER_MINT_COMPUTE_UNITS: u32 = 100_000;
const REGISTER_MINT_CU_PRICE: u64 = 90_000;

/// Chain reads and writes the setup steps need.
#[async_trait]
pub trait SetupRpc: Send + Sync {
    async fn account_exists(&self, address: &Pubkey) -> Result<bool, SwapError>;

    /// Raw token amount held by an SPL token account.
    async fn token_balance(&self, account: &Pubkey) -> Result<u64, SwapError>;

    /// Sign with `wallet`, send and wait for confirmation.
    async fn send_instructions(
        &self,
        wallet: &WalletManager,
        instructions: &[Instruction],
    ) -> Result<Signature, SwapError>;
}

#[async_trait]
impl SetupRpc for RpcClient {
    async fn account_exists(&self, address: &Pubkey) -> Result<bool, SwapError> {
        let account = self
            .get_account_with_commitment(address, CommitmentConfig::confirmed())
            .await
            .map_err(|e| e.network_context("getAccountInfo"))?
            .value;
        Ok(account.is_some())
    }

    async fn token_balance(&self, account: &Pubkey) -> Result<u64, SwapError> {
        let balance = self
            .get_token_account_balance(account)
            .await
            .map_err(|e| e.network_context("getTokenAccountBalance"))?;
        parse_amount(&balance.amount)
    }

    async fn send_instructions(
        &self,
        wallet: &WalletManager,
        instructions: &[Instruction],
    ) -> Result<Signature, SwapError> {
        let blockhash = self
            .get_latest_blockhash()
            .await
            .map_err(|e| e.network_context("getLatestBlockhash"))?;
        let message = MessageV0::try_compile(&wallet.pubkey(), instructions, &[], blockhash)
            .map_err(|e| SwapError::build(format!("Failed to compile message: {}", e)))?;
        let tx = wallet
            .sign_message(VersionedMessage::V0(message))
            .map_err(|e| SwapError::build(e.to_string()))?;
        self.send_and_confirm_transaction(&tx)
            .await
            .map_err(|e| e.network_context("sendAndConfirmTransaction"))
    }
}

pub fn parse_amount(amount: &str) -> Result<u64, SwapError> {
    amount
        .trim()
        .parse::<u64>()
        .map_err(|e| SwapError::decode("tokenAmount.amount", format!("{}: {}", amount, e)))
}

/// Fails unless the raw token amount is zero.
pub fn ensure_empty(amount: u64) -> Result<(), SwapError> {
    if amount == 0 {
        Ok(())
    } else {
        Err(SwapError::validation("input ATA", "balance is not 0"))
    }
}

/// What the reset did to the input ATA.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AtaReset {
    pub compressed: Option<Signature>,
    pub closed: Option<Signature>,
}

/// Create the compressed-token pool for `mint` unless it exists.
pub async fn register_mint<R: SetupRpc + ?Sized>(
    rpc: &R,
    wallet: &WalletManager,
    mint: &Pubkey,
    log: &DebugLog,
) -> Result<Option<Signature>, SwapError> {
    let pool = token_pool_address(mint);
    let exists = rpc.account_exists(&pool).await?;
    log.log(format!(
        "Input mint already registered: {}",
        if exists { "yes" } else { "no" }
    ));
    if exists {
        return Ok(None);
    }

    let instructions = [
        ComputeBudgetInstruction::set_compute_unit_limit(REGISTER_MINT_COMPUTE_UNITS),
        ComputeBudgetInstruction::set_compute_unit_price(REGISTER_MINT_CU_PRICE),
        create_token_pool_instruction(&wallet.pubkey(), mint),
    ];
    match rpc.send_instructions(wallet, &instructions).await {
        Ok(signature) => {
            info!(%mint, %pool, %signature, "Registered mint token pool");
            log.log(format!("new mint registered: {}", signature));
            Ok(Some(signature))
        }
        Err(e) => {
            log.log(format!("error registering mint: {}", e));
            Err(e)
        }
    }
}

/// Compress whatever the wallet's ATA for `mint` still holds, then close it.
/// A missing ATA is left alone. A failed compress is logged; the round only
/// fails if the balance is still non-zero afterwards.
pub async fn reset_input_ata<R: SetupRpc + ?Sized>(
    rpc: &R,
    wallet: &WalletManager,
    mint: &Pubkey,
    state_tree: &StateTreeAccounts,
    log: &DebugLog,
) -> Result<AtaReset, SwapError> {
    let owner = wallet.pubkey();
    let ata = get_associated_token_address(&owner, mint);
    let mut reset = AtaReset::default();

    if !rpc.account_exists(&ata).await? {
        log.log(format!("Input ATA {} does not exist, nothing to reset", ata));
        return Ok(reset);
    }

    let leftover = rpc.token_balance(&ata).await?;
    if leftover > 0 {
        log.log(format!("Found ATA, compressing: {}", leftover));
        let compressed = match compress_instruction(&owner, &owner, &ata, mint, leftover, state_tree) {
            Ok(ix) => rpc.send_instructions(wallet, &[ix]).await,
            Err(e) => Err(e),
        };
        match compressed {
            Ok(signature) => {
                info!(%ata, amount = leftover, %signature, "Compressed input ATA leftovers");
                log.log(format!("compressTxId: {}", signature));
                reset.compressed = Some(signature);
            }
            Err(e) => {
                warn!(%ata, amount = leftover, error = %e, "Compressing input ATA leftovers failed");
                log.log(format!("Compression of input ATA failed: {}", e));
            }
        }
        ensure_empty(rpc.token_balance(&ata).await?)?;
    }

    let close = close_account(&spl_token::id(), &ata, &owner, &owner, &[])
        .map_err(|e| SwapError::build(format!("close input ATA: {}", e)))?;
    let signature = rpc.send_instructions(wallet, &[close]).await?;
    info!(%ata, %signature, "Closed input ATA");
    log.log(format!("closeTxId: {}", signature));
    reset.closed = Some(signature);
    Ok(reset)
}
