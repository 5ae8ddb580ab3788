//! Swap transaction assembly.
//!
//! Turns an aggregator `/swap-instructions` response into one signed v0
//! transaction with a fixed instruction order:
//! compute budget, input ATA create, decompress, setup, swap, cleanup
//! (re-compress / unwrap), input ATA close.
//! The `/swap` flow skips assembly and only re-signs what the aggregator built.

use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use itertools::Itertools;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::{
    address_lookup_table::{state::AddressLookupTable, AddressLookupTableAccount},
    commitment_config::CommitmentConfig,
    compute_budget::ComputeBudgetInstruction,
    hash::Hash,
    instruction::{AccountMeta, Instruction},
    message::{v0::Message as MessageV0, VersionedMessage},
    pubkey::Pubkey,
    signature::Signature,
    transaction::VersionedTransaction,
};
use spl_associated_token_account::{
    get_associated_token_address, instruction::create_associated_token_account_idempotent,
};
use spl_token::instruction::close_account;
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::{ErrorContext, SwapError};
use crate::light_instructions::compressed_token_program_id;
use crate::structured_logging::DebugLog;
use crate::swap_client::{InstructionPayload, SwapInstructionsResponse};
use crate::wallet::WalletManager;

/// Discriminator of the SPL token `CloseAccount` instruction.
const CLOSE_ACCOUNT_TAG: u8 = 9;

/// Signed transaction plus what the send path needs to track it.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub transaction: VersionedTransaction,
    pub serialized: Vec<u8>,
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
}

impl BuiltTransaction {
    fn new(
        transaction: VersionedTransaction,
        last_valid_block_height: u64,
    ) -> Result<Self, SwapError> {
        let serialized = bincode::serialize(&transaction)
            .map_err(|e| SwapError::build(format!("serialize transaction: {}", e)))?;
        Ok(Self {
            blockhash: *transaction.message.recent_blockhash(),
            transaction,
            serialized,
            last_valid_block_height,
        })
    }

    pub fn signature(&self) -> Option<Signature> {
        self.transaction.signatures.first().copied()
    }

    pub fn size(&self) -> usize {
        self.serialized.len()
    }

    pub fn fits(&self, max_size: usize) -> bool {
        self.size() <= max_size
    }
}

/// Inputs to the instruction ordering that do not come from the aggregator.
#[derive(Debug, Clone)]
pub struct AssemblyParams {
    pub payer: Pubkey,
    pub input_mint: Pubkey,
    pub compute_unit_limit: u32,
    pub compute_unit_price: u64,
    /// Local decompress of the input into its ATA. Dropped when the
    /// aggregator's setup already talks to the compressed-token program.
    pub decompress: Option<Instruction>,
}

impl AssemblyParams {
    pub fn input_ata(&self) -> Pubkey {
        get_associated_token_address(&self.payer, &self.input_mint)
    }
}

/// Convert an aggregator payload, rejecting any signer other than `payer`.
pub fn decode_instruction(
    payload: &InstructionPayload,
    payer: &Pubkey,
) -> Result<Instruction, SwapError> {
    let program_id = Pubkey::from_str(&payload.program_id)
        .map_err(|e| SwapError::decode("programId", format!("{}: {}", payload.program_id, e)))?;
    let data = BASE64
        .decode(&payload.data)
        .map_err(|e| SwapError::decode("data", format!("{} (program {})", e, program_id)))?;

    let accounts = payload
        .accounts
        .iter()
        .map(|meta| {
            let pubkey = Pubkey::from_str(&meta.pubkey)
                .map_err(|e| SwapError::decode("accounts.pubkey", format!("{}: {}", meta.pubkey, e)))?;
            if meta.is_signer && pubkey != *payer {
                return Err(SwapError::decode(
                    "accounts.isSigner",
                    format!("unexpected signer account: {}", pubkey),
                ));
            }
            Ok(AccountMeta {
                pubkey,
                is_signer: meta.is_signer,
                is_writable: meta.is_writable,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Instruction {
        program_id,
        accounts,
        data,
    })
}

fn decode_each<'a>(
    payloads: impl IntoIterator<Item = &'a InstructionPayload>,
    payer: &Pubkey,
) -> Result<Vec<Instruction>, SwapError> {
    payloads
        .into_iter()
        .map(|payload| decode_instruction(payload, payer))
        .collect()
}

fn creates_ata(ix: &Instruction, ata: &Pubkey) -> bool {
    ix.program_id == spl_associated_token_account::id()
        && ix.accounts.get(1).map(|meta| meta.pubkey) == Some(*ata)
}

fn closes_account(ix: &Instruction, account: &Pubkey) -> bool {
    ix.program_id == spl_token::id()
        && ix.data.first() == Some(&CLOSE_ACCOUNT_TAG)
        && ix.accounts.first().map(|meta| meta.pubkey) == Some(*account)
}

/// Order the swap's instructions. Pure; no RPC.
pub fn assemble_instructions(
    response: &SwapInstructionsResponse,
    params: &AssemblyParams,
) -> Result<Vec<Instruction>, SwapError> {
    let payer = &params.payer;
    let compute_budget = decode_each(&response.compute_budget_instructions, payer)?;
    let setup = decode_each(&response.setup_instructions, payer)?;
    let swap = decode_instruction(&response.swap_instruction, payer)?;
    let cleanup = decode_each(response.cleanup(), payer)?;

    let input_ata = params.input_ata();
    let is_native_input = params.input_mint == spl_token::native_mint::id();

    let mut instructions = Vec::with_capacity(compute_budget.len() + setup.len() + cleanup.len() + 5);

    if compute_budget.is_empty() {
        instructions.push(ComputeBudgetInstruction::set_compute_unit_limit(
            params.compute_unit_limit,
        ));
        instructions.push(ComputeBudgetInstruction::set_compute_unit_price(
            params.compute_unit_price,
        ));
    } else {
        instructions.extend(compute_budget);
    }

    if !setup.iter().any(|ix| creates_ata(ix, &input_ata)) {
        instructions.push(create_associated_token_account_idempotent(
            payer,
            payer,
            &params.input_mint,
            &spl_token::id(),
        ));
    }

    let setup_decompresses = setup
        .iter()
        .any(|ix| ix.program_id == compressed_token_program_id());
    match &params.decompress {
        Some(decompress) if !setup_decompresses => instructions.push(decompress.clone()),
        Some(_) => debug!("Aggregator setup already decompresses, skipping local decompress"),
        None => {}
    }

    instructions.extend(setup);
    instructions.push(swap);

    let cleanup_closes_input = cleanup.iter().any(|ix| closes_account(ix, &input_ata));
    instructions.extend(cleanup);

    // Wrapped SOL is unwrapped by the aggregator's own cleanup.
    if !is_native_input && !cleanup_closes_input {
        let close = close_account(&spl_token::id(), &input_ata, payer, payer, &[])
            .map_err(|e| SwapError::build(format!("close input ATA: {}", e)))?;
        instructions.push(close);
    }

    Ok(instructions)
}

/// Aggregator tables first, then the Light table; unparsable and duplicate
/// addresses are dropped.
pub fn lookup_table_addresses(
    response: &SwapInstructionsResponse,
    light_lut: Option<Pubkey>,
) -> Vec<Pubkey> {
    let mut seen = HashSet::new();
    response
        .address_lookup_table_addresses
        .iter()
        .filter_map(|addr| match Pubkey::from_str(addr) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(address = %addr, error = %e, "Ignoring invalid lookup table address");
                None
            }
        })
        .chain(light_lut)
        .filter(|key| seen.insert(*key))
        .collect()
}

pub fn describe_instruction(index: usize, ix: &Instruction) -> String {
    format!(
        "#{} program={} data_len={} accounts={} [{}]",
        index,
        ix.program_id,
        ix.data.len(),
        ix.accounts.len(),
        ix.accounts.iter().map(|meta| meta.pubkey).join(", ")
    )
}

pub struct SwapTransactionBuilder {
    wallet: Arc<WalletManager>,
    rpc: Arc<RpcClient>,
    input_mint: Pubkey,
    light_lut: Option<Pubkey>,
    compute_unit_limit: u32,
    compute_unit_price: u64,
    log: DebugLog,
}

impl SwapTransactionBuilder {
    pub fn new(
        wallet: Arc<WalletManager>,
        rpc: Arc<RpcClient>,
        config: &Config,
        log: DebugLog,
    ) -> Result<Self, SwapError> {
        Ok(Self {
            wallet,
            rpc,
            input_mint: config.input_mint_pubkey()?,
            light_lut: config.light_lut_pubkey()?,
            compute_unit_limit: config.compute_unit_limit,
            compute_unit_price: config.compute_unit_price_micro_lamports(),
            log,
        })
    }

    pub fn params(&self) -> AssemblyParams {
        AssemblyParams {
            payer: self.wallet.pubkey(),
            input_mint: self.input_mint,
            compute_unit_limit: self.compute_unit_limit,
            compute_unit_price: self.compute_unit_price,
            decompress: None,
        }
    }

    /// Latest blockhash at "confirmed" and its last valid block height.
    pub async fn latest_blockhash(&self) -> Result<(Hash, u64), SwapError> {
        let retry_strategy = ExponentialBackoff::from_millis(50)
            .max_delay(Duration::from_millis(1000))
            .map(jitter)
            .take(3);

        let rpc = self.rpc.clone();
        Retry::spawn(retry_strategy, || {
            let rpc = rpc.clone();
            async move {
                rpc.get_latest_blockhash_with_commitment(CommitmentConfig::confirmed())
                    .await
            }
        })
        .await
        .map_err(|e| e.network_context("getLatestBlockhash"))
    }

    /// Missing or undecodable tables are skipped with a warning.
    pub async fn fetch_lookup_tables(
        &self,
        addresses: &[Pubkey],
    ) -> Result<Vec<AddressLookupTableAccount>, SwapError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let accounts = self
            .rpc
            .get_multiple_accounts(addresses)
            .await
            .map_err(|e| e.network_context("getMultipleAccounts"))?;

        Ok(addresses
            .iter()
            .zip(accounts)
            .filter_map(|(key, account)| {
                let Some(account) = account else {
                    warn!(table = %key, "Lookup table account not found");
                    return None;
                };
                match AddressLookupTable::deserialize(&account.data) {
                    Ok(table) => Some(AddressLookupTableAccount {
                        key: *key,
                        addresses: table.addresses.to_vec(),
                    }),
                    Err(e) => {
                        warn!(table = %key, error = %e, "Lookup table account is not decodable");
                        None
                    }
                }
            })
            .collect())
    }

    fn log_instructions(&self, instructions: &[Instruction]) {
        for (index, ix) in instructions.iter().enumerate() {
            let line = describe_instruction(index, ix);
            debug!("{}", line);
            self.log.log(line);
        }
    }

    pub async fn build(
        &self,
        response: &SwapInstructionsResponse,
        decompress: Option<Instruction>,
    ) -> Result<BuiltTransaction, SwapError> {
        let params = AssemblyParams {
            decompress,
            ..self.params()
        };
        let instructions = assemble_instructions(response, &params)?;
        self.log_instructions(&instructions);

        let table_addresses = lookup_table_addresses(response, self.light_lut);
        let tables = self.fetch_lookup_tables(&table_addresses).await?;
        let (blockhash, last_valid_block_height) = self.latest_blockhash().await?;

        let payer = self.wallet.pubkey();
        let message = MessageV0::try_compile(&payer, &instructions, &tables, blockhash)
            .map_err(|e| SwapError::build(format!("Failed to compile message: {}", e)))?;
        let transaction = self
            .wallet
            .sign_message(VersionedMessage::V0(message))
            .map_err(|e| SwapError::build(e.to_string()))?;

        let built = BuiltTransaction::new(transaction, last_valid_block_height)?;
        info!(
            instructions = instructions.len(),
            lookup_tables = tables.len(),
            size = built.size(),
            %blockhash,
            "Swap transaction built"
        );
        Ok(built)
    }

    /// Re-sign the aggregator's `/swap` transaction. Without a reported last
    /// valid block height the current one is used.
    pub async fn build_from_swap_transaction(
        &self,
        encoded: &str,
        last_valid_block_height: Option<u64>,
    ) -> Result<BuiltTransaction, SwapError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| SwapError::decode("swapTransaction", e.to_string()))?;
        let unsigned: VersionedTransaction = bincode::deserialize(&bytes)
            .map_err(|e| SwapError::decode("swapTransaction", e.to_string()))?;

        let last_valid_block_height = match last_valid_block_height {
            Some(height) => height,
            None => self.latest_blockhash().await?.1,
        };

        let transaction = self
            .wallet
            .sign_transaction(unsigned)
            .map_err(|e| SwapError::build(e.to_string()))?;
        let built = BuiltTransaction::new(transaction, last_valid_block_height)?;
        info!(size = built.size(), blockhash = %built.blockhash, "Aggregator transaction re-signed");
        Ok(built)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap_client::AccountMetaPayload;
    use solana_sdk::{compute_budget, system_instruction};

    fn payload(ix: &Instruction) -> InstructionPayload {
        InstructionPayload {
            program_id: ix.program_id.to_string(),
            accounts: ix
                .accounts
                .iter()
                .map(|meta| AccountMetaPayload {
                    pubkey: meta.pubkey.to_string(),
                    is_signer: meta.is_signer,
                    is_writable: meta.is_writable,
                })
                .collect(),
            data: BASE64.encode(&ix.data),
        }
    }

    fn params() -> AssemblyParams {
        AssemblyParams {
            payer: Pubkey::new_unique(),
            input_mint: Pubkey::new_unique(),
            compute_unit_limit: 1_400_000,
            compute_unit_price: 17_858,
            decompress: None,
        }
    }

    fn marker(program: Pubkey) -> Instruction {
        Instruction::new_with_bytes(program, &[1, 2, 3], vec![])
    }

    fn response(
        compute_budget: Vec<Instruction>,
        setup: Vec<Instruction>,
        swap: Instruction,
        cleanup: Vec<Instruction>,
    ) -> SwapInstructionsResponse {
        SwapInstructionsResponse {
            token_ledger_instruction: None,
            compute_budget_instructions: compute_budget.iter().map(payload).collect(),
            setup_instructions: setup.iter().map(payload).collect(),
            swap_instruction: payload(&swap),
            cleanup_instruction: None,
            cleanup_instructions: cleanup.iter().map(payload).collect(),
            address_lookup_table_addresses: vec![],
        }
    }

    #[test]
    fn instructions_follow_fixed_order() {
        let p = params();
        let decompress = marker(Pubkey::new_unique());
        let swap = marker(Pubkey::new_unique());
        let compress = marker(Pubkey::new_unique());
        let resp = response(vec![], vec![decompress.clone()], swap.clone(), vec![compress.clone()]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        let programs: Vec<Pubkey> = ixs.iter().map(|ix| ix.program_id).collect();
        assert_eq!(
            programs,
            vec![
                compute_budget::id(),
                compute_budget::id(),
                spl_associated_token_account::id(),
                decompress.program_id,
                swap.program_id,
                compress.program_id,
                spl_token::id(),
            ]
        );
        assert!(closes_account(ixs.last().unwrap(), &p.input_ata()));
    }

    #[test]
    fn local_decompress_follows_ata_create() {
        let mut p = params();
        let decompress = Instruction::new_with_bytes(compressed_token_program_id(), &[7], vec![]);
        p.decompress = Some(decompress.clone());
        let swap = marker(Pubkey::new_unique());
        let resp = response(vec![], vec![], swap.clone(), vec![]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        assert!(creates_ata(&ixs[2], &p.input_ata()));
        assert_eq!(ixs[3], decompress);
        assert_eq!(ixs[4], swap);
        assert_eq!(ixs.len(), 6);
    }

    #[test]
    fn aggregator_decompress_suppresses_local_one() {
        let mut p = params();
        p.decompress = Some(Instruction::new_with_bytes(compressed_token_program_id(), &[7], vec![]));
        let aggregator_decompress = Instruction::new_with_bytes(compressed_token_program_id(), &[8], vec![]);
        let resp = response(vec![], vec![aggregator_decompress.clone()], marker(Pubkey::new_unique()), vec![]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        let light: Vec<&Instruction> = ixs
            .iter()
            .filter(|ix| ix.program_id == compressed_token_program_id())
            .collect();
        assert_eq!(light, vec![&aggregator_decompress]);
    }

    #[test]
    fn aggregator_compute_budget_replaces_local_pair() {
        let p = params();
        let cu = ComputeBudgetInstruction::set_compute_unit_limit(300_000);
        let resp = response(vec![cu.clone()], vec![], marker(Pubkey::new_unique()), vec![]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        assert_eq!(ixs[0], cu);
        assert_eq!(ixs[1].program_id, spl_associated_token_account::id());
    }

    #[test]
    fn setup_that_creates_input_ata_is_not_duplicated() {
        let p = params();
        let create = create_associated_token_account_idempotent(
            &p.payer,
            &p.payer,
            &p.input_mint,
            &spl_token::id(),
        );
        let resp = response(vec![], vec![create], marker(Pubkey::new_unique()), vec![]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        let creates = ixs.iter().filter(|ix| creates_ata(ix, &p.input_ata())).count();
        assert_eq!(creates, 1);
    }

    #[test]
    fn native_input_is_not_closed_twice() {
        let mut p = params();
        p.input_mint = spl_token::native_mint::id();
        let resp = response(vec![], vec![], marker(Pubkey::new_unique()), vec![]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        assert!(!ixs.iter().any(|ix| closes_account(ix, &p.input_ata())));
    }

    #[test]
    fn cleanup_that_closes_input_ata_suppresses_local_close() {
        let p = params();
        let close = close_account(&spl_token::id(), &p.input_ata(), &p.payer, &p.payer, &[]).unwrap();
        let resp = response(vec![], vec![], marker(Pubkey::new_unique()), vec![close]);

        let ixs = assemble_instructions(&resp, &p).unwrap();

        let closes = ixs.iter().filter(|ix| closes_account(ix, &p.input_ata())).count();
        assert_eq!(closes, 1);
    }

    #[test]
    fn foreign_signer_is_rejected() {
        let payer = Pubkey::new_unique();
        let stranger = Pubkey::new_unique();
        let ix = system_instruction::transfer(&stranger, &payer, 1);

        let err = decode_instruction(&payload(&ix), &payer).unwrap_err();
        assert!(err.to_string().contains("unexpected signer account"));

        let own = system_instruction::transfer(&payer, &stranger, 1);
        assert_eq!(decode_instruction(&payload(&own), &payer).unwrap(), own);
    }

    #[test]
    fn malformed_payloads_are_decode_errors() {
        let payer = Pubkey::new_unique();
        let bad_program = InstructionPayload {
            program_id: "not-a-key".to_string(),
            accounts: vec![],
            data: String::new(),
        };
        assert!(matches!(
            decode_instruction(&bad_program, &payer),
            Err(SwapError::InstructionDecode { ref field, .. }) if field == "programId"
        ));

        let bad_data = InstructionPayload {
            program_id: Pubkey::new_unique().to_string(),
            accounts: vec![],
            data: "***".to_string(),
        };
        assert!(matches!(
            decode_instruction(&bad_data, &payer),
            Err(SwapError::InstructionDecode { ref field, .. }) if field == "data"
        ));
    }

    #[test]
    fn lookup_tables_append_light_table_once() {
        let jup = Pubkey::new_unique();
        let light = Pubkey::new_unique();
        let mut resp = response(vec![], vec![], marker(Pubkey::new_unique()), vec![]);
        resp.address_lookup_table_addresses =
            vec![jup.to_string(), "garbage".to_string(), light.to_string()];

        assert_eq!(lookup_table_addresses(&resp, Some(light)), vec![jup, light]);
        assert_eq!(lookup_table_addresses(&resp, None), vec![jup, light]);
    }

    #[test]
    fn describe_lists_accounts() {
        let a = Pubkey::new_unique();
        let ix = Instruction::new_with_bytes(Pubkey::new_unique(), &[0; 4], vec![AccountMeta::new(a, false)]);
        let line = describe_instruction(3, &ix);
        assert!(line.starts_with("#3 "));
        assert!(line.contains("data_len=4 accounts=1"));
        assert!(line.contains(&a.to_string()));
    }

    #[test]
    fn built_transaction_reports_size_and_signature() {
        let wallet = WalletManager::new_random();
        let payer = wallet.pubkey();
        let ix = system_instruction::transfer(&payer, &Pubkey::new_unique(), 1);
        let blockhash = Hash::new_unique();
        let message = MessageV0::try_compile(&payer, &[ix], &[], blockhash).unwrap();
        let tx = wallet.sign_message(VersionedMessage::V0(message)).unwrap();

        let built = BuiltTransaction::new(tx.clone(), 500).unwrap();

        assert_eq!(built.blockhash, blockhash);
        assert_eq!(built.signature(), Some(tx.signatures[0]));
        assert!(built.fits(1_232));
        assert!(!built.fits(10));
        let roundtrip: VersionedTransaction = bincode::deserialize(&built.serialized).unwrap();
        assert_eq!(roundtrip, tx);
    }
}
