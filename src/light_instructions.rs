//! Light compressed-token program instructions used around a swap: decompress
//! the input into its ATA, compress ATA leftovers back, and register a mint's
//! token pool.

use std::str::FromStr;

use light_compressed_token_client::{
    compress, create_decompress_instruction, get_cpi_authority_pda, get_token_pool_pda,
    AccountState, CompressedAccount, CompressedProof, DecompressParams, MerkleContext, TokenData,
    TreeType, PROGRAM_ID,
};
use solana_sdk::{
    instruction::{AccountMeta, Instruction},
    pubkey::Pubkey,
    system_program,
};

use crate::compression::{CompressedTokenAccount, ProofPoints, ValidityProof};
use crate::config::StateTreeAccounts;
use crate::errors::SwapError;

/// Anchor discriminator of `create_token_pool`.
const CREATE_TOKEN_POOL_DISCRIMINATOR: [u8; 8] = [0x17, 0xa9, 0x1b, 0x7a, 0x93, 0xa9, 0xd1, 0x98];

pub fn compressed_token_program_id() -> Pubkey {
    PROGRAM_ID
}

/// SPL account holding the mint's tokens while they are compressed.
pub fn token_pool_address(mint: &Pubkey) -> Pubkey {
    get_token_pool_pda(mint)
}

fn parse_key(field: &str, value: &str) -> Result<Pubkey, SwapError> {
    Pubkey::from_str(value).map_err(|e| SwapError::decode(field, format!("{}: {}", value, e)))
}

/// Indexer entry as the program expects it: account, token data and the
/// position of its leaf.
fn input_account(
    account: &CompressedTokenAccount,
    state_tree: &StateTreeAccounts,
) -> Result<(CompressedAccount, TokenData, MerkleContext), SwapError> {
    let tree = match account.tree.as_deref() {
        Some(tree) => parse_key("tree", tree)?,
        None => return Err(SwapError::decode("tree", format!("missing for {}", account.hash))),
    };
    let queue = match account.queue.as_deref() {
        Some(queue) => parse_key("queue", queue)?,
        None if tree == state_tree.tree => state_tree.queue,
        None => {
            return Err(SwapError::decode(
                "queue",
                format!("unknown nullifier queue for tree {}", tree),
            ))
        }
    };
    let leaf_index = account
        .leaf_index
        .ok_or_else(|| SwapError::decode("leafIndex", format!("missing for {}", account.hash)))
        .and_then(|index| {
            u32::try_from(index).map_err(|_| SwapError::decode("leafIndex", index.to_string()))
        })?;

    let compressed = CompressedAccount {
        owner: PROGRAM_ID.into(),
        lamports: account.lamports,
        address: None,
        data: None,
    };
    let token_data = TokenData {
        mint: parse_key("mint", &account.mint)?.into(),
        owner: parse_key("owner", &account.owner)?.into(),
        amount: account.amount,
        delegate: account
            .delegate
            .as_deref()
            .map(|delegate| parse_key("delegate", delegate).map(Into::into))
            .transpose()?,
        state: if account.frozen {
            AccountState::Frozen
        } else {
            AccountState::Initialized
        },
        tlv: None,
    };
    let context = MerkleContext {
        merkle_tree_pubkey: tree.into(),
        queue_pubkey: queue.into(),
        leaf_index,
        prove_by_index: false,
        tree_type: TreeType::StateV1,
    };
    Ok((compressed, token_data, context))
}

fn proof_points(points: &ProofPoints) -> Result<CompressedProof, SwapError> {
    fn fixed<const N: usize>(field: &str, bytes: &[u8]) -> Result<[u8; N], SwapError> {
        bytes
            .try_into()
            .map_err(|_| SwapError::decode(field, format!("expected {} bytes, got {}", N, bytes.len())))
    }
    Ok(CompressedProof {
        a: fixed("compressedProof.a", &points.a)?,
        b: fixed("compressedProof.b", &points.b)?,
        c: fixed("compressedProof.c", &points.c)?,
    })
}

fn root_indices(proof: &ValidityProof) -> Result<Vec<Option<u16>>, SwapError> {
    proof
        .root_indices
        .iter()
        .map(|index| {
            u16::try_from(*index)
                .map(Some)
                .map_err(|_| SwapError::decode("rootIndices", index.to_string()))
        })
        .collect()
}

/// Decompress `amount` from `accounts` into `destination`. Change stays
/// compressed in `state_tree`.
pub fn decompress_instruction(
    payer: &Pubkey,
    destination: &Pubkey,
    amount: u64,
    accounts: &[CompressedTokenAccount],
    proof: &ValidityProof,
    state_tree: &StateTreeAccounts,
) -> Result<Instruction, SwapError> {
    if accounts.is_empty() {
        return Err(SwapError::validation("decompress", "no compressed input accounts"));
    }
    let inputs = accounts
        .iter()
        .map(|account| input_account(account, state_tree))
        .collect::<Result<Vec<_>, _>>()?;

    let params = DecompressParams {
        payer: *payer,
        input_compressed_token_accounts: inputs,
        to_address: *destination,
        amount,
        recent_input_state_root_indices: root_indices(proof)?,
        recent_validity_proof: proof.compressed_proof.as_ref().map(proof_points).transpose()?,
        output_state_tree: Some(state_tree.tree),
        token_program_id: Some(spl_token::id()),
    };
    create_decompress_instruction(params)
        .map_err(|e| SwapError::build(format!("decompress instruction: {:?}", e)))
}

/// Move `amount` from the SPL account `source` back into a compressed
/// account of `owner`.
pub fn compress_instruction(
    payer: &Pubkey,
    owner: &Pubkey,
    source: &Pubkey,
    mint: &Pubkey,
    amount: u64,
    state_tree: &StateTreeAccounts,
) -> Result<Instruction, SwapError> {
    compress(*payer, *owner, *source, *mint, amount, *owner, state_tree.tree)
        .map_err(|e| SwapError::build(format!("compress instruction: {:?}", e)))
}

/// Create the token pool that lets `mint` be compressed.
pub fn create_token_pool_instruction(fee_payer: &Pubkey, mint: &Pubkey) -> Instruction {
    let (cpi_authority, _) = get_cpi_authority_pda();
    Instruction {
        program_id: PROGRAM_ID,
        accounts: vec![
            AccountMeta::new(*fee_payer, true),
            AccountMeta::new(token_pool_address(mint), false),
            AccountMeta::new_readonly(system_program::id(), false),
            AccountMeta::new(*mint, false),
            AccountMeta::new_readonly(spl_token::id(), false),
            AccountMeta::new_readonly(cpi_authority, false),
        ],
        data: CREATE_TOKEN_POOL_DISCRIMINATOR.to_vec(),
    }
}
