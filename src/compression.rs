//! Compressed token account reads against the compression indexer (Photon
//! JSON-RPC), validity proofs for spending them, and input selection for a
//! decompress of a given amount.

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

use crate::errors::{ErrorContext, SwapError};

/// Upper bound on pages followed per owner/mint query.
const MAX_PAGES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressedTokenAccount {
    pub hash: String,
    pub tree: Option<String>,
    /// Nullifier queue, when the indexer reports it.
    pub queue: Option<String>,
    pub leaf_index: Option<u64>,
    pub lamports: u64,
    pub mint: String,
    pub owner: String,
    pub delegate: Option<String>,
    pub frozen: bool,
    pub amount: u64,
}

/// Groth16 proof points as returned by the indexer.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProofPoints {
    pub a: Vec<u8>,
    pub b: Vec<u8>,
    pub c: Vec<u8>,
}

/// Proof that the given account hashes are current leaves of their trees.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidityProof {
    #[serde(default)]
    pub compressed_proof: Option<ProofPoints>,
    /// Per input, index of the root the proof was made against.
    pub root_indices: Vec<u64>,
    #[serde(default)]
    pub leaf_indices: Vec<u64>,
    #[serde(default)]
    pub merkle_trees: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ProofEnvelope {
    value: ValidityProof,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct AccountsPage {
    value: AccountsList,
}

#[derive(Debug, Deserialize)]
struct AccountsList {
    #[serde(default)]
    items: Vec<TokenAccountItem>,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenAccountItem {
    account: AccountInfo,
    token_data: TokenData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountInfo {
    hash: String,
    #[serde(default)]
    tree: Option<String>,
    #[serde(default)]
    leaf_index: Option<u64>,
    #[serde(default, deserialize_with = "u64_from_number_or_string")]
    lamports: u64,
    /// Newer indexers nest tree and queue here.
    #[serde(default)]
    merkle_context: Option<MerkleContextInfo>,
}

#[derive(Debug, Deserialize)]
struct MerkleContextInfo {
    tree: String,
    #[serde(default)]
    queue: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    mint: String,
    owner: String,
    #[serde(deserialize_with = "u64_from_number_or_string")]
    amount: u64,
    #[serde(default)]
    delegate: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

fn u64_from_number_or_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }
    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OwnerQuery {
    owner: String,
    mint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<String>,
}

pub struct CompressionClient {
    http: Client,
    url: String,
}

impl CompressionClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, SwapError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SwapError::network(format!("http client: {}", e)))?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, SwapError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "compressed-swap",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::Error::new(e).network_context(method.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(SwapError::network(format!("{} returned {}: {}", method, status, text)));
        }
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| SwapError::decode(method, e.to_string()))?;
        if let Some(err) = envelope.error {
            return Err(SwapError::network(format!("{} failed ({}): {}", method, err.code, err.message)));
        }
        envelope
            .result
            .ok_or_else(|| SwapError::decode(method, "missing result"))
    }

    /// All compressed token accounts of `mint` owned by `owner`, following
    /// the indexer's pagination cursor.
    pub async fn compressed_token_accounts(
        &self,
        owner: &Pubkey,
        mint: &Pubkey,
    ) -> Result<Vec<CompressedTokenAccount>, SwapError> {
        let mut accounts = Vec::new();
        let mut cursor = None;
        for _ in 0..MAX_PAGES {
            let params = serde_json::to_value(OwnerQuery {
                owner: owner.to_string(),
                mint: mint.to_string(),
                cursor: cursor.take(),
            })
            .map_err(|e| SwapError::decode("params", e.to_string()))?;
            let result = self.call("getCompressedTokenAccountsByOwner", params).await?;
            let (page, next) = parse_accounts_page(result)?;
            accounts.extend(page);
            match next {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        debug!(%owner, %mint, count = accounts.len(), "Fetched compressed token accounts");
        Ok(accounts)
    }

    pub async fn compressed_balance(&self, owner: &Pubkey, mint: &Pubkey) -> Result<u64, SwapError> {
        let accounts = self.compressed_token_accounts(owner, mint).await?;
        Ok(total_amount(&accounts))
    }

    /// Validity proof for spending `accounts`, in the same order.
    pub async fn validity_proof(
        &self,
        accounts: &[CompressedTokenAccount],
    ) -> Result<ValidityProof, SwapError> {
        let hashes: Vec<&str> = accounts.iter().map(|a| a.hash.as_str()).collect();
        let result = self
            .call(
                "getValidityProof",
                json!({ "hashes": hashes, "newAddressesWithTrees": [] }),
            )
            .await?;
        let proof = parse_validity_proof(result, accounts.len())?;
        debug!(inputs = accounts.len(), root_indices = ?proof.root_indices, "Fetched validity proof");
        Ok(proof)
    }
}

fn parse_validity_proof(result: Value, inputs: usize) -> Result<ValidityProof, SwapError> {
    let envelope: ProofEnvelope = serde_json::from_value(result)
        .map_err(|e| SwapError::decode("getValidityProof", e.to_string()))?;
    let proof = envelope.value;
    if proof.root_indices.len() != inputs {
        return Err(SwapError::decode(
            "rootIndices",
            format!("expected {} entries, got {}", inputs, proof.root_indices.len()),
        ));
    }
    Ok(proof)
}

fn parse_accounts_page(
    result: Value,
) -> Result<(Vec<CompressedTokenAccount>, Option<String>), SwapError> {
    let page: AccountsPage = serde_json::from_value(result)
        .map_err(|e| SwapError::decode("getCompressedTokenAccountsByOwner", e.to_string()))?;
    let accounts = page
        .value
        .items
        .into_iter()
        .map(|item| {
            let (tree, queue) = match item.account.merkle_context {
                Some(ctx) => (Some(ctx.tree), ctx.queue),
                None => (item.account.tree, None),
            };
            CompressedTokenAccount {
                hash: item.account.hash,
                tree,
                queue,
                leaf_index: item.account.leaf_index,
                lamports: item.account.lamports,
                mint: item.token_data.mint,
                owner: item.token_data.owner,
                delegate: item.token_data.delegate,
                frozen: item.token_data.state.as_deref() == Some("frozen"),
                amount: item.token_data.amount,
            }
        })
        .collect();
    Ok((accounts, page.value.cursor.filter(|c| !c.is_empty())))
}

pub fn total_amount(accounts: &[CompressedTokenAccount]) -> u64 {
    accounts.iter().fold(0u64, |acc, a| acc.saturating_add(a.amount))
}

/// Largest accounts first until `amount` is covered. Frozen accounts cannot
/// be spent and are skipped.
pub fn select_min_accounts_for_transfer(
    accounts: &[CompressedTokenAccount],
    amount: u64,
) -> Result<Vec<CompressedTokenAccount>, SwapError> {
    let mut sorted: Vec<&CompressedTokenAccount> = accounts.iter().filter(|a| !a.frozen).collect();
    sorted.sort_by(|a, b| b.amount.cmp(&a.amount));

    let mut selected = Vec::new();
    let mut covered = 0u64;
    for account in sorted {
        if covered >= amount {
            break;
        }
        covered = covered.saturating_add(account.amount);
        selected.push(account.clone());
    }

    if covered < amount {
        return Err(SwapError::InsufficientCompressedBalance {
            required: amount,
            available: covered,
        });
    }
    Ok(selected)
}
