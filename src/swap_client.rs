//! Aggregator HTTP client: quotes, swap instructions and full swap transactions.
//!
//! The quote response is kept as raw JSON because `/swap-instructions` and
//! `/swap` expect it echoed back untouched; a typed summary is parsed next to
//! it for logging.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use solana_sdk::pubkey::Pubkey;
use tracing::{debug, info};

use crate::config::{CompressionMode, Config};
use crate::errors::{ErrorContext, SwapError};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteRequest {
    pub input_mint: String,
    pub output_mint: String,
    pub amount: u64,
    pub slippage_bps: u16,
    pub max_accounts: u8,
    pub only_direct_routes: bool,
    pub restrict_intermediate_tokens: bool,
    pub compute_auto_slippage: bool,
    pub minimize_slippage: bool,
    pub prefer_liquid_dexes: bool,
    pub compression_mode: CompressionMode,
}

impl QuoteRequest {
    pub fn from_config(cfg: &Config, input_mint: &Pubkey, output_mint: &Pubkey) -> Self {
        Self {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            amount: cfg.amount,
            slippage_bps: cfg.slippage_bps,
            max_accounts: cfg.max_accounts,
            only_direct_routes: true,
            restrict_intermediate_tokens: true,
            compute_auto_slippage: true,
            minimize_slippage: true,
            prefer_liquid_dexes: true,
            compression_mode: cfg.compression_mode,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteSummary {
    in_amount: String,
    out_amount: String,
    #[serde(default)]
    price_impact_pct: Option<String>,
    #[serde(default)]
    slippage_bps: u16,
    #[serde(default)]
    route_plan: Vec<RoutePlanStep>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoutePlanStep {
    swap_info: SwapInfo,
}

#[derive(Debug, Deserialize)]
struct SwapInfo {
    #[serde(default)]
    label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QuoteResponse {
    pub raw: Value,
    pub in_amount: u64,
    pub out_amount: u64,
    pub price_impact_pct: Option<String>,
    pub slippage_bps: u16,
    pub route_labels: Vec<String>,
}

impl QuoteResponse {
    pub fn from_value(raw: Value) -> Result<Self, SwapError> {
        let summary: QuoteSummary = serde_json::from_value(raw.clone())
            .map_err(|e| SwapError::decode("quoteResponse", e.to_string()))?;
        let in_amount = summary
            .in_amount
            .parse()
            .map_err(|e| SwapError::decode("inAmount", format!("{}", e)))?;
        let out_amount = summary
            .out_amount
            .parse()
            .map_err(|e| SwapError::decode("outAmount", format!("{}", e)))?;
        Ok(Self {
            raw,
            in_amount,
            out_amount,
            price_impact_pct: summary.price_impact_pct,
            slippage_bps: summary.slippage_bps,
            route_labels: summary
                .route_plan
                .into_iter()
                .filter_map(|step| step.swap_info.label)
                .collect(),
        })
    }
}

/// Instruction exactly as the aggregator returns it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionPayload {
    pub program_id: String,
    #[serde(default)]
    pub accounts: Vec<AccountMetaPayload>,
    /// base64
    pub data: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMetaPayload {
    pub pubkey: String,
    pub is_signer: bool,
    pub is_writable: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapInstructionsResponse {
    #[serde(default)]
    pub token_ledger_instruction: Option<InstructionPayload>,
    #[serde(default)]
    pub compute_budget_instructions: Vec<InstructionPayload>,
    #[serde(default)]
    pub setup_instructions: Vec<InstructionPayload>,
    pub swap_instruction: InstructionPayload,
    /// Plain aggregator API: at most one cleanup (SOL unwrap).
    #[serde(default)]
    pub cleanup_instruction: Option<InstructionPayload>,
    /// Compression-aware adapter: cleanup list including re-compression.
    #[serde(default)]
    pub cleanup_instructions: Vec<InstructionPayload>,
    #[serde(default)]
    pub address_lookup_table_addresses: Vec<String>,
}

impl SwapInstructionsResponse {
    /// The plural list wins when the endpoint provides one.
    pub fn cleanup(&self) -> Vec<&InstructionPayload> {
        if !self.cleanup_instructions.is_empty() {
            self.cleanup_instructions.iter().collect()
        } else {
            self.cleanup_instruction.iter().collect()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwapTransactionResponse {
    /// base64 serialized, unsigned versioned transaction
    pub swap_transaction: String,
    #[serde(default)]
    pub last_valid_block_height: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    user_public_key: String,
    quote_response: &'a Value,
    wrap_and_unwrap_sol: bool,
    dynamic_compute_unit_limit: bool,
    skip_user_accounts_rpc_calls: bool,
    compute_unit_price_micro_lamports: u64,
    compression_mode: CompressionMode,
}

pub struct SwapClient {
    http: Client,
    base_url: String,
    limiter: DefaultDirectRateLimiter,
    compute_unit_price_micro_lamports: u64,
    compression_mode: CompressionMode,
}

impl std::fmt::Debug for SwapClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwapClient")
            .field("base_url", &self.base_url)
            .field("compression_mode", &self.compression_mode)
            .finish()
    }
}

impl SwapClient {
    pub fn new(cfg: &Config) -> Result<Self, SwapError> {
        let http = Client::builder()
            .timeout(Duration::from_millis(cfg.http_timeout_ms))
            .build()
            .map_err(|e| SwapError::network(format!("http client: {}", e)))?;
        let per_sec = NonZeroU32::new(cfg.aggregator_requests_per_sec)
            .ok_or_else(|| SwapError::config("aggregator_requests_per_sec must be greater than 0"))?;
        Ok(Self {
            http,
            base_url: cfg.aggregator_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::direct(Quota::per_second(per_sec)),
            compute_unit_price_micro_lamports: cfg.compute_unit_price_micro_lamports(),
            compression_mode: cfg.compression_mode,
        })
    }

    pub async fn quote(&self, req: &QuoteRequest) -> Result<QuoteResponse, SwapError> {
        self.limiter.until_ready().await;
        let url = format!("{}/quote", self.base_url);
        debug!(%url, input = %req.input_mint, output = %req.output_mint, amount = req.amount, "Requesting quote");
        let response = self
            .http
            .get(&url)
            .query(req)
            .send()
            .await
            .map_err(|e| anyhow::Error::new(e).network_context("GET /quote"))?;
        let raw: Value = Self::json_or_error(response).await?;
        let quote = QuoteResponse::from_value(raw)?;
        info!(
            in_amount = quote.in_amount,
            out_amount = quote.out_amount,
            routes = ?quote.route_labels,
            "Quote received"
        );
        Ok(quote)
    }

    pub async fn swap_instructions(
        &self,
        user: &Pubkey,
        quote: &QuoteResponse,
    ) -> Result<SwapInstructionsResponse, SwapError> {
        let response = self.post_swap("swap-instructions", user, quote).await?;
        Self::json_or_error(response).await
    }

    pub async fn swap_transaction(
        &self,
        user: &Pubkey,
        quote: &QuoteResponse,
    ) -> Result<SwapTransactionResponse, SwapError> {
        let response = self.post_swap("swap", user, quote).await?;
        Self::json_or_error(response).await
    }

    async fn post_swap(
        &self,
        path: &str,
        user: &Pubkey,
        quote: &QuoteResponse,
    ) -> Result<Response, SwapError> {
        self.limiter.until_ready().await;
        let body = SwapRequest {
            user_public_key: user.to_string(),
            quote_response: &quote.raw,
            wrap_and_unwrap_sol: true,
            dynamic_compute_unit_limit: false,
            skip_user_accounts_rpc_calls: false,
            compute_unit_price_micro_lamports: self.compute_unit_price_micro_lamports,
            compression_mode: self.compression_mode,
        };
        let url = format!("{}/{}", self.base_url, path);
        debug!(%url, "Posting swap request");
        self.http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::Error::new(e).network_context(format!("POST /{}", path)))
    }

    async fn json_or_error<T: serde::de::DeserializeOwned>(response: Response) -> Result<T, SwapError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SwapError::Aggregator {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| SwapError::decode("response body", e.to_string()))
    }
}
