use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use std::{fs, str::FromStr, time::Duration};

use crate::errors::SwapError;

/// Which token representation the aggregator adapter should move through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CompressionMode {
    /// Decompress the input into the ATA before the swap
    DecompressInput,
    /// Decompress the input and re-compress the swap output
    DecompressInputCompressOutput,
}

impl Default for CompressionMode {
    fn default() -> Self {
        CompressionMode::DecompressInput
    }
}

impl CompressionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompressionMode::DecompressInput => "decompressInput",
            CompressionMode::DecompressInputCompressOutput => "decompressInputCompressOutput",
        }
    }
}

/// Timing policy of the send/confirm core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendConfig {
    #[serde(default = "default_resend_interval_ms")]
    pub resend_interval_ms: u64,
    #[serde(default = "default_status_poll_interval_ms")]
    pub status_poll_interval_ms: u64,
    /// Blocks subtracted from the last valid block height before waiting
    #[serde(default = "default_block_height_margin")]
    pub block_height_margin: u64,
    #[serde(default = "default_fetch_retries")]
    pub fetch_retries: u32,
    #[serde(default = "default_fetch_min_delay_ms")]
    pub fetch_min_delay_ms: u64,
    #[serde(default = "default_fetch_backoff_factor")]
    pub fetch_backoff_factor: u32,
    /// How often the subscription path checks the current block height
    #[serde(default = "default_block_height_poll_ms")]
    pub block_height_poll_ms: u64,
}

impl Default for SendConfig {
    fn default() -> Self {
        Self {
            resend_interval_ms: default_resend_interval_ms(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
            block_height_margin: default_block_height_margin(),
            fetch_retries: default_fetch_retries(),
            fetch_min_delay_ms: default_fetch_min_delay_ms(),
            fetch_backoff_factor: default_fetch_backoff_factor(),
            block_height_poll_ms: default_block_height_poll_ms(),
        }
    }
}

impl SendConfig {
    pub fn resend_interval(&self) -> Duration {
        Duration::from_millis(self.resend_interval_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_millis(self.status_poll_interval_ms)
    }

    pub fn block_height_poll_interval(&self) -> Duration {
        Duration::from_millis(self.block_height_poll_ms)
    }

    /// Delay before fetch retry `attempt` (0-indexed): min * factor^attempt
    pub fn fetch_delay(&self, attempt: u32) -> Duration {
        let factor = u64::from(self.fetch_backoff_factor.max(1));
        let multiplier = factor.saturating_pow(attempt);
        Duration::from_millis(self.fetch_min_delay_ms.saturating_mul(multiplier))
    }

    pub fn validate(&self) -> Result<(), SwapError> {
        if self.resend_interval_ms == 0 {
            return Err(SwapError::config("resend_interval_ms must be greater than 0"));
        }
        if self.status_poll_interval_ms == 0 {
            return Err(SwapError::config("status_poll_interval_ms must be greater than 0"));
        }
        if self.block_height_poll_ms == 0 {
            return Err(SwapError::config("block_height_poll_ms must be greater than 0"));
        }
        if self.fetch_min_delay_ms == 0 {
            return Err(SwapError::config("fetch_min_delay_ms must be greater than 0"));
        }
        Ok(())
    }
}

/// A state Merkle tree and its nullifier queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTreeAccounts {
    pub tree: Pubkey,
    pub queue: Pubkey,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Endpoints
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    /// Optional WebSocket endpoint; derived from `rpc_url` when absent.
    #[serde(default)]
    pub ws_url: Option<String>,
    /// Compression indexer (Photon) endpoint.
    #[serde(default = "default_rpc_url")]
    pub compression_url: String,
    #[serde(default = "default_aggregator_url")]
    pub aggregator_url: String,
    #[serde(default = "default_aggregator_requests_per_sec")]
    pub aggregator_requests_per_sec: u32,
    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,

    // Keys
    #[serde(default)]
    pub keypair_path: String,
    #[serde(default)]
    pub light_lut: Option<String>,
    /// State tree receiving decompress change and compressed leftovers.
    #[serde(default = "default_state_tree")]
    pub state_tree: String,
    /// Nullifier queue of `state_tree`; also used for inputs whose indexer
    /// entry carries no queue.
    #[serde(default = "default_state_queue")]
    pub state_queue: String,

    // Swap
    #[serde(default)]
    pub input_mint: String,
    #[serde(default)]
    pub output_mint: String,
    #[serde(default = "default_amount")]
    pub amount: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    #[serde(default = "default_max_accounts")]
    pub max_accounts: u8,
    #[serde(default)]
    pub compression_mode: CompressionMode,
    #[serde(default = "default_priority_fee_lamports")]
    pub priority_fee_lamports: u64,
    #[serde(default = "default_compute_unit_limit")]
    pub compute_unit_limit: u32,
    #[serde(default = "default_max_transaction_size")]
    pub max_transaction_size: usize,

    #[serde(default)]
    pub send: SendConfig,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            ws_url: None,
            compression_url: default_rpc_url(),
            aggregator_url: default_aggregator_url(),
            aggregator_requests_per_sec: default_aggregator_requests_per_sec(),
            http_timeout_ms: default_http_timeout_ms(),
            keypair_path: String::new(),
            light_lut: None,
            state_tree: default_state_tree(),
            state_queue: default_state_queue(),
            input_mint: String::new(),
            output_mint: String::new(),
            amount: default_amount(),
            slippage_bps: default_slippage_bps(),
            max_accounts: default_max_accounts(),
            compression_mode: CompressionMode::default(),
            priority_fee_lamports: default_priority_fee_lamports(),
            compute_unit_limit: default_compute_unit_limit(),
            max_transaction_size: default_max_transaction_size(),
            send: SendConfig::default(),
            log_file: default_log_file(),
        }
    }
}

fn default_rpc_url() -> String {
    "http://127.0.0.1:8899".to_string()
}
fn default_aggregator_url() -> String {
    "https://quote-api.jup.ag/v6".to_string()
}
fn default_aggregator_requests_per_sec() -> u32 {
    1
}
fn default_http_timeout_ms() -> u64 {
    8_000
}
fn default_state_tree() -> String {
    "smt1NamzXdq4AMqS2fS2F1i5KTYPZRhoHgWx38d8WsT".to_string()
}
fn default_state_queue() -> String {
    "nfq1NvQDJ2GEgnS8zt9prAe8rjjpAW1zFkrvZoBR148".to_string()
}
fn default_amount() -> u64 {
    // 0.001042 USDC
    1_042
}
fn default_slippage_bps() -> u16 {
    500
}
fn default_max_accounts() -> u8 {
    64
}
fn default_priority_fee_lamports() -> u64 {
    25_000
}
fn default_compute_unit_limit() -> u32 {
    1_400_000
}
fn default_max_transaction_size() -> usize {
    1_232
}
fn default_log_file() -> String {
    "swap.log".to_string()
}

// Send/confirm defaults
fn default_resend_interval_ms() -> u64 {
    3_500
}
fn default_status_poll_interval_ms() -> u64 {
    2_000
}
fn default_block_height_margin() -> u64 {
    50
}
fn default_fetch_retries() -> u32 {
    4
}
fn default_fetch_min_delay_ms() -> u64 {
    1_000
}
fn default_fetch_backoff_factor() -> u32 {
    2
}
fn default_block_height_poll_ms() -> u64 {
    2_000
}

impl Config {
    /// Load configuration from "config.toml" if present, otherwise defaults,
    /// then apply `.env` and process environment overrides (highest priority):
    /// - INPUT_MINT, OUTPUT_MINT, SWAP_USER_KEYPAIR_PATH
    /// - LIGHT_LUT (or LIGHT_LUT_DEVNET)
    /// - RPC_URL, WS_URL, COMPRESSION_URL, AGGREGATOR_URL, AMOUNT
    /// - STATE_TREE, STATE_QUEUE
    pub fn load() -> Result<Self, SwapError> {
        let _ = dotenvy::dotenv();

        let mut cfg = match fs::read_to_string("config.toml") {
            Ok(s) => toml::from_str::<Config>(&s)
                .map_err(|e| SwapError::config(format!("invalid config.toml: {}", e)))?,
            Err(_) => Config::default(),
        };

        cfg.apply_env(|key| std::env::var(key).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), SwapError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("INPUT_MINT") {
            self.input_mint = v;
        }
        if let Some(v) = lookup("OUTPUT_MINT") {
            self.output_mint = v;
        }
        if let Some(v) = lookup("SWAP_USER_KEYPAIR_PATH") {
            self.keypair_path = v;
        }
        if let Some(v) = lookup("LIGHT_LUT").or_else(|| lookup("LIGHT_LUT_DEVNET")) {
            self.light_lut = Some(v);
        }
        if let Some(v) = lookup("RPC_URL") {
            self.rpc_url = v;
        }
        if let Some(v) = lookup("WS_URL") {
            self.ws_url = Some(v);
        }
        if let Some(v) = lookup("COMPRESSION_URL") {
            self.compression_url = v;
        }
        if let Some(v) = lookup("AGGREGATOR_URL") {
            self.aggregator_url = v;
        }
        if let Some(v) = lookup("STATE_TREE") {
            self.state_tree = v;
        }
        if let Some(v) = lookup("STATE_QUEUE") {
            self.state_queue = v;
        }
        if let Some(v) = lookup("AMOUNT") {
            self.amount = v
                .parse()
                .map_err(|e| SwapError::config(format!("AMOUNT is not a number: {}", e)))?;
        }
        Ok(())
    }

    /// Validate configuration consistency and constraints
    pub fn validate(&self) -> Result<(), SwapError> {
        if self.input_mint.is_empty() {
            return Err(SwapError::config("INPUT_MINT is not set"));
        }
        if self.output_mint.is_empty() {
            return Err(SwapError::config("OUTPUT_MINT is not set"));
        }
        if self.keypair_path.is_empty() {
            return Err(SwapError::config("SWAP_USER_KEYPAIR_PATH is not set"));
        }
        if self.light_lut.is_none() {
            return Err(SwapError::config("LIGHT_LUT and LIGHT_LUT_DEVNET is not set"));
        }
        self.input_mint_pubkey()?;
        self.output_mint_pubkey()?;
        self.light_lut_pubkey()?;
        self.state_tree_accounts()?;

        if self.amount == 0 {
            return Err(SwapError::config("amount must be greater than 0"));
        }
        if self.slippage_bps > 10_000 {
            return Err(SwapError::config("slippage_bps must be <= 10000"));
        }
        if self.compute_unit_limit == 0 {
            return Err(SwapError::config("compute_unit_limit must be greater than 0"));
        }
        if self.aggregator_requests_per_sec == 0 {
            return Err(SwapError::config("aggregator_requests_per_sec must be greater than 0"));
        }
        self.send.validate()
    }

    pub fn input_mint_pubkey(&self) -> Result<Pubkey, SwapError> {
        parse_pubkey("INPUT_MINT", &self.input_mint)
    }

    pub fn output_mint_pubkey(&self) -> Result<Pubkey, SwapError> {
        parse_pubkey("OUTPUT_MINT", &self.output_mint)
    }

    pub fn light_lut_pubkey(&self) -> Result<Option<Pubkey>, SwapError> {
        self.light_lut
            .as_deref()
            .map(|lut| parse_pubkey("LIGHT_LUT", lut))
            .transpose()
    }

    pub fn state_tree_accounts(&self) -> Result<StateTreeAccounts, SwapError> {
        Ok(StateTreeAccounts {
            tree: parse_pubkey("STATE_TREE", &self.state_tree)?,
            queue: parse_pubkey("STATE_QUEUE", &self.state_queue)?,
        })
    }

    /// WebSocket endpoint: explicit `ws_url`, else `rpc_url` with the scheme
    /// swapped (http -> ws, https -> wss).
    pub fn websocket_url(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        if let Some(rest) = self.rpc_url.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = self.rpc_url.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            self.rpc_url.clone()
        }
    }

    /// Priority fee spread over the compute budget, in micro-lamports per CU.
    pub fn compute_unit_price_micro_lamports(&self) -> u64 {
        compute_unit_price(self.priority_fee_lamports, self.compute_unit_limit)
    }
}

/// ceil(lamports * 1e6 / compute_units)
pub fn compute_unit_price(priority_fee_lamports: u64, compute_units: u32) -> u64 {
    let units = u128::from(compute_units.max(1));
    let micro = u128::from(priority_fee_lamports) * 1_000_000;
    micro.div_ceil(units).min(u128::from(u64::MAX)) as u64
}

fn parse_pubkey(field: &str, value: &str) -> Result<Pubkey, SwapError> {
    Pubkey::from_str(value).map_err(|e| SwapError::config(format!("{} is invalid: {}", field, e)))
}
