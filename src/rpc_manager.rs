use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::StreamExt;
use serde_json::json;
use solana_client::{
    client_error::{ClientError, ClientErrorKind},
    nonblocking::{pubsub_client::PubsubClient, rpc_client::RpcClient},
    rpc_config::{RpcSendTransactionConfig, RpcSignatureSubscribeConfig, RpcTransactionConfig},
    rpc_request::{RpcError, RpcRequest},
    rpc_response::RpcSignatureResult,
};
use solana_sdk::{
    commitment_config::{CommitmentConfig, CommitmentLevel},
    signature::Signature,
};
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, TransactionConfirmationStatus, UiTransactionEncoding,
};
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::errors::ConfirmError;

/// Classification of RPC errors for handling logic
#[derive(Debug, PartialEq, Eq)]
pub enum RpcErrorType {
    AlreadyProcessed,
    DuplicateSignature,
    BlockhashNotFound,
    RateLimited,
    Other(String),
}

impl RpcErrorType {
    /// Resending a transaction the cluster already knows about is expected.
    pub fn is_benign_resend(&self) -> bool {
        matches!(self, RpcErrorType::AlreadyProcessed | RpcErrorType::DuplicateSignature)
    }
}

/// Classify a ClientError into an RpcErrorType for consistent handling
pub fn classify_rpc_error(error: &ClientError) -> RpcErrorType {
    match error.kind() {
        ClientErrorKind::RpcError(RpcError::RpcResponseError { message, .. }) => {
            classify_message(message)
        }
        ClientErrorKind::RpcError(_) => RpcErrorType::Other("Unknown RPC error".to_string()),
        _ => RpcErrorType::Other(error.to_string()),
    }
}

/// Same classification for errors that already lost their concrete type.
pub fn classify_anyhow(error: &anyhow::Error) -> RpcErrorType {
    match error.downcast_ref::<ClientError>() {
        Some(client_error) => classify_rpc_error(client_error),
        None => classify_message(&error.to_string()),
    }
}

fn classify_message(message: &str) -> RpcErrorType {
    let msg = message.to_lowercase();
    if msg.contains("already processed") {
        RpcErrorType::AlreadyProcessed
    } else if msg.contains("duplicate signature") {
        RpcErrorType::DuplicateSignature
    } else if msg.contains("blockhash not found") {
        RpcErrorType::BlockhashNotFound
    } else if msg.contains("rate limit") || msg.contains("too many requests") {
        RpcErrorType::RateLimited
    } else {
        RpcErrorType::Other(message.to_string())
    }
}

/// Network operations the send/confirm core depends on.
///
/// Implementations must be safe to call concurrently: the resend task, the
/// subscription wait and the status poller all share one instance.
#[async_trait]
pub trait TxNetwork: Send + Sync + 'static {
    /// Full transaction record returned once a signature is visible.
    type Record: Send + 'static;

    /// Broadcast signed bytes with preflight disabled.
    async fn submit(&self, serialized_tx: &[u8]) -> Result<Signature>;

    /// Wait for "confirmed" commitment, failing with
    /// [`ConfirmError::BlockHeightExceeded`] once the chain passes
    /// `last_valid_block_height`. Must return promptly once `cancel` fires.
    async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmError>;

    /// Current status without searching history; `None` if unknown.
    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionConfirmationStatus>>;

    /// Full record at "confirmed" commitment; `None` if not (yet) visible.
    async fn transaction(&self, signature: &Signature) -> Result<Option<Self::Record>>;
}

/// Production network layer over one HTTP RPC endpoint and its WebSocket twin.
pub struct RpcManager {
    pub endpoint: String,
    ws_endpoint: String,
    client: Arc<RpcClient>,
    block_height_poll: Duration,
}

impl std::fmt::Debug for RpcManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcManager")
            .field("endpoint", &self.endpoint)
            .field("ws_endpoint", &self.ws_endpoint)
            .finish()
    }
}

impl RpcManager {
    pub fn new(endpoint: String, ws_endpoint: String, block_height_poll: Duration) -> Self {
        let client = Arc::new(RpcClient::new_with_commitment(
            endpoint.clone(),
            CommitmentConfig::confirmed(),
        ));
        Self {
            endpoint,
            ws_endpoint,
            client,
            block_height_poll,
        }
    }

    pub fn new_with_config(config: &Config) -> Self {
        Self::new(
            config.rpc_url.clone(),
            config.websocket_url(),
            config.send.block_height_poll_interval(),
        )
    }

    /// Shared HTTP client for account reads and blockhash fetches.
    pub fn client(&self) -> Arc<RpcClient> {
        self.client.clone()
    }

    /// One expiry check. A failed height read is not an expiry; the next
    /// tick tries again.
    async fn check_expiry(&self, signature: &Signature, last_valid_block_height: u64) -> Option<ConfirmError> {
        let current = self.client.get_block_height().await.map_err(|e| anyhow!(e));
        expiry_from_height(signature, current, last_valid_block_height)
    }
}

/// Decide expiry from a block height read.
pub fn expiry_from_height(
    signature: &Signature,
    current: Result<u64>,
    last_valid_block_height: u64,
) -> Option<ConfirmError> {
    match current {
        Ok(current) if current > last_valid_block_height => Some(ConfirmError::BlockHeightExceeded {
            current,
            last_valid_block_height,
        }),
        Ok(_) => None,
        Err(e) => {
            warn!(%signature, error = %format!("{:#}", e), "getBlockHeight failed, treating as not expired");
            None
        }
    }
}

#[async_trait]
impl TxNetwork for RpcManager {
    type Record = EncodedConfirmedTransactionWithStatusMeta;

    async fn submit(&self, serialized_tx: &[u8]) -> Result<Signature> {
        let send_cfg = RpcSendTransactionConfig {
            skip_preflight: true,
            preflight_commitment: Some(CommitmentLevel::Confirmed),
            encoding: Some(UiTransactionEncoding::Base64),
            ..Default::default()
        };
        let encoded = BASE64.encode(serialized_tx);
        let sig: String = self
            .client
            .send(RpcRequest::SendTransaction, json!([encoded, send_cfg]))
            .await
            .map_err(|e| anyhow!(e))
            .context("sendTransaction")?;
        debug!(endpoint = %self.endpoint, signature = %sig, "Transaction submitted");
        Signature::from_str(&sig).map_err(|e| anyhow!("RPC returned invalid signature {}: {}", sig, e))
    }

    async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmError> {
        let config = RpcSignatureSubscribeConfig {
            commitment: Some(CommitmentConfig::confirmed()),
            enable_received_notification: Some(false),
        };
        // Without a subscription only the block-height ticker runs; the
        // caller's status poller still sees the confirmation.
        let pubsub = match PubsubClient::new(&self.ws_endpoint).await {
            Ok(pubsub) => Some(pubsub),
            Err(e) => {
                warn!(%signature, ws = %self.ws_endpoint, error = %e, "WebSocket connect failed, waiting on block height only");
                None
            }
        };
        let subscription = match &pubsub {
            Some(pubsub) => match pubsub.signature_subscribe(signature, Some(config)).await {
                Ok(subscription) => Some(subscription),
                Err(e) => {
                    warn!(%signature, error = %e, "signatureSubscribe failed, waiting on block height only");
                    None
                }
            },
            None => None,
        };
        let (mut notifications, unsubscribe) = match subscription {
            Some((stream, unsubscribe)) => (Some(stream), Some(unsubscribe)),
            None => (None, None),
        };

        let mut ticker = time::interval(self.block_height_poll);

        let result = loop {
            tokio::select! {
                _ = cancel.cancelled() => break Err(ConfirmError::Aborted),
                notification = async {
                    match notifications.as_mut() {
                        Some(stream) => stream.next().await,
                        None => None,
                    }
                }, if notifications.is_some() => match notification {
                    Some(response) => {
                        if let RpcSignatureResult::ProcessedSignature(result) = &response.value {
                            info!(%signature, slot = response.context.slot, ?result, "Signature notification received");
                        }
                        break Ok(());
                    }
                    None => {
                        // Keep enforcing expiry so the wait still terminates.
                        warn!(%signature, "Signature subscription closed without a notification");
                        notifications = None;
                    }
                },
                _ = ticker.tick() => {
                    if let Some(expired) = self.check_expiry(signature, last_valid_block_height).await {
                        break Err(expired);
                    }
                }
            }
        };

        drop(notifications);
        if let Some(unsubscribe) = unsubscribe {
            unsubscribe().await;
        }
        result
    }

    async fn signature_status(
        &self,
        signature: &Signature,
    ) -> Result<Option<TransactionConfirmationStatus>> {
        let statuses = self
            .client
            .get_signature_statuses(&[*signature])
            .await
            .map_err(|e| anyhow!(e))
            .context("getSignatureStatuses")?;
        Ok(statuses
            .value
            .into_iter()
            .next()
            .flatten()
            .and_then(|status| status.confirmation_status))
    }

    async fn transaction(&self, signature: &Signature) -> Result<Option<Self::Record>> {
        let config = RpcTransactionConfig {
            encoding: Some(UiTransactionEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            max_supported_transaction_version: Some(0),
        };
        self.client
            .send(
                RpcRequest::GetTransaction,
                json!([signature.to_string(), config]),
            )
            .await
            .map_err(|e| anyhow!(e))
            .context("getTransaction")
    }
}
