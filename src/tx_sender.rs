//! Send/confirm core.
//!
//! Submits a signed transaction once, keeps re-broadcasting the identical
//! bytes in the background, and races a signature subscription against a
//! status poller. The background resend task is owned by a guard, so it is
//! cancelled on every way out of the wait, including early returns and
//! panics.
//!
//! Outcome contract of [`TransactionSender::submit_and_confirm`]:
//! - `Ok(Some(record))`: confirmed and the record is readable,
//! - `Ok(None)`: blockhash expired first, or the record never became visible,
//! - `Err(_)`: submission failed, or a detector hit an unexpected error.

use std::sync::Arc;

use solana_sdk::{hash::Hash, signature::Signature};
use solana_transaction_status::{
    EncodedConfirmedTransactionWithStatusMeta, TransactionConfirmationStatus,
};
use tokio::{task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SendConfig;
use crate::errors::{ConfirmError, SendError};
use crate::rpc_manager::{classify_anyhow, TxNetwork};
use crate::structured_logging::DebugLog;

/// A transaction on its way to the cluster.
#[derive(Debug, Clone)]
pub struct PendingSubmission {
    pub serialized: Arc<[u8]>,
    pub blockhash: Hash,
    pub last_valid_block_height: u64,
    pub signature: Option<Signature>,
}

impl PendingSubmission {
    pub fn new(serialized: Vec<u8>, blockhash: Hash, last_valid_block_height: u64) -> Self {
        Self {
            serialized: serialized.into(),
            blockhash,
            last_valid_block_height,
            signature: None,
        }
    }

    /// Height the subscription wait is bounded by.
    pub fn wait_deadline(&self, margin: u64) -> u64 {
        self.last_valid_block_height.saturating_sub(margin)
    }
}

/// Terminal result of one submission.
#[derive(Debug)]
pub enum SendOutcome<R> {
    Confirmed(R),
    /// The blockhash validity window closed before confirmation.
    Expired,
    /// Confirmed, but the record was still missing after every fetch retry.
    NotVisible,
}

impl<R> SendOutcome<R> {
    pub fn into_record(self) -> Option<R> {
        match self {
            SendOutcome::Confirmed(record) => Some(record),
            SendOutcome::Expired | SendOutcome::NotVisible => None,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, SendOutcome::Confirmed(_))
    }
}

/// Which detector won the confirmation race.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmedVia {
    Subscription,
    StatusPoll,
}

/// Background re-broadcast of the same bytes. Dropping the guard cancels the
/// loop and aborts the task.
pub struct ResendTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    log: DebugLog,
}

impl ResendTask {
    fn spawn<N: TxNetwork>(
        network: Arc<N>,
        serialized: Arc<[u8]>,
        config: &SendConfig,
        cancel: CancellationToken,
        log: DebugLog,
    ) -> Self {
        let interval = config.resend_interval();
        let task_cancel = cancel.clone();
        let task_log = log.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => return,
                    _ = sleep(interval) => {}
                }
                if task_cancel.is_cancelled() {
                    return;
                }
                task_log.log("Resending transaction...");
                if let Err(e) = network.submit(&serialized).await {
                    let kind = classify_anyhow(&e);
                    if kind.is_benign_resend() {
                        debug!(?kind, "Resend rejected as already known");
                    } else {
                        warn!(error = %e, "Resend failed");
                    }
                    task_log.log(format!("Failed to resend transaction: {}", e));
                }
            }
        });
        Self { cancel, handle, log }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ResendTask {
    fn drop(&mut self) {
        self.log.log("Aborting transaction monitoring");
        self.cancel.cancel();
        self.handle.abort();
    }
}

pub struct TransactionSender<N: TxNetwork> {
    network: Arc<N>,
    config: SendConfig,
    log: DebugLog,
}

impl<N: TxNetwork> TransactionSender<N> {
    pub fn new(network: Arc<N>, config: SendConfig, log: DebugLog) -> Self {
        Self { network, config, log }
    }

    pub fn network(&self) -> &Arc<N> {
        &self.network
    }

    /// Submit, resend and wait; `None` means "not confirmed in time" or
    /// "confirmed but never readable". Use
    /// [`submit_and_confirm_detailed`](Self::submit_and_confirm_detailed) to
    /// tell those apart.
    pub async fn submit_and_confirm(
        &self,
        serialized: Vec<u8>,
        blockhash: Hash,
        last_valid_block_height: u64,
    ) -> Result<Option<N::Record>, SendError> {
        let outcome = self
            .submit_and_confirm_detailed(serialized, blockhash, last_valid_block_height)
            .await?;
        Ok(outcome.into_record())
    }

    pub async fn submit_and_confirm_detailed(
        &self,
        serialized: Vec<u8>,
        blockhash: Hash,
        last_valid_block_height: u64,
    ) -> Result<SendOutcome<N::Record>, SendError> {
        let mut pending = PendingSubmission::new(serialized, blockhash, last_valid_block_height);

        self.log.log("Sending transaction...");
        let signature = self
            .network
            .submit(&pending.serialized)
            .await
            .map_err(SendError::Submission)?;
        pending.signature = Some(signature);
        self.log.log(format!("Transaction sent with id: {}", signature));
        info!(%signature, blockhash = %pending.blockhash, "Transaction submitted");

        let race = {
            let cancel = CancellationToken::new();
            let _resender = ResendTask::spawn(
                self.network.clone(),
                pending.serialized.clone(),
                &self.config,
                cancel.clone(),
                self.log.clone(),
            );
            let deadline = pending.wait_deadline(self.config.block_height_margin);
            self.log.log(format!(
                "Waiting for confirmation with lastValidBlockHeight: {}",
                deadline
            ));
            let result = self.race_confirmation(&signature, deadline, &cancel).await;
            cancel.cancel();
            result
        };

        match race {
            Ok(via) => {
                debug!(%signature, ?via, "Confirmation race resolved");
            }
            Err(ConfirmError::BlockHeightExceeded { current, last_valid_block_height }) => {
                self.log.log("Transaction expired, returning null");
                info!(%signature, current, last_valid_block_height, "Transaction expired before confirmation");
                return Ok(SendOutcome::Expired);
            }
            Err(e) => {
                self.log.log(format!("Unexpected error: {}", e));
                warn!(%signature, error = %e, "Confirmation wait failed");
                return Err(SendError::Wait { signature, source: e });
            }
        }

        self.log.log("Getting final transaction details with retries...");
        let record = self.fetch_with_retries(&signature).await?;
        self.log.log("Transaction processing complete");
        Ok(match record {
            Some(record) => SendOutcome::Confirmed(record),
            None => {
                warn!(%signature, "Confirmed transaction never became visible");
                SendOutcome::NotVisible
            }
        })
    }

    /// First detector to finish wins; the loser is dropped with the select.
    async fn race_confirmation(
        &self,
        signature: &Signature,
        deadline: u64,
        cancel: &CancellationToken,
    ) -> Result<ConfirmedVia, ConfirmError> {
        tokio::select! {
            res = self.network.confirm(signature, deadline, cancel) => {
                res.map(|_| ConfirmedVia::Subscription)
            }
            res = self.poll_status(signature, cancel) => {
                res.map(|_| ConfirmedVia::StatusPoll)
            }
        }
    }

    /// Covers a subscription that silently dies. No timeout of its own.
    async fn poll_status(
        &self,
        signature: &Signature,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmError> {
        let interval = self.config.status_poll_interval();
        while !cancel.is_cancelled() {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(interval) => {}
            }
            self.log.log("Checking transaction status...");
            let status = self
                .network
                .signature_status(signature)
                .await
                .map_err(ConfirmError::Network)?;
            if matches!(
                status,
                Some(TransactionConfirmationStatus::Confirmed)
                    | Some(TransactionConfirmationStatus::Finalized)
            ) {
                self.log.log("Transaction confirmed via status check");
                return Ok(());
            }
        }
        Err(ConfirmError::Aborted)
    }

    /// One attempt plus `fetch_retries` retries, delays doubling from the
    /// configured minimum.
    async fn fetch_with_retries(&self, signature: &Signature) -> Result<Option<N::Record>, SendError> {
        let retries = self.config.fetch_retries;
        let mut attempt = 0;
        loop {
            let record = self
                .network
                .transaction(signature)
                .await
                .map_err(|source| SendError::Fetch {
                    signature: *signature,
                    source,
                })?;
            if record.is_some() {
                return Ok(record);
            }
            if attempt >= retries {
                return Ok(None);
            }
            self.log.log("Transaction not found, retrying...");
            sleep(self.config.fetch_delay(attempt)).await;
            attempt += 1;
        }
    }
}

/// Explorer link for a confirmed transaction.
pub fn explorer_url(signature: &str) -> String {
    format!("https://solscan.io/tx/{}", signature)
}

/// Send, wait, and report the outcome the way the CLI shows it.
pub async fn handle_send<N>(
    sender: &TransactionSender<N>,
    serialized: Vec<u8>,
    blockhash: Hash,
    last_valid_block_height: u64,
) -> Result<Option<EncodedConfirmedTransactionWithStatusMeta>, SendError>
where
    N: TxNetwork<Record = EncodedConfirmedTransactionWithStatusMeta>,
{
    let response = sender
        .submit_and_confirm(serialized, blockhash, last_valid_block_height)
        .await?;

    let Some(record) = response else {
        warn!("Transaction not confirmed");
        return Ok(None);
    };

    if let Some(err) = record.transaction.meta.as_ref().and_then(|meta| meta.err.as_ref()) {
        warn!(slot = record.slot, error = ?err, "Transaction landed with an error");
    }

    match record.transaction.transaction.decode() {
        Some(tx) => match tx.signatures.first() {
            Some(sig) => info!(url = %explorer_url(&sig.to_string()), "Transaction confirmed"),
            None => info!(slot = record.slot, "Transaction confirmed without signatures"),
        },
        None => info!(slot = record.slot, "Transaction confirmed (undecodable payload)"),
    }

    Ok(Some(record))
}
