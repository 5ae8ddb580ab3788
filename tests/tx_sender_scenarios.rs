use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use solana_sdk::{hash::Hash, signature::Signature};
use solana_transaction_status::TransactionConfirmationStatus;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use compressed_swap::config::SendConfig;
use compressed_swap::errors::{ConfirmError, SendError};
use compressed_swap::rpc_manager::{RpcManager, TxNetwork};
use compressed_swap::structured_logging::DebugLog;
use compressed_swap::tx_sender::{SendOutcome, TransactionSender};

#[derive(Clone, Copy, Debug)]
enum Subscription {
    /// Never notifies; only cancellation ends it.
    Silent,
    ConfirmAfter(Duration),
    ExpireAfter(Duration),
    FailAfter(Duration),
}

/// Scripted network that counts every call it sees.
struct StubNetwork {
    signature: Signature,
    fail_initial_submit: bool,
    fail_resends: bool,
    subscription: Subscription,
    /// 1-based poll on which the status turns "confirmed"
    confirmed_on_poll: Option<usize>,
    /// 1-based fetch from which the record is visible
    visible_from_fetch: Option<usize>,
    submits: AtomicUsize,
    polls: AtomicUsize,
    fetches: AtomicUsize,
    submitted_bytes: Mutex<Vec<Vec<u8>>>,
}

impl StubNetwork {
    fn new(subscription: Subscription) -> Self {
        Self {
            signature: Signature::from([7u8; 64]),
            fail_initial_submit: false,
            fail_resends: false,
            subscription,
            confirmed_on_poll: None,
            visible_from_fetch: Some(1),
            submits: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            submitted_bytes: Mutex::new(Vec::new()),
        }
    }

    fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TxNetwork for StubNetwork {
    type Record = Signature;

    async fn submit(&self, serialized_tx: &[u8]) -> anyhow::Result<Signature> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst) + 1;
        self.submitted_bytes.lock().unwrap().push(serialized_tx.to_vec());
        if n == 1 && self.fail_initial_submit {
            return Err(anyhow!("node is unhealthy"));
        }
        if n > 1 && self.fail_resends {
            return Err(anyhow!("Transaction was already processed"));
        }
        Ok(self.signature)
    }

    async fn confirm(
        &self,
        _signature: &Signature,
        last_valid_block_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmError> {
        let (after, outcome) = match self.subscription {
            Subscription::Silent => {
                cancel.cancelled().await;
                return Err(ConfirmError::Aborted);
            }
            Subscription::ConfirmAfter(d) => (d, Ok(())),
            Subscription::ExpireAfter(d) => (
                d,
                Err(ConfirmError::BlockHeightExceeded {
                    current: last_valid_block_height + 1,
                    last_valid_block_height,
                }),
            ),
            Subscription::FailAfter(d) => (d, Err(ConfirmError::Network(anyhow!("websocket dropped")))),
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(ConfirmError::Aborted),
            _ = sleep(after) => outcome,
        }
    }

    async fn signature_status(
        &self,
        _signature: &Signature,
    ) -> anyhow::Result<Option<TransactionConfirmationStatus>> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match self.confirmed_on_poll {
            Some(target) if n >= target => Some(TransactionConfirmationStatus::Confirmed),
            _ => Some(TransactionConfirmationStatus::Processed),
        })
    }

    async fn transaction(&self, signature: &Signature) -> anyhow::Result<Option<Signature>> {
        let n = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(match self.visible_from_fetch {
            Some(from) if n >= from => Some(*signature),
            _ => None,
        })
    }
}

fn sender(network: &Arc<StubNetwork>) -> TransactionSender<StubNetwork> {
    TransactionSender::new(network.clone(), SendConfig::default(), DebugLog::disabled())
}

const TX_BYTES: [u8; 4] = [1, 2, 3, 4];
const LAST_VALID: u64 = 1_000;

#[tokio::test(start_paused = true)]
async fn scenario_a_status_poll_confirms_at_two_seconds() {
    let mut stub = StubNetwork::new(Subscription::Silent);
    stub.confirmed_on_poll = Some(1);
    let network = Arc::new(stub);
    let start = Instant::now();

    let record = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.signature));
    assert_eq!(start.elapsed(), Duration::from_secs(2));
    assert_eq!(network.submits(), 1);

    // Resend task must be gone: nothing more is submitted.
    sleep(Duration::from_secs(10)).await;
    assert_eq!(network.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_b_expiry_returns_none_at_five_seconds() {
    let network = Arc::new(StubNetwork::new(Subscription::ExpireAfter(Duration::from_secs(5))));
    let start = Instant::now();

    let outcome = sender(&network)
        .submit_and_confirm_detailed(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert!(matches!(outcome, SendOutcome::Expired));
    assert_eq!(start.elapsed(), Duration::from_secs(5));
    // Initial send plus one resend at 3.5 s.
    assert_eq!(network.submits(), 2);
    assert_eq!(network.polls.load(Ordering::SeqCst), 2);
    assert_eq!(network.fetches.load(Ordering::SeqCst), 0);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(network.submits(), 2);
}

#[tokio::test(start_paused = true)]
async fn expiry_maps_to_none_not_error() {
    let network = Arc::new(StubNetwork::new(Subscription::ExpireAfter(Duration::from_secs(5))));

    let record = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert!(record.is_none());
}

#[tokio::test(start_paused = true)]
async fn scenario_c_failed_submission_rejects_without_resend() {
    let mut stub = StubNetwork::new(Subscription::Silent);
    stub.fail_initial_submit = true;
    let network = Arc::new(stub);
    let start = Instant::now();

    let err = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap_err();

    assert!(matches!(err, SendError::Submission(_)));
    assert_eq!(start.elapsed(), Duration::ZERO);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(network.submits(), 1);
    assert_eq!(network.polls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_record_visible_on_fourth_fetch() {
    let mut stub = StubNetwork::new(Subscription::Silent);
    stub.confirmed_on_poll = Some(1);
    stub.visible_from_fetch = Some(4);
    let network = Arc::new(stub);
    let start = Instant::now();

    let record = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.signature));
    assert_eq!(network.fetches.load(Ordering::SeqCst), 4);
    // Poll at 2 s, then fetch delays of 1 + 2 + 4 s.
    assert_eq!(start.elapsed(), Duration::from_secs(9));
    // Resending stopped when the race resolved, before the fetch retries.
    assert_eq!(network.submits(), 1);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_record_never_visible_returns_none() {
    let mut stub = StubNetwork::new(Subscription::Silent);
    stub.confirmed_on_poll = Some(1);
    stub.visible_from_fetch = None;
    let network = Arc::new(stub);

    let outcome = sender(&network)
        .submit_and_confirm_detailed(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert!(matches!(outcome, SendOutcome::NotVisible));
    assert_eq!(network.fetches.load(Ordering::SeqCst), 5);
}

#[tokio::test(start_paused = true)]
async fn subscription_confirmation_after_resends_keeps_signature() {
    let network = Arc::new(StubNetwork::new(Subscription::ConfirmAfter(Duration::from_secs(8))));

    let record = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.signature));
    // Sends at 0, 3.5 and 7 s.
    assert_eq!(network.submits(), 3);
    let bytes = network.submitted_bytes.lock().unwrap();
    assert!(bytes.iter().all(|b| b.as_slice() == TX_BYTES));
}

#[tokio::test(start_paused = true)]
async fn failing_resends_do_not_change_the_outcome() {
    let mut stub = StubNetwork::new(Subscription::ConfirmAfter(Duration::from_secs(8)));
    stub.fail_resends = true;
    let network = Arc::new(stub);

    let record = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.signature));
    assert_eq!(network.submits(), 3);
}

#[tokio::test(start_paused = true)]
async fn unexpected_wait_error_is_surfaced_and_resend_stops() {
    let network = Arc::new(StubNetwork::new(Subscription::FailAfter(Duration::from_secs(4))));

    let err = sender(&network)
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap_err();

    match err {
        SendError::Wait { signature, source } => {
            assert_eq!(signature, network.signature);
            assert!(matches!(source, ConfirmError::Network(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(network.submits(), 2);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(network.submits(), 2);
}

#[tokio::test(start_paused = true)]
async fn finalized_status_also_counts_as_confirmed() {
    struct Finalized(StubNetwork);

    #[async_trait]
    impl TxNetwork for Finalized {
        type Record = Signature;

        async fn submit(&self, tx: &[u8]) -> anyhow::Result<Signature> {
            self.0.submit(tx).await
        }

        async fn confirm(
            &self,
            signature: &Signature,
            last_valid_block_height: u64,
            cancel: &CancellationToken,
        ) -> Result<(), ConfirmError> {
            self.0.confirm(signature, last_valid_block_height, cancel).await
        }

        async fn signature_status(
            &self,
            _signature: &Signature,
        ) -> anyhow::Result<Option<TransactionConfirmationStatus>> {
            Ok(Some(TransactionConfirmationStatus::Finalized))
        }

        async fn transaction(&self, signature: &Signature) -> anyhow::Result<Option<Signature>> {
            self.0.transaction(signature).await
        }
    }

    let network = Arc::new(Finalized(StubNetwork::new(Subscription::Silent)));
    let sender = TransactionSender::new(network.clone(), SendConfig::default(), DebugLog::disabled());
    let start = Instant::now();

    let record = sender
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.0.signature));
    assert_eq!(start.elapsed(), Duration::from_secs(2));
}

/// Real confirm path against endpoints that refuse every connection; only
/// the status poll can resolve the race.
struct UnreachableSocket {
    rpc: RpcManager,
    signature: Signature,
}

#[async_trait]
impl TxNetwork for UnreachableSocket {
    type Record = Signature;

    async fn submit(&self, _tx: &[u8]) -> anyhow::Result<Signature> {
        Ok(self.signature)
    }

    async fn confirm(
        &self,
        signature: &Signature,
        last_valid_block_height: u64,
        cancel: &CancellationToken,
    ) -> Result<(), ConfirmError> {
        self.rpc.confirm(signature, last_valid_block_height, cancel).await
    }

    async fn signature_status(
        &self,
        _signature: &Signature,
    ) -> anyhow::Result<Option<TransactionConfirmationStatus>> {
        Ok(Some(TransactionConfirmationStatus::Confirmed))
    }

    async fn transaction(&self, signature: &Signature) -> anyhow::Result<Option<Signature>> {
        Ok(Some(*signature))
    }
}

#[tokio::test]
async fn unreachable_websocket_falls_back_to_status_poll() {
    let network = Arc::new(UnreachableSocket {
        rpc: RpcManager::new(
            "http://127.0.0.1:1".to_string(),
            "ws://127.0.0.1:1".to_string(),
            Duration::from_millis(50),
        ),
        signature: Signature::from([9u8; 64]),
    });
    let config = SendConfig {
        status_poll_interval_ms: 300,
        ..SendConfig::default()
    };
    let sender = TransactionSender::new(network.clone(), config, DebugLog::disabled());
    assert_eq!(sender.network().signature, network.signature);
    let start = Instant::now();

    let record = sender
        .submit_and_confirm(TX_BYTES.to_vec(), Hash::default(), LAST_VALID)
        .await
        .unwrap();

    assert_eq!(record, Some(network.signature));
    assert!(start.elapsed() >= Duration::from_millis(300));
}
