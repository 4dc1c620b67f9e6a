use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use stockroom::{
    InventoryError, InventoryItem, ItemId, Reconciler, RequestId, RestockClient, RestockRequest,
    Result, ShutdownSignal, StockLedger, Transaction, TransactionalStore, shutdown_channel,
};
use tokio::sync::Mutex;

#[derive(Default)]
struct RecordingClient {
    requests: Mutex<Vec<RestockRequest>>,
    unavailable: AtomicBool,
}

impl RecordingClient {
    async fn requests(&self) -> Vec<RestockRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl RestockClient for RecordingClient {
    async fn submit_restock_request(&self, request: &RestockRequest) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InventoryError::DownstreamUnavailable("connection refused".into()));
        }
        self.requests.lock().await.push(request.clone());
        Ok(())
    }
}

/// Accepts the request, then keeps the item locked as if the process stalled
/// before the flag update could commit.
struct StallingClient {
    ledger: StockLedger,
    stall: AtomicBool,
    held: Mutex<Option<Transaction>>,
    submitted: Mutex<Vec<RestockRequest>>,
}

#[async_trait]
impl RestockClient for StallingClient {
    async fn submit_restock_request(&self, request: &RestockRequest) -> Result<()> {
        self.submitted.lock().await.push(request.clone());
        if self.stall.swap(false, Ordering::SeqCst) {
            let mut tx = self.ledger.store().begin().await;
            tx.get_for_update(self.ledger.items(), request.item_id.as_str()).await?;
            *self.held.lock().await = Some(tx);
        }
        Ok(())
    }
}

/// Sells one unit while the restock request is in flight.
struct RacingClient {
    ledger: StockLedger,
}

#[async_trait]
impl RestockClient for RacingClient {
    async fn submit_restock_request(&self, request: &RestockRequest) -> Result<()> {
        self.ledger
            .remove_stock(&request.item_id, 1, &RequestId::new("concurrent-sale"))
            .await?;
        Ok(())
    }
}

fn low_item() -> InventoryItem {
    InventoryItem::new("bolt", "m6 bolt", 0.1, 2, 5, 20)
}

async fn ledger_with_low_item(store: TransactionalStore) -> StockLedger {
    let ledger = StockLedger::open(store).await.unwrap();
    ledger.create_item(low_item()).await.unwrap();
    ledger
        .create_item(InventoryItem::new("nut", "m6 nut", 0.05, 50, 5, 100))
        .await
        .unwrap();
    ledger
}

async fn on_reorder(ledger: &StockLedger) -> bool {
    ledger.get_item(&ItemId::new("bolt")).await.unwrap().unwrap().on_reorder
}

#[tokio::test]
async fn low_item_orders_once_and_flags() {
    let ledger = ledger_with_low_item(TransactionalStore::default()).await;
    let client = Arc::new(RecordingClient::default());
    let reconciler = Reconciler::new(&ledger, client.clone(), Duration::from_secs(30));
    let never = ShutdownSignal::never();

    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.scanned, 2);
    assert_eq!(report.restocks_requested, 1);
    assert_eq!(report.flagged, 1);

    let requests = client.requests().await;
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].item_id, ItemId::new("bolt"));
    assert_eq!(requests[0].quantity, 18);
    assert!(on_reorder(&ledger).await);

    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.restocks_requested, 0);
    assert_eq!(client.requests().await.len(), 1);
}

#[tokio::test]
async fn replenishment_reopens_the_reorder_cycle() {
    let ledger = ledger_with_low_item(TransactionalStore::default()).await;
    let client = Arc::new(RecordingClient::default());
    let reconciler = Reconciler::new(&ledger, client.clone(), Duration::from_secs(30));
    let never = ShutdownSignal::never();

    reconciler.reconcile_once(&never).await.unwrap();
    ledger.add_stock(&ItemId::new("bolt"), 18).await.unwrap();
    assert!(!on_reorder(&ledger).await);

    ledger
        .remove_stock(&ItemId::new("bolt"), 17, &RequestId::new("big-order"))
        .await
        .unwrap();
    reconciler.reconcile_once(&never).await.unwrap();

    let requests = client.requests().await;
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].quantity, 17);
    assert_ne!(requests[0].request_id, requests[1].request_id);
}

#[tokio::test]
async fn downstream_failure_leaves_item_unflagged() {
    let ledger = ledger_with_low_item(TransactionalStore::default()).await;
    let client = Arc::new(RecordingClient::default());
    client.unavailable.store(true, Ordering::SeqCst);
    let reconciler = Reconciler::new(&ledger, client.clone(), Duration::from_secs(30));
    let never = ShutdownSignal::never();

    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.flagged, 0);
    assert!(!on_reorder(&ledger).await);

    client.unavailable.store(false, Ordering::SeqCst);
    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.flagged, 1);
    assert_eq!(client.requests().await.len(), 1);
}

#[tokio::test]
async fn item_changed_during_request_is_not_flagged() {
    let ledger = ledger_with_low_item(TransactionalStore::default()).await;
    let reconciler = Reconciler::new(
        &ledger,
        Arc::new(RacingClient { ledger: ledger.clone() }),
        Duration::from_secs(30),
    );

    let report = reconciler.reconcile_once(&ShutdownSignal::never()).await.unwrap();
    assert_eq!(report.restocks_requested, 1);
    assert_eq!(report.stale, 1);
    assert_eq!(report.flagged, 0);
    assert!(!on_reorder(&ledger).await);
}

#[tokio::test]
async fn unflagged_request_is_ordered_again_on_next_pass() {
    let store = TransactionalStore::new(Duration::from_millis(50));
    let ledger = ledger_with_low_item(store).await;
    let client = Arc::new(StallingClient {
        ledger: ledger.clone(),
        stall: AtomicBool::new(true),
        held: Mutex::new(None),
        submitted: Mutex::new(Vec::new()),
    });
    let reconciler = Reconciler::new(&ledger, client.clone(), Duration::from_secs(30));
    let never = ShutdownSignal::never();

    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.restocks_requested, 1);
    assert_eq!(report.failed, 1);
    assert!(!on_reorder(&ledger).await);

    // The stalled writer goes away without committing.
    client.held.lock().await.take();

    let report = reconciler.reconcile_once(&never).await.unwrap();
    assert_eq!(report.flagged, 1);

    let submitted = client.submitted.lock().await;
    assert_eq!(submitted.len(), 2);
    assert_eq!(submitted[0].item_id, submitted[1].item_id);
    assert_eq!(submitted[0].quantity, submitted[1].quantity);
}

#[tokio::test]
async fn loop_runs_until_shutdown() {
    let ledger = ledger_with_low_item(TransactionalStore::default()).await;
    let client = Arc::new(RecordingClient::default());
    let reconciler = Arc::new(Reconciler::new(&ledger, client.clone(), Duration::from_millis(20)));
    let (trigger, signal) = shutdown_channel();

    let task = {
        let reconciler = reconciler.clone();
        tokio::spawn(async move { reconciler.run(signal).await })
    };

    tokio::time::timeout(Duration::from_secs(5), async {
        while !on_reorder(&ledger).await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    trigger.trigger();
    tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert_eq!(client.requests().await.len(), 1);
}
