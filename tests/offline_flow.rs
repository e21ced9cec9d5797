use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use till_sync::{
    Config, ConnectivityMonitor, Delivery, FailureReason, MemoryRemote, OperationKind,
    RemoteError, RemoteStore, SaleDetails, SaleLine, SyncEvent, Till, Trigger,
};
use tokio::sync::broadcast;

fn open(dir: &Path, online: bool, remote: &Arc<MemoryRemote>) -> Till {
    let config = Config {
        data_dir: dir.to_path_buf(),
        sync_interval_ms: 3_600_000,
        ..Config::default()
    };
    let till = Till::open(
        config,
        Arc::clone(remote) as Arc<dyn RemoteStore>,
        ConnectivityMonitor::new(online),
    )
    .expect("open till");
    till.refresh_stock(remote.stock_figures());
    till
}

fn sale(product: &str, quantity: u32) -> Vec<SaleLine> {
    vec![SaleLine {
        product_id: product.to_string(),
        quantity,
        unit_price: 1_000,
    }]
}

fn cashier() -> SaleDetails {
    SaleDetails::new("cash", "till-1")
}

async fn drained(events: &mut broadcast::Receiver<SyncEvent>) {
    loop {
        if let SyncEvent::PassFinished { remaining: 0, .. } = events.recv().await.expect("event") {
            return;
        }
    }
}

#[tokio::test]
async fn offline_checkout_is_queued_not_sent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("X".to_string(), 2)]));
    let till = open(dir.path(), true, &remote);
    till.monitor().set_online(false);
    assert_eq!(till.available_stock("X"), 2);

    let receipt = till.record_sale(sale("X", 2), cashier()).await.expect("sale");

    assert!(matches!(receipt.delivery, Delivery::Queued(_)));
    assert_eq!(till.available_stock("X"), 0);
    assert_eq!(till.pending_count(), 1);
    assert_eq!(till.pending()[0].kind, OperationKind::CreateSale);
    assert!(remote.applied().is_empty());
    assert_eq!(remote.stock("X"), 2);
}

#[tokio::test(start_paused = true)]
async fn reconnect_drains_three_pending_without_waiting_for_the_timer() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("coffee".to_string(), 9)]));
    let till = open(dir.path(), false, &remote);
    for _ in 0..3 {
        till.record_sale(sale("coffee", 1), cashier()).await.expect("sale");
    }
    let mut events = till.subscribe_sync();
    till.start();

    till.monitor().set_online(true);
    tokio::time::timeout(Duration::from_millis(10), drained(&mut events))
        .await
        .expect("drain started on reconnect");

    assert_eq!(till.pending_count(), 0);
    assert_eq!(remote.stock("coffee"), 6);
    assert_eq!(till.available_stock("coffee"), 6);
    till.shutdown();
}

#[tokio::test(start_paused = true)]
async fn transient_head_failure_blocks_the_rest_until_next_tick() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("beer".to_string(), 10)]));
    let till = open(dir.path(), false, &remote);
    till.record_sale(sale("beer", 2), cashier()).await.expect("sale A");
    till.adjust_stock("beer", -1, "breakage").await.expect("adjust B");

    till.monitor().set_online(true);
    remote.fail_next(RemoteError::Timeout);
    till.driver().drain(Trigger::Tick).await.expect("pass ran");

    let pending = till.pending();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].attempts, 1);
    assert_eq!(pending[1].attempts, 0);
    assert!(remote.applied().is_empty());

    tokio::time::advance(Duration::from_secs(1)).await;
    let summary = till.driver().drain(Trigger::Tick).await.expect("pass ran");

    assert_eq!(summary.applied, 2);
    assert_eq!(
        remote.applied(),
        vec![OperationKind::CreateSale, OperationKind::AdjustStock]
    );
    assert_eq!(remote.stock("beer"), 7);
}

#[tokio::test]
async fn queued_sales_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("bagel".to_string(), 4)]));
    {
        let till = open(dir.path(), false, &remote);
        till.record_sale(sale("bagel", 3), cashier()).await.expect("sale");
    }

    let till = open(dir.path(), false, &remote);
    assert_eq!(till.pending_count(), 1);
    assert_eq!(till.available_stock("bagel"), 1);

    till.monitor().set_online(true);
    let summary = till.sync_now().await.expect("pass ran");
    assert_eq!(summary.applied, 1);
    assert_eq!(remote.stock("bagel"), 1);
    assert_eq!(till.available_stock("bagel"), 1);
}

#[tokio::test]
async fn rejected_queued_sale_is_reported_and_stock_returned() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("wine".to_string(), 1)]));
    let till = open(dir.path(), false, &remote);
    till.refresh_stock([("wine".to_string(), 5)]);

    till.record_sale(sale("wine", 3), cashier()).await.expect("sale");
    assert_eq!(till.available_stock("wine"), 2);

    let mut events = till.subscribe_sync();
    till.monitor().set_online(true);
    till.sync_now().await.expect("pass ran");

    match events.recv().await.expect("event") {
        SyncEvent::Failed { operation, reason: FailureReason::Rejected(_) } => {
            assert_eq!(operation.kind, OperationKind::CreateSale);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(till.pending_count(), 0);
    assert_eq!(till.available_stock("wine"), 5);
}

#[tokio::test]
async fn queue_badge_follows_pending_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let remote = Arc::new(MemoryRemote::new([("tea".to_string(), 5)]));
    let till = open(dir.path(), false, &remote);
    let mut badge = till.subscribe_queue();

    till.record_sale(sale("tea", 1), cashier()).await.expect("sale");
    till.record_sale(sale("tea", 1), cashier()).await.expect("sale");
    till.monitor().set_online(true);
    till.sync_now().await.expect("pass ran");

    let counts: Vec<usize> = std::iter::from_fn(|| badge.try_recv().ok())
        .map(|change| change.pending)
        .collect();
    assert_eq!(counts, vec![1, 2, 1, 0]);
}
