//! Scripted walk-through of the offline write path against an in-memory
//! backend: a sale while online, a run of sales while offline, then the
//! reconnect and the drain that follows.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use till_sync::{
    CheckoutError, Config, ConnectivityMonitor, Delivery, MemoryRemote, RemoteStore, SaleDetails,
    SaleLine, SaleReceipt, SyncEvent, Till,
};

const PRODUCTS: [(&str, u32, i64); 2] = [("coffee", 10, 350), ("bagel", 6, 275)];

fn banner(title: &str) {
    println!("╔════════════════════════════════════════════════════════════════╗");
    println!("║ {title:<62} ║");
    println!("╚════════════════════════════════════════════════════════════════╝\n");
}

fn line(product: &str, quantity: u32) -> SaleLine {
    let unit_price = PRODUCTS
        .iter()
        .find(|(id, _, _)| *id == product)
        .map_or(0, |(_, _, price)| *price);
    SaleLine {
        product_id: product.to_string(),
        quantity,
        unit_price,
    }
}

fn print_stock(till: &Till, remote: &MemoryRemote) {
    println!("┌────────────┬──────────┬──────────┐");
    println!("│ product    │ local    │ backend  │");
    println!("├────────────┼──────────┼──────────┤");
    for (product, _, _) in PRODUCTS {
        println!(
            "│ {:<10} │ {:>8} │ {:>8} │",
            product,
            till.available_stock(product),
            remote.stock(product)
        );
    }
    println!("└────────────┴──────────┴──────────┘\n");
}

pub async fn run(mut config: Config, offline_sales: u32) -> Result<(), Box<dyn Error>> {
    config.data_dir = config.data_dir.join("simulate");
    if config.data_dir.exists() {
        std::fs::remove_dir_all(&config.data_dir)?;
    }

    let remote = Arc::new(
        MemoryRemote::new(PRODUCTS.iter().map(|(id, stock, _)| (id.to_string(), *stock)))
            .with_latency(Duration::from_millis(150)),
    );
    let monitor = ConnectivityMonitor::new(true);
    let till = Till::open(
        config,
        Arc::clone(&remote) as Arc<dyn RemoteStore>,
        Arc::clone(&monitor),
    )?;
    till.refresh_stock(remote.stock_figures());

    let _badge = till.on_connectivity(|online| {
        println!("[till] {}", if online { "📶 back online" } else { "📵 offline, sales will be queued" });
    });
    let mut events = till.subscribe_sync();
    let printer = tokio::spawn({
        let mut events = till.subscribe_sync();
        async move {
            while let Ok(event) = events.recv().await {
                match event {
                    SyncEvent::Completed { operation, domain, .. } => {
                        println!("[sync] ✓ {} {} ({domain:?})", operation.id, operation.kind)
                    }
                    SyncEvent::Failed { operation, reason } => {
                        println!("[sync] ✗ {} {}: {reason:?}", operation.id, operation.kind)
                    }
                    SyncEvent::PassFinished { applied, dropped, remaining, .. } => println!(
                        "[sync] pass finished: {applied} applied, {dropped} dropped, {remaining} left"
                    ),
                }
            }
        }
    });
    till.start();

    banner("PHASE 1: Online checkout");
    let receipt = till
        .record_sale(vec![line("coffee", 1)], SaleDetails::new("card", "sam"))
        .await?;
    println!("Sold 1 coffee for {} cents: {:?}\n", receipt.total, receipt.delivery);
    print_stock(&till, &remote);

    banner("PHASE 2: Connection lost");
    remote.set_reachable(false);
    monitor.set_online(false);

    for n in 0..offline_sales {
        let product = if n % 2 == 0 { "coffee" } else { "bagel" };
        match till
            .record_sale(vec![line(product, 2)], SaleDetails::new("cash", "sam"))
            .await
        {
            Ok(SaleReceipt { delivery: Delivery::Queued(id), .. }) => {
                println!("Sold 2 {product}: queued as {id}")
            }
            Ok(receipt) => println!("Sold 2 {product}: {:?}", receipt.delivery),
            Err(CheckoutError::Insufficient(failure)) => {
                for short in failure.shortfalls {
                    println!("Cannot sell 2 {product}: short by {}", short.missing());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    match till
        .record_sale(vec![line("bagel", 50)], SaleDetails::new("cash", "sam"))
        .await
    {
        Err(CheckoutError::Insufficient(failure)) => {
            println!("Blocked oversell of 50 bagels ({failure})")
        }
        other => println!("Unexpected result for 50 bagels: {other:?}"),
    }
    println!("\n{} operation(s) waiting for the backend\n", till.pending_count());
    print_stock(&till, &remote);

    banner("PHASE 3: Reconnect and drain");
    remote.set_reachable(true);
    monitor.set_online(true);

    let drained = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::PassFinished { remaining: 0, .. }) => break true,
                Ok(_) => {}
                Err(_) => break false,
            }
        }
    })
    .await
    .unwrap_or(false);

    println!();
    if drained {
        println!("Queue drained.");
    } else {
        println!("Queue not drained yet: {} left.", till.pending_count());
    }
    print_stock(&till, &remote);

    let status = till.status();
    println!(
        "online={} pending={} last_synced_at={}",
        status.online,
        status.pending,
        status.last_synced_at.map_or_else(|| "-".to_string(), |at| at.to_rfc3339())
    );

    till.shutdown();
    printer.abort();
    Ok(())
}
