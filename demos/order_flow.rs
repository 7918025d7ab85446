//! Order processing on the task engine.
//!
//! Run with: cargo run --example order_flow
//!
//! Three orders go in. The first hits a flaky payment gateway twice and
//! then succeeds. The second asks for goods the warehouse does not have and
//! walks the short rejection chain: nothing was paid, so only the
//! reservation is cleaned up. The third pays but no carrier will ship it,
//! and the bank refuses to cancel the charge, so it walks the long chain:
//! failure details recorded, manager notified, reservation cancelled.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use conveyor::{Binder, Engine, EngineConfig, HandlerError, HandlerOptions, RetryPolicy, Task};

const NEW_ORDER_CREATED: &str = "New order created";
const ORDER_PROCESSING_STARTED: &str = "Order processing started";
const GOODS_RESERVED: &str = "Goods reserved";
const NO_GOODS: &str = "No Goods";
const REJECTED_NO_GOODS: &str = "Rejected No Goods";
const PAYMENT_FAILED: &str = "Payment failed";
const ORDER_PAID: &str = "Order paid";
const REJECTED_NO_PAYMENT: &str = "Rejected No Payment";
const ORDER_NOT_SHIPPED: &str = "Order Not shipped";
const ORDER_SHIPPED: &str = "Order shipped";
const REJECTED_NO_SHIPPING: &str = "Rejected No Shipping";
const PAYMENT_CANCELLED: &str = "Payment cancelled";
const PAYMENT_CANCELLATION_FAILED: &str = "Payment cancellation failed";
const FAILURE_DETAILS_UPDATED: &str = "Failure details updated";
const MANAGER_NOTIFIED: &str = "Manager notified";
const RESERVATION_CANCELLED: &str = "Reservation cancelled";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Order {
    id: String,
    task_id: i64,
    status: String,
    customer: String,
    items: String,
    reject_reason: Option<String>,
    reservation_token: Option<String>,
    payment_attempt_ref: Option<String>,
    payment_transaction_id: Option<String>,
    delivery_tracking_id: Option<String>,
    failure_details: Option<serde_json::Value>,
}

/// Orders live in the same database as the tasks, so the attachment and the
/// task commit together.
#[derive(Clone)]
struct OrderDao;

impl OrderDao {
    async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id        TEXT PRIMARY KEY,
                task_id   INTEGER NOT NULL UNIQUE,
                status    TEXT NOT NULL,
                json_data TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;
        Ok(())
    }

    async fn insert_order(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO orders (id, task_id, status, json_data) VALUES (?, ?, ?, ?)")
            .bind(&order.id)
            .bind(order.task_id)
            .bind(&order.status)
            .bind(encode(order)?)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn update_order(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE orders SET status = ?, json_data = ? WHERE id = ?")
            .bind(&order.status)
            .bind(encode(order)?)
            .bind(&order.id)
            .execute(conn)
            .await?;
        Ok(())
    }

    async fn find_by_task(
        &self,
        conn: &mut SqliteConnection,
        task_id: i64,
    ) -> Result<Option<Order>, sqlx::Error> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT json_data FROM orders WHERE task_id = ?")
                .bind(task_id)
                .fetch_optional(conn)
                .await?;
        json.map(|json| serde_json::from_str(&json).map_err(|e| sqlx::Error::Decode(e.into())))
            .transpose()
    }
}

fn encode(order: &Order) -> Result<String, sqlx::Error> {
    serde_json::to_string(order).map_err(|e| sqlx::Error::Encode(e.into()))
}

#[async_trait]
impl Binder<Order> for OrderDao {
    async fn load(&self, conn: &mut SqliteConnection, task: &Task) -> Result<Order, HandlerError> {
        let order = self.find_by_task(conn, task.id).await?;
        order.ok_or_else(|| {
            HandlerError::new("OrderNotFound", format!("no order for task {}", task.id))
        })
    }

    async fn unload(
        &self,
        conn: &mut SqliteConnection,
        _task: &Task,
        order: Order,
    ) -> Result<(), HandlerError> {
        self.update_order(conn, &order).await?;
        Ok(())
    }
}

struct Warehouse;

impl Warehouse {
    async fn reserve_goods(&self, order: &Order) -> Result<String, HandlerError> {
        if order.items.contains("unobtainium") {
            return Err(HandlerError::new("OutOfStock", "warehouse has no such goods")
                .with_details(json!({
                    "method": "POST",
                    "uri": "https://warehouse.example.com/reservations",
                    "status": 409,
                    "json_body": { "error": "out of stock", "order": order.id },
                })));
        }
        Ok(format!("rsv-{}", Uuid::new_v4()))
    }

    async fn ship_the_order(&self, order: &Order) -> Result<String, HandlerError> {
        if order.items.contains("fragile") {
            return Err(HandlerError::new("CarrierRefused", "no carrier accepts this parcel")
                .with_details(json!({
                    "method": "POST",
                    "uri": "https://warehouse.example.com/shipments",
                    "status": 422,
                    "json_body": { "error": "refused by all carriers", "order": order.id },
                })));
        }
        Ok(format!("trk-{}", Uuid::new_v4()))
    }

    async fn cancel_reservation(&self, token: &str) -> Result<(), HandlerError> {
        info!(token, "Reservation cancelled");
        Ok(())
    }
}

struct Bank {
    flaky_charges: AtomicU32,
}

impl Bank {
    fn new(failures: u32) -> Self {
        Self {
            flaky_charges: AtomicU32::new(failures),
        }
    }

    async fn process_payment(&self, order: &Order, attempt_ref: &str) -> Result<String, HandlerError> {
        let flaking = self
            .flaky_charges
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if flaking {
            return Err(HandlerError::new("BankGateway", "payment service returned 503")
                .with_details(json!({
                    "method": "POST",
                    "uri": "https://bank.example.com/payments",
                    "status": 503,
                    "json_body": { "error": "temporarily unavailable", "order": order.id },
                })));
        }
        info!(attempt_ref, "Charge accepted");
        Ok(format!("txn-{}", Uuid::new_v4()))
    }

    async fn cancel_payment(&self, transaction_id: &str) -> Result<(), HandlerError> {
        Err(HandlerError::new("BankGateway", "cancellation service returned 503")
            .with_details(json!({
                "method": "DELETE",
                "uri": format!("https://bank.example.com/payments/{transaction_id}"),
                "status": 503,
                "json_body": { "error": "temporarily unavailable" },
            })))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,conveyor=info".into()),
        )
        .init();

    // 1. Fresh database next to the current directory
    for path in ["order_flow.db", "order_flow.db-wal", "order_flow.db-shm"] {
        let _ = std::fs::remove_file(path);
    }
    let mut engine = Engine::with_config(
        "sqlite://order_flow.db?mode=rwc",
        EngineConfig {
            idle_poll_interval: Duration::from_millis(250),
            queues_reload_interval: Duration::from_secs(2),
            ..EngineConfig::default()
        },
    )
    .await?;
    OrderDao::migrate(engine.store().pool()).await?;

    // 2. Wire the attachment and the failure-log enricher
    let dao = OrderDao;
    engine.bind::<Order, _>(dao.clone())?;
    engine.augment(|_task, error, extra| {
        if let Some(details) = error.details() {
            extra.insert("response".to_string(), details.clone());
        }
    })?;

    let warehouse = Arc::new(Warehouse);
    let bank = Arc::new(Bank::new(2));
    let store = engine.store().clone();

    // 3. The order flow, one handler per status
    engine.register_with(
        [NEW_ORDER_CREATED],
        HandlerOptions::new().named("start_order_processing"),
        |mut task: Task, mut order: Order| async move {
            order.status = "PROCESSING".to_string();
            task.set_status(ORDER_PROCESSING_STARTED);
            Ok((task, order))
        },
    )?;

    {
        let warehouse = Arc::clone(&warehouse);
        engine.register_with(
            [ORDER_PROCESSING_STARTED],
            HandlerOptions::new()
                .named("reserve_goods")
                .retry(RetryPolicy::parse("every 1s during 3s", NO_GOODS)?),
            move |mut task: Task, mut order: Order| {
                let warehouse = Arc::clone(&warehouse);
                async move {
                    let token = warehouse.reserve_goods(&order).await?;
                    order.reservation_token = Some(token);
                    task.set_status(GOODS_RESERVED);
                    Ok((task, order))
                }
            },
        )?;
    }

    engine.register_with(
        [NO_GOODS],
        HandlerOptions::new().named("report_no_goods"),
        |mut task: Task, mut order: Order| async move {
            order.reject_reason = Some("Cannot reserve goods for this order.".to_string());
            task.set_status(REJECTED_NO_GOODS);
            Ok((task, order))
        },
    )?;

    {
        let bank = Arc::clone(&bank);
        let dao = dao.clone();
        let store = store.clone();
        engine.register_with(
            [GOODS_RESERVED],
            HandlerOptions::new()
                .named("pay_order")
                .retry(RetryPolicy::parse("every 1s during 10s", PAYMENT_FAILED)?),
            move |mut task: Task, mut order: Order| {
                let bank = Arc::clone(&bank);
                let dao = dao.clone();
                let store = store.clone();
                async move {
                    // Write the payment reference down before calling out, so
                    // a retried attempt re-sends the same charge and the bank
                    // can deduplicate it.
                    let reference = match order.payment_attempt_ref.clone() {
                        Some(reference) => reference,
                        None => {
                            let reference = format!("pay-{}", Uuid::new_v4());
                            order.payment_attempt_ref = Some(reference.clone());
                            let mut conn = store.pool().acquire().await?;
                            dao.update_order(&mut conn, &order).await?;
                            reference
                        }
                    };
                    let transaction_id = bank.process_payment(&order, &reference).await?;
                    order.payment_transaction_id = Some(transaction_id);
                    task.set_status(ORDER_PAID);
                    Ok((task, order))
                }
            },
        )?;
    }

    engine.register_with(
        [PAYMENT_FAILED],
        HandlerOptions::new().named("report_no_payment"),
        |mut task: Task, mut order: Order| async move {
            order.reject_reason = Some("Payment not processed.".to_string());
            task.set_status(REJECTED_NO_PAYMENT);
            Ok((task, order))
        },
    )?;

    {
        let warehouse = Arc::clone(&warehouse);
        engine.register_with(
            [ORDER_PAID],
            HandlerOptions::new()
                .named("ship_order")
                .retry(RetryPolicy::parse("every 1s during 3s", ORDER_NOT_SHIPPED)?),
            move |mut task: Task, mut order: Order| {
                let warehouse = Arc::clone(&warehouse);
                async move {
                    let track_id = warehouse.ship_the_order(&order).await?;
                    order.delivery_tracking_id = Some(track_id);
                    task.set_status(ORDER_SHIPPED);
                    Ok((task, order))
                }
            },
        )?;
    }

    engine.register_with(
        [ORDER_NOT_SHIPPED],
        HandlerOptions::new().named("report_not_shipped"),
        |mut task: Task, mut order: Order| async move {
            order.reject_reason = Some("Unable to ship the order.".to_string());
            task.set_status(REJECTED_NO_SHIPPING);
            Ok((task, order))
        },
    )?;

    engine.register_with(
        [ORDER_SHIPPED],
        HandlerOptions::new().named("finish_order_processing"),
        |mut task: Task, mut order: Order| async move {
            info!(order = %order.id, "Order shipped");
            order.status = "SHIPPED".to_string();
            task.finish();
            Ok((task, order))
        },
    )?;

    {
        let bank = Arc::clone(&bank);
        engine.register_with(
            [REJECTED_NO_GOODS, REJECTED_NO_PAYMENT, REJECTED_NO_SHIPPING],
            HandlerOptions::new()
                .named("cancel_payment")
                .retry(RetryPolicy::parse("every 1s during 3s", PAYMENT_CANCELLATION_FAILED)?),
            move |mut task: Task, order: Order| {
                let bank = Arc::clone(&bank);
                async move {
                    if let Some(transaction_id) = &order.payment_transaction_id {
                        bank.cancel_payment(transaction_id).await?;
                    }
                    task.set_status(PAYMENT_CANCELLED);
                    Ok((task, order))
                }
            },
        )?;
    }

    {
        let store = store.clone();
        engine.register_with(
            [PAYMENT_CANCELLATION_FAILED],
            HandlerOptions::new().named("update_order_failure_details"),
            move |mut task: Task, mut order: Order| {
                let store = store.clone();
                async move {
                    order.failure_details = store.last_failure_extra_json(task.id).await?;
                    task.set_status(FAILURE_DETAILS_UPDATED);
                    Ok((task, order))
                }
            },
        )?;
    }

    engine.register_with(
        [FAILURE_DETAILS_UPDATED],
        HandlerOptions::new()
            .named("notify_manager")
            .retry(RetryPolicy::parse("every 1s during 1s", MANAGER_NOTIFIED)?),
        |mut task: Task, order: Order| async move {
            info!(
                order = %order.id,
                details = %order.failure_details.clone().unwrap_or_default(),
                "Mailing the order manager"
            );
            task.set_status(MANAGER_NOTIFIED);
            Ok((task, order))
        },
    )?;

    {
        let warehouse = Arc::clone(&warehouse);
        engine.register_with(
            [MANAGER_NOTIFIED, PAYMENT_CANCELLED],
            HandlerOptions::new()
                .named("cancel_reservation")
                .retry(RetryPolicy::parse("every 1s during 3s", RESERVATION_CANCELLED)?),
            move |mut task: Task, order: Order| {
                let warehouse = Arc::clone(&warehouse);
                async move {
                    if let Some(token) = &order.reservation_token {
                        warehouse.cancel_reservation(token).await?;
                    }
                    task.set_status(RESERVATION_CANCELLED);
                    Ok((task, order))
                }
            },
        )?;
    }

    engine.register_with(
        [RESERVATION_CANCELLED],
        HandlerOptions::new().named("reject_order"),
        |mut task: Task, mut order: Order| async move {
            order.status = "REJECTED".to_string();
            task.finish();
            Ok((task, order))
        },
    )?;

    // 4. Go
    engine.start().await?;

    // 5. Three orders, placed atomically next to their tasks
    let smooth = place_order(&engine, &dao, "alice", "2x mechanical keyboard").await?;
    let doomed = place_order(&engine, &dao, "bob", "1x unobtainium ingot").await?;
    let returned = place_order(&engine, &dao, "carol", "1x fragile vase").await?;

    // 6. Watch them run
    let (a, b, c) = tokio::join!(
        watch_until_done(&engine, smooth),
        watch_until_done(&engine, doomed),
        watch_until_done(&engine, returned)
    );
    a?;
    b?;
    c?;

    // 7. Read back what happened
    print_report(&engine, &dao, smooth).await?;
    print_report(&engine, &dao, doomed).await?;
    print_report(&engine, &dao, returned).await?;

    engine.stop().await;
    Ok(())
}

async fn place_order(
    engine: &Engine,
    dao: &OrderDao,
    customer: &str,
    items: &str,
) -> Result<i64, Box<dyn std::error::Error>> {
    let mut tx = engine.store().begin().await?;
    let task = engine.store().insert_in(&mut tx, NEW_ORDER_CREATED).await?;
    let order = Order {
        id: Uuid::new_v4().to_string(),
        task_id: task.id,
        status: "NEW".to_string(),
        customer: customer.to_string(),
        items: items.to_string(),
        ..Order::default()
    };
    dao.insert_order(&mut tx, &order).await?;
    tx.commit().await?;
    engine.trigger_queues_reload_from_db();
    info!(task_id = task.id, customer, items, "Order placed");
    Ok(task.id)
}

async fn watch_until_done(engine: &Engine, task_id: i64) -> Result<(), Box<dyn std::error::Error>> {
    let mut last = String::new();
    loop {
        let task = engine
            .load_task(task_id)
            .await?
            .ok_or("task disappeared")?;
        let current = task.status.clone().unwrap_or_default();
        if current != last && !current.is_empty() {
            info!(task_id, status = %current, "Status");
            last = current;
        }
        if task.status.is_none() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

async fn print_report(
    engine: &Engine,
    dao: &OrderDao,
    task_id: i64,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = engine.store().pool().acquire().await?;
    let order = dao
        .find_by_task(&mut conn, task_id)
        .await?
        .ok_or("order disappeared")?;

    println!();
    println!(
        "=== order {} for {} ({}): {}",
        order.id, order.customer, order.items, order.status
    );
    if let Some(reason) = &order.reject_reason {
        println!("    rejected: {reason}");
    }
    if let Some(reference) = &order.payment_attempt_ref {
        println!("    pay ref:  {reference}");
    }
    if let Some(transaction_id) = &order.payment_transaction_id {
        println!("    payment:  {transaction_id}");
    }
    if let Some(track_id) = &order.delivery_tracking_id {
        println!("    tracking: {track_id}");
    }
    for row in engine.store().logs(task_id).await? {
        let outcome = match &row.exception_type {
            Some(kind) => format!(
                "failed ({kind}: {})",
                row.exception_message.as_deref().unwrap_or("")
            ),
            None => "ok".to_string(),
        };
        println!(
            "    {} {:>26} -> {:<26} {}",
            row.created.format("%H:%M:%S%.3f"),
            show(&row.status_before),
            show(&row.status_after),
            outcome
        );
        if let Some(extra) = &row.extra_json {
            println!("        extra: {extra}");
        }
    }
    Ok(())
}

fn show(status: &Option<String>) -> &str {
    status.as_deref().unwrap_or("(done)")
}
