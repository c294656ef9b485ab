//! Live account dashboard: balance, trade and notification updates over the event socket.
//!
//! Run with tracing enabled:
//! ```sh
//! REALTIME_URL=wss://api.example.com/realtime REALTIME_TOKEN=... RUST_LOG=info cargo run --example dashboard --features tracing
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=dashboard.log RUST_LOG=debug cargo run --example dashboard --features tracing
//! ```

use std::fs::File;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;
use trading_realtime::auth::SecretString;
use trading_realtime::bus::EventBus;
use trading_realtime::hooks::{
    Hook, balance_updates, connection_status, notifications, trade_updates,
};
use trading_realtime::types::{ConnectionStatus, Severity};
use trading_realtime::ws::{Config, ConnectionManager};
use trading_realtime::{Handler, handler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let endpoint = std::env::var("REALTIME_URL")
        .unwrap_or_else(|_| "wss://api.example.com/realtime".to_owned());
    let mut config = Config::new(&endpoint)?;
    config.reconnect.max_attempts = Some(8);

    // The auth store publishes the session token; `None` means logged out.
    let (token_tx, token_rx) = watch::channel::<Option<SecretString>>(None);

    let bus = EventBus::with_alerter(|message: &str, severity: Severity| match severity {
        Severity::Error | Severity::Warning => warn!(%severity, text = message, "alert"),
        _ => info!(%severity, text = message, "alert"),
    });
    let manager = ConnectionManager::new(config, token_rx.clone(), bus);
    let _follower = manager.follow_credentials(token_rx);

    let _status = connection_status(manager.bus(), |status| match status {
        ConnectionStatus::Failed => warn!("gave up reconnecting, restart to try again"),
        status => info!(%status, "connection"),
    });
    let _balances = balance_updates(manager.bus(), |update| {
        info!(
            balance = ?update.balance,
            available = ?update.available,
            currency = ?update.currency,
            "balance"
        );
    });
    let _trades = trade_updates(manager.bus(), |trade| {
        info!(id = ?trade.id, symbol = ?trade.symbol, status = ?trade.status, "trade");
    });
    let _notifications = notifications(manager.bus(), |notification| {
        info!(title = ?notification.title, "notification");
    });

    // A view that only cares about one market: re-registers when the selection changes.
    let mut market_view = Hook::mount(
        manager.bus(),
        "trade-updated",
        "BTCUSDT".to_owned(),
        |symbol: &String| -> Handler {
            let symbol = symbol.clone();
            handler(move |trade| {
                if trade["symbol"] == symbol.as_str() {
                    info!(%symbol, price = %trade["price"], "selected market trade");
                }
            })
        },
    );

    match std::env::var("REALTIME_TOKEN") {
        Ok(token) => {
            token_tx.send_replace(Some(SecretString::from(token)));
        }
        Err(_) => warn!("REALTIME_TOKEN is not set, staying offline"),
    }

    tokio::time::sleep(Duration::from_secs(10)).await;
    if manager.join_room("market:ETHUSDT") {
        market_view.update("ETHUSDT".to_owned());
    }

    tokio::signal::ctrl_c().await?;

    // Logging out tears the session down and clears every registration.
    token_tx.send_replace(None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    info!(subscriptions = manager.bus().subscription_count(), "logged out");

    Ok(())
}
