use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod admin;
mod config;
mod db;
mod entitlement;
mod limits;
mod model;
mod notify;
mod sweeper;

use admin::AppState;
use config::Settings;
use db::EntitlementStore;
use entitlement::{Evaluator, UploadGate};
use limits::RateLimiter;
use notify::Notifier;
use sweeper::Sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting linkgate subscription core...");

    // -----------------------------
    // Shared state / Dependencies
    // -----------------------------
    let settings = Settings::from_env()?;
    let store = Arc::new(EntitlementStore::new(&settings.database_path)?);
    let limiter = Arc::new(RateLimiter::new(settings.limits));
    let (notifier, mut notifications) = Notifier::channel(settings.notify_queue_depth);

    let gate = Arc::new(UploadGate::new(Evaluator::new(
        store.clone(),
        limiter.clone(),
        notifier.clone(),
    )));

    // Drain task standing in for the messaging glue: deliveries are
    // best-effort by contract, so logging them is a valid transport here.
    tokio::spawn(async move {
        while let Some(note) = notifications.recv().await {
            info!(user_id = note.user_id, kind = ?note.kind, text = %note.text, "outbound notification");
        }
    });

    // -----------------------------
    // Expiry sweeper
    // -----------------------------
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = Sweeper::new(
        store.clone(),
        limiter,
        notifier.clone(),
        settings.sweep_interval,
        shutdown_rx,
    );
    let sweeper_handle = tokio::spawn(sweeper.run());

    // -----------------------------
    // Routers
    // -----------------------------
    let state = AppState {
        gate,
        notifier,
        admin_token: settings.admin_token.clone(),
    };

    let app = Router::new()
        .merge(admin::router())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let addr = settings.bind_addr.clone();
    println!("🌐 HTTP listening on http://{addr}");
    println!("🛡 Admin API at http://{addr}/admin");
    println!("📥 Upload gate at http://{addr}/gate/authorize");

    let listener = TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Let the sweeper finish its current pass before exiting.
    let _ = shutdown_tx.send(true);
    let _ = sweeper_handle.await;

    Ok(())
}
