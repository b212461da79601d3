use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use realtime_notification_service::{
    handlers, logging, metrics, Config, InMemoryNotificationStore, NotificationStore, Notifier,
    RealtimeService,
};
use std::sync::Arc;
use tokio::signal;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        heartbeat_interval_secs = config.heartbeat_interval_secs,
        max_retries = config.max_retries,
        "starting realtime notification service"
    );

    let service = web::Data::new(RealtimeService::from_config(&config));
    service.start();

    let store: Arc<dyn NotificationStore> = Arc::new(InMemoryNotificationStore::new());
    let notifier = web::Data::new(Notifier::new(&service, store));

    let app_service = service.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_service.clone())
            .app_data(notifier.clone())
            .wrap(middleware::Logger::default())
            .wrap(metrics::MetricsMiddleware)
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::configure)
    })
    .bind(config.bind_address())
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
    .disable_signals()
    .run();

    // Sockets must see the 1001 close before the server stops accepting
    let handle = server.handle();
    let shutdown_service = service.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_service.shutdown();
        handle.stop(true).await;
    });

    server.await.context("HTTP server error")?;
    tracing::info!("realtime notification service shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C signal"),
        _ = terminate => tracing::info!("received SIGTERM signal"),
    }
}
