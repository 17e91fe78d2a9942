use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, HttpResponse, HttpServer, Responder, get};
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use restaurant_outbox::broker::KafkaBroker;
use restaurant_outbox::clients::{setup_db_pool, setup_kafka_producer};
use restaurant_outbox::config::Config;
use restaurant_outbox::dispatcher::{Dispatcher, DispatcherSettings};
use restaurant_outbox::lease::LeaseManager;
use restaurant_outbox::metrics::DispatchMetrics;

#[get("/health")]
async fn health_check() -> impl Responder {
    // Just return a 200 OK response
    HttpResponse::Ok().body("OK")
}

// Graceful shutdown signal future
async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to install SIGTERM handler");
    #[cfg(unix)]
    let terminate = term_signal.recv();
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received. Stopping the dispatcher after the current cycle.");
}

async fn run_dispatcher_logic(shutdown: watch::Receiver<bool>) {
    // Setup logging. The sentry layer only reports once a client is
    // initialized below.
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(sentry::integrations::tracing::layer())
        .init();

    // --- Configuration ---
    info!("Loading configuration...");
    let config = Config::load().expect("Failed to load configuration");
    info!("Configuration loaded.");

    let _sentry_guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });

    // --- End Configuration ---

    // 1. Connect to the Database
    info!("Connecting to database...");
    let db_pool = setup_db_pool(&config)
        .await
        .expect("failed to create database connection.");
    info!("Database connection established.");

    // 2. Setup the Kafka producer
    info!("Setting up Kafka producer...");
    let producer = setup_kafka_producer(&config).expect("Failed to create Kafka producer");
    let broker = KafkaBroker::new(producer);
    info!("Kafka producer established.");

    // 3. Run the dispatch loop until shutdown
    let lease = LeaseManager::new(
        db_pool.clone(),
        chrono::Duration::seconds(config.lease_seconds),
    );
    let metrics = Arc::new(DispatchMetrics::default());
    let settings = DispatcherSettings {
        poll_interval: Duration::from_millis(config.dispatch_interval_ms),
        fetch_page_size: config.fetch_page_size,
        delete_batch_size: config.delete_batch_size,
    };

    info!(
        interval_ms = config.dispatch_interval_ms,
        lease_seconds = config.lease_seconds,
        "Starting outbox dispatcher..."
    );
    let dispatcher = Dispatcher::new(db_pool, broker, lease, metrics, settings);
    dispatcher.run(shutdown).await;

    info!("Dispatcher shut down.");
}

/// The main function sets up our application's state and runs the
/// dispatcher next to its health endpoint.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let dispatcher_handle = tokio::spawn(async {
        run_dispatcher_logic(shutdown_rx).await;
    });

    // Spawn the health check server
    let health_server = HttpServer::new(|| App::new().service(health_check))
        .bind(("0.0.0.0", 8080))? // Binds to all interfaces on port 8080
        .run();

    println!("Health check server running on http://0.0.0.0:8080");

    // Keep both tasks running
    // This will error out if either the server or the dispatcher task fails
    let _ = tokio::try_join!(
        async { health_server.await },
        async {
            dispatcher_handle
                .await
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
        }
    )?;

    Ok(())
}
