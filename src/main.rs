use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use read_model::adapter::DeliveryAdapter;
use read_model::config::PipelineConfig;
use read_model::handler::HandlerRegistry;
use read_model::http::{create_router, AppState};
use read_model::materialize::Materializer;
use read_model::metrics::PipelineMetrics;
use read_model::normalize::Normalizer;
use read_model::route::Router;
use read_model::store::MemoryStore;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    tracing::info!("Starting read-model materialization service");

    let config = PipelineConfig::default();
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(HandlerRegistry::builtin());

    let metrics = Arc::new(PipelineMetrics::new());
    let adapter = Arc::new(DeliveryAdapter::new(
        Normalizer::with_defaults(),
        Router::new(registry),
        Materializer::new(store.clone(), &config),
        metrics.clone(),
        &config,
    ));

    // Dedup markers outlive the transport redelivery window by the
    // configured retention; sweep them hourly.
    let retention = chrono::Duration::seconds(config.dedupe_retention_secs as i64);
    let sweep_store = store.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        loop {
            ticker.tick().await;
            let removed = sweep_store.sweep_dedupe(chrono::Utc::now() - retention);
            if removed > 0 {
                tracing::info!(removed, "swept expired dedup markers");
            }
        }
    });

    let app = create_router(AppState { adapter, metrics });

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
