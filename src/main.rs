use std::sync::Arc;

use gateway::config::GatewayConfig;
use gateway::web::{build_router, AppState};
use gateway::{admission::ConnectionManager, engine::mock::MockEngineFactory};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting realtime STT gateway v{}", env!("CARGO_PKG_VERSION"));

    let config = GatewayConfig::init()?;
    info!("configuration loaded");

    let state = AppState {
        config,
        connections: Arc::new(ConnectionManager::new(config.limits.max_concurrent_connections)),
        // The inference engine itself is out of scope for this crate; the
        // mock factory is a runnable stand-in so the gateway can be
        // exercised end-to-end. A real deployment supplies its own
        // `EngineConnectionFactory`.
        engine_factory: Arc::new(MockEngineFactory),
    };

    let app = build_router(state);

    let addr = format!("{}:{}", config.web.host, config.web.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("gateway listening on ws://{}{}", addr, config.web.ws_path);

    axum::serve(listener, app).await?;

    Ok(())
}
