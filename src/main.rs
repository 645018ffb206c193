use std::{env, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scorm_tracker::{
    config::AppConfig,
    db::{self, PgStore},
    routes::{self, AppState},
    store::{MemoryStore, Store},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "scorm_tracker=info,axum=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env()?;
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url).await?;
            // crate-relative path for sqlx migrations
            sqlx::migrate!("./migrations").run(&pool).await?;
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, tracking data is kept in memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let port = config.port;
    let app = routes::app(AppState {
        store,
        config: Arc::new(config),
    });

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", port);

    axum::serve(listener, app).await?;
    Ok(())
}
