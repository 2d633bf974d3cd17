mod api;
mod authenticity;
mod config;
mod http;
mod idempotency;
mod imaging;
mod jobs;
mod llm;
mod metrics;
mod models;
mod pipeline;
mod post_gen;
mod pricing;
mod security;
mod store;
mod upload;

use api::AppState;
use config::{SearchKeys, env_or, env_string, parse_env_bool};
use eyre::WrapErr;
use idempotency::IdempotencyCache;
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline::Pipeline;
use security::{JwtConfig, TokenBuckets};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};
use upload::UploadSettings;

const DEFAULT_BODY_LIMIT: usize = 25 * 1024 * 1024;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "auction.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let store = store::from_env()
        .await
        .wrap_err("failed to connect to the listing store")?;
    let models = llm::Models::from_env();
    let pipeline = Pipeline::from_env(store, &models, &SearchKeys::from_env());
    let (queue, _worker) = jobs::JobQueue::spawn(pipeline.clone());

    let uploads = UploadSettings::from_env();
    tokio::fs::create_dir_all(&uploads.dir)
        .await
        .wrap_err_with(|| format!("cannot create upload dir {}", uploads.dir.display()))?;

    let redis = env_string("REDIS_URL").and_then(|url| match redis::Client::open(url) {
        Ok(client) => Some(client),
        Err(err) => {
            warn!(target = "auction.api", error = %err, "invalid REDIS_URL; idempotency stays in memory");
            None
        }
    });
    let idempotency = IdempotencyCache::new(
        redis,
        env_or("IDEMPOTENCY_TTL_SECS", idempotency::DEFAULT_TTL_SECS),
    );

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("failed to install the prometheus recorder")?;

    let state = AppState {
        pipeline,
        queue,
        jwt: Arc::new(JwtConfig::from_env()),
        uploads: Arc::new(uploads),
        idempotency: Arc::new(idempotency),
        openapi: Arc::new(api::load_openapi()),
        prometheus,
        body_limit: env_parse_positive("REQUEST_MAX_BYTES").unwrap_or(DEFAULT_BODY_LIMIT),
    };
    let app = api::router(state, TokenBuckets::from_env());

    let port: u16 = env_or("PORT", 8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "auction.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

fn env_parse_positive(key: &str) -> Option<usize> {
    config::env_parse::<usize>(key).filter(|v| *v > 0)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_ansi(!parse_env_bool("LOG_NO_ANSI"))
        .try_init();
}
