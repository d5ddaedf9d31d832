use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::{
    Router,
    http::{HeaderValue, Method, StatusCode},
    routing::{get, post},
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use url::Url;

use crate::api;
use crate::config::AppConfig;
use crate::state::AppState;

pub async fn serve(config: AppConfig) -> Result<()> {
    let state = AppState::build(config.clone())?;
    state.worker.start();

    let app = router(state.clone());

    let cors_origin = normalize_origin(&config.public_base_url)?;
    let cors_origin: HeaderValue = cors_origin
        .as_str()
        .parse()
        .context("invalid cors origin")?;
    let cors = CorsLayer::new()
        .allow_origin(cors_origin)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    let app = app.layer(cors).layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.bind_addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind TCP listener")?;

    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await
        .context("http server exited")?;

    Ok(())
}

pub fn router(state: Arc<AppState>) -> Router {
    let queue_router = Router::new()
        .route("/sim-then-generate", post(api::sim_then_generate))
        .route("/tasks/{task_id}/status", get(api::task_status))
        .route("/tasks/{task_id}/result", get(api::task_result))
        .route("/tasks/{task_id}/stream", get(api::task_stream))
        .route("/state", get(api::queue_state));

    let api_router = Router::new()
        .route("/health", get(api_health))
        .route("/jd/latest", get(api::get_latest_jd))
        .route("/jd/{jd_id}", get(api::get_jd))
        .nest("/llm/queue", queue_router);

    Router::new()
        .nest("/api", api_router)
        .route("/metrics", get(metrics))
        .with_state(state)
}

fn normalize_origin(url: &Url) -> Result<Url> {
    let origin = url.origin().ascii_serialization();
    Url::parse(&origin).context("failed to normalize origin url")
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => state.worker.stop(),
        _ = terminate => state.worker.stop(),
    }
}

async fn api_health() -> axum::Json<serde_json::Value> {
    axum::Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics() -> Result<String, (StatusCode, String)> {
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::default_registry().gather())
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::normalize_origin;

    #[test]
    fn origin_strips_path_and_query() {
        let url = Url::parse("http://127.0.0.1:58080/some/path?x=1").expect("parse url");
        let origin = normalize_origin(&url).expect("normalize");
        assert_eq!(origin.as_str(), "http://127.0.0.1:58080/");
    }
}
