use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::types::{PollerStatus, PowerModel};

/// Read-only view of what the poller publishes.
#[derive(Clone)]
pub struct AppState {
    power: watch::Receiver<PowerModel>,
    status: watch::Receiver<PollerStatus>,
}

impl AppState {
    pub fn new(power: watch::Receiver<PowerModel>, status: watch::Receiver<PollerStatus>) -> Self {
        Self { power, status }
    }
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/power", get(get_power))
        .route("/status", get(get_status))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the status API on `bind` until `shutdown` fires.
pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(bind, "status API listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn get_power(State(app): State<AppState>) -> impl IntoResponse {
    let model = app.power.borrow().clone();
    (StatusCode::OK, Json(model))
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    let status = app.status.borrow().clone();
    (StatusCode::OK, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PollerState;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn power_endpoint_returns_latest_model() {
        let mut model = PowerModel::new();
        model.ports[0].current_milliamps = 1500;
        model.ports[0].voltage_millivolts = 5000;
        model.recompute();
        model.data_valid = true;
        let (power_tx, power_rx) = watch::channel(PowerModel::new());
        let (_status_tx, status_rx) = watch::channel(PollerStatus::default());
        power_tx.send_replace(model);

        let app = router(AppState::new(power_rx, status_rx));
        let resp = app
            .oneshot(Request::get("/api/power").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let got: PowerModel = serde_json::from_slice(&bytes).unwrap();
        assert!(got.data_valid);
        assert_eq!(got.total_watts, 7.5);
    }

    #[tokio::test]
    async fn status_endpoint_and_unknown_route() {
        let (_power_tx, power_rx) = watch::channel(PowerModel::new());
        let (_status_tx, status_rx) = watch::channel(PollerStatus {
            state: PollerState::Polling,
            address: Some("10.0.0.5".into()),
            consecutive_failures: 2,
            last_error: Some("request timed out".into()),
        });
        let app = router(AppState::new(power_rx, status_rx));

        let resp = app
            .clone()
            .oneshot(Request::get("/api/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let bytes = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["state"], "polling");
        assert_eq!(v["address"], "10.0.0.5");
        assert_eq!(v["consecutive_failures"], 2);

        let resp = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
