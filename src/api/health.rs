//! Health check endpoints

use actix_web::{get, web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub node_id: String,
    pub cluster: String,
    pub backend: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_seconds: Option<f64>,
}

impl HealthResponse {
    pub fn new(status: &str, state: &AppState) -> Self {
        Self {
            status: status.to_string(),
            version: state.version.clone(),
            node_id: state.node_id.clone(),
            cluster: state.cluster.clone(),
            backend: state.backend.clone(),
            timestamp: Utc::now(),
            uptime_seconds: None,
        }
    }

    pub fn with_uptime(mut self, uptime: f64) -> Self {
        self.uptime_seconds = Some(uptime);
        self
    }
}

/// Shared admin state
#[derive(Clone)]
pub struct AppState {
    pub node_id: String,
    pub cluster: String,
    pub backend: String,
    pub version: String,
    pub start_time: DateTime<Utc>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(node_id: impl Into<String>, cluster: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            cluster: cluster.into(),
            backend: backend.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            start_time: Utc::now(),
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        let duration = Utc::now().signed_duration_since(self.start_time);
        duration.num_milliseconds() as f64 / 1000.0
    }

    /// Mark whether the node is discoverable
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Health check endpoint
#[get("/health")]
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let response = HealthResponse::new("healthy", &state).with_uptime(state.uptime_seconds());
    HttpResponse::Ok().json(response)
}

/// Readiness check endpoint: ready once discovery has started
#[get("/ready")]
pub async fn readiness_check(state: web::Data<AppState>) -> HttpResponse {
    if state.is_ready() {
        HttpResponse::Ok().json(HealthResponse::new("ready", &state))
    } else {
        HttpResponse::ServiceUnavailable().json(HealthResponse::new("starting", &state))
    }
}

/// Liveness check endpoint
#[get("/live")]
pub async fn liveness_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "alive"
    }))
}

/// Configure health routes
pub fn configure_health_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(health_check)
        .service(readiness_check)
        .service(liveness_check);
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{test, App};

    #[actix_rt::test]
    async fn test_readiness_follows_state() {
        let state = AppState::new("n1", "orders", "registry");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .configure(configure_health_routes),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/ready").to_request()).await;
        assert_eq!(resp.status(), 503);

        state.set_ready(true);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/ready").to_request()).await;
        assert_eq!(resp.status(), 200);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(body["node_id"], "n1");
        assert_eq!(body["cluster"], "orders");
        assert_eq!(body["status"], "healthy");
    }
}
