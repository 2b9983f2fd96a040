//! Web server module

mod middleware;
mod routes;

pub use self::middleware::{get_real_ip, RequestCaptureLayer};

use anyhow::Result;
use axum::{routing::get, Router};
use std::{net::SocketAddr, sync::Arc};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::analytics::capture::EventCapture;
use crate::analytics::diagnostics::Diagnostics;
use crate::config::Config;
use crate::stats::StatsService;

pub struct AppState {
    pub stats: Arc<StatsService>,
    pub diagnostics: Arc<Diagnostics>,
}

/// Router with every route wrapped in request capture
pub fn router(state: Arc<AppState>, capture: EventCapture) -> Router {
    Router::new()
        .route("/api/stats", get(routes::api_stats))
        .route("/api/analytics/diagnostics", get(routes::api_diagnostics))
        .fallback(routes::not_found)
        .layer(RequestCaptureLayer::new(capture))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Fill the stats cache in the background so the first request is cheap
pub fn warm_cache(stats: Arc<StatsService>) {
    tokio::spawn(async move {
        match stats.refresh().await {
            Ok(result) => info!(generated_at = %result.generated_at, "Stats cache warmed"),
            Err(e) => warn!(error = %e, "stats cache warm-up failed"),
        }
    });
}

pub async fn start_server(config: &Config, state: Arc<AppState>, capture: EventCapture) -> Result<()> {
    let app = router(state, capture);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    info!("Web server starting on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::capture;
    use crate::config::StatsConfig;
    use crate::db::test_database;
    use crate::kv::MemoryStore;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn app(queue_capacity: usize) -> (Router, capture::EventQueue, Arc<Diagnostics>) {
        let diagnostics = Arc::new(Diagnostics::new());
        let db = test_database().await;
        db.insert_post("Hello", 3).await.unwrap();
        let stats = StatsService::new(
            &StatsConfig::default(),
            db,
            Arc::new(MemoryStore::new()),
            diagnostics.clone(),
        );
        let (capture, queue) = capture::channel(queue_capacity, diagnostics.clone());
        let state = Arc::new(AppState {
            stats: Arc::new(stats),
            diagnostics: diagnostics.clone(),
        });
        (router(state, capture), queue, diagnostics)
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn stats_endpoint_returns_json() {
        let (app, _queue, _) = app(16).await;
        let response = app
            .oneshot(Request::get("/api/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["total_visits"], 3);
        assert_eq!(body["unique_visitors"], 0);
        assert_eq!(body["top_posts"][0]["path"], "/posts/1");
        assert!(body["region_distribution"].as_array().unwrap().is_empty());
        assert!(body["generated_at"].is_string());
    }

    #[tokio::test]
    async fn every_request_is_captured_with_its_status() {
        let (app, mut queue, diagnostics) = app(16).await;
        let response = app
            .oneshot(
                Request::get("/nope?x=1")
                    .header("x-forwarded-for", "203.0.113.7")
                    .header("user-agent", "test-agent")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"], "not found");

        let event = queue.try_recv().unwrap();
        assert_eq!(event.ip, "203.0.113.7");
        assert_eq!(event.method, "GET");
        assert_eq!(event.path, "/nope");
        assert_eq!(event.status, 404);
        assert_eq!(event.user_agent, "test-agent");
        assert_eq!(diagnostics.snapshot().events_captured, 1);
    }

    #[tokio::test]
    async fn full_queue_does_not_fail_requests() {
        let (app, _queue, diagnostics) = app(1).await;
        for _ in 0..3 {
            let response = app
                .clone()
                .oneshot(Request::get("/api/analytics/diagnostics").body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let snap = diagnostics.snapshot();
        assert_eq!(snap.events_captured, 1);
        assert_eq!(snap.events_dropped, 2);
    }
}
