//! Route definitions and router setup
//!
//! Configures all API routes and middleware.

mod connection;
mod monitoring;

use crate::config::Settings;
use crate::state::SharedState;
use axum::{
    extract::State,
    http::{header, Method},
    routing::{delete, get, post},
    Router,
};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    request_id::MakeRequestUuid,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
    ServiceBuilderExt,
};
use tracing::Level;

/// Create the application router with all routes and middleware
pub fn create_router(state: SharedState, settings: &Settings) -> Router {
    let cors = build_cors_layer(settings);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
        .on_request(DefaultOnRequest::new().level(Level::INFO))
        .on_response(DefaultOnResponse::new().level(Level::INFO));

    let middleware = ServiceBuilder::new()
        .set_x_request_id(MakeRequestUuid)
        .layer(trace_layer)
        .layer(CompressionLayer::new())
        .layer(cors)
        .propagate_x_request_id();

    Router::new()
        .route("/health", get(health_check))

        // Datasets and captures
        .route("/api/datasets", get(monitoring::list_datasets))
        .route(
            "/api/datasets/{key}/captures",
            post(monitoring::submit_capture).get(monitoring::list_captures),
        )
        .route("/api/datasets/{key}/diff", get(monitoring::latest_diff))
        .route("/api/datasets/{key}/check", post(monitoring::check_dataset))
        .route("/api/datasets/{key}/refresh", post(monitoring::refresh_dataset))

        // Batch checks
        .route("/api/checks/run", post(monitoring::run_checks))

        // Incidents
        .route("/api/incidents", get(monitoring::list_incidents))
        .route("/api/incidents/{id}", get(monitoring::get_incident))

        // Source connections
        .route(
            "/api/connections",
            post(connection::connect).get(connection::list_connections),
        )
        .route("/api/connections/{id}", delete(connection::disconnect))
        .route("/api/connections/{id}/discover", post(connection::discover))
        .route("/api/connections/{id}/datasets", get(connection::list_datasets))
        .route("/api/connections/{id}/checks", post(connection::run_checks))
        .route("/api/connections/{id}/incidents", get(connection::list_incidents))

        .layer(middleware)
        .with_state(state)
}

/// Build CORS layer from settings
fn build_cors_layer(settings: &Settings) -> CorsLayer {
    let origins: Vec<_> = settings
        .cors
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let layer = if origins.is_empty() {
        CorsLayer::new().allow_origin(Any)
    } else {
        CorsLayer::new().allow_origin(origins)
    };

    layer
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .max_age(Duration::from_secs(3600))
}

/// Health check endpoint
async fn health_check(State(state): State<SharedState>) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "success": true,
        "message": "Server is running fine.",
        "storage": state.storage,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CorsConfig, LogFormat, MonitoringConfig, ServerConfig};
    use crate::connection::tests::StaticSource;
    use crate::monitor::ColumnSpec;
    use crate::state::AppState;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tower::ServiceExt;

    fn settings() -> Settings {
        Settings {
            server: ServerConfig::default(),
            database: None,
            cors: CorsConfig::default(),
            log_format: LogFormat::Compact,
            monitoring: MonitoringConfig::default(),
        }
    }

    fn app() -> (SharedState, Router) {
        let settings = settings();
        let state = Arc::new(AppState::in_memory(&settings.monitoring));
        (state.clone(), create_router(state, &settings))
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(match body {
                Some(v) => Body::from(v.to_string()),
                None => Body::empty(),
            })
            .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (_, app) = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["storage"], "memory");
    }

    #[tokio::test]
    async fn test_push_captures_then_check_opens_drift() {
        let (_, app) = app();
        let uri = "/api/datasets/warehouse:public.users/captures";

        let (status, _) = call(
            &app,
            "POST",
            uri,
            Some(json!({"columns": [{"name": "id", "type": "int", "nullable": false}]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = call(
            &app,
            "POST",
            uri,
            Some(json!({"columns": [
                {"name": "id", "type": "int", "nullable": false},
                {"name": "email", "type": "text"}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&app, "GET", "/api/datasets/warehouse:public.users/diff", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hasDrift"], true);
        assert_eq!(body["diff"]["added"], json!(["email"]));

        let (status, body) =
            call(&app, "POST", "/api/datasets/warehouse:public.users/check", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["opened"], 1);

        let (status, body) = call(
            &app,
            "GET",
            "/api/incidents?ruleType=SCHEMA_DRIFT&status=OPEN",
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let incidents = body["incidents"].as_array().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0]["severity"], "HIGH");

        let id = incidents[0]["id"].as_str().unwrap();
        let (status, body) = call(&app, "GET", &format!("/api/incidents/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["incident"]["datasetKey"], "warehouse:public.users");
    }

    #[tokio::test]
    async fn test_duplicate_columns_are_unprocessable() {
        let (_, app) = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/datasets/warehouse:public.users/captures",
            Some(json!({"columns": [
                {"name": "id", "type": "int"},
                {"name": "id", "type": "text"}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_diff_needs_two_captures() {
        let (_, app) = app();
        let (status, _) = call(&app, "GET", "/api/datasets/lake:public.none/diff", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unknown_incident_is_not_found() {
        let (_, app) = app();
        let (status, _) = call(
            &app,
            "GET",
            &format!("/api/incidents/{}", uuid::Uuid::new_v4()),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_discover_then_run_checks() {
        let (state, app) = app();
        let source = Arc::new(StaticSource::new(
            "lake",
            &[
                ("orders", vec![ColumnSpec::new("id", "int", false)]),
                ("users", vec![ColumnSpec::new("id", "int", false)]),
            ],
        ));
        let info = state
            .connections
            .register("lake".to_string(), "test".to_string(), source.clone())
            .await
            .unwrap();

        let (status, body) = call(
            &app,
            "POST",
            &format!("/api/connections/{}/discover", info.id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["datasetsChecked"], 2);

        let (_, body) = call(&app, "GET", "/api/datasets", None).await;
        assert_eq!(body["datasets"], json!(["lake:public.orders", "lake:public.users"]));

        // The source changes; refreshing one dataset captures the drift
        source
            .tables
            .lock()
            .await
            .get_mut("orders")
            .unwrap()
            .push(ColumnSpec::new("total", "numeric", true));
        let (status, body) =
            call(&app, "POST", "/api/datasets/lake:public.orders/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["report"]["opened"], 1);

        let (status, body) = call(&app, "POST", "/api/checks/run", Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["datasetsChecked"], 2);
        assert_eq!(body["summary"]["opened"], 0);
    }

    #[tokio::test]
    async fn test_source_scoped_datasets_checks_and_incidents() {
        let (state, app) = app();
        let source = Arc::new(StaticSource::new(
            "lake",
            &[("orders", vec![ColumnSpec::new("id", "int", false)])],
        ));
        let info = state
            .connections
            .register("lake".to_string(), "test".to_string(), source.clone())
            .await
            .unwrap();

        // Pushed capture under another source prefix
        let (status, _) = call(
            &app,
            "POST",
            "/api/datasets/warehouse:public.users/captures",
            Some(json!({"columns": [{"name": "id", "type": "int"}]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let base = format!("/api/connections/{}", info.id);
        let (_, body) = call(&app, "POST", &format!("{}/discover", base), None).await;
        assert_eq!(body["summary"]["datasetsChecked"], 1);

        let (status, body) = call(&app, "GET", &format!("{}/datasets", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["datasets"], json!(["lake:public.orders"]));
        assert_eq!(body["connection"]["name"], "lake");

        // Drift pushed straight to the store; checking must not capture again
        let (status, _) = call(
            &app,
            "POST",
            "/api/datasets/lake:public.orders/captures",
            Some(json!({"columns": [
                {"name": "id", "type": "int", "nullable": false},
                {"name": "total", "type": "numeric"}
            ]})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&app, "POST", &format!("{}/checks", base), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["datasetsChecked"], 1);
        assert_eq!(body["summary"]["opened"], 1);
        let (_, body) = call(&app, "GET", "/api/datasets/lake:public.orders/captures", None).await;
        assert_eq!(body["captures"].as_array().unwrap().len(), 2);

        let (status, body) = call(
            &app,
            "GET",
            &format!("{}/incidents?status=OPEN", base),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let incidents = body["incidents"].as_array().unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0]["datasetKey"], "lake:public.orders");

        let (status, body) = call(&app, "GET", "/api/incidents?source=lake", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["incidents"].as_array().unwrap().len(), 1);

        let missing = format!("/api/connections/{}/datasets", uuid::Uuid::new_v4());
        let (status, _) = call(&app, "GET", &missing, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_refresh_without_source_is_not_found() {
        let (_, app) = app();
        let (status, _) = call(&app, "POST", "/api/datasets/nowhere:public.t/refresh", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
