#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tower::ServiceExt;

use dispatch_api::config::{DispatchConfig, LogFormat, ServerConfig};
use dispatch_api::router::build_app_router;
use dispatch_api::state::AppState;
use dispatch_core::archive::JobArchive;
use dispatch_db::MemoryJobArchive;
use dispatch_queue::QueueConfig;
use dispatch_store::{
    LockToken, MemoryStore, StateStore, StoreError, StoreResult, Subscription,
};

/// Build a test `ServerConfig` with safe defaults.
///
/// Uses `http://localhost:5173` as CORS origin (matching the dev default),
/// no admin token, relay disabled and short queue timings.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        shutdown_timeout_secs: 30,
        database_url: None,
        redis_url: None,
        admin_api_token: None,
        node_id: "test-node".to_string(),
        relay_enabled: false,
        log_format: LogFormat::Text,
        dispatch: DispatchConfig {
            max_malformed: 3,
            emergency_rate_limit: 2,
            ..DispatchConfig::default()
        },
        queue: QueueConfig {
            max_retries: 2,
            heartbeat_timeout: Duration::from_secs(60),
            ..QueueConfig::default()
        },
    }
}

/// In-memory backends behind a fully wired [`AppState`].
pub fn build_test_state(config: ServerConfig) -> (AppState, Arc<MemoryJobArchive>) {
    let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
    let archive = Arc::new(MemoryJobArchive::new());
    let state = AppState::build(
        config,
        store,
        Arc::clone(&archive) as Arc<dyn JobArchive>,
    );
    (state, archive)
}

/// In-memory archive over a store that is down.
pub fn build_state_with_store_down(config: ServerConfig) -> AppState {
    let store: Arc<dyn StateStore> = Arc::new(UnreachableStore);
    let archive: Arc<dyn JobArchive> = Arc::new(MemoryJobArchive::new());
    AppState::build(config, store, archive)
}

/// Build the full application router with all middleware layers.
///
/// This is the same router construction `main.rs` uses, so integration
/// tests exercise the production middleware stack.
pub fn build_test_app() -> (Router, AppState) {
    let config = test_config();
    let (state, _) = build_test_state(config.clone());
    (build_app_router(state.clone(), &config), state)
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    app.oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap()
}

pub async fn get_with_token(app: Router, uri: &str, token: &str) -> Response<Body> {
    app.oneshot(
        Request::get(uri)
            .header("authorization", format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await
    .unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    app.oneshot(
        Request::post(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
    )
    .await
    .unwrap()
}

/// Store whose every call fails, as when Redis is down.
pub struct UnreachableStore;

fn down<T>() -> StoreResult<T> {
    Err(StoreError::Unavailable("connection refused".into()))
}

#[async_trait]
impl StateStore for UnreachableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<String>> {
        down()
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Option<Duration>) -> StoreResult<()> {
        down()
    }
    async fn delete(&self, _key: &str) -> StoreResult<bool> {
        down()
    }
    async fn exists(&self, _key: &str) -> StoreResult<bool> {
        down()
    }
    async fn acquire_lock(&self, _key: &str, _ttl: Duration) -> StoreResult<Option<LockToken>> {
        down()
    }
    async fn release_lock(&self, _key: &str, _token: &LockToken) -> StoreResult<bool> {
        down()
    }
    async fn publish(&self, _channel: &str, _message: &str) -> StoreResult<()> {
        down()
    }
    async fn subscribe(&self, _channel: &str) -> StoreResult<Subscription> {
        down()
    }
    async fn increment(&self, _key: &str, _window: Duration) -> StoreResult<u64> {
        down()
    }
    async fn ping(&self) -> StoreResult<()> {
        down()
    }
    fn backend(&self) -> &'static str {
        "unreachable"
    }
}
