//! Shared helpers for integration tests
//!
//! Each integration test binary compiles this module separately, so not
//! every helper is used by every suite.
#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use sqlx::SqlitePool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tower::ServiceExt;
use tunesync_cb::db::{schema, track_versions, tracks};
use tunesync_cb::services::{
    ObjectStorage, ProviderApi, ProviderError, StemTaskStatus, StorageError,
};
use tunesync_cb::{build_router, AppState};
use uuid::Uuid;

pub const STORAGE: &str = "https://storage.example/media";

/// Recording storage double; uploads succeed instantly.
pub struct RecordingStorage {
    pub audio_uploads: Mutex<Vec<String>>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self {
            audio_uploads: Mutex::new(Vec::new()),
        }
    }

    pub fn audio_upload_count(&self) -> usize {
        self.audio_uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStorage for RecordingStorage {
    async fn upload_audio(
        &self,
        source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError> {
        self.audio_uploads.lock().unwrap().push(source_url.to_string());
        Ok(format!("{STORAGE}/tracks-audio/{user_id}/{track_id}/{file_name}"))
    }

    async fn upload_cover(
        &self,
        _source_url: &str,
        user_id: &str,
        track_id: &str,
        file_name: &str,
    ) -> Result<String, StorageError> {
        Ok(format!("{STORAGE}/tracks-covers/{user_id}/{track_id}/{file_name}"))
    }
}

/// Provider double returning queued stem task statuses in order.
pub struct ScriptedProvider {
    responses: Mutex<Vec<StemTaskStatus>>,
    pub balance: f64,
    pub balance_calls: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(responses: Vec<StemTaskStatus>) -> Self {
        Self {
            responses: Mutex::new(responses),
            balance: 42.5,
            balance_calls: Mutex::new(0),
        }
    }

    pub fn balance_call_count(&self) -> usize {
        *self.balance_calls.lock().unwrap()
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    async fn query_stem_task(&self, _task_id: &str) -> Result<StemTaskStatus, ProviderError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(ProviderError::Api(500, "script exhausted".to_string()));
        }
        Ok(responses.remove(0))
    }

    async fn query_balance(&self) -> Result<f64, ProviderError> {
        *self.balance_calls.lock().unwrap() += 1;
        Ok(self.balance)
    }
}

/// In-memory state wired to the given doubles.
pub async fn test_state(
    storage: Arc<dyn ObjectStorage>,
    provider: Arc<dyn ProviderApi>,
) -> (SqlitePool, AppState) {
    let pool = tunesync_common::db::init_memory_pool().await.unwrap();
    schema::init_tables(&pool).await.unwrap();
    let state = AppState::new(pool.clone(), storage, provider, STORAGE.to_string());
    (pool, state)
}

/// Default state: recording storage, empty provider script.
pub async fn default_state() -> (SqlitePool, AppState, Arc<RecordingStorage>) {
    let storage = Arc::new(RecordingStorage::new());
    let provider = Arc::new(ScriptedProvider::new(Vec::new()));
    let (pool, state) = test_state(Arc::clone(&storage) as Arc<dyn ObjectStorage>, provider).await;
    (pool, state, storage)
}

/// Insert a pending track owning `task_id`.
pub async fn seed_track(pool: &SqlitePool, task_id: &str) -> Uuid {
    let track = tracks::Track::new("user-1", "musegen", task_id);
    tracks::insert_track(pool, &track).await.unwrap();
    track.id
}

/// POST a JSON body and return the response.
pub async fn post_json(app: Router, uri: &str, body: Value) -> Response<Body> {
    post_json_with_headers(app, uri, body, &[]).await
}

/// POST a JSON body with extra headers.
pub async fn post_json_with_headers(
    app: Router,
    uri: &str,
    body: Value,
    headers: &[(&str, &str)],
) -> Response<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let request = builder.body(Body::from(body.to_string())).unwrap();

    app.oneshot(request).await.unwrap()
}

/// Decode a response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Router over a fresh clone of the state.
pub fn app(state: &AppState) -> Router {
    build_router(state.clone())
}

/// Poll until the track has `count` version rows (the fan-out is
/// detached, so tests wait for it to land).
pub async fn wait_for_versions(
    pool: &SqlitePool,
    track_id: Uuid,
    count: usize,
) -> Vec<track_versions::TrackVersion> {
    for _ in 0..400 {
        let rows = track_versions::list_for_track(pool, track_id).await.unwrap();
        if rows.len() >= count {
            return rows;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("fan-out never persisted {count} versions for {track_id}");
}

/// Give detached fan-out tasks a moment to run when no row count change
/// is expected.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
