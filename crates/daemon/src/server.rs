//! JSON HTTP surface for the queue daemon.
//!
//! Thin routes over [`DaemonHandle`]. Every mutating route answers with an
//! array of result envelopes; `/json/queue` answers with a queue snapshot.

use crate::daemon::{DaemonHandle, OpResult, QueueSnapshot};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Deserialize;
use std::future::Future;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur when running the server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Query string of the add routes.
#[derive(Debug, Deserialize)]
pub struct AddParams {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default, rename = "deleteSource")]
    pub delete_source: Option<String>,
}

impl AddParams {
    fn delete_source(&self) -> bool {
        self.delete_source.as_deref().is_some_and(is_truthy)
    }
}

/// Checkbox-style flag values.
fn is_truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "true" | "1" | "on" | "yes"
    )
}

async fn get_queue(
    State(handle): State<DaemonHandle>,
) -> Result<Json<QueueSnapshot>, (StatusCode, Json<Vec<OpResult>>)> {
    handle.snapshot().await.map(Json).map_err(|e| {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(vec![OpResult::err(&e)]),
        )
    })
}

async fn add_job(
    State(handle): State<DaemonHandle>,
    Query(params): Query<AddParams>,
) -> Json<Vec<OpResult>> {
    let path = std::path::Path::new(&params.path);
    Json(vec![
        handle
            .add_job(path, &params.profile, params.delete_source())
            .await,
    ])
}

async fn add_folder(
    State(handle): State<DaemonHandle>,
    Query(params): Query<AddParams>,
) -> Json<Vec<OpResult>> {
    let path = std::path::Path::new(&params.path);
    Json(
        handle
            .add_folder(path, &params.profile, params.delete_source())
            .await,
    )
}

async fn readd_job(
    State(handle): State<DaemonHandle>,
    Path(job_id): Path<String>,
) -> Json<Vec<OpResult>> {
    Json(vec![handle.requeue(&job_id).await])
}

async fn remove_job(
    State(handle): State<DaemonHandle>,
    Path(job_id): Path<String>,
) -> Json<Vec<OpResult>> {
    Json(vec![handle.remove(&job_id).await])
}

async fn move_job(
    State(handle): State<DaemonHandle>,
    Path((job_id, new_index)): Path<(String, i64)>,
) -> Json<Vec<OpResult>> {
    Json(vec![handle.move_job(&job_id, new_index).await])
}

async fn clear_completed(State(handle): State<DaemonHandle>) -> Json<Vec<OpResult>> {
    Json(vec![handle.clear_completed().await])
}

/// Creates the axum Router with the queue routes
pub fn create_router(handle: DaemonHandle) -> Router {
    Router::new()
        .route("/json/queue", get(get_queue))
        .route("/json/add", get(add_job))
        .route("/json/add-folder", get(add_folder))
        .route("/json/readd/:job_id", get(readd_job))
        .route("/json/remove/:job_id", get(remove_job))
        .route("/json/move-job-to/:job_id/:new_index", get(move_job))
        .route("/json/clear-completed", get(clear_completed))
        .with_state(handle)
}

/// Serve the queue routes on `0.0.0.0:<port>` until `shutdown` resolves.
pub async fn run_server(
    handle: DaemonHandle,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let app = create_router(handle);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{Config, MainConfig};
    use crate::daemon::Daemon;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::collections::BTreeMap;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn router(dir: &TempDir) -> Router {
        let root = dir.path().join("media");
        std::fs::create_dir_all(&root).unwrap();
        let mut main = MainConfig::new(root, dir.path().join("out"));
        main.encoder = "/bin/sh".to_string();
        main.state_file = dir.path().join("config.json");
        let mut profiles = BTreeMap::new();
        profiles.insert("sh".to_string(), "{inputFile} {outputFile}.mkv".to_string());

        let (daemon, handle) = Daemon::new_without_checks(Config { main, profiles })
            .await
            .unwrap();
        daemon.spawn();
        create_router(handle)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(app: &Router, uri: &str) -> (StatusCode, T) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test]
    fn test_truthy_flags() {
        for value in ["true", "TRUE", "1", "on", "yes"] {
            assert!(is_truthy(value), "{}", value);
        }
        for value in ["", "false", "0", "off", "no", "maybe"] {
            assert!(!is_truthy(value), "{}", value);
        }
    }

    #[tokio::test]
    async fn test_empty_queue() {
        let dir = TempDir::new().unwrap();
        let app = router(&dir).await;

        let (status, snapshot): (_, QueueSnapshot) = get_json(&app, "/json/queue").await;
        assert_eq!(status, StatusCode::OK);
        assert!(snapshot.queued_jobs.is_empty());
        assert!(snapshot.completed_jobs.is_empty());
        assert!(snapshot.current_job.is_none());
    }

    #[tokio::test]
    async fn test_add_and_readd_routes() {
        let dir = TempDir::new().unwrap();
        let app = router(&dir).await;
        let source = dir.path().join("media").join("a.mkv");
        std::fs::write(&source, "echo 'Encode done!'\n").unwrap();

        let uri = format!("/json/add?path={}&profile=sh&deleteSource=off", source.display());
        let (status, results): (_, Vec<OpResult>) = get_json(&app, &uri).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(results.len(), 1);
        assert!(results[0].success, "{}", results[0].msg);
        let job_id = results[0].job_id.clone().unwrap();

        let mut done = false;
        for _ in 0..500 {
            let (_, snapshot): (_, QueueSnapshot) = get_json(&app, "/json/queue").await;
            if snapshot.completed_jobs.iter().any(|j| j.id == job_id) {
                done = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert!(done);
        assert!(source.exists());

        let (_, results): (_, Vec<OpResult>) =
            get_json(&app, "/json/readd/not-a-job").await;
        assert!(!results[0].success);
        assert_eq!(results[0].msg, "Job not found");
    }

    #[tokio::test]
    async fn test_add_rejects_relative_path() {
        let dir = TempDir::new().unwrap();
        let app = router(&dir).await;

        let (_, results): (_, Vec<OpResult>) =
            get_json(&app, "/json/add?path=relative.mkv&profile=sh").await;
        assert_eq!(
            results,
            vec![OpResult {
                success: false,
                msg: "Not an absolute path".to_string(),
                job_id: None,
            }]
        );

        let (_, results): (_, Vec<OpResult>) = get_json(&app, "/json/add?profile=sh").await;
        assert_eq!(results[0].msg, "Please provide a path");
    }

    #[tokio::test]
    async fn test_add_folder_without_media() {
        let dir = TempDir::new().unwrap();
        let app = router(&dir).await;
        let folder = dir.path().join("media").join("empty");
        std::fs::create_dir_all(&folder).unwrap();

        let uri = format!("/json/add-folder?path={}&profile=sh", folder.display());
        let (_, results): (_, Vec<OpResult>) = get_json(&app, &uri).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].msg, "No suitable files found");
    }

    #[tokio::test]
    async fn test_mutation_routes_on_unknown_ids() {
        let dir = TempDir::new().unwrap();
        let app = router(&dir).await;

        let (_, results): (_, Vec<OpResult>) = get_json(&app, "/json/remove/nope").await;
        assert_eq!(results[0].msg, "Job not found");

        let (_, results): (_, Vec<OpResult>) =
            get_json(&app, "/json/move-job-to/nope/3").await;
        assert!(!results[0].success);

        let (_, results): (_, Vec<OpResult>) = get_json(&app, "/json/clear-completed").await;
        assert!(results[0].success);
        assert_eq!(results[0].msg, "0 completed jobs cleared");
    }
}
