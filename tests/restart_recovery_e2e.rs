//! Restart reconciliation: which on-disk indexes survive a new manager.

use std::path::Path;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::ServiceExt;

use vectoriadb::api::create_router;
use vectoriadb::config::{Config, ModeKind};
use vectoriadb::index::distance::Distance;
use vectoriadb::manager::catalog::{write_metadata_file, write_status_file, IndexState};
use vectoriadb::memory::MemoryBudgets;
use vectoriadb::IndexManager;

fn test_config(base_path: &Path, dimensions: usize, default_mode: ModeKind) -> Config {
    Config {
        dimensions,
        max_connections_per_vertex: 16,
        max_candidates_returned: 128,
        compression_ratio: 32,
        distance_multiplier: 1.0,
        index_building_max_memory: None,
        disk_cache_memory: None,
        base_path: base_path.to_path_buf(),
        default_mode,
    }
}

fn test_budgets() -> MemoryBudgets {
    MemoryBudgets {
        max_memory_consumption: 256 << 20,
        index_building: 128 << 20,
        disk_cache: 16 << 20,
    }
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    send(
        router,
        Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await
}

#[tokio::test]
async fn test_interrupted_build_is_not_loaded_and_cannot_be_dropped() {
    let dir = tempdir().unwrap();

    // Simulate a server killed mid-build: BUILDING persisted on disk.
    let index_dir = dir.path().join("indexes").join("a");
    std::fs::create_dir_all(&index_dir).unwrap();
    write_status_file(&index_dir, IndexState::Building).unwrap();
    write_metadata_file(&index_dir, Distance::L2).unwrap();

    let manager =
        IndexManager::new(test_config(dir.path(), 3, ModeKind::Build), test_budgets()).unwrap();
    let router = create_router(manager);

    let (status, body) = get(&router, "/v1/indexes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["index_names"], json!([]));

    let (status, _) = send(
        &router,
        Request::builder()
            .method("DELETE")
            .uri("/v1/indexes/a")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::PRECONDITION_FAILED);

    // The directory stays on disk for out-of-band removal.
    assert!(index_dir.exists());
}

#[tokio::test]
async fn test_built_index_survives_restart_and_serves_queries() {
    let dir = tempdir().unwrap();

    // First incarnation: create, upload, build.
    {
        let manager =
            IndexManager::new(test_config(dir.path(), 2, ModeKind::Build), test_budgets())
                .unwrap();
        let router = create_router(manager.clone());

        let (status, _) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/v1/indexes")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({"index_name": "a", "distance": "L2"}).to_string(),
                ))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let chunk = json!({"index_name": "a", "vector_components": [1.0, 2.0], "id": "2a"});
        let (status, _) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/v1/indexes/upload")
                .body(Body::from(format!("{chunk}\n")))
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(
            &router,
            Request::builder()
                .method("POST")
                .uri("/v1/indexes/a/build")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let mut built = false;
        for _ in 0..250 {
            let (_, body) = get(&router, "/v1/indexes/a/state").await;
            if body["state"] == "BUILT" {
                built = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(built, "index never reached BUILT");

        manager.shutdown().await;
    }

    // Second incarnation starts straight in search mode.
    let manager = IndexManager::new(
        test_config(dir.path(), 2, ModeKind::Search),
        test_budgets(),
    )
    .unwrap();
    let router = create_router(manager);

    let (status, body) = get(&router, "/v1/indexes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["index_names"], json!(["a"]));

    let (_, body) = get(&router, "/v1/indexes/a/state").await;
    assert_eq!(body["state"], "BUILT");

    let (status, body) = send(
        &router,
        Request::builder()
            .method("POST")
            .uri("/v1/indexes/a/search")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"k": 1, "vector_components": [1.0, 2.0]}).to_string(),
            ))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ids"], json!(["2a"]));
}

#[tokio::test]
async fn test_status_file_replace_is_crash_safe() {
    let dir = tempdir().unwrap();
    let index_dir = dir.path().join("indexes").join("a");
    std::fs::create_dir_all(&index_dir).unwrap();

    write_status_file(&index_dir, IndexState::Created).unwrap();
    write_status_file(&index_dir, IndexState::Uploaded).unwrap();

    // Leftover temp files from an aborted replace must not confuse the
    // reconciler; only the status file itself is read.
    std::fs::write(index_dir.join("status-partial.tmp"), "BUIL").unwrap();
    write_metadata_file(&index_dir, Distance::Cosine).unwrap();

    let manager =
        IndexManager::new(test_config(dir.path(), 3, ModeKind::Build), test_budgets()).unwrap();
    let router = create_router(manager);

    let (status, body) = get(&router, "/v1/indexes/a/state").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "UPLOADED");
}
