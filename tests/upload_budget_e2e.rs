//! Uploader budget, drain behavior and post-shutdown refusal.

use std::path::Path;

use tempfile::tempdir;

use vectoriadb::config::{Config, ModeKind};
use vectoriadb::manager::{IndexState, UploadChunk, MAXIMUM_UPLOADERS_COUNT};
use vectoriadb::memory::MemoryBudgets;
use vectoriadb::{IndexManager, Status};

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

fn chunk(index_name: &str, id: u8) -> UploadChunk {
    UploadChunk {
        index_name: index_name.to_string(),
        vector_components: vec![1.0],
        id: vec![id],
    }
}

#[tokio::test]
async fn test_uploader_budget_is_enforced() {
    let dir = tempdir().unwrap();
    let manager =
        IndexManager::new(test_config(dir.path(), 1, ModeKind::Build), test_budgets()).unwrap();

    for i in 0..=MAXIMUM_UPLOADERS_COUNT {
        let distance = "L2".parse().unwrap();
        manager
            .create_index(&format!("idx-{i}"), distance)
            .await
            .unwrap();
    }

    // Fill the budget with concurrent streams, one chunk each.
    let mut sessions = Vec::new();
    for i in 0..MAXIMUM_UPLOADERS_COUNT {
        let mut session = manager.begin_upload().await.unwrap();
        session.on_chunk(&chunk(&format!("idx-{i}"), i as u8)).unwrap();
        sessions.push(session);
    }

    // The budget is full: a stream for a fresh index is refused and the
    // index rolls back to CREATED.
    let overflow_name = format!("idx-{MAXIMUM_UPLOADERS_COUNT}");
    let mut overflow = manager.begin_upload().await.unwrap();
    let error = overflow
        .on_chunk(&chunk(&overflow_name, 0xFF))
        .unwrap_err();
    assert!(matches!(error, Status::ResourceExhausted(_)), "{error}");
    overflow.fail();

    assert_eq!(
        manager.retrieve_index_state(&overflow_name).await.unwrap(),
        IndexState::Created
    );

    // Draining one stream frees a slot.
    let freed = sessions.pop().unwrap();
    freed.complete().unwrap();

    let mut retry = manager.begin_upload().await.unwrap();
    retry.on_chunk(&chunk(&overflow_name, 0xFF)).unwrap();
    retry.complete().unwrap();
    assert_eq!(
        manager.retrieve_index_state(&overflow_name).await.unwrap(),
        IndexState::Uploaded
    );

    for session in sessions {
        session.complete().unwrap();
    }
}

#[tokio::test]
async fn test_completed_streams_flip_to_uploaded() {
    let dir = tempdir().unwrap();
    let manager =
        IndexManager::new(test_config(dir.path(), 1, ModeKind::Build), test_budgets()).unwrap();

    manager.create_index("a", "L2".parse().unwrap()).await.unwrap();

    let mut session = manager.begin_upload().await.unwrap();
    session.on_chunk(&chunk("a", 0x01)).unwrap();
    assert_eq!(
        manager.retrieve_index_state("a").await.unwrap(),
        IndexState::Uploading
    );

    session.complete().unwrap();
    assert_eq!(
        manager.retrieve_index_state("a").await.unwrap(),
        IndexState::Uploaded
    );
}

#[tokio::test]
async fn test_second_stream_for_same_index_is_rejected() {
    let dir = tempdir().unwrap();
    let manager =
        IndexManager::new(test_config(dir.path(), 1, ModeKind::Build), test_budgets()).unwrap();

    manager.create_index("a", "L2".parse().unwrap()).await.unwrap();

    let mut first = manager.begin_upload().await.unwrap();
    first.on_chunk(&chunk("a", 0x01)).unwrap();

    // The index is now UPLOADING, so a second stream fails its CAS.
    let mut second = manager.begin_upload().await.unwrap();
    let error = second.on_chunk(&chunk("a", 0x02)).unwrap_err();
    assert!(matches!(error, Status::FailedPrecondition(_)), "{error}");
    second.fail();

    // The original stream is unaffected.
    first.on_chunk(&chunk("a", 0x03)).unwrap();
    first.complete().unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_search_switch_times_out_while_upload_in_flight() {
    let dir = tempdir().unwrap();
    let manager =
        IndexManager::new(test_config(dir.path(), 1, ModeKind::Build), test_budgets()).unwrap();

    manager.create_index("a", "L2".parse().unwrap()).await.unwrap();

    let mut session = manager.begin_upload().await.unwrap();
    session.on_chunk(&chunk("a", 0x01)).unwrap();

    // The in-flight stream holds an operation permit, so the drain cannot
    // complete within its deadline.
    let error = manager.switch_to_search_mode().await.unwrap_err();
    assert!(matches!(error, Status::Unavailable(_)), "{error}");

    // Releasing the stream lets the swap through.
    session.complete().unwrap();
    manager.switch_to_search_mode().await.unwrap();
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() {
    let dir = tempdir().unwrap();
    let manager =
        IndexManager::new(test_config(dir.path(), 1, ModeKind::Build), test_budgets()).unwrap();

    manager.shutdown().await;

    let error = manager
        .create_index("a", "L2".parse().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(error, Status::Unavailable(_)), "{error}");

    let error = manager.list_indexes().await.unwrap_err();
    assert!(matches!(error, Status::Unavailable(_)), "{error}");

    let error = manager.switch_to_search_mode().await.unwrap_err();
    assert!(matches!(error, Status::Unavailable(_)), "{error}");

    // Shutdown is idempotent.
    manager.shutdown().await;
}
