//! Build mode: index creation, streaming uploads and the build pipeline.
//!
//! The build pipeline is deliberately single-slot: one queued index, one
//! worker, no parallel builds. Uploads are bounded by a process-wide
//! uploader budget; each upload stream is represented by an
//! [`UploadSession`] owning exactly one operation permit for its whole
//! lifetime.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;

use crate::error::{OpResult, Status};
use crate::index::builder;
use crate::index::datastore::DataStore;
use crate::index::distance::Distance;
use crate::manager::catalog::{write_metadata_file, write_status_file, IndexMetadata, IndexState};
use crate::manager::{ManagerCore, MAXIMUM_UPLOADERS_COUNT};

pub struct BuildMode {
    core: Arc<ManagerCore>,
    creation_lock: tokio::sync::Mutex<()>,
    build_queue: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
}

impl BuildMode {
    pub(crate) fn new(core: Arc<ManagerCore>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(build_worker(core.clone(), rx));

        Self {
            core,
            creation_lock: tokio::sync::Mutex::new(()),
            build_queue: parking_lot::Mutex::new(Some(tx)),
        }
    }

    pub async fn create_index(&self, index_name: &str, distance: Distance) -> OpResult<()> {
        let _guard = self.creation_lock.lock().await;

        if !self.core.catalog.insert_new(index_name) {
            let msg = format!("Index {index_name} already exists");
            tracing::error!("{msg}");
            return Err(Status::already_exists(msg));
        }

        match self.initialize_index(index_name, distance) {
            Ok(()) => {
                tracing::info!("Index {} created", index_name);
                Ok(())
            }
            Err(status) => {
                self.core.catalog.remove_metadata(index_name);
                tracing::error!("Failed to create index {}: {}", index_name, status);
                Err(status)
            }
        }
    }

    fn initialize_index(&self, index_name: &str, distance: Distance) -> OpResult<()> {
        let core = &self.core;
        let index_dir = core.config.indexes_path().join(index_name);
        std::fs::create_dir_all(&index_dir)
            .map_err(|e| Status::Internal(anyhow::Error::new(e).context("creating index directory")))?;

        write_status_file(&index_dir, IndexState::Creating).map_err(Status::Internal)?;
        core.catalog.put_metadata(
            index_name,
            IndexMetadata {
                distance,
                dir: index_dir.clone(),
            },
        );

        if !core
            .catalog
            .compare_and_set(index_name, IndexState::Creating, IndexState::Created)
        {
            let msg = format!("Failed to create index {index_name}");
            tracing::error!("{msg}");
            core.catalog.set_state(index_name, IndexState::Broken);
            let _ = write_status_file(&index_dir, IndexState::Broken);
            return Err(Status::Internal(anyhow!(msg)));
        }

        write_metadata_file(&index_dir, distance).map_err(Status::Internal)?;
        write_status_file(&index_dir, IndexState::Created).map_err(Status::Internal)?;
        Ok(())
    }

    pub async fn build_index(&self, index_name: &str) -> OpResult<()> {
        let transition = self.core.catalog.transition(index_name, |state| {
            matches!(state, IndexState::Uploaded | IndexState::Created)
                .then_some(IndexState::InBuildQueue)
        });

        let Some((previous, current)) = transition else {
            let msg = format!("Index {index_name} does not exist");
            tracing::error!("{msg}");
            return Err(Status::not_found(msg));
        };
        if previous == current {
            let msg = format!(
                "Index {index_name} is not in UPLOADED or CREATED state : {}",
                current.as_str()
            );
            tracing::error!("{msg}");
            return Err(Status::failed_precondition(msg));
        }

        let metadata = self
            .core
            .catalog
            .metadata(index_name)
            .ok_or_else(|| Status::Internal(anyhow!("no metadata for index {index_name}")))?;
        write_status_file(&metadata.dir, IndexState::InBuildQueue).map_err(Status::Internal)?;

        let sender = self.build_queue.lock().clone();
        let Some(sender) = sender else {
            return Err(Status::unavailable("build queue is shut down"));
        };
        sender
            .send(index_name.to_string())
            .await
            .map_err(|_| Status::unavailable("build queue is shut down"))?;
        Ok(())
    }

    pub async fn drop_index(&self, index_name: &str) -> OpResult<()> {
        let _guard = self.creation_lock.lock().await;

        let transition = self.core.catalog.transition(index_name, |state| {
            matches!(
                state,
                IndexState::Created | IndexState::Built | IndexState::Uploaded
            )
            .then_some(IndexState::Broken)
        });

        if transition.map(|(_, current)| current) != Some(IndexState::Broken) {
            let msg = format!("Index {index_name} is not in CREATED, UPLOADED or BUILT state");
            tracing::error!("{msg}");
            return Err(Status::failed_precondition(msg));
        }

        match self.remove_index_files(index_name) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.catalog.set_state(index_name, IndexState::Broken);
                tracing::error!("Failed to drop index {}: {}", index_name, e);
                Err(Status::Internal(e))
            }
        }
    }

    fn remove_index_files(&self, index_name: &str) -> anyhow::Result<()> {
        let metadata = self
            .core
            .catalog
            .metadata(index_name)
            .ok_or_else(|| anyhow!("no metadata for index {index_name}"))?;
        std::fs::remove_dir_all(&metadata.dir)?;
        self.core.catalog.remove(index_name);
        Ok(())
    }

    pub(crate) fn shutdown(&self) {
        self.build_queue.lock().take();
    }
}

async fn build_worker(core: Arc<ManagerCore>, mut queue: mpsc::Receiver<String>) {
    while let Some(index_name) = queue.recv().await {
        let permit = match core.gate.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if core.closed.load(Ordering::SeqCst) {
            return;
        }

        run_build_task(&core, &index_name).await;
        drop(permit);
    }
}

async fn run_build_task(core: &Arc<ManagerCore>, index_name: &str) {
    let Some(metadata) = core.catalog.metadata(index_name) else {
        tracing::warn!("No metadata for index {}, skipping build", index_name);
        return;
    };

    if !core
        .catalog
        .compare_and_set(index_name, IndexState::InBuildQueue, IndexState::Building)
    {
        tracing::warn!(
            "Failed to build index {} because it is not in IN_BUILD_QUEUE state",
            index_name
        );
        return;
    }

    if let Err(e) = write_status_file(&metadata.dir, IndexState::Building) {
        tracing::error!("Failed to update index status in FS: {}", e);
        core.catalog.set_state(index_name, IndexState::Broken);
        let _ = write_status_file(&metadata.dir, IndexState::Broken);
        return;
    }

    let build_core = core.clone();
    let build_metadata = metadata.clone();
    let name = index_name.to_string();
    let result = tokio::task::spawn_blocking(move || {
        builder::build_index(
            &name,
            build_core.config.dimensions,
            build_core.config.compression_ratio,
            build_core.config.distance_multiplier,
            &build_metadata.dir,
            &DataStore::data_location(&name, &build_metadata.dir),
            build_core.budgets.index_building,
            build_core.config.max_connections_per_vertex,
            build_core.config.max_candidates_returned,
            build_metadata.distance,
            &build_core.tracker,
        )
    })
    .await
    .unwrap_or_else(|join_error| Err(anyhow!("index builder task panicked: {join_error}")));

    match result {
        Ok(()) => {
            core.catalog.set_state(index_name, IndexState::Built);
            if let Err(e) = write_status_file(&metadata.dir, IndexState::Built) {
                tracing::error!("Failed to update index status in FS: {}", e);
                core.catalog.set_state(index_name, IndexState::Broken);
                let _ = write_status_file(&metadata.dir, IndexState::Broken);
            }
        }
        Err(e) => {
            tracing::error!("Failed to build index {}: {}", index_name, e);
            core.catalog.set_state(index_name, IndexState::Broken);
            let _ = write_status_file(&metadata.dir, IndexState::Broken);
        }
    }
}

/// One chunk of an upload stream.
#[derive(Debug, Clone)]
pub struct UploadChunk {
    pub index_name: String,
    pub vector_components: Vec<f32>,
    pub id: Vec<u8>,
}

/// Per-stream upload state.
///
/// The session owns one operation permit, released exactly once when the
/// session ends on any path. The first chunk binds the session to an
/// index; later chunks must carry the same name.
pub struct UploadSession {
    core: Arc<ManagerCore>,
    _permit: OwnedSemaphorePermit,
    index_name: Option<String>,
    store: Option<DataStore>,
    finished: bool,
}

impl UploadSession {
    pub(crate) fn new(core: Arc<ManagerCore>, permit: OwnedSemaphorePermit) -> Self {
        Self {
            core,
            _permit: permit,
            index_name: None,
            store: None,
            finished: false,
        }
    }

    pub fn on_chunk(&mut self, chunk: &UploadChunk) -> OpResult<()> {
        let dimensions = self.core.config.dimensions;
        if chunk.vector_components.len() != dimensions {
            let msg = format!(
                "Index {} has {} dimensions, but {} were provided",
                chunk.index_name,
                dimensions,
                chunk.vector_components.len()
            );
            tracing::error!("{msg}");
            return Err(Status::invalid_argument(msg));
        }

        match &self.index_name {
            None => self.begin_session(&chunk.index_name)?,
            Some(session_name) => {
                if chunk.index_name != *session_name {
                    let msg = format!(
                        "Index name mismatch: expected {session_name}, got {}",
                        chunk.index_name
                    );
                    tracing::error!("{msg}");
                    return Err(Status::failed_precondition(msg));
                }
                if self.core.catalog.state(session_name) != Some(IndexState::Uploading) {
                    let msg = format!("Index {session_name} is not in UPLOADING state");
                    tracing::error!("{msg}");
                    return Err(Status::failed_precondition(msg));
                }
            }
        }

        let Some(index_name) = self.index_name.clone() else {
            return Err(Status::Internal(anyhow!("upload session has no index")));
        };
        let Some(store) = self.store.as_mut() else {
            return Err(Status::Internal(anyhow!("upload session has no datastore")));
        };

        if let Err(e) = store.add(&chunk.vector_components, &chunk.id) {
            let msg = format!("Failed to add vector to index {index_name}");
            tracing::error!("{msg}: {e}");
            self.mark_broken(&index_name);
            return Err(Status::Internal(anyhow::Error::new(e).context(msg)));
        }
        Ok(())
    }

    fn begin_session(&mut self, index_name: &str) -> OpResult<()> {
        let core = self.core.clone();

        if !core
            .catalog
            .compare_and_set(index_name, IndexState::Created, IndexState::Uploading)
        {
            let msg = format!("Index {index_name} is not in CREATED state");
            tracing::error!("{msg}");
            return Err(Status::failed_precondition(msg));
        }

        let Some(metadata) = core.catalog.metadata(index_name) else {
            return Err(Status::Internal(anyhow!(
                "no metadata for index {index_name}"
            )));
        };
        if let Err(e) = write_status_file(&metadata.dir, IndexState::Uploading) {
            tracing::error!("Failed to update index status in FS: {}", e);
            return Err(Status::Internal(e));
        }

        {
            let mut uploading = core.uploading.lock();
            if !uploading.contains(index_name) {
                if uploading.len() == MAXIMUM_UPLOADERS_COUNT {
                    drop(uploading);
                    core.catalog.set_state(index_name, IndexState::Created);
                    if let Err(e) = write_status_file(&metadata.dir, IndexState::Created) {
                        tracing::error!("Failed to update index status in FS: {}", e);
                        return Err(Status::Internal(e));
                    }
                    return Err(Status::resource_exhausted("Maximum uploaders count reached"));
                }
                uploading.insert(index_name.to_string());
            }
        }

        match DataStore::create(index_name, core.config.dimensions, &metadata.dir) {
            Ok(store) => {
                self.store = Some(store);
                self.index_name = Some(index_name.to_string());
                Ok(())
            }
            Err(e) => {
                let msg = format!("Failed to create data store for index {index_name}");
                tracing::error!("{msg}: {e}");
                core.uploading.lock().remove(index_name);
                core.catalog.set_state(index_name, IndexState::Broken);
                let _ = write_status_file(&metadata.dir, IndexState::Broken);
                Err(Status::Internal(anyhow::Error::new(e).context(msg)))
            }
        }
    }

    /// Finish the stream: close the datastore and flip the index to
    /// UPLOADED. A stream that never carried a chunk is acknowledged as a
    /// no-op.
    pub fn complete(mut self) -> OpResult<()> {
        self.finished = true;
        let Some(index_name) = self.index_name.take() else {
            return Ok(());
        };

        self.core.uploading.lock().remove(&index_name);
        let metadata = self.core.catalog.metadata(&index_name);

        if let Some(store) = self.store.take() {
            if let Err(e) = store.close() {
                let msg = format!("Failed to close data store for index {index_name}");
                tracing::error!("{msg}: {e}");
                self.core.catalog.set_state(&index_name, IndexState::Broken);
                if let Some(metadata) = &metadata {
                    let _ = write_status_file(&metadata.dir, IndexState::Broken);
                }
                return Err(Status::Internal(anyhow::Error::new(e).context(msg)));
            }
        }

        self.core
            .catalog
            .set_state(&index_name, IndexState::Uploaded);
        if let Some(metadata) = &metadata {
            if let Err(e) = write_status_file(&metadata.dir, IndexState::Uploaded) {
                tracing::error!("Failed to update index status in FS: {}", e);
                self.core.catalog.set_state(&index_name, IndexState::Broken);
                let _ = write_status_file(&metadata.dir, IndexState::Broken);
                return Err(Status::Internal(e));
            }
        }
        Ok(())
    }

    /// Terminate the stream on an error path. Idempotent; marks the index
    /// BROKEN only when the session got far enough to bind one.
    pub fn fail(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;

        let Some(index_name) = self.index_name.take() else {
            self.store = None;
            return;
        };
        tracing::error!("Failed to upload vectors for index {index_name}");
        self.mark_broken(&index_name);
        self.core.uploading.lock().remove(&index_name);
        // Dropping the store closes the underlying file, best effort.
        self.store = None;
    }

    fn mark_broken(&self, index_name: &str) {
        self.core.catalog.set_state(index_name, IndexState::Broken);
        if let Some(metadata) = self.core.catalog.metadata(index_name) {
            if let Err(e) = write_status_file(&metadata.dir, IndexState::Broken) {
                tracing::error!("Failed to update index status in FS: {}", e);
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        // An abandoned session must not pin the uploader budget.
        if !self.finished {
            if let Some(index_name) = &self.index_name {
                self.core.uploading.lock().remove(index_name);
            }
        }
    }
}
