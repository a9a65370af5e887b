//! The index manager: control plane for every index on the node.
//!
//! # Concurrency model
//!
//! Every externally observable operation holds one permit of the
//! operation gate for its whole duration. Mode swaps and shutdown acquire
//! the entire permit budget, which drains all in-flight work before the
//! active resource set is replaced. The active [`Mode`] lives behind an
//! `ArcSwap`; because swaps only happen under a full drain, operations
//! never observe a half-constructed mode.

pub mod build;
pub mod catalog;
pub mod progress;
pub mod search;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::{Config, ModeKind};
use crate::error::{OpResult, Status};
use crate::index::distance::Distance;
use crate::memory::MemoryBudgets;

pub use build::{BuildMode, UploadChunk, UploadSession};
pub use catalog::{IndexCatalog, IndexState};
pub use progress::{BuildPhase, BuildProgress, ProgressTracker};
pub use search::SearchMode;

pub const MAXIMUM_UPLOADERS_COUNT: usize = 64;

/// Permit budget of the operation gate; effectively unbounded concurrency.
const OPERATION_PERMITS: u32 = 1 << 30;

const DRAIN_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const SEARCH_SWITCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const PROGRESS_PERIOD: Duration = Duration::from_secs(5);

/// State shared between the manager, the active mode and upload sessions.
pub(crate) struct ManagerCore {
    pub(crate) config: Config,
    pub(crate) budgets: MemoryBudgets,
    pub(crate) catalog: IndexCatalog,
    pub(crate) uploading: Mutex<HashSet<String>>,
    pub(crate) gate: Arc<Semaphore>,
    pub(crate) closed: AtomicBool,
    pub(crate) tracker: ProgressTracker,
}

pub(crate) enum Mode {
    Build(BuildMode),
    Search(SearchMode),
}

impl Mode {
    fn shutdown(&self) {
        match self {
            Mode::Build(build) => build.shutdown(),
            Mode::Search(search) => search.shutdown(),
        }
    }
}

pub struct IndexManager {
    core: Arc<ManagerCore>,
    mode: ArcSwap<Mode>,
    mode_lock: tokio::sync::Mutex<()>,
}

impl IndexManager {
    /// Construct the manager: ensure the directory tree, reconcile indexes
    /// found on disk and enter the configured default mode.
    ///
    /// Must run inside a tokio runtime; the progress tracker and the build
    /// worker are spawned here.
    pub fn new(config: Config, budgets: MemoryBudgets) -> Result<Arc<Self>> {
        let indexes_dir = config.indexes_path();
        std::fs::create_dir_all(&indexes_dir)
            .with_context(|| format!("creating {}", indexes_dir.display()))?;
        std::fs::create_dir_all(config.logs_path())?;

        let core = Arc::new(ManagerCore {
            catalog: IndexCatalog::default(),
            uploading: Mutex::new(HashSet::new()),
            gate: Arc::new(Semaphore::new(OPERATION_PERMITS as usize)),
            closed: AtomicBool::new(false),
            tracker: ProgressTracker::new(PROGRESS_PERIOD),
            config,
            budgets,
        });

        catalog::load_indexes_from_disk(&indexes_dir, &core.catalog)?;

        let mode = match core.config.default_mode {
            ModeKind::Build => Mode::Build(BuildMode::new(core.clone())),
            ModeKind::Search => Mode::Search(SearchMode::new(core.clone())),
        };

        tracing::info!(
            "Index manager initialized with parameters dimensions = {}, maxConnectionsPerVertex = {}, maxCandidatesReturned = {}, compressionRatio = {}, distanceMultiplier = {}, mode = {}",
            core.config.dimensions,
            core.config.max_connections_per_vertex,
            core.config.max_candidates_returned,
            core.config.compression_ratio,
            core.config.distance_multiplier,
            core.config.default_mode.as_str()
        );

        Ok(Arc::new(Self {
            core,
            mode: ArcSwap::from_pointee(mode),
            mode_lock: tokio::sync::Mutex::new(()),
        }))
    }

    async fn acquire_op(&self) -> OpResult<OwnedSemaphorePermit> {
        let permit = self
            .core
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("index manager is shut down"))?;
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("index manager is shut down"));
        }
        Ok(permit)
    }

    fn search_only() -> Status {
        Status::permission_denied("Index manager is in search mode")
    }

    pub async fn create_index(&self, index_name: &str, distance: Distance) -> OpResult<()> {
        let _permit = self.acquire_op().await?;
        let mode = self.mode.load_full();
        match &*mode {
            Mode::Build(build) => build.create_index(index_name, distance).await,
            Mode::Search(_) => Err(Self::search_only()),
        }
    }

    pub async fn trigger_index_build(&self, index_name: &str) -> OpResult<()> {
        let _permit = self.acquire_op().await?;
        let mode = self.mode.load_full();
        match &*mode {
            Mode::Build(build) => build.build_index(index_name).await,
            Mode::Search(_) => Err(Self::search_only()),
        }
    }

    /// Open an upload stream. The returned session owns an operation
    /// permit until it is completed, failed or dropped.
    pub async fn begin_upload(&self) -> OpResult<UploadSession> {
        let permit = self
            .core
            .gate
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Status::unavailable("index manager is shut down"))?;
        if self.core.closed.load(Ordering::SeqCst) {
            return Err(Status::unavailable("index manager is shut down"));
        }

        let mode = self.mode.load_full();
        match &*mode {
            Mode::Build(_) => Ok(UploadSession::new(self.core.clone(), permit)),
            Mode::Search(_) => Err(Self::search_only()),
        }
    }

    /// Register a build-progress listener.
    pub async fn build_status(&self) -> OpResult<mpsc::Receiver<BuildProgress>> {
        let _permit = self.acquire_op().await?;
        let mode = self.mode.load_full();
        match &*mode {
            Mode::Build(_) => Ok(self.core.tracker.subscribe()),
            Mode::Search(_) => Err(Self::search_only()),
        }
    }

    pub async fn retrieve_index_state(&self, index_name: &str) -> OpResult<IndexState> {
        let _permit = self.acquire_op().await?;
        self.core
            .catalog
            .state(index_name)
            .ok_or_else(|| Status::not_found(format!("Index {index_name} does not exist")))
    }

    /// Names of every index that is not BROKEN.
    pub async fn list_indexes(&self) -> OpResult<Vec<String>> {
        let _permit = self.acquire_op().await?;
        let mut names = self.core.catalog.list_non_broken();
        names.sort();
        Ok(names)
    }

    pub async fn find_nearest_neighbours(
        &self,
        index_name: &str,
        k: usize,
        query: Vec<f32>,
    ) -> OpResult<Vec<Vec<u8>>> {
        let _permit = self.acquire_op().await?;
        let mode = self.mode.load_full();
        let name = index_name.to_string();
        tokio::task::spawn_blocking(move || match &*mode {
            Mode::Search(search) => search.find_nearest(&name, k, &query),
            Mode::Build(_) => Err(Status::unavailable(
                "Index manager is in build mode. Please switch to search mode.",
            )),
        })
        .await
        .unwrap_or_else(|join_error| {
            Err(Status::Internal(anyhow!("search task failed: {join_error}")))
        })
    }

    pub async fn drop_index(&self, index_name: &str) -> OpResult<()> {
        let _permit = self.acquire_op().await?;
        let mode = self.mode.load_full();
        match &*mode {
            Mode::Build(build) => build.drop_index(index_name).await,
            Mode::Search(search) => search.drop_index(index_name),
        }
    }

    /// Swap to build mode. Refuses unless the drain barrier can be taken
    /// immediately; a no-op when build mode is already active.
    pub async fn switch_to_build_mode(&self) -> OpResult<()> {
        tracing::info!("Switching to build mode");
        let _mode_guard = self.mode_lock.lock().await;

        if matches!(&**self.mode.load(), Mode::Build(_)) {
            tracing::info!("Will not switch to build mode, because it is already active");
            return Ok(());
        }

        let drain = match self.core.gate.try_acquire_many(OPERATION_PERMITS) {
            Ok(drain) => drain,
            Err(_) => {
                let msg = "Failed to switch to build mode because of ongoing operations";
                tracing::error!("{msg}");
                return Err(Status::unavailable(msg));
            }
        };

        if self.core.closed.load(Ordering::SeqCst) {
            drop(drain);
            return Err(Status::unavailable("index manager is shut down"));
        }

        let outgoing = self.mode.load_full();
        outgoing.shutdown();
        self.mode
            .store(Arc::new(Mode::Build(BuildMode::new(self.core.clone()))));
        drop(drain);

        tracing::info!("Switched to build mode");
        Ok(())
    }

    /// Swap to search mode, waiting up to five seconds for the drain
    /// barrier; a no-op when search mode is already active.
    pub async fn switch_to_search_mode(&self) -> OpResult<()> {
        tracing::info!("Switching to search mode");
        let _mode_guard = self.mode_lock.lock().await;

        if matches!(&**self.mode.load(), Mode::Search(_)) {
            tracing::info!("Will not switch to search mode, because it is already active");
            return Ok(());
        }

        let drain = match tokio::time::timeout(
            SEARCH_SWITCH_DRAIN_TIMEOUT,
            self.core.gate.acquire_many(OPERATION_PERMITS),
        )
        .await
        {
            Ok(Ok(drain)) => drain,
            _ => {
                let msg = "Failed to switch to search mode because of ongoing operations";
                tracing::error!("{msg}");
                return Err(Status::unavailable(msg));
            }
        };

        if self.core.closed.load(Ordering::SeqCst) {
            drop(drain);
            return Err(Status::unavailable("index manager is shut down"));
        }

        let outgoing = self.mode.load_full();
        outgoing.shutdown();
        self.mode
            .store(Arc::new(Mode::Search(SearchMode::new(self.core.clone()))));
        drop(drain);

        tracing::info!("Switched to search mode");
        Ok(())
    }

    /// Drain every in-flight operation and close the node. Retries the
    /// drain every five seconds until it succeeds; every call after the
    /// first is a no-op.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down index manager");
        loop {
            match tokio::time::timeout(
                DRAIN_RETRY_INTERVAL,
                self.core.gate.acquire_many(OPERATION_PERMITS),
            )
            .await
            {
                Err(_elapsed) => {
                    tracing::warn!(
                        "Failed to acquire semaphore to shutdown index manager because of running operations. Will retry in 5 seconds"
                    );
                    continue;
                }
                Ok(Err(_)) => return,
                Ok(Ok(drain)) => {
                    if !self.core.closed.swap(true, Ordering::SeqCst) {
                        self.mode.load().shutdown();
                    }
                    drop(drain);
                    break;
                }
            }
        }
        tracing::info!("Shutdown of index manager completed");
    }
}
