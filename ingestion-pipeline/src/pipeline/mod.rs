mod stages;
mod state;
mod workers;

pub use workers::AdaptiveWorkers;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use common::{
    backends::registry::BackendRegistry,
    error::AppError,
    storage::types::source::Source,
    utils::config::IngestConfig,
};
use globset::{Glob, GlobSet, GlobSetBuilder};
use storage_coordinator::StorageCoordinator;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::{
    chunker::{Chunker, ChunkerConfig},
    task::{TaskHandle, TaskRegistry, TaskSnapshot, TaskStatus},
    tracker::{FileTracker, IngestDecision},
    watcher::{FileEvent, FileWatcher},
};

use self::stages::FileContext;
use self::state::ready;

/// What happened to one file inside a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Written(usize),
    Unchanged,
    Skipped,
}

pub struct IngestionPipeline {
    coordinator: Arc<StorageCoordinator>,
    registry: Arc<BackendRegistry>,
    tracker: Arc<FileTracker>,
    chunker: Chunker,
    tasks: Arc<TaskRegistry>,
    workers: Arc<AdaptiveWorkers>,
    config: IngestConfig,
    ignore: GlobSet,
    shutdown: CancellationToken,
    watchers: std::sync::Mutex<Vec<FileWatcher>>,
}

impl IngestionPipeline {
    pub fn new(
        coordinator: Arc<StorageCoordinator>,
        registry: Arc<BackendRegistry>,
        config: IngestConfig,
    ) -> Arc<Self> {
        let tracker = Arc::new(FileTracker::new(Arc::clone(coordinator.db())));
        let workers = AdaptiveWorkers::new(config.workers);
        let ignore = build_ignore_set(&config.ignore_globs);

        Arc::new(Self {
            coordinator,
            registry,
            tracker,
            chunker: Chunker::new(ChunkerConfig::default()),
            tasks: Arc::new(TaskRegistry::new()),
            workers,
            config,
            ignore,
            shutdown: CancellationToken::new(),
            watchers: std::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn tracker(&self) -> &Arc<FileTracker> {
        &self.tracker
    }

    /// Start an ingestion task over the given roots; returns immediately
    /// with the task id. RPC threads never carry per-file work.
    pub fn ingest(
        self: &Arc<Self>,
        paths: Vec<PathBuf>,
        recursive: bool,
        watch: bool,
    ) -> Result<String, AppError> {
        if paths.is_empty() {
            return Err(AppError::Validation("ingest requires at least one path".into()));
        }

        let task = self.tasks.create();
        let task_id = task.snapshot().task_id.clone();

        if watch {
            self.start_watcher(paths.clone())?;
        }

        let pipeline = Arc::clone(self);
        let handle = Arc::clone(&task);
        tokio::spawn(async move {
            pipeline.run_task(handle, paths, recursive).await;
        });

        Ok(task_id)
    }

    pub fn status(&self, task_id: &str) -> Option<Arc<TaskSnapshot>> {
        self.tasks.get(task_id).map(|handle| handle.snapshot())
    }

    pub fn cancel(&self, task_id: &str) -> bool {
        self.tasks.cancel(task_id)
    }

    /// Deletion path: mark the source deleted and supersede its chunks.
    pub async fn remove_path(&self, path: &Path) -> Result<Vec<String>, AppError> {
        let source_id = Source::id_for_path(&path.to_string_lossy());
        let lock = self.tracker.source_lock(&source_id);
        let _guard = lock.lock().await;

        let chunk_ids = self.tracker.mark_deleted(path).await?;
        let pairs: Vec<(String, Option<String>)> =
            chunk_ids.iter().map(|id| (id.clone(), None)).collect();
        self.coordinator.supersede_chunks(&pairs).await?;

        info!(path = %path.display(), superseded = chunk_ids.len(), "source removed");
        Ok(chunk_ids)
    }

    /// Stop accepting work: cancel running tasks and stop watchers.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.cancel_all();
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }

    #[instrument(skip_all, fields(task_id = %task.snapshot().task_id))]
    async fn run_task(self: Arc<Self>, task: Arc<TaskHandle>, roots: Vec<PathBuf>, recursive: bool) {
        if !task.transition(TaskStatus::Running) {
            return;
        }

        let files = self.expand_paths(roots, recursive).await;
        task.set_total(files.len());
        info!(files = files.len(), "ingestion task started");

        let mut join_set: JoinSet<()> = JoinSet::new();
        let mut backpressure = self.coordinator.backpressure();

        for path in files {
            if task.is_cancelled() || self.shutdown.is_cancelled() {
                break;
            }

            // Reconcile queues above high-water pause dispatch entirely.
            while *backpressure.borrow_and_update() {
                let cancellation = task.cancellation();
                tokio::select! {
                    () = cancellation.cancelled() => break,
                    changed = backpressure.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            if task.is_cancelled() {
                break;
            }

            let Some(permit) = self.workers.acquire().await else {
                break;
            };
            let pipeline = Arc::clone(&self);
            let handle = Arc::clone(&task);
            join_set.spawn(async move {
                let _permit = permit;
                match pipeline.process_file(&path, &handle).await {
                    Ok(FileOutcome::Written(chunks)) => {
                        handle.record_file_done(chunks);
                        pipeline.workers.record_success();
                    }
                    Ok(FileOutcome::Unchanged | FileOutcome::Skipped) => {
                        handle.record_file_done(0);
                        pipeline.workers.record_success();
                    }
                    Err(AppError::Cancelled) => {
                        debug!(path = %path.display(), "file ingestion cancelled");
                    }
                    Err(err) => {
                        if err.is_retryable() {
                            pipeline.workers.record_pressure();
                        }
                        warn!(path = %path.display(), error = %err, "file ingestion failed");
                        handle.record_file_failed(&path.to_string_lossy(), err.to_string());
                    }
                }
            });
        }

        while join_set.join_next().await.is_some() {}

        let snapshot = task.snapshot();
        if snapshot.status == TaskStatus::Cancelled {
            info!("ingestion task cancelled");
            return;
        }

        let threshold = usize::from(self.config.failure_threshold_pct);
        let failed_task =
            snapshot.failed > 0 && snapshot.failed * 100 >= snapshot.total * threshold;
        task.transition(if failed_task {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        });
        info!(
            processed = snapshot.processed,
            written = snapshot.written,
            failed = snapshot.failed,
            "ingestion task finished"
        );
    }

    async fn process_file(
        &self,
        path: &Path,
        task: &TaskHandle,
    ) -> Result<FileOutcome, AppError> {
        let metadata = tokio::fs::metadata(path).await?;
        if metadata.len() > self.config.max_file_bytes {
            debug!(
                path = %path.display(),
                bytes = metadata.len(),
                "file exceeds size cap; skipping"
            );
            return Ok(FileOutcome::Skipped);
        }
        let file_mtime = metadata
            .modified()
            .ok()
            .and_then(|mtime| mtime.duration_since(UNIX_EPOCH).ok())
            .map(|elapsed| elapsed.as_millis() as i64)
            .unwrap_or(0);
        let bytes = tokio::fs::read(path).await?;

        // One ingestion per source at a time; the next generation waits for
        // this one's metadata commit.
        let source_id = Source::id_for_path(&path.to_string_lossy());
        let lock = self.tracker.source_lock(&source_id);
        let _guard = lock.lock().await;

        let cancel = task.cancellation();
        let mut ctx = FileContext::new(
            &self.tracker,
            &self.coordinator,
            &self.registry,
            &self.chunker,
            &cancel,
            stages::RetryPolicy::from_config(&self.config),
            path.to_path_buf(),
            bytes,
            file_mtime,
        );

        let machine = ready();
        let machine = stages::decide(machine, &mut ctx).await?;
        if matches!(ctx.decision, Some(IngestDecision::Unchanged)) {
            return Ok(FileOutcome::Unchanged);
        }

        let machine = stages::split(machine, &mut ctx)?;
        let machine = stages::embed(machine, &mut ctx).await?;
        let machine = stages::persist(machine, &mut ctx).await?;
        let _machine = stages::record(machine, &mut ctx).await?;

        let written = ctx.report.as_ref().map_or(0, |report| report.written);
        Ok(FileOutcome::Written(written))
    }

    async fn expand_paths(&self, roots: Vec<PathBuf>, recursive: bool) -> Vec<PathBuf> {
        let ignore = self.ignore.clone();
        let files = tokio::task::spawn_blocking(move || {
            let mut files = Vec::new();
            for root in roots {
                if root.is_file() {
                    files.push(root);
                    continue;
                }
                let max_depth = if recursive { usize::MAX } else { 1 };
                for entry in walkdir::WalkDir::new(&root)
                    .max_depth(max_depth)
                    .follow_links(false)
                    .into_iter()
                    .filter_map(Result::ok)
                {
                    if entry.file_type().is_file() {
                        files.push(entry.into_path());
                    }
                }
            }
            files.retain(|path| !ignore.is_match(path));
            files.sort();
            files.dedup();
            files
        })
        .await;

        match files {
            Ok(files) => files,
            Err(err) => {
                warn!(error = %err, "path expansion panicked; ingesting nothing");
                Vec::new()
            }
        }
    }

    fn start_watcher(self: &Arc<Self>, roots: Vec<PathBuf>) -> Result<(), AppError> {
        let (watcher, mut rx) =
            FileWatcher::spawn(&roots, Duration::from_millis(self.config.debounce_ms))?;
        self.watchers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(watcher);

        let pipeline = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = rx.recv() => {
                        let Some(event) = event else { break };
                        match event {
                            FileEvent::Changed(path) => {
                                if let Err(err) = pipeline.ingest(vec![path.clone()], false, false) {
                                    warn!(path = %path.display(), error = %err, "watch-triggered ingest failed");
                                }
                            }
                            FileEvent::Removed(path) => {
                                if let Err(err) = pipeline.remove_path(&path).await {
                                    warn!(path = %path.display(), error = %err, "watch-triggered removal failed");
                                }
                            }
                        }
                    }
                }
            }
        });

        Ok(())
    }
}

fn build_ignore_set(globs: &[String]) -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in globs {
        match Glob::new(pattern) {
            Ok(glob) => {
                builder.add(glob);
            }
            Err(err) => warn!(pattern, error = %err, "ignoring invalid ignore glob"),
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}
