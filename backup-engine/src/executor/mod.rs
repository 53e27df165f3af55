//! Plan executor - Applies a change plan to the destination.
//!
//! Phases run in a fixed order: obstructions are removed first, then files
//! are transferred by a bounded pool of workers, then stale files are
//! deleted and finally empty directories are pruned. Every entry is isolated:
//! a failure is recorded in the report and the run carries on.

pub mod report;

pub use report::{BackupReport, EntryAction, EntryFailure, RunOutcome, SessionState};

use crate::compress::{self, ArchiveFormat, ArchiveGranularity, ArchiveMember};
use crate::config::CompressionConfig;
use crate::fs::FileRecord;
use crate::index::{FingerprintEntry, FingerprintStore};
use crate::progress::{format_bytes, ProgressTracker};
use crate::reconcile::ChangePlan;
use crate::transport::{Transport, STAGING_PREFIX};
use crate::utils::{EngineError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Execution settings derived from the validated configuration.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Maximum concurrent transfers or deletes
    pub workers: usize,
    /// Upper bound for a single transport operation
    pub transfer_timeout: Duration,
    pub compression: Option<CompressionConfig>,
    /// Where archives are built before upload
    pub staging_dir: PathBuf,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            transfer_timeout: Duration::from_secs(300),
            compression: None,
            staging_dir: std::env::temp_dir(),
        }
    }
}

/// Result of one entry task.
enum Outcome {
    Done { bytes: u64 },
    Failed(EntryFailure),
    /// Cancelled before the entry started
    NotStarted,
}

/// Everything a worker task needs, cheap to clone.
#[derive(Clone)]
struct Context {
    transport: Arc<dyn Transport>,
    store: Arc<Mutex<FingerprintStore>>,
    tracker: Arc<ProgressTracker>,
    cancel: CancellationToken,
    timeout: Duration,
}

/// Applies a [`ChangePlan`] through a [`Transport`].
pub struct Executor {
    transport: Arc<dyn Transport>,
    store: Arc<Mutex<FingerprintStore>>,
    options: ExecutorOptions,
    cancel_token: CancellationToken,
}

impl Executor {
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<Mutex<FingerprintStore>>,
        options: ExecutorOptions,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            store,
            options,
            cancel_token,
        }
    }

    /// Execute the plan. Fills the transfer, delete and failure fields of the
    /// returned report; planning figures are left to the caller.
    pub async fn execute(&self, plan: ChangePlan, tracker: Arc<ProgressTracker>) -> BackupReport {
        let mut report = BackupReport::default();
        let ctx = Context {
            transport: Arc::clone(&self.transport),
            store: Arc::clone(&self.store),
            tracker,
            cancel: self.cancel_token.clone(),
            timeout: self.options.transfer_timeout,
        };

        info!(
            "Starting execution: {} (workers: {}, compression: {})",
            plan,
            self.options.workers,
            self.options
                .compression
                .as_ref()
                .map_or_else(|| "off".to_string(), |c| c.format.to_string())
        );

        let ChangePlan {
            to_transfer,
            to_delete,
            obstructions,
            prune_dirs,
            forget,
            ..
        } = plan;

        self.remove_obstructions(&ctx, obstructions, &mut report).await;

        if !ctx.cancel.is_cancelled() {
            let records: Vec<FileRecord> = to_transfer.into_iter().map(|t| t.record).collect();
            let outcomes = match &self.options.compression {
                Some(compression) => {
                    // Archives and compressed files gain nothing from another pass
                    let (plain, packable): (Vec<FileRecord>, Vec<FileRecord>) = records
                        .into_iter()
                        .partition(|r| compress::is_precompressed(&r.relative_path));
                    if !plain.is_empty() {
                        debug!("Sending {} already compressed files as they are", plain.len());
                    }
                    let mut outcomes = self.transfer_each(&ctx, plain, None).await;
                    outcomes.extend(match compression.granularity {
                        ArchiveGranularity::Batch => self.transfer_batch(&ctx, compression.clone(), packable).await,
                        ArchiveGranularity::PerFile => {
                            self.transfer_each(&ctx, packable, Some(compression.clone())).await
                        }
                    });
                    outcomes
                }
                None => self.transfer_each(&ctx, records, None).await,
            };
            for outcome in outcomes {
                match outcome {
                    Outcome::Done { bytes } => {
                        report.transferred_files += 1;
                        report.transferred_bytes += bytes;
                    }
                    Outcome::Failed(failure) => report.failures.push(failure),
                    Outcome::NotStarted => {}
                }
            }
        }

        if !ctx.cancel.is_cancelled() {
            for outcome in self.delete_each(&ctx, to_delete).await {
                match outcome {
                    Outcome::Done { .. } => report.deleted_files += 1,
                    Outcome::Failed(failure) => report.failures.push(failure),
                    Outcome::NotStarted => {}
                }
            }
        }

        if !ctx.cancel.is_cancelled() {
            self.prune(&ctx, prune_dirs, &mut report).await;

            let mut store = ctx.store.lock().await;
            for path in &forget {
                store.remove(path);
            }
            if !forget.is_empty() {
                debug!("Forgot {} index entries gone from both ends", forget.len());
            }
        }

        report.cancelled = ctx.cancel.is_cancelled();
        if report.cancelled {
            info!(
                "Execution cancelled: {} transferred, {} deleted before stopping",
                report.transferred_files, report.deleted_files
            );
        }
        report
    }

    /// Serially remove destination entries whose type changed.
    async fn remove_obstructions(&self, ctx: &Context, obstructions: Vec<String>, report: &mut BackupReport) {
        for path in obstructions {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let transport = Arc::clone(&ctx.transport);
            let target = path.clone();
            match run_blocking(ctx.timeout, move || transport.remove_tree(&target)).await {
                Ok(()) => {
                    let removed = ctx.store.lock().await.remove_tree(&path);
                    debug!("Removed obstruction {} ({} index entries dropped)", path, removed);
                    report.replaced_entries += 1;
                    ctx.tracker.advance(&path, 0, false);
                }
                Err(e) => {
                    warn!("Failed to remove obstruction {}: {}", path, e);
                    ctx.tracker.advance(&path, 0, true);
                    report.record_failure(path, EntryAction::RemoveObstruction, e);
                }
            }
        }
    }

    /// One task per file: a plain upload, or a single-file archive when
    /// `per_file_archive` is set.
    async fn transfer_each(
        &self,
        ctx: &Context,
        records: Vec<FileRecord>,
        per_file_archive: Option<CompressionConfig>,
    ) -> Vec<Outcome> {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let staging_dir = self.options.staging_dir.clone();
        let mut handles: Vec<(String, u64, JoinHandle<Outcome>)> = Vec::with_capacity(records.len());

        for record in records {
            let ctx = ctx.clone();
            let sem = Arc::clone(&semaphore);
            let compression = per_file_archive.clone();
            let staging_dir = staging_dir.clone();
            let path = record.relative_path.clone();
            let size = record.size;

            let handle = tokio::spawn(async move {
                let Some(_permit) = acquire(&sem, &ctx.cancel).await else {
                    return Outcome::NotStarted;
                };
                match compression {
                    Some(compression) => {
                        let mut outcomes = transfer_archive(&ctx, compression, staging_dir, vec![record]).await;
                        outcomes.pop().unwrap_or(Outcome::NotStarted)
                    }
                    None => transfer_file(&ctx, record).await,
                }
            });
            handles.push((path, size, handle));
        }

        join_all(ctx, handles, EntryAction::Transfer).await
    }

    /// Everything in one archive.
    async fn transfer_batch(&self, ctx: &Context, compression: CompressionConfig, records: Vec<FileRecord>) -> Vec<Outcome> {
        if records.is_empty() || ctx.cancel.is_cancelled() {
            return Vec::new();
        }
        ctx.tracker.note(&format!("packing {} files", records.len()));
        transfer_archive(ctx, compression, self.options.staging_dir.clone(), records).await
    }

    async fn delete_each(&self, ctx: &Context, paths: Vec<String>) -> Vec<Outcome> {
        let semaphore = Arc::new(Semaphore::new(self.options.workers.max(1)));
        let mut handles = Vec::with_capacity(paths.len());

        for path in paths {
            let ctx = ctx.clone();
            let sem = Arc::clone(&semaphore);
            let task_path = path.clone();

            let handle = tokio::spawn(async move {
                let Some(_permit) = acquire(&sem, &ctx.cancel).await else {
                    return Outcome::NotStarted;
                };
                let transport = Arc::clone(&ctx.transport);
                let target = task_path.clone();
                match run_blocking(ctx.timeout, move || transport.delete(&target)).await {
                    Ok(()) => {
                        ctx.store.lock().await.remove(&task_path);
                        debug!("Deleted {}", task_path);
                        ctx.tracker.advance(&task_path, 0, false);
                        Outcome::Done { bytes: 0 }
                    }
                    Err(e) => {
                        warn!("Failed to delete {}: {}", task_path, e);
                        ctx.tracker.advance(&task_path, 0, true);
                        Outcome::Failed(EntryFailure {
                            path: task_path,
                            action: EntryAction::Delete,
                            error: e.to_string(),
                        })
                    }
                }
            });
            handles.push((path, 0, handle));
        }

        join_all(ctx, handles, EntryAction::Delete).await
    }

    /// Remove directories left empty, deepest first. A directory that cannot
    /// be removed only produces a warning.
    async fn prune(&self, ctx: &Context, dirs: Vec<String>, report: &mut BackupReport) {
        for dir in dirs {
            if ctx.cancel.is_cancelled() {
                return;
            }
            let transport = Arc::clone(&ctx.transport);
            let target = dir.clone();
            match run_blocking(ctx.timeout, move || transport.remove_dir(&target)).await {
                Ok(()) => {
                    report.pruned_dirs += 1;
                    ctx.tracker.advance(&dir, 0, false);
                }
                Err(e) => {
                    warn!("Failed to prune directory {}: {}", dir, e);
                    report.warnings.push(format!("could not remove directory {}: {}", dir, e));
                    ctx.tracker.advance(&dir, 0, false);
                }
            }
        }
    }
}

/// Wait for a worker slot unless the run is cancelled first.
async fn acquire<'a>(sem: &'a Semaphore, cancel: &CancellationToken) -> Option<tokio::sync::SemaphorePermit<'a>> {
    if cancel.is_cancelled() {
        return None;
    }
    let permit = tokio::select! {
        permit = sem.acquire() => permit.ok()?,
        _ = cancel.cancelled() => return None,
    };
    if cancel.is_cancelled() {
        return None;
    }
    Some(permit)
}

async fn join_all(ctx: &Context, handles: Vec<(String, u64, JoinHandle<Outcome>)>, action: EntryAction) -> Vec<Outcome> {
    let mut outcomes = Vec::with_capacity(handles.len());
    for (path, size, handle) in handles {
        match handle.await {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                warn!("Task for {} panicked: {}", path, e);
                ctx.tracker.advance(&path, size, true);
                outcomes.push(Outcome::Failed(EntryFailure {
                    path,
                    action,
                    error: format!("task failed: {}", e),
                }));
            }
        }
    }
    outcomes
}

/// Run a blocking transport call, bounded by `timeout`.
async fn run_blocking<T, F>(timeout: Duration, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    match tokio::time::timeout(timeout, tokio::task::spawn_blocking(op)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(EngineError::Io(std::io::Error::other(format!("blocking task failed: {}", e)))),
        Err(_) => Err(EngineError::Timeout(timeout.as_secs())),
    }
}

async fn transfer_file(ctx: &Context, record: FileRecord) -> Outcome {
    let transport = Arc::clone(&ctx.transport);
    let source = record.absolute_path.clone();
    let target = record.relative_path.clone();

    match run_blocking(ctx.timeout, move || transport.upload(&source, &target)).await {
        Ok(receipt) => {
            ctx.store.lock().await.commit(
                &record.relative_path,
                FingerprintEntry::new(receipt.fingerprint, receipt.bytes, record.modified),
            );
            debug!("Transferred {} ({} bytes)", record.relative_path, receipt.bytes);
            ctx.tracker.advance(&record.relative_path, record.size, false);
            Outcome::Done { bytes: receipt.bytes }
        }
        Err(e) => {
            warn!("Failed to transfer {}: {}", record.relative_path, e);
            ctx.tracker.advance(&record.relative_path, record.size, true);
            Outcome::Failed(EntryFailure {
                path: record.relative_path,
                action: EntryAction::Transfer,
                error: e.to_string(),
            })
        }
    }
}

/// Pack `records` into one archive, ship it and unpack it at the destination.
async fn transfer_archive(
    ctx: &Context,
    compression: CompressionConfig,
    staging_dir: PathBuf,
    records: Vec<FileRecord>,
) -> Vec<Outcome> {
    let format = compression.format;
    let level = compression.level;
    let known: HashMap<String, (u64, DateTime<Utc>)> = records
        .iter()
        .map(|r| (r.relative_path.clone(), (r.size, r.modified)))
        .collect();
    let members: Vec<ArchiveMember> = records
        .into_iter()
        .map(|r| ArchiveMember {
            source: r.absolute_path,
            relative_path: r.relative_path,
        })
        .collect();

    let built = tokio::task::spawn_blocking(move || compress::compress(&members, format, level, &staging_dir))
        .await
        .map_err(|e| EngineError::Compression(format!("archive task failed: {}", e)))
        .and_then(|result| result);
    let archive = match built {
        Ok(archive) => archive,
        Err(e) => {
            warn!("Failed to build archive: {}", e);
            return fail_all(ctx, known.into_iter().map(|(path, (size, _))| (path, size)), &e);
        }
    };

    let mut outcomes = Vec::with_capacity(known.len());
    for (path, reason) in &archive.failed {
        warn!("Failed to archive {}: {}", path, reason);
        let size = known.get(path).map_or(0, |(size, _)| *size);
        ctx.tracker.advance(path, size, true);
        outcomes.push(Outcome::Failed(EntryFailure {
            path: path.clone(),
            action: EntryAction::Transfer,
            error: reason.clone(),
        }));
    }
    if archive.packed.is_empty() {
        return outcomes;
    }

    let staged_name = format!("{}{}.{}", STAGING_PREFIX, uuid::Uuid::new_v4().simple(), format.extension());
    let shipped = ship_archive(ctx, archive.path().to_path_buf(), staged_name, format).await;

    let packed = archive.packed.clone();
    drop(archive);

    match shipped {
        Ok(()) => {
            let mut store = ctx.store.lock().await;
            for member in &packed {
                let modified = known.get(&member.relative_path).map_or_else(Utc::now, |(_, m)| *m);
                store.commit(
                    &member.relative_path,
                    FingerprintEntry::new(member.fingerprint, member.size, modified),
                );
            }
            drop(store);
            for member in packed {
                let size = known.get(&member.relative_path).map_or(member.size, |(s, _)| *s);
                ctx.tracker.advance(&member.relative_path, size, false);
                outcomes.push(Outcome::Done { bytes: member.size });
            }
            outcomes
        }
        Err(e) => {
            warn!("Failed to ship archive: {}", e);
            outcomes.extend(fail_all(
                ctx,
                packed.into_iter().map(|m| {
                    let size = known.get(&m.relative_path).map_or(m.size, |(s, _)| *s);
                    (m.relative_path, size)
                }),
                &e,
            ));
            outcomes
        }
    }
}

async fn ship_archive(ctx: &Context, local: PathBuf, staged_name: String, format: ArchiveFormat) -> Result<()> {
    let transport = Arc::clone(&ctx.transport);
    let name = staged_name.clone();
    let size = std::fs::metadata(&local).map(|m| m.len()).unwrap_or(0);
    ctx.tracker.note(&format!("uploading archive ({})", format_bytes(size)));
    let receipt = run_blocking(ctx.timeout, move || transport.upload(&local, &name)).await?;
    debug!("Uploaded archive {} ({} bytes)", staged_name, receipt.bytes);

    ctx.tracker.note("unpacking archive");
    let transport = Arc::clone(&ctx.transport);
    run_blocking(ctx.timeout, move || transport.unpack(&staged_name, format)).await
}

fn fail_all(ctx: &Context, entries: impl Iterator<Item = (String, u64)>, error: &EngineError) -> Vec<Outcome> {
    entries
        .map(|(path, size)| {
            ctx.tracker.advance(&path, size, true);
            Outcome::Failed(EntryFailure {
                path,
                action: EntryAction::Transfer,
                error: error.to_string(),
            })
        })
        .collect()
}
