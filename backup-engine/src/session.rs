//! Backup session orchestration.
//!
//! A [`BackupEngine`] runs one backup from a validated [`BackupConfig`]:
//! it connects the destination, scans and plans, executes the plan and
//! flushes the fingerprint index. Only start-up failures abort the run;
//! everything after that ends in a [`BackupReport`].

use crate::config::BackupConfig;
use crate::executor::{BackupReport, Executor, ExecutorOptions, SessionState};
use crate::fs::{ScanOptions, TreeScanner};
use crate::index::{FingerprintStore, StoreIdentity};
use crate::progress::{ProgressReporter, ProgressTracker};
use crate::reconcile::{ReconcileOptions, Reconciler};
use crate::transport::{self, Transport};
use crate::utils::{EngineError, Result};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct BackupEngine {
    config: BackupConfig,
    transport: Option<Arc<dyn Transport>>,
    cancel_token: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl BackupEngine {
    pub fn new(config: BackupConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Scanning);
        Self {
            config,
            transport: None,
            cancel_token: CancellationToken::new(),
            state,
        }
    }

    /// Use an already opened destination instead of connecting from the config.
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Stop starting new entries once `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Follow state transitions of the running session.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn enter(&self, state: SessionState) {
        info!("Session state: {}", state);
        self.state.send_replace(state);
    }

    fn abort(&self, err: EngineError) -> EngineError {
        error!("Backup aborted: {}", err);
        self.enter(SessionState::Aborted);
        err
    }

    /// Run the backup once.
    ///
    /// Returns `Err` only when the run could not start; entry failures and
    /// cancellation are reported in the returned report.
    pub async fn run(&self, reporter: Arc<dyn ProgressReporter>) -> Result<BackupReport> {
        let started = Instant::now();
        self.enter(SessionState::Scanning);

        let scan_options = ScanOptions {
            exclude_patterns: self.config.exclude.clone(),
        };
        let scanner = TreeScanner::new(&self.config.source, scan_options).map_err(|e| self.abort(e))?;

        let transport = self.open_transport().await.map_err(|e| self.abort(e))?;
        let listing = {
            let transport = Arc::clone(&transport);
            let task = tokio::task::spawn_blocking(move || transport.list());
            match tokio::time::timeout(self.config.transfer_timeout, task).await {
                Ok(Ok(Ok(listing))) => listing,
                Ok(Ok(Err(e))) => return Err(self.abort(EngineError::DestinationListing(e.to_string()))),
                Ok(Err(e)) => return Err(self.abort(EngineError::DestinationListing(e.to_string()))),
                Err(_) => {
                    return Err(self.abort(EngineError::DestinationListing(format!(
                        "timed out after {}s",
                        self.config.transfer_timeout.as_secs()
                    ))))
                }
            }
        };
        info!("Destination {} lists {} entries", transport.identity(), listing.len());

        self.enter(SessionState::Planning);
        let identity = StoreIdentity::new(&self.config.source, transport.identity());
        let state_dir = self.config.state_dir.clone();
        let options = ReconcileOptions {
            force_copy: self.config.force_copy,
            clean_artifacts: self.config.clean_artifacts,
            always_checksum: self.config.always_checksum,
        };
        let (store, plan) = tokio::task::spawn_blocking(move || {
            let mut store = FingerprintStore::load(&state_dir, identity);
            let plan = Reconciler::new(&mut store, options).plan(&scanner, &listing);
            (store, plan)
        })
        .await
        .map_err(|e| self.abort(EngineError::State(format!("planning task failed: {}", e))))?;

        let scanned_files = plan.scanned_files;
        let skipped_files = plan.to_skip.len();
        let skipped_bytes = plan.skipped_bytes;
        let scan_warnings = plan.scan_warnings.clone();
        for warning in &scan_warnings {
            warn!("Skipped source entry {}", warning);
        }

        let store = Arc::new(Mutex::new(store));
        let tracker = Arc::new(ProgressTracker::new(reporter, plan.work_items(), plan.transfer_bytes()));

        let mut report = if self.cancel_token.is_cancelled() {
            info!("Cancelled before execution");
            BackupReport {
                cancelled: true,
                ..Default::default()
            }
        } else {
            self.enter(SessionState::Executing);
            tracker.start();
            let executor = Executor::new(
                Arc::clone(&transport),
                Arc::clone(&store),
                self.executor_options(),
                self.cancel_token.clone(),
            );
            executor.execute(plan, Arc::clone(&tracker)).await
        };

        self.enter(SessionState::Flushing);
        {
            let store = store.lock().await;
            if let Err(e) = store.flush() {
                warn!("Failed to save fingerprint index {}: {}", store.path().display(), e);
                report
                    .warnings
                    .push(format!("fingerprint index not saved ({}); the next run will re-verify", e));
            }
        }

        report.scanned_files = scanned_files;
        report.skipped_files = skipped_files;
        report.skipped_bytes = skipped_bytes;
        report.scan_warnings = scan_warnings;
        report.duration = started.elapsed();
        report.state = SessionState::Done;
        self.enter(SessionState::Done);

        tracker.finish(&report);
        Ok(report)
    }

    async fn open_transport(&self) -> Result<Arc<dyn Transport>> {
        match &self.transport {
            Some(transport) => {
                let prepared = Arc::clone(transport);
                tokio::task::spawn_blocking(move || prepared.prepare())
                    .await
                    .map_err(|e| EngineError::DestinationUnreachable(e.to_string()))?
                    .map_err(|e| EngineError::DestinationUnreachable(e.to_string()))?;
                Ok(Arc::clone(transport))
            }
            None => transport::connect(&self.config.transport, self.config.connect_timeout).await,
        }
    }

    fn executor_options(&self) -> ExecutorOptions {
        ExecutorOptions {
            workers: self.config.workers,
            transfer_timeout: self.config.transfer_timeout,
            compression: self.config.compression.clone(),
            staging_dir: std::env::temp_dir(),
        }
    }
}
