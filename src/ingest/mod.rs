//! Ingestion pipeline
//!
//! One crawl-and-process pass: a directory-walking producer feeds a pool of
//! workers over a bounded queue, each worker runs the per-file pipeline
//! (change detection, extraction, store routing, registry upsert), and a
//! collector logs progress. Queues are capacity 2N, so a stalled store
//! naturally slows the walker.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::config::Config;
use crate::extract;
use crate::metrics::Metrics;
use crate::models::{FileRecord, IocRecord, ScanStatus};
use crate::storage::blob::{self, BlobStore};
use crate::storage::bloom::BloomStore;
use crate::storage::clickhouse::ClickHouseStore;
use crate::storage::file_id;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);
const CONSOLIDATOR_QUEUE: usize = 10;

/// A file queued for processing.
#[derive(Debug, Clone)]
pub struct FileJob {
    pub file_path: PathBuf,
    pub file_size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Outcome of processing one file.
#[derive(Debug)]
pub struct ProcessOutcome {
    pub file_id: String,
    pub file_path: PathBuf,
    pub status: ScanStatus,
    pub ioc_count: usize,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Counters shared by every worker.
#[derive(Debug, Default)]
pub struct IngestStats {
    pub files_processed: AtomicU64,
    pub files_skipped: AtomicU64,
    pub files_failed: AtomicU64,
    pub iocs_extracted: AtomicU64,
    pub bytes_processed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub files_processed: u64,
    pub files_skipped: u64,
    pub files_failed: u64,
    pub iocs_extracted: u64,
    pub bytes_processed: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            files_processed: self.files_processed.load(Ordering::Relaxed),
            files_skipped: self.files_skipped.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            iocs_extracted: self.iocs_extracted.load(Ordering::Relaxed),
            bytes_processed: self.bytes_processed.load(Ordering::Relaxed),
        }
    }
}

/// Store handles and counters a worker needs; cheap to clone per task.
#[derive(Clone)]
struct WorkerContext {
    ch: ClickHouseStore,
    bloom: BloomStore,
    blob: BlobStore,
    metrics: Arc<Metrics>,
    stats: Arc<IngestStats>,
}

/// Drives one crawl-and-process pass over the data directory.
pub struct Ingestor {
    data_path: PathBuf,
    extensions: HashSet<String>,
    worker_count: usize,
    batch_size: usize,
    ctx: WorkerContext,
    cancel: CancellationToken,
    started: Instant,
}

impl Ingestor {
    pub fn new(
        config: &Config,
        ch: ClickHouseStore,
        bloom: BloomStore,
        blob: BlobStore,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            data_path: config.data_path.clone(),
            extensions: config.worker.extension_set(),
            worker_count: config.worker.count.max(1),
            batch_size: config.worker.batch_size,
            ctx: WorkerContext {
                ch,
                bloom,
                blob,
                metrics,
                stats: Arc::new(IngestStats::default()),
            },
            cancel: CancellationToken::new(),
            started: Instant::now(),
        }
    }

    /// Token observed by the walker; cancelling aborts enqueuing while
    /// workers drain what is already queued.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the pipeline to completion (or until cancelled and drained).
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            data_path = %self.data_path.display(),
            workers = self.worker_count,
            batch_size = self.batch_size,
            "starting ingestion"
        );

        let (jobs_tx, jobs_rx) = mpsc::channel::<FileJob>(self.worker_count * 2);
        let (results_tx, results_rx) = mpsc::channel::<ProcessOutcome>(self.worker_count * 2);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));

        let collector = tokio::spawn(collect_results(results_rx, self.ctx.stats.clone()));

        // Consolidation path: running, but nothing routes batches to it at
        // this revision; workers submit per-file batches directly.
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<IocRecord>>(CONSOLIDATOR_QUEUE);
        let consolidator = tokio::spawn(consolidate_batches(
            self.ctx.ch.clone(),
            self.ctx.metrics.clone(),
            batch_rx,
        ));

        let mut workers = Vec::with_capacity(self.worker_count);
        for id in 0..self.worker_count {
            workers.push(tokio::spawn(worker_loop(
                id,
                jobs_rx.clone(),
                results_tx.clone(),
                self.ctx.clone(),
            )));
        }
        drop(results_tx);

        let root = self.data_path.clone();
        let extensions = self.extensions.clone();
        let cancel = self.cancel.clone();
        let walker = tokio::task::spawn_blocking(move || crawl(&root, &extensions, jobs_tx, cancel));

        let enqueued = walker.await.context("walker task panicked")??;
        tracing::debug!(enqueued, "directory walk finished");

        for worker in workers {
            worker.await.context("worker task panicked")?;
        }
        collector.await.context("collector task panicked")?;

        drop(batch_tx);
        consolidator.await.context("consolidator task panicked")?;

        self.log_summary();
        Ok(())
    }

    fn log_summary(&self) {
        let snapshot = self.ctx.stats.snapshot();
        let elapsed = self.started.elapsed();
        let files_per_sec = snapshot.files_processed as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        tracing::info!(
            files_processed = snapshot.files_processed,
            files_skipped = snapshot.files_skipped,
            files_failed = snapshot.files_failed,
            iocs_extracted = snapshot.iocs_extracted,
            bytes_processed = snapshot.bytes_processed,
            duration_secs = elapsed.as_secs_f64(),
            files_per_sec,
            "ingestion complete"
        );
    }
}

// ==================== Directory Walk ====================

/// Depth-first walk of the root, enqueuing eligible files. Entries that fail
/// to stat are logged and skipped. Runs on a blocking thread.
fn crawl(
    root: &Path,
    extensions: &HashSet<String>,
    jobs: mpsc::Sender<FileJob>,
    cancel: CancellationToken,
) -> Result<u64> {
    let mut enqueued = 0u64;

    for entry in WalkDir::new(root) {
        if cancel.is_cancelled() {
            tracing::info!("crawl cancelled, aborting enqueue");
            break;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "error accessing path");
                continue;
            }
        };
        if entry.file_type().is_dir() {
            continue;
        }
        if !eligible(entry.path(), extensions) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!(error = %e, path = %entry.path().display(), "failed to stat file");
                continue;
            }
        };
        let last_modified = match metadata.modified() {
            Ok(t) => DateTime::<Utc>::from(t),
            Err(e) => {
                tracing::warn!(error = %e, path = %entry.path().display(), "failed to read mtime");
                continue;
            }
        };

        let job = FileJob {
            file_path: entry.into_path(),
            file_size: metadata.len(),
            last_modified,
        };
        if jobs.blocking_send(job).is_err() {
            // All workers are gone; nothing left to feed.
            break;
        }
        enqueued += 1;
    }

    Ok(enqueued)
}

/// A non-empty allow-list restricts enqueued files by extension; an empty
/// list admits everything.
fn eligible(path: &Path, extensions: &HashSet<String>) -> bool {
    if extensions.is_empty() {
        return true;
    }
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => extensions.contains(&format!(".{}", ext.to_lowercase())),
        None => false,
    }
}

// ==================== Workers ====================

async fn worker_loop(
    id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<FileJob>>>,
    results: mpsc::Sender<ProcessOutcome>,
    ctx: WorkerContext,
) {
    ctx.metrics.active_workers.inc();
    tracing::debug!(worker = id, "worker started");

    loop {
        // The lock is held only for the dequeue, so workers pull jobs
        // one at a time.
        let job = {
            let mut rx = jobs.lock().await;
            rx.recv().await
        };
        let Some(job) = job else { break };

        let outcome = process_file(&ctx, job).await;
        if results.send(outcome).await.is_err() {
            break;
        }
    }

    tracing::debug!(worker = id, "worker finished");
    ctx.metrics.active_workers.dec();
}

/// The per-file pipeline: change detection, read, extract, route, register.
async fn process_file(ctx: &WorkerContext, job: FileJob) -> ProcessOutcome {
    let started = Instant::now();
    let path_str = job.file_path.to_string_lossy().to_string();
    let fid = file_id(&path_str);

    // Idempotency check: equal mtime (second resolution) means skip, and the
    // skip returns before any registry write so terminal statuses survive.
    match ctx.ch.last_modified_of(&fid).await {
        Ok(Some(stored)) if stored.timestamp() == job.last_modified.timestamp() => {
            ctx.stats.files_skipped.fetch_add(1, Ordering::Relaxed);
            ctx.metrics.files_skipped.inc();
            return ProcessOutcome {
                file_id: fid,
                file_path: job.file_path,
                status: ScanStatus::Clean,
                ioc_count: 0,
                error: None,
                duration: started.elapsed(),
            };
        }
        Ok(_) => {}
        Err(e) => {
            // Absence and query failure both mean "treat as changed".
            tracing::debug!(error = %e, file = %path_str, "change detection query failed, treating as new");
        }
    }

    let content = match tokio::fs::read(&job.file_path).await {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(error = %e, file = %path_str, "failed to read file");
            return mark_failed(ctx, fid, &job, format!("read failed: {e}"), started).await;
        }
    };
    ctx.stats
        .bytes_processed
        .fetch_add(content.len() as u64, Ordering::Relaxed);
    ctx.metrics.bytes_processed.inc_by(content.len() as u64);

    let iocs = extract::scan(&content);
    let ioc_count = extract::count(&iocs);
    let now = Utc::now();

    let (status, blob_key) = if ioc_count > 0 {
        // Filter adds happen before the index insert: a crash in between
        // leaves only a benign false positive in the filter.
        for (ioc_type, values) in &iocs {
            ctx.metrics.record_iocs_extracted(ioc_type.as_str(), values.len());
            if let Err(e) = ctx.bloom.madd(values).await {
                tracing::warn!(error = %e, file = %path_str, "failed to add IOCs to Bloom filter");
            }
        }

        let records = extract::flatten(&iocs, &fid, now);
        let insert_started = Instant::now();
        if let Err(e) = ctx.ch.batch_insert_iocs(&records).await {
            tracing::error!(error = %e, file = %path_str, "failed to insert IOCs");
            return mark_failed(ctx, fid, &job, format!("index insert failed: {e}"), started)
                .await;
        }
        ctx.metrics
            .record_batch_insert(records.len(), insert_started.elapsed().as_secs_f64());
        ctx.stats
            .iocs_extracted
            .fetch_add(ioc_count as u64, Ordering::Relaxed);

        (ScanStatus::Infected, String::new())
    } else {
        let content_type = blob::content_type_for(&path_str);
        match ctx.blob.put(&fid, &content, content_type).await {
            Ok(upload) => {
                tracing::debug!(key = %upload.key, size = upload.size, "archived file body");
            }
            Err(e) => {
                tracing::warn!(error = %e, file = %path_str, "failed to archive file body");
                return mark_failed(ctx, fid, &job, format!("blob upload failed: {e}"), started)
                    .await;
            }
        }
        (ScanStatus::Misc, fid.clone())
    };

    let record = FileRecord {
        file_id: fid.clone(),
        file_path: path_str.clone(),
        file_size: job.file_size,
        last_modified: job.last_modified,
        scan_status: status,
        ioc_count: if status == ScanStatus::Infected {
            ioc_count as u32
        } else {
            0
        },
        blob_key,
        error_message: String::new(),
        processed_at: now,
        updated_at: now,
    };
    if let Err(e) = ctx.ch.upsert_file(&record).await {
        tracing::error!(error = %e, file = %path_str, "failed to update file registry");
        ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
        ctx.metrics.files_failed.inc();
    }

    ctx.stats.files_processed.fetch_add(1, Ordering::Relaxed);
    ctx.metrics.record_file_processed(status.as_str());

    ProcessOutcome {
        file_id: fid,
        file_path: job.file_path,
        status,
        ioc_count,
        error: None,
        duration: started.elapsed(),
    }
}

/// Record a per-file failure in the registry and counters; the pipeline
/// continues with the next file.
async fn mark_failed(
    ctx: &WorkerContext,
    fid: String,
    job: &FileJob,
    message: String,
    started: Instant,
) -> ProcessOutcome {
    let now = Utc::now();
    let record = FileRecord {
        file_id: fid.clone(),
        file_path: job.file_path.to_string_lossy().to_string(),
        file_size: job.file_size,
        last_modified: job.last_modified,
        scan_status: ScanStatus::Failed,
        ioc_count: 0,
        blob_key: String::new(),
        error_message: message.clone(),
        processed_at: now,
        updated_at: now,
    };
    if let Err(e) = ctx.ch.upsert_file(&record).await {
        tracing::warn!(error = %e, file_id = %fid, "failed to record failure in registry");
    }

    ctx.stats.files_failed.fetch_add(1, Ordering::Relaxed);
    ctx.metrics.files_failed.inc();
    ctx.metrics.record_file_processed(ScanStatus::Failed.as_str());

    ProcessOutcome {
        file_id: fid,
        file_path: job.file_path.clone(),
        status: ScanStatus::Failed,
        ioc_count: 0,
        error: Some(message),
        duration: started.elapsed(),
    }
}

// ==================== Collector & Consolidator ====================

async fn collect_results(mut results: mpsc::Receiver<ProcessOutcome>, stats: Arc<IngestStats>) {
    let start = tokio::time::Instant::now() + PROGRESS_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, PROGRESS_INTERVAL);

    loop {
        tokio::select! {
            outcome = results.recv() => {
                match outcome {
                    Some(outcome) if outcome.ioc_count > 0 => {
                        tracing::info!(
                            file = %outcome.file_path.display(),
                            file_id = %outcome.file_id,
                            status = %outcome.status,
                            ioc_count = outcome.ioc_count,
                            duration_ms = outcome.duration.as_millis() as u64,
                            "processed file with IOCs"
                        );
                    }
                    Some(outcome) if outcome.status == ScanStatus::Failed => {
                        tracing::warn!(
                            file = %outcome.file_path.display(),
                            error = outcome.error.as_deref().unwrap_or("unknown"),
                            "file processing failed"
                        );
                    }
                    Some(_) => {}
                    None => break,
                }
            }
            _ = ticker.tick() => {
                let s = stats.snapshot();
                tracing::info!(
                    processed = s.files_processed,
                    skipped = s.files_skipped,
                    failed = s.files_failed,
                    iocs = s.iocs_extracted,
                    bytes = s.bytes_processed,
                    "ingestion progress"
                );
            }
        }
    }
}

async fn consolidate_batches(
    ch: ClickHouseStore,
    metrics: Arc<Metrics>,
    mut batches: mpsc::Receiver<Vec<IocRecord>>,
) {
    while let Some(batch) = batches.recv().await {
        if batch.is_empty() {
            continue;
        }
        let started = Instant::now();
        match ch.batch_insert_iocs(&batch).await {
            Ok(()) => metrics.record_batch_insert(batch.len(), started.elapsed().as_secs_f64()),
            Err(e) => {
                tracing::error!(error = %e, count = batch.len(), "consolidated batch insert failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exts(list: &[&str]) -> HashSet<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn eligibility_respects_allow_list() {
        let allowed = exts(&[".txt", ".log"]);
        assert!(eligible(Path::new("/data/a.txt"), &allowed));
        assert!(eligible(Path::new("/data/A.LOG"), &allowed));
        assert!(!eligible(Path::new("/data/a.bin"), &allowed));
        assert!(!eligible(Path::new("/data/noext"), &allowed));
    }

    #[test]
    fn empty_allow_list_admits_everything() {
        let none = HashSet::new();
        assert!(eligible(Path::new("/data/a.bin"), &none));
        assert!(eligible(Path::new("/data/noext"), &none));
    }

    #[test]
    fn crawl_enqueues_only_eligible_files() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("nested");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();
        std::fs::write(sub.join("b.txt"), b"y").unwrap();
        std::fs::write(sub.join("c.bin"), b"z").unwrap();

        let (tx, mut rx) = mpsc::channel::<FileJob>(16);
        let enqueued = crawl(
            dir.path(),
            &exts(&[".log", ".txt"]),
            tx,
            CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(enqueued, 2);
        let mut paths = Vec::new();
        while let Ok(job) = rx.try_recv() {
            paths.push(job.file_path);
        }
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|p| {
            let ext = p.extension().unwrap().to_str().unwrap();
            ext == "log" || ext == "txt"
        }));
    }

    #[test]
    fn cancelled_crawl_enqueues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"x").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        let (tx, mut rx) = mpsc::channel::<FileJob>(16);
        let enqueued = crawl(dir.path(), &exts(&[".log"]), tx, cancel).unwrap();
        assert_eq!(enqueued, 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stats_snapshot_reflects_counters() {
        let stats = IngestStats::default();
        stats.files_processed.fetch_add(3, Ordering::Relaxed);
        stats.files_skipped.fetch_add(1, Ordering::Relaxed);
        let snap = stats.snapshot();
        assert_eq!(snap.files_processed, 3);
        assert_eq!(snap.files_skipped, 1);
        assert_eq!(snap.files_failed, 0);
    }
}
