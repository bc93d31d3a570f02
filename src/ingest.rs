//! Bounded-concurrency fetch→commit pipeline.
//!
//! Fetch workers run under a semaphore and hand snapshots to a single
//! batcher over a buffered channel. The batcher groups snapshots into
//! batches of `commit_size` and commits each batch as one version. It
//! flushes when the batch fills, when the channel closes, and on
//! cancellation: a cancelled pipeline still commits the snapshots it
//! already holds before exiting. Endpoint bookkeeping and scoring ride on
//! each committed batch best-effort.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

use crate::canonical;
use crate::errors::{MokuError, Result};
use crate::scoring::ScoreOptions;
use crate::store::{CommitOptions, CommitResult, Engine, Snapshot};

/// Fetch port: turns a URL into a snapshot. Implementations live outside
/// the engine (HTTP client, headless browser, fixture server).
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Snapshot>;
}

/// One URL the pipeline could not ingest.
#[derive(Debug, Clone)]
pub struct IngestFailure {
    pub url: String,
    pub error: String,
}

/// Outcome of one pipeline run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// Per-snapshot commit results, in commit order.
    pub committed: Vec<CommitResult>,
    pub failed: Vec<IngestFailure>,
}

/// Fetch `urls` with bounded concurrency and commit them in batches under
/// `message`-prefixed versions. Returns once every URL is fetched (or
/// failed) and every batch is committed, or earlier on cancellation.
pub async fn ingest(
    engine: Arc<Engine>,
    fetcher: Arc<dyn Fetcher>,
    urls: Vec<String>,
    message: impl Into<String>,
    cancel: CancellationToken,
) -> Result<IngestReport> {
    let message = message.into();
    if message.trim().is_empty() {
        return Err(MokuError::InvalidInput("empty commit message".to_string()));
    }
    let config = engine.config().ingest.clone();

    engine.add_endpoints(&urls, "ingest").await?;

    let (tx, rx) = mpsc::channel::<Snapshot>(config.commit_size.max(1) * 2);
    let batcher = tokio::spawn(run_batcher(
        Arc::clone(&engine),
        rx,
        config.commit_size.max(1),
        message,
        config.score_timeout,
        cancel.clone(),
    ));

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let mut workers = Vec::with_capacity(urls.len());
    for url in urls {
        let engine = Arc::clone(&engine);
        let fetcher = Arc::clone(&fetcher);
        let semaphore = Arc::clone(&semaphore);
        let tx = tx.clone();
        let cancel = cancel.clone();
        workers.push(tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return None;
            };
            if cancel.is_cancelled() {
                return None;
            }

            let canonical_url =
                canonical::canonicalize(&url, &engine.config().canonicalize).ok();
            if let Some(canonical_url) = &canonical_url {
                if let Err(e) = engine.mark_pending(canonical_url).await {
                    tracing::debug!("mark_pending {canonical_url}: {e}");
                }
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => return None,
                fetched = fetcher.fetch(&url) => fetched,
            };
            match fetched {
                Ok(snapshot) => {
                    if tx.send(snapshot).await.is_err() {
                        tracing::warn!("batcher gone before {url} could be queued");
                    }
                    None
                }
                Err(e) => {
                    let error = e.to_string();
                    if let Some(canonical_url) = &canonical_url {
                        if let Err(mark) = engine.mark_failed(canonical_url, &error).await {
                            tracing::debug!("mark_failed {canonical_url}: {mark}");
                        }
                    }
                    Some(IngestFailure { url, error })
                }
            }
        }));
    }
    drop(tx);

    let mut failed: Vec<IngestFailure> = join_all(workers)
        .await
        .into_iter()
        .filter_map(|joined| joined.ok().flatten())
        .collect();

    let (committed, mut commit_failures) = batcher
        .await
        .map_err(|e| MokuError::Storage(format!("batcher task failed: {e}")))?;
    failed.append(&mut commit_failures);

    Ok(IngestReport { committed, failed })
}

/// Single batcher: receives snapshots, groups them, commits, bookkeeps.
async fn run_batcher(
    engine: Arc<Engine>,
    mut rx: mpsc::Receiver<Snapshot>,
    commit_size: usize,
    message: String,
    score_timeout: std::time::Duration,
    cancel: CancellationToken,
) -> (Vec<CommitResult>, Vec<IngestFailure>) {
    let mut committed = Vec::new();
    let mut failures = Vec::new();
    let mut batch: Vec<Snapshot> = Vec::new();

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Some(snapshot) => {
                    batch.push(snapshot);
                    if batch.len() >= commit_size {
                        flush(&engine, &mut batch, &message, score_timeout, &mut committed, &mut failures).await;
                    }
                }
                None => break,
            },
        }
    }
    // Flush on both normal close and cancellation.
    flush(&engine, &mut batch, &message, score_timeout, &mut committed, &mut failures).await;

    (committed, failures)
}

/// Commit the pending batch as one version, then mark endpoints and score
/// best-effort.
async fn flush(
    engine: &Engine,
    batch: &mut Vec<Snapshot>,
    message: &str,
    score_timeout: std::time::Duration,
    committed: &mut Vec<CommitResult>,
    failures: &mut Vec<IngestFailure>,
) {
    if batch.is_empty() {
        return;
    }
    let snapshots = std::mem::take(batch);
    let urls: Vec<String> = snapshots.iter().map(|s| s.url.clone()).collect();

    match engine
        .commit_batch(snapshots, message, CommitOptions::default())
        .await
    {
        Ok(results) => {
            let version_id = results
                .first()
                .map(|r| r.version_id.clone())
                .unwrap_or_default();
            let canonicals: Vec<String> = results.iter().map(|r| r.url.clone()).collect();
            if let Err(e) = engine
                .mark_fetched_batch(&canonicals, &version_id, Utc::now())
                .await
            {
                tracing::warn!("endpoint bookkeeping for version {version_id} failed: {e}");
            }

            let options = ScoreOptions {
                timeout: score_timeout,
                ..Default::default()
            };
            for result in &results {
                if let Err(e) = engine.score_commit(result, &options).await {
                    tracing::warn!("scoring version {} failed: {e}", result.version_id);
                }
            }

            committed.extend(results);
        }
        Err(e) => {
            let error = e.to_string();
            tracing::error!("batch commit of {} snapshots failed: {error}", urls.len());
            for url in urls {
                failures.push(IngestFailure {
                    url,
                    error: error.clone(),
                });
            }
        }
    }
}
