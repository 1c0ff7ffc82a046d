//! Parallel catch-up for sources addressable by height.
//!
//! `[local_tip + 1, remote_tip - tip_pad]` is cut into contiguous ranges that
//! worker threads fetch, convert and store without claiming canonical heights.
//! The coordinator marks blocks processed strictly in height order, and only
//! across the prefix of ranges that have all completed. A broken parent link
//! stops the parallel phase; the single-threaded worker takes over from the
//! last processed block and handles the fork. Blocks a worker wrote that never
//! got processed are released before the parallel phase returns.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chainidx_adapter::{BlockContext, ChainAdapter, NativeBlock};
use chainidx_index::{BlockRecord, IndexStore, UpsertOutcome};
use chainidx_log::{log_debug, log_info, log_warn};
use chainidx_params::{hash256_to_hex, ChainKey, Hash256};
use chainidx_storage::KeyValueStore;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use tokio::runtime::Handle;
use tokio::sync::watch;

use crate::source::ChainSource;
use crate::status::{StatusBoard, SyncState};
use crate::sync::SyncError;

const RESULT_POLL: Duration = Duration::from_millis(200);

#[derive(Clone, Debug)]
pub struct RangeSyncConfig {
    pub threads: usize,
    pub range_size: u64,
    /// Blocks this close to the remote tip are left to the single-threaded worker.
    pub tip_pad: u64,
    pub max_attempts: u32,
    pub start_height: u64,
}

impl Default for RangeSyncConfig {
    fn default() -> Self {
        Self {
            threads: 4,
            range_size: 100,
            tip_pad: 100,
            max_attempts: 3,
            start_height: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeOutcome {
    NothingToDo,
    /// Every range was processed; the tip is at `tip`.
    Completed { tip: u64 },
    /// A parent link broke at `height`; blocks below it are processed.
    HandOff { height: u64 },
}

#[derive(Clone, Copy, Debug)]
struct RangeJob {
    index: usize,
    start: u64,
    end: u64,
}

#[derive(Clone, Copy, Debug)]
struct Link {
    height: u64,
    hash: Hash256,
    previous_hash: Hash256,
}

pub struct RangeSync {
    key: ChainKey,
    index: IndexStore<dyn KeyValueStore>,
    adapter: Arc<dyn ChainAdapter>,
    source: Arc<dyn ChainSource>,
    status: Arc<StatusBoard>,
    config: RangeSyncConfig,
    shutdown: watch::Receiver<bool>,
}

/// Splits `start..=end` into contiguous ranges of at most `size` heights.
fn split_ranges(start: u64, end: u64, size: u64) -> Vec<RangeJob> {
    let size = size.max(1);
    let mut out = Vec::new();
    let mut cursor = start;
    while cursor <= end {
        let last = cursor.saturating_add(size - 1).min(end);
        out.push(RangeJob {
            index: out.len(),
            start: cursor,
            end: last,
        });
        if last == u64::MAX {
            break;
        }
        cursor = last + 1;
    }
    out
}

impl RangeSync {
    pub fn new(
        key: ChainKey,
        index: IndexStore<dyn KeyValueStore>,
        adapter: Arc<dyn ChainAdapter>,
        source: Arc<dyn ChainSource>,
        status: Arc<StatusBoard>,
        config: RangeSyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            key,
            index,
            adapter,
            source,
            status,
            config,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<RangeOutcome, SyncError> {
        let tip = self.index.get_local_tip(&self.key)?;
        let remote = self.source.remote_tip().await?;
        let start = tip
            .as_ref()
            .map_or(self.config.start_height, |tip| tip.height + 1);
        let end = remote.saturating_sub(self.config.tip_pad);
        if end < start || remote < self.config.tip_pad {
            return Ok(RangeOutcome::NothingToDo);
        }
        log_info!(
            chain: self.key,
            "range sync of heights {start}..={end} on {} threads",
            self.config.threads
        );
        let handle = Handle::current();
        let parent_hash = tip.map(|tip| tip.hash);
        tokio::task::spawn_blocking(move || self.run_blocking(&handle, start, end, parent_hash))
            .await
            .map_err(|err| SyncError::Inconsistent(format!("range sync task: {err}")))?
    }

    fn run_blocking(
        &self,
        handle: &Handle,
        start: u64,
        end: u64,
        mut parent_hash: Option<Hash256>,
    ) -> Result<RangeOutcome, SyncError> {
        self.status.update_state(&self.key, SyncState::Fetching);
        let jobs = split_ranges(start, end, self.config.range_size);
        let total = jobs.len();
        let (job_tx, job_rx) = unbounded::<RangeJob>();
        let (result_tx, result_rx) = unbounded::<(RangeJob, Result<Vec<Link>, SyncError>)>();
        let (written_tx, written_rx) = unbounded::<(u64, Hash256)>();
        for job in &jobs {
            let _ = job_tx.send(*job);
        }
        let abort = AtomicBool::new(false);
        let threads = self.config.threads.max(1).min(total);

        let outcome = thread::scope(|scope| {
            for _ in 0..threads {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let written_tx = written_tx.clone();
                let abort = &abort;
                scope.spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        if abort.load(Ordering::Relaxed) {
                            break;
                        }
                        let result = self.ingest_range(handle, job, &written_tx);
                        if result_tx.send((job, result)).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(result_tx);
            drop(written_tx);

            let mut completed: BTreeMap<usize, Vec<Link>> = BTreeMap::new();
            let mut attempts = vec![0u32; total];
            let mut next = 0usize;
            let mut last_height = None;
            let outcome = 'coordinate: loop {
                if next == total {
                    break Ok(RangeOutcome::Completed {
                        tip: last_height.unwrap_or(end),
                    });
                }
                if *self.shutdown.borrow() {
                    break Err(SyncError::Shutdown);
                }
                let (job, result) = match result_rx.recv_timeout(RESULT_POLL) {
                    Ok(received) => received,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        break Err(SyncError::Inconsistent(
                            "range workers exited early".to_string(),
                        ))
                    }
                };
                match result {
                    Ok(links) => {
                        completed.insert(job.index, links);
                    }
                    Err(err) => {
                        attempts[job.index] += 1;
                        if attempts[job.index] >= self.config.max_attempts {
                            break Err(err);
                        }
                        log_warn!(
                            chain: self.key,
                            "range {}..={} failed (attempt {}): {err}",
                            job.start,
                            job.end,
                            attempts[job.index]
                        );
                        let _ = job_tx.send(job);
                        continue;
                    }
                }

                let mut broken = None;
                while let Some(links) = completed.remove(&next) {
                    match self.commit_links(&links, &mut parent_hash) {
                        Ok(Some(height)) => {
                            broken = Some(height);
                            break;
                        }
                        Ok(None) => {
                            last_height = links.last().map(|link| link.height).or(last_height);
                        }
                        Err(err) => break 'coordinate Err(err),
                    }
                    next += 1;
                }
                if let Some(height) = broken {
                    break Ok(RangeOutcome::HandOff { height });
                }
            };
            abort.store(true, Ordering::Relaxed);
            drop(job_tx);
            outcome
        });
        self.release_unprocessed(&written_rx);
        outcome
    }

    /// Undoes the writes of every stored block that did not get processed, so
    /// their spends do not linger on canonical coins.
    fn release_unprocessed(&self, written: &Receiver<(u64, Hash256)>) {
        let mut blocks: Vec<(u64, Hash256)> = written.try_iter().collect();
        blocks.sort_unstable_by(|a, b| b.cmp(a));
        blocks.dedup();
        let mut released = 0usize;
        for (height, hash) in blocks {
            match self.index.release_unprocessed(&self.key, &hash) {
                Ok(count) => released += count,
                Err(err) => log_warn!(
                    chain: self.key,
                    "could not release block {} at height {height}: {err}",
                    hash256_to_hex(&hash)
                ),
            }
        }
        if released > 0 {
            log_info!(
                chain: self.key,
                "released {released} transactions from unprocessed range blocks"
            );
        }
    }

    /// Marks a completed range processed in height order. Returns the height of
    /// the first block whose parent is not the block below it.
    fn commit_links(
        &self,
        links: &[Link],
        parent_hash: &mut Option<Hash256>,
    ) -> Result<Option<u64>, SyncError> {
        for link in links {
            if let Some(expected) = parent_hash {
                if link.previous_hash != *expected {
                    log_warn!(
                        chain: self.key,
                        "parent link broken at height {}; handing over to the single-threaded worker",
                        link.height
                    );
                    return Ok(Some(link.height));
                }
            }
            self.index.mark_processed(&self.key, &link.hash)?;
            self.status.set_tip(&self.key, link.height);
            *parent_hash = Some(link.hash);
        }
        Ok(None)
    }

    fn ingest_range(
        &self,
        handle: &Handle,
        job: RangeJob,
        written: &Sender<(u64, Hash256)>,
    ) -> Result<Vec<Link>, SyncError> {
        let blocks = handle.block_on(self.source.fetch_range(job.start, job.end))?;
        let expected = (job.end - job.start + 1) as usize;
        if blocks.len() != expected {
            return Err(SyncError::Inconsistent(format!(
                "range {}..={} returned {} blocks",
                job.start,
                job.end,
                blocks.len()
            )));
        }
        let mut parent: Option<BlockRecord> = match blocks.first() {
            Some(first) => self
                .index
                .block_by_hash(&self.key, &first.previous_hash())?
                .filter(|block| block.height + 1 == job.start),
            None => None,
        };
        let mut links = Vec::with_capacity(blocks.len());
        for (offset, native) in blocks.iter().enumerate() {
            let height = job.start + offset as u64;
            let link = Link {
                height,
                hash: native.hash(),
                previous_hash: native.previous_hash(),
            };
            let record = self.store_unprocessed(native, height, parent.take(), written)?;
            parent = Some(record);
            links.push(link);
        }
        log_debug!(chain: self.key, "stored range {}..={}", job.start, job.end);
        Ok(links)
    }

    fn store_unprocessed(
        &self,
        native: &NativeBlock,
        height: u64,
        parent: Option<BlockRecord>,
        written: &Sender<(u64, Hash256)>,
    ) -> Result<BlockRecord, SyncError> {
        // Within a range the previous block is the parent even if a fork split
        // them; the coordinator's link check catches that.
        let parent = parent.filter(|parent| parent.hash == native.previous_hash());
        let ctx = BlockContext {
            key: self.key.clone(),
            height,
            parent,
        };
        let converted = self.adapter.convert_block(native, &ctx)?;
        let outcome = self.index.upsert_block(&self.key, &converted.block)?;
        let _ = written.send((height, converted.block.hash));
        if let UpsertOutcome::CandidateReorg { processed_hash, .. } = outcome {
            return Err(SyncError::Inconsistent(format!(
                "height {height} already holds block {}",
                hash256_to_hex(&processed_hash)
            )));
        }
        self.index.upsert_transactions(&self.key, &converted.transactions)?;
        self.index.upsert_coins(&self.key, &converted.coins)?;
        self.index.apply_spends(&self.key, &converted.spends)?;
        Ok(converted.block)
    }
}
