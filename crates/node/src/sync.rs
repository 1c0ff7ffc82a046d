//! Single-threaded sync worker for one (chain, network).
//!
//! The worker compares the local tip with its source, pulls headers after a
//! locator, converts and stores each block, and claims its canonical height
//! last. A branch that does not extend the tip goes through fork choice and,
//! when it wins, a reorg that orphans the local blocks top down before
//! replaying the new branch.

use std::sync::Arc;
use std::time::Duration;

use chainidx_adapter::{BlockContext, ChainAdapter, ConversionError, ConvertedBlock, NativeBlock};
use chainidx_index::{BlockRecord, IndexError, IndexStore, UpsertOutcome};
use chainidx_log::{log_debug, log_error, log_info, log_warn};
use chainidx_params::{hash256_to_hex, ChainKey};
use chainidx_primitives::U256;
use chainidx_storage::KeyValueStore;
use tokio::sync::watch;

use crate::source::{Announcement, ChainSource, HeaderSummary, SourceError};
use crate::status::{Degraded, StatusBoard, SyncState};

const FETCH_BATCH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Conversion(#[from] ConversionError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("inconsistent chain data: {0}")]
    Inconsistent(String),
    #[error("equal-work fork {depth} blocks deep above height {ancestor_height}")]
    ForkTie { ancestor_height: u64, depth: u64 },
    #[error("shutdown requested")]
    Shutdown,
}

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Height assigned to the first block of an empty index.
    pub start_height: u64,
    pub tie_alarm_depth: u32,
    pub conversion_failure_limit: u32,
    pub announcement_wait: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl SyncConfig {
    pub fn new(tie_alarm_depth: u32) -> Self {
        Self {
            start_height: 0,
            tie_alarm_depth,
            conversion_failure_limit: 3,
            announcement_wait: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepOutcome {
    Advanced(u64),
    CaughtUp,
}

pub struct SyncWorker {
    key: ChainKey,
    index: IndexStore<dyn KeyValueStore>,
    adapter: Arc<dyn ChainAdapter>,
    source: Arc<dyn ChainSource>,
    status: Arc<StatusBoard>,
    state: watch::Sender<SyncState>,
    config: SyncConfig,
    shutdown: watch::Receiver<bool>,
    conversion_failures: u32,
}

fn branch_work(headers: &[HeaderSummary]) -> Option<U256> {
    headers
        .iter()
        .try_fold(U256::zero(), |acc, header| header.work.map(|work| acc.saturating_add(work)))
}

impl SyncWorker {
    pub fn new(
        key: ChainKey,
        index: IndexStore<dyn KeyValueStore>,
        adapter: Arc<dyn ChainAdapter>,
        source: Arc<dyn ChainSource>,
        status: Arc<StatusBoard>,
        config: SyncConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Idle);
        status.update_state(&key, SyncState::Idle);
        Self {
            key,
            index,
            adapter,
            source,
            status,
            state,
            config,
            shutdown,
            conversion_failures: 0,
        }
    }

    pub fn key(&self) -> &ChainKey {
        &self.key
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
        self.status.update_state(&self.key, state);
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn tip(&self) -> Result<Option<BlockRecord>, SyncError> {
        Ok(self.index.get_local_tip(&self.key)?)
    }

    /// Runs until shutdown is signalled. A fork tie pauses the worker until then.
    pub async fn run(mut self) -> Result<(), SyncError> {
        log_info!(chain: self.key, "sync worker started");
        if let Some(tip) = self.tip()? {
            self.status.set_tip(&self.key, tip.height);
        }
        let mut backoff = self.config.backoff_base;
        loop {
            if self.stopping() {
                break;
            }
            let result = match self.step().await {
                Ok(StepOutcome::CaughtUp) => {
                    self.set_state(SyncState::CaughtUp);
                    self.idle().await
                }
                other => other,
            };
            match result {
                Ok(_) => backoff = self.config.backoff_base,
                Err(SyncError::Shutdown) => break,
                Err(SyncError::ForkTie { .. }) => {
                    self.set_state(SyncState::Paused);
                    let mut shutdown = self.shutdown.clone();
                    while !*shutdown.borrow() {
                        if shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                    break;
                }
                Err(err) => {
                    let delay = self.on_error(err, &mut backoff).await;
                    if !self.pause_for(delay).await {
                        break;
                    }
                }
            }
        }
        self.set_state(SyncState::Stopped);
        log_info!(chain: self.key, "sync worker stopped");
        Ok(())
    }

    async fn pause_for(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(delay) => !self.stopping(),
            _ = shutdown.changed() => false,
        }
    }

    /// Classifies a failed step and returns how long to wait before the next one.
    async fn on_error(&mut self, err: SyncError, backoff: &mut Duration) -> Duration {
        match err {
            SyncError::Source(err) if err.is_transient() => {
                log_debug!(chain: self.key, "source unavailable: {err}");
                self.config.backoff_base
            }
            SyncError::Source(err) => {
                log_warn!(chain: self.key, "source served bad data: {err}");
                self.source.report_suspect(&err.to_string()).await;
                self.config.backoff_base
            }
            SyncError::Inconsistent(reason) => {
                log_warn!(chain: self.key, "{reason}");
                self.source.report_suspect(&reason).await;
                self.config.backoff_base
            }
            SyncError::Conversion(err) => {
                self.conversion_failures += 1;
                log_warn!(
                    chain: self.key,
                    "block conversion failed ({} in a row): {err}",
                    self.conversion_failures
                );
                self.source.report_suspect(&err.to_string()).await;
                if self.conversion_failures >= self.config.conversion_failure_limit {
                    log_error!(
                        chain: self.key,
                        "canonical blocks keep failing conversion: {err}"
                    );
                    self.status.set_degraded(
                        &self.key,
                        Degraded::ConversionFailures {
                            count: self.conversion_failures,
                            last_error: err.to_string(),
                        },
                    );
                }
                self.config.backoff_base
            }
            other => {
                self.set_state(SyncState::Errored);
                log_error!(chain: self.key, "sync step failed: {other}");
                let delay = *backoff;
                *backoff = (*backoff * 2).min(self.config.backoff_max);
                delay
            }
        }
    }

    /// One round against the source: headers, then blocks, until caught up
    /// with what the source announced.
    pub async fn step(&mut self) -> Result<StepOutcome, SyncError> {
        self.set_state(SyncState::Fetching);
        let tip = self.tip()?;
        let remote = self.source.remote_tip().await?;
        match &tip {
            Some(tip) if tip.height >= remote => Ok(StepOutcome::CaughtUp),
            _ => self.sync_headers(tip).await,
        }
    }

    async fn idle(&mut self) -> Result<StepOutcome, SyncError> {
        let source = Arc::clone(&self.source);
        let mut shutdown = self.shutdown.clone();
        let announcement = tokio::select! {
            _ = shutdown.changed() => return Err(SyncError::Shutdown),
            announcement = source.next_announcement(self.config.announcement_wait) => announcement?,
        };
        match announcement {
            Some(announcement) => self.handle_announcement(announcement).await,
            None => Ok(StepOutcome::CaughtUp),
        }
    }

    pub async fn handle_announcement(
        &mut self,
        announcement: Announcement,
    ) -> Result<StepOutcome, SyncError> {
        match announcement {
            Announcement::Tip(height) => {
                let tip = self.tip()?;
                if tip.as_ref().is_some_and(|tip| tip.height >= height) {
                    return Ok(StepOutcome::CaughtUp);
                }
                self.sync_headers(tip).await
            }
            Announcement::Blocks(hashes) => {
                let mut unknown = Vec::new();
                for hash in hashes {
                    let known = self
                        .index
                        .block_by_hash(&self.key, &hash)?
                        .is_some_and(|block| block.processed);
                    if !known {
                        unknown.push(hash);
                    }
                }
                if unknown.is_empty() {
                    return Ok(StepOutcome::CaughtUp);
                }
                self.set_state(SyncState::Fetching);
                let blocks = self.source.fetch_blocks(&unknown).await?;
                self.set_state(SyncState::Processing);
                let mut advanced = 0;
                for block in &blocks {
                    match self.tip()? {
                        Some(tip) if block.previous_hash() == tip.hash => {
                            self.ingest(block, Some(tip))?;
                            advanced += 1;
                        }
                        tip => {
                            log_debug!(
                                chain: self.key,
                                "announced block {} does not extend the tip",
                                hash256_to_hex(&block.hash())
                            );
                            return self.sync_headers(tip).await;
                        }
                    }
                }
                Ok(StepOutcome::Advanced(advanced))
            }
        }
    }

    async fn sync_headers(&mut self, tip: Option<BlockRecord>) -> Result<StepOutcome, SyncError> {
        let locator = match tip {
            Some(_) => self.index.locator(&self.key)?,
            None => Vec::new(),
        };
        let headers = self.source.headers_after(&locator).await?;
        if headers
            .windows(2)
            .any(|pair| pair[1].previous_hash != pair[0].hash)
        {
            return Err(SyncError::Inconsistent(
                "headers do not form a chain".to_string(),
            ));
        }
        let Some(tip) = tip else {
            if headers.is_empty() {
                return Ok(StepOutcome::CaughtUp);
            }
            return self.extend(None, &headers).await;
        };

        // A sparse locator can make the source repeat blocks we already hold.
        let mut skip = 0;
        for header in &headers {
            let processed = self
                .index
                .block_by_hash(&self.key, &header.hash)?
                .is_some_and(|block| block.processed);
            if !processed {
                break;
            }
            skip += 1;
        }
        let headers = &headers[skip..];
        let Some(first) = headers.first() else {
            return Ok(StepOutcome::CaughtUp);
        };
        if first.previous_hash == tip.hash {
            return self.extend(Some(tip), headers).await;
        }
        self.resolve_fork(tip, headers).await
    }

    async fn fetch_checked(&self, chunk: &[HeaderSummary]) -> Result<Vec<NativeBlock>, SyncError> {
        let hashes: Vec<_> = chunk.iter().map(|header| header.hash).collect();
        let blocks = self.source.fetch_blocks(&hashes).await?;
        if blocks.len() != hashes.len()
            || blocks
                .iter()
                .zip(&hashes)
                .any(|(block, hash)| block.hash() != *hash)
        {
            return Err(SyncError::Inconsistent(
                "source returned blocks other than requested".to_string(),
            ));
        }
        Ok(blocks)
    }

    async fn extend(
        &mut self,
        mut parent: Option<BlockRecord>,
        headers: &[HeaderSummary],
    ) -> Result<StepOutcome, SyncError> {
        let mut advanced = 0;
        for chunk in headers.chunks(FETCH_BATCH) {
            if self.stopping() {
                return Err(SyncError::Shutdown);
            }
            self.set_state(SyncState::Fetching);
            let blocks = self.fetch_checked(chunk).await?;
            self.set_state(SyncState::Processing);
            for block in &blocks {
                if self.stopping() {
                    return Err(SyncError::Shutdown);
                }
                parent = Some(self.ingest(block, parent.take())?);
                advanced += 1;
            }
        }
        Ok(StepOutcome::Advanced(advanced))
    }

    fn convert(
        &self,
        native: &NativeBlock,
        parent: Option<BlockRecord>,
    ) -> Result<ConvertedBlock, SyncError> {
        let height = match &parent {
            Some(parent) => parent.height + 1,
            None => self.config.start_height,
        };
        let ctx = BlockContext {
            key: self.key.clone(),
            height,
            parent,
        };
        Ok(self.adapter.convert_block(native, &ctx)?)
    }

    fn ingest(
        &mut self,
        native: &NativeBlock,
        parent: Option<BlockRecord>,
    ) -> Result<BlockRecord, SyncError> {
        let converted = self.convert(native, parent)?;
        self.store(&converted)
    }

    /// Writes a converted block. Claiming the canonical height comes last so a
    /// crash leaves at most an unprocessed block behind.
    fn store(&mut self, converted: &ConvertedBlock) -> Result<BlockRecord, SyncError> {
        let key = &self.key;
        let block = &converted.block;
        if let UpsertOutcome::CandidateReorg {
            height,
            processed_hash,
        } = self.index.upsert_block(key, block)?
        {
            return Err(SyncError::Inconsistent(format!(
                "height {height} already holds block {}",
                hash256_to_hex(&processed_hash)
            )));
        }
        self.index.upsert_transactions(key, &converted.transactions)?;
        self.index.upsert_coins(key, &converted.coins)?;
        self.index.apply_spends(key, &converted.spends)?;
        if let Err(err) = self.index.mark_processed(key, &block.hash) {
            if let Err(release) = self.index.release_unprocessed(key, &block.hash) {
                log_warn!(
                    chain: self.key,
                    "could not release unprocessed block {}: {release}",
                    hash256_to_hex(&block.hash)
                );
            }
            return Err(err.into());
        }

        if self.conversion_failures >= self.config.conversion_failure_limit {
            self.status.clear_degraded(key);
        }
        self.conversion_failures = 0;
        self.status.set_tip(key, block.height);
        log_debug!(
            chain: self.key,
            "processed block {} at height {}",
            hash256_to_hex(&block.hash),
            block.height
        );
        let mut record = block.clone();
        record.processed = true;
        Ok(record)
    }

    async fn resolve_fork(
        &mut self,
        tip: BlockRecord,
        headers: &[HeaderSummary],
    ) -> Result<StepOutcome, SyncError> {
        self.set_state(SyncState::ReorgDetected);
        let first = &headers[0];
        let ancestor = match self.index.block_by_hash(&self.key, &first.previous_hash)? {
            Some(block) if block.processed => block,
            _ => {
                return Err(SyncError::Inconsistent(format!(
                    "branch parent {} is not a processed block",
                    hash256_to_hex(&first.previous_hash)
                )))
            }
        };
        let depth = headers.len() as u64;
        let competing_tip = ancestor.height + depth;
        let ordering = match (tip.chainwork(), ancestor.chainwork(), branch_work(headers)) {
            (Some(local), Some(base), Some(branch)) => base.saturating_add(branch).cmp(&local),
            _ => competing_tip.cmp(&tip.height),
        };
        match ordering {
            std::cmp::Ordering::Less => {
                log_info!(
                    chain: self.key,
                    "ignoring weaker branch of {depth} blocks above height {}",
                    ancestor.height
                );
                Ok(StepOutcome::CaughtUp)
            }
            std::cmp::Ordering::Equal if depth >= u64::from(self.config.tie_alarm_depth) => {
                log_error!(
                    chain: self.key,
                    "fork tie: {depth} competing blocks above height {} carry the same work as the local chain; sync paused",
                    ancestor.height
                );
                self.status.set_degraded(
                    &self.key,
                    Degraded::ForkTie {
                        ancestor_height: ancestor.height,
                        local_tip: tip.height,
                        competing_tip,
                        depth,
                    },
                );
                Err(SyncError::ForkTie {
                    ancestor_height: ancestor.height,
                    depth,
                })
            }
            std::cmp::Ordering::Equal => {
                log_warn!(
                    chain: self.key,
                    "equal-work branch of {depth} blocks above height {}; keeping the first seen",
                    ancestor.height
                );
                Ok(StepOutcome::CaughtUp)
            }
            std::cmp::Ordering::Greater => self.reorg(tip, ancestor, headers).await,
        }
    }

    async fn reorg(
        &mut self,
        tip: BlockRecord,
        ancestor: BlockRecord,
        headers: &[HeaderSummary],
    ) -> Result<StepOutcome, SyncError> {
        log_warn!(
            chain: self.key,
            "reorganizing: {} blocks above height {} replaced by {}",
            tip.height - ancestor.height,
            ancestor.height,
            headers.len()
        );
        // The whole branch converts before anything local is detached.
        let mut branch = Vec::with_capacity(headers.len());
        let mut parent = ancestor.clone();
        for chunk in headers.chunks(FETCH_BATCH) {
            if self.stopping() {
                return Err(SyncError::Shutdown);
            }
            self.set_state(SyncState::Fetching);
            for block in self.fetch_checked(chunk).await? {
                let converted = self.convert(&block, Some(parent))?;
                parent = converted.block.clone();
                branch.push(converted);
            }
        }

        self.set_state(SyncState::Processing);
        let mut detached = 0;
        for height in (ancestor.height + 1..=tip.height).rev() {
            let Some(hash) = self.index.canonical_hash(&self.key, height)? else {
                continue;
            };
            detached += self.index.unconfirm_block_transactions(&self.key, &hash)?;
            self.index.mark_orphaned(&self.key, &hash)?;
        }
        for converted in &branch {
            self.store(converted)?;
        }
        log_info!(
            chain: self.key,
            "reorg complete at height {}: {} transactions returned to pending",
            ancestor.height + branch.len() as u64,
            detached
        );
        Ok(StepOutcome::Advanced(branch.len() as u64))
    }
}
