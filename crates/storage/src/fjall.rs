use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fjall::PersistMode;
use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle};

use crate::{Column, KeyValueStore, Precondition, PrefixVisitor, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT_THRESHOLD: Duration = Duration::from_millis(500);
const SLOW_COMMIT_LOG_INTERVAL_SECS: u64 = 30;
const WRITE_BUFFER_HIGH_WATERMARK_PCT: u64 = 90;
const WRITE_BUFFER_RELIEF_COOLDOWN_SECS: u64 = 1;

static LAST_SLOW_COMMIT_LOG_SECS: AtomicU64 = AtomicU64::new(0);

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: Vec<PartitionHandle>,
    max_write_buffer_bytes: Option<u64>,
    last_pressure_relief_secs: AtomicU64,
    // Serializes conditional commits against plain writes.
    write_lock: Mutex<()>,
}

#[derive(Clone, Debug, Default)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub write_buffer_bytes: Option<u64>,
    pub journal_bytes: Option<u64>,
    pub fsync_ms: Option<u16>,
}

impl FjallOptions {
    fn apply_config(&self, mut config: Config) -> Config {
        if let Some(bytes) = self.cache_bytes {
            config = config.cache_size(bytes);
        }
        if let Some(bytes) = self.write_buffer_bytes {
            config = config.max_write_buffer_size(bytes);
        }
        if let Some(bytes) = self.journal_bytes {
            config = config.max_journaling_size(bytes);
        }
        if let Some(ms) = self.fsync_ms {
            config = config.fsync_ms(Some(ms));
        }
        config
    }
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let keyspace = options
            .apply_config(Config::new(path))
            .open()
            .map_err(map_err)?;
        let mut partitions = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            let handle = keyspace
                .open_partition(column.as_str(), PartitionCreateOptions::default())
                .map_err(map_err)?;
            partitions.push(handle);
        }
        Ok(Self {
            keyspace,
            partitions,
            max_write_buffer_bytes: options.write_buffer_bytes,
            last_pressure_relief_secs: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    fn partition(&self, column: Column) -> Result<&PartitionHandle, StoreError> {
        self.partitions
            .get(column.index())
            .ok_or_else(|| StoreError::Backend(format!("missing partition {}", column.as_str())))
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.write_lock.lock().map_err(|_| StoreError::Poisoned)
    }

    fn maybe_relieve_write_buffer_pressure(&self, touched: u32) {
        let Some(limit) = self.max_write_buffer_bytes.filter(|limit| *limit > 0) else {
            return;
        };
        let current = self.keyspace.write_buffer_size();
        if current < limit.saturating_mul(WRITE_BUFFER_HIGH_WATERMARK_PCT) / 100 {
            return;
        }
        let now = unix_secs();
        let last = self.last_pressure_relief_secs.load(Ordering::Relaxed);
        if now.saturating_sub(last) < WRITE_BUFFER_RELIEF_COOLDOWN_SECS {
            return;
        }
        self.last_pressure_relief_secs.store(now, Ordering::Relaxed);

        for column in Column::ALL {
            if touched & column.bit() == 0 {
                continue;
            }
            let Ok(partition) = self.partition(column) else {
                continue;
            };
            if matches!(partition.rotate_memtable(), Ok(true)) {
                chainidx_log::log_debug!(
                    "fjall write buffer at {current}B of {limit}B; rotated {} memtable",
                    column.as_str()
                );
                break;
            }
        }
    }

    fn commit_locked(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut touched: u32 = 0;
        let mut fjall_batch = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(PersistMode::Buffer));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    touched |= column.bit();
                    fjall_batch.insert(self.partition(*column)?, key.as_slice(), value.as_slice());
                }
                WriteOp::Delete { column, key } => {
                    touched |= column.bit();
                    fjall_batch.remove(self.partition(*column)?, key.as_slice());
                }
            }
        }
        self.maybe_relieve_write_buffer_pressure(touched);

        let commit_start = Instant::now();
        fjall_batch.commit().map_err(map_err)?;
        let elapsed = commit_start.elapsed();
        if elapsed >= SLOW_COMMIT_THRESHOLD {
            let now = unix_secs();
            let last = LAST_SLOW_COMMIT_LOG_SECS.load(Ordering::Relaxed);
            if now.saturating_sub(last) >= SLOW_COMMIT_LOG_INTERVAL_SECS
                && LAST_SLOW_COMMIT_LOG_SECS
                    .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
            {
                chainidx_log::log_warn!(
                    "fjall commit took {}ms (ops {}, write_buffer {}B, journals {})",
                    elapsed.as_millis(),
                    batch.len(),
                    self.keyspace.write_buffer_size(),
                    self.keyspace.journal_count(),
                );
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let partition = self.partition(column)?;
        let value = partition.get(key).map_err(map_err)?;
        Ok(value.map(|bytes| bytes.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        let _guard = self.lock_writes()?;
        partition.insert(key, value).map_err(map_err)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        let _guard = self.lock_writes()?;
        partition.remove(key).map_err(map_err)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let partition = self.partition(column)?;
        let mut results = Vec::new();
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            results.push((key.to_vec(), value.to_vec()));
        }
        Ok(results)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let partition = self.partition(column)?;
        for entry in partition.prefix(prefix) {
            let (key, value) = entry.map_err(map_err)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let partition = self.partition(column)?;
        match partition.prefix(prefix).next_back() {
            Some(entry) => {
                let (key, value) = entry.map_err(map_err)?;
                Ok(Some((key.to_vec(), value.to_vec())))
            }
            None => Ok(None),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let _guard = self.lock_writes()?;
        self.commit_locked(batch)
    }

    fn commit_if(
        &self,
        preconditions: &[Precondition],
        batch: &WriteBatch,
    ) -> Result<bool, StoreError> {
        let _guard = self.lock_writes()?;
        for precondition in preconditions {
            let current = self
                .partition(precondition.column)?
                .get(&precondition.key)
                .map_err(map_err)?;
            if current.as_deref() != precondition.expected.as_deref() {
                return Ok(false);
            }
        }
        self.commit_locked(batch)?;
        Ok(true)
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn map_err(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
