use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::{Column, KeyValueStore, Precondition, PrefixVisitor, StoreError, WriteBatch, WriteOp};

type MemoryStoreMap = BTreeMap<(Column, Vec<u8>), Vec<u8>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryStoreMap>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreMap>, StoreError> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }

    fn prefixed<'m>(
        map: &'m MemoryStoreMap,
        column: Column,
        prefix: &'m [u8],
    ) -> impl Iterator<Item = (&'m Vec<u8>, &'m Vec<u8>)> + 'm {
        map.range((column, prefix.to_vec())..)
            .take_while(move |((entry_column, key), _)| {
                *entry_column == column && key.starts_with(prefix)
            })
            .map(|((_, key), value)| (key, value))
    }
}

fn apply(map: &mut MemoryStoreMap, batch: &WriteBatch) {
    for op in batch.iter() {
        match op {
            WriteOp::Put { column, key, value } => {
                map.insert((*column, key.as_slice().to_vec()), value.as_slice().to_vec());
            }
            WriteOp::Delete { column, key } => {
                map.remove(&(*column, key.as_slice().to_vec()));
            }
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let guard = self.read()?;
        Ok(guard.get(&(column, key.to_vec())).cloned())
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.insert((column, key.to_vec()), value.to_vec());
        Ok(())
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        guard.remove(&(column, key.to_vec()));
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read()?;
        Ok(Self::prefixed(&guard, column, prefix)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        let guard = self.read()?;
        for (key, value) in Self::prefixed(&guard, column, prefix) {
            visitor(key.as_slice(), value.as_slice())?;
        }
        Ok(())
    }

    fn last_with_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>, StoreError> {
        let guard = self.read()?;
        Ok(Self::prefixed(&guard, column, prefix)
            .last()
            .map(|(key, value)| (key.clone(), value.clone())))
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut guard = self.write()?;
        apply(&mut guard, batch);
        Ok(())
    }

    fn commit_if(
        &self,
        preconditions: &[Precondition],
        batch: &WriteBatch,
    ) -> Result<bool, StoreError> {
        let mut guard = self.write()?;
        for precondition in preconditions {
            let current = guard.get(&(precondition.column, precondition.key.clone()));
            if current != precondition.expected.as_ref() {
                return Ok(false);
            }
        }
        apply(&mut guard, batch);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_with_prefix_stays_inside_prefix() {
        let store = MemoryStore::new();
        store.put(Column::Meta, b"a\x01", b"1").expect("put");
        store.put(Column::Meta, b"a\x02", b"2").expect("put");
        store.put(Column::Meta, b"b\x00", b"3").expect("put");
        store.put(Column::Cache, b"a\x09", b"4").expect("put");
        assert_eq!(
            store.last_with_prefix(Column::Meta, b"a").expect("last"),
            Some((b"a\x02".to_vec(), b"2".to_vec()))
        );
        assert_eq!(store.last_with_prefix(Column::Meta, b"c").expect("last"), None);
    }

    #[test]
    fn compare_and_swap_checks_current_value() {
        let store = MemoryStore::new();
        assert!(store
            .compare_and_swap(Column::Meta, b"k", None, b"v1")
            .expect("cas"));
        assert!(!store
            .compare_and_swap(Column::Meta, b"k", None, b"v2")
            .expect("cas"));
        assert!(store
            .compare_and_swap(Column::Meta, b"k", Some(b"v1"), b"v2")
            .expect("cas"));
        assert_eq!(store.get(Column::Meta, b"k").expect("get"), Some(b"v2".to_vec()));
    }
}
