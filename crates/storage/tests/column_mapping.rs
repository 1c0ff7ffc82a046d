use std::collections::HashSet;

use chainidx_storage::memory::MemoryStore;
use chainidx_storage::{Column, KeyValueStore, Precondition, WriteBatch};

#[test]
fn partition_names_and_bits_are_distinct() {
    let names: HashSet<_> = Column::ALL.iter().map(|column| column.as_str()).collect();
    assert_eq!(names.len(), Column::ALL.len());
    let mut touched = 0u32;
    for (idx, column) in Column::ALL.iter().copied().enumerate() {
        assert_eq!(column.index(), idx);
        assert_eq!(touched & column.bit(), 0, "{column:?} shares a bit");
        touched |= column.bit();
    }
}

#[test]
fn same_key_is_independent_per_column() {
    let store = MemoryStore::new();
    let mut batch = WriteBatch::new();
    for column in Column::ALL {
        batch.put(column, b"shared", column.as_str().as_bytes());
    }
    store.write_batch(&batch).expect("batch");

    store.delete(Column::Coins, b"shared").expect("delete");
    for column in Column::ALL {
        let value = store.get(column, b"shared").expect("get");
        if column == Column::Coins {
            assert_eq!(value, None);
        } else {
            assert_eq!(value.as_deref(), Some(column.as_str().as_bytes()));
        }
    }
}

#[test]
fn failed_precondition_leaves_every_column_untouched() {
    let store = MemoryStore::new();
    store
        .put(Column::CanonicalHeight, b"h7", b"first")
        .expect("claim");

    let mut batch = WriteBatch::new();
    batch.put(Column::CanonicalHeight, b"h7", b"second");
    batch.put(Column::Blocks, b"second", b"record");
    let claimed = store
        .commit_if(&[Precondition::absent(Column::CanonicalHeight, b"h7".to_vec())], &batch)
        .expect("commit_if");
    assert!(!claimed);
    assert_eq!(
        store.get(Column::CanonicalHeight, b"h7").expect("get"),
        Some(b"first".to_vec())
    );
    assert_eq!(store.get(Column::Blocks, b"second").expect("get"), None);
}
