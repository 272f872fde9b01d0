//! Indexer over the RocksDB store, without any witness connection.

use std::sync::Arc;

use gxb_core::constants::{META_PRUNED_THROUGH, META_SYNC_CURSOR};
use gxb_core::store::{KeyValueStore, Keyspace};
use gxb_core::types::SyncCursor;
use gxb_node_lib::indexer::{BlockIndexer, IndexerSettings};
use gxb_node_lib::storage::RocksStore;
use gxb_node_lib::testing::MockChain;

fn open(path: &std::path::Path) -> Arc<RocksStore> {
    Arc::new(RocksStore::open(path).unwrap())
}

#[tokio::test]
async fn index_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("index");
    let chain = MockChain::new();

    {
        let store = open(&path);
        let indexer = BlockIndexer::new(store.clone(), IndexerSettings::default());
        indexer.attach(chain.clone());
        indexer.init().await.unwrap();
        indexer.sync_to_block(8).await.unwrap();
        indexer.store().unwrap();
    }

    let store = open(&path);
    let indexer = BlockIndexer::new(store.clone(), IndexerSettings::default());
    assert_eq!(indexer.init().await.unwrap(), SyncCursor::new(8));

    let tx = indexer.transaction(&MockChain::txid(5, 2)).unwrap().unwrap();
    assert_eq!(tx.block_num, 5);
    assert_eq!(tx.trx_in_block, 2);
    assert_eq!(
        indexer.block_record(8).unwrap().unwrap().transaction_ids,
        MockChain::block(8).transaction_ids
    );
}

#[tokio::test]
async fn retention_keeps_rocksdb_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(&dir.path().join("index"));
    let chain = MockChain::new();
    let settings = IndexerSettings {
        initial_block: Some(100),
        retain_blocks: Some(10),
    };

    let indexer = BlockIndexer::new(store.clone(), settings);
    indexer.attach(chain.clone());
    indexer.init().await.unwrap();
    for target in [120, 135, 150] {
        indexer.sync_to_block(target).await.unwrap();
    }
    for height in 101..=140 {
        assert!(indexer.block_record(height).unwrap().is_none(), "height {height} should be pruned");
        assert!(indexer.transaction(&MockChain::txid(height, 0)).unwrap().is_none());
    }
    for height in 141..=150 {
        let record = indexer.block_record(height).unwrap().unwrap();
        for txid in &record.transaction_ids {
            assert!(store.get(Keyspace::Transactions, txid.as_bytes()).unwrap().is_some());
        }
    }
    assert!(store.get(Keyspace::Metadata, META_SYNC_CURSOR).unwrap().is_some());
    let marker = store.get(Keyspace::Metadata, META_PRUNED_THROUGH).unwrap().unwrap();
    assert_eq!(marker, 140u64.to_be_bytes());
}
