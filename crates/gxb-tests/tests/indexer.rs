//! Block indexer guarantees: idempotence, monotonicity, crash recovery.

use std::sync::Arc;

use proptest::prelude::*;

use gxb_core::constants::META_SYNC_CURSOR;
use gxb_core::store::{height_key, KeyValueStore, Keyspace, MemoryStore};
use gxb_core::types::SyncCursor;
use gxb_node_lib::indexer::{BlockIndexer, IndexerSettings};
use gxb_node_lib::testing::MockChain;
use gxb_tests::helpers::*;

fn indexer_over(store: Arc<dyn KeyValueStore>, chain: &Arc<MockChain>) -> BlockIndexer {
    let indexer = BlockIndexer::new(store, IndexerSettings::default());
    indexer.attach(chain.clone());
    indexer
}

fn snapshot(store: &MemoryStore, height: u64) -> (Vec<u8>, Vec<Vec<u8>>) {
    let block = store.get(Keyspace::Blocks, &height_key(height)).unwrap().unwrap();
    let txs = MockChain::block(height)
        .transaction_ids
        .iter()
        .map(|id| store.get(Keyspace::Transactions, id.as_bytes()).unwrap().unwrap())
        .collect();
    (block, txs)
}

#[tokio::test]
async fn repeated_and_stale_targets_write_nothing() {
    let chain = MockChain::new();
    let store = Arc::new(MemoryStore::new());
    let indexer = indexer_over(store.clone(), &chain);
    indexer.init().await.unwrap();

    indexer.sync_to_block(7).await.unwrap();
    let writes = store.write_count();
    let fetched = chain.fetched().len();

    for target in [7, 7, 3, 0] {
        assert_eq!(indexer.sync_to_block(target).await.unwrap(), 7);
    }
    assert_eq!(store.write_count(), writes);
    assert_eq!(chain.fetched().len(), fetched);
}

#[tokio::test]
async fn crash_before_cursor_write_reindexes_identically() {
    let chain = MockChain::new();
    let inner = store_at(0);
    let crashing: Arc<dyn KeyValueStore> = Arc::new(CrashingStore::new(inner.clone(), 3));

    let indexer = indexer_over(crashing, &chain);
    indexer.init().await.unwrap();
    assert!(indexer.sync_to_block(5).await.is_err());

    // Block 3's records made it to disk; the cursor did not.
    let persisted = inner.get(Keyspace::Metadata, META_SYNC_CURSOR).unwrap().unwrap();
    assert_eq!(SyncCursor::from_bytes(&persisted).unwrap(), SyncCursor::new(2));
    let before = snapshot(&inner, 3);

    // Restart over the same data.
    let restarted = indexer_over(inner.clone(), &chain);
    assert_eq!(restarted.init().await.unwrap(), SyncCursor::new(2));
    assert_eq!(restarted.sync_to_block(5).await.unwrap(), 5);

    assert_eq!(snapshot(&inner, 3), before);
    assert_eq!(chain.fetched(), vec![1, 2, 3, 3, 4, 5]);
}

#[tokio::test]
async fn concurrent_runs_never_skip_or_repeat() {
    let chain = MockChain::new();
    let indexer = Arc::new(indexer_over(Arc::new(MemoryStore::new()), &chain));
    indexer.init().await.unwrap();

    let mut runs = Vec::new();
    for target in [4, 9, 2, 9, 6, 12] {
        let indexer = Arc::clone(&indexer);
        runs.push(tokio::spawn(async move { indexer.sync_to_block(target).await }));
    }
    for run in runs {
        run.await.unwrap().unwrap();
    }

    assert_eq!(indexer.cursor(), Some(SyncCursor::new(12)));
    assert_eq!(chain.fetched(), (1..=12).collect::<Vec<_>>());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn cursor_tracks_highest_target(start in 0u64..20, targets in proptest::collection::vec(0u64..60, 1..12)) {
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let chain = MockChain::new();
            let store = store_at(start);
            let indexer = indexer_over(store.clone(), &chain);
            indexer.init().await.unwrap();

            let mut previous = start;
            for &target in &targets {
                let cursor = indexer.sync_to_block(target).await.unwrap();
                prop_assert!(cursor >= previous);
                previous = cursor;
            }

            let expected = targets.iter().copied().fold(start, u64::max);
            prop_assert_eq!(indexer.cursor(), Some(SyncCursor::new(expected)));
            prop_assert_eq!(chain.fetched(), ((start + 1)..=expected).collect::<Vec<_>>());
            for height in (start + 1)..=expected {
                prop_assert!(store.get(Keyspace::Blocks, &height_key(height)).unwrap().is_some());
            }
            Ok(())
        })?;
    }
}
