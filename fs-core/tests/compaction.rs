use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use pmextent::prelude::*;
use pmextent::{CompactionPolicy, MemBlockDevice, OpKind};

const INO: u64 = 1;

fn page(byte: u8) -> Vec<u8> {
    vec![byte; BLOCK_SIZE]
}

async fn store_with(blocks: u64, compaction: CompactionPolicy) -> (Arc<MemBlockDevice>, ExtentStore) {
    let device = Arc::new(MemBlockDevice::new(blocks));
    let config = StoreConfig {
        compaction,
        ..StoreConfig::default()
    };
    let store = ExtentStore::format(device.clone(), 16, config)
        .await
        .expect("Failed to format device");
    (device, store)
}

async fn lookups(store: &ExtentStore, pages: u64) -> Vec<Option<u64>> {
    let mut out = Vec::with_capacity(pages as usize);
    for offset in 0..pages {
        out.push(store.lookup(INO, offset).await.expect("Failed to look up"));
    }
    out
}

#[tokio::test]
async fn test_compaction_preserves_every_lookup() {
    env_logger::builder().is_test(true).try_init().ok();

    let (device, store) = store_with(4096, CompactionPolicy::disabled()).await;
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..600 {
        let offset = rng.gen_range(0..64u64);
        let pages = rng.gen_range(1..=4usize);
        if rng.gen_bool(0.1) {
            store
                .punch_hole(INO, offset, pages as u32)
                .await
                .expect("Failed to punch hole");
        } else {
            store
                .write(INO, offset, &vec![rng.gen::<u8>(); BLOCK_SIZE * pages])
                .await
                .expect("Failed to write");
        }
    }

    let before = lookups(&store, 80).await;
    let mapping = store.mapping(INO).await.unwrap();
    let report = store.inspect(INO).await.unwrap();
    let free_before = store.allocator().free_blocks();
    println!(
        "{} entries in {} pages, {} live runs",
        report.entries.len(),
        report.pages.len(),
        mapping.len()
    );

    let outcome = store.compact(INO).await.expect("Failed to compact");
    assert_eq!(outcome.entries_before, 600);
    assert_eq!(outcome.entries_after as usize, mapping.len());
    assert_eq!(outcome.pages_before as usize, report.pages.len());

    assert_eq!(lookups(&store, 80).await, before);
    let after = store.inspect(INO).await.unwrap();
    assert_eq!(after.invalid_entries, 0);
    assert!(after.entries.iter().all(|e| !e.entry.is_hole()));
    assert_eq!(
        store.allocator().free_blocks(),
        free_before + outcome.pages_before - outcome.pages_after
    );
    assert!(store.allocator().is_consistent());

    // The compacted chain is what a remount sees
    let reopened = ExtentStore::open(device.clone(), StoreConfig::default())
        .await
        .expect("Failed to reopen");
    assert_eq!(lookups(&reopened, 80).await, before);
    assert_eq!(reopened.free_pool().ranges, store.free_pool().ranges);
}

#[tokio::test]
async fn test_policy_triggers_compaction() {
    env_logger::builder().is_test(true).try_init().ok();

    let policy = CompactionPolicy {
        enabled: true,
        min_entries: 8,
        invalid_percent: 50,
    };
    let (_device, store) = store_with(1024, policy).await;

    for i in 0..7u8 {
        let outcome = store.write(INO, 0, &page(i)).await.unwrap();
        assert!(!outcome.compacted, "compacted early at write {}", i);
    }
    // Eighth entry: 7 of 8 invalidated
    let outcome = store.write(INO, 0, &page(7)).await.unwrap();
    assert!(outcome.compacted);
    assert_eq!(store.telemetry().count(OpKind::Compaction), 1);

    let report = store.inspect(INO).await.unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.pages.len(), 1);
    assert_eq!(store.read(INO, 0).await.unwrap(), Some(page(7)));
}

#[tokio::test]
async fn test_compacting_fully_unmapped_log_empties_it() {
    env_logger::builder().is_test(true).try_init().ok();

    let (device, store) = store_with(1024, CompactionPolicy::disabled()).await;
    store.write(INO, 0, &vec![3u8; BLOCK_SIZE * 4]).await.unwrap();
    store.punch_hole(INO, 0, 4).await.unwrap();

    let outcome = store.compact(INO).await.unwrap();
    assert_eq!(outcome.entries_after, 0);
    assert_eq!(outcome.pages_after, 0);
    assert!(store.active_inodes().await.is_empty());
    assert_eq!(
        store.free_pool().ranges,
        vec![store.geometry().data_region()]
    );

    let reopened = ExtentStore::open(device.clone(), StoreConfig::default())
        .await
        .unwrap();
    assert!(reopened.active_inodes().await.is_empty());
}

#[tokio::test]
async fn test_compaction_fails_cleanly_without_space() {
    env_logger::builder().is_test(true).try_init().ok();

    let (_device, store) = store_with(256, CompactionPolicy::disabled()).await;
    for i in 0..20u64 {
        store.write(INO, i * 2, &page(i as u8)).await.unwrap();
    }
    // Exhaust the pool
    let free = store.allocator().free_blocks();
    let hog = store.allocator().allocate(free).unwrap();

    let err = store.compact(INO).await.unwrap_err();
    assert!(err.is_exhausted());
    assert_eq!(store.inspect(INO).await.unwrap().entries.len(), 20);
    assert_eq!(store.read(INO, 38).await.unwrap(), Some(page(19)));

    store.allocator().release(hog).unwrap();
    store.compact(INO).await.expect("Failed to compact");
}
