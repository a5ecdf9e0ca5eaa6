//! Read-your-writes and write-back behavior of the stripe cache (§8.4, §4.3),
//! exercised through a `Volume` with caching enabled so the scenarios match
//! real call shapes rather than poking `StripeCache` directly.

use std::sync::Arc;
use std::time::Duration;

use stripevolume::{CacheConfig, MockPartitionClient, StripeCache, Volume};

const D: u64 = 4;
const C: u64 = 2;
const R: u64 = 16;
const B: usize = 1024;

fn cache_root(label: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!(
        "stripevolume-cache-test-{label}-{}",
        std::process::id()
    ))
}

#[test]
fn read_your_writes_before_any_flush() {
    let root = cache_root("ryw");
    let volume = Volume::new("v", D, C, R, B, None).unwrap();
    let mocks: Vec<Arc<MockPartitionClient>> =
        (0..(D + C)).map(|_| MockPartitionClient::new(B)).collect();
    let partitions: Vec<Arc<dyn stripevolume::PartitionClient>> = mocks
        .iter()
        .map(|m| m.clone() as Arc<dyn stripevolume::PartitionClient>)
        .collect();
    for (col, mock) in mocks.iter().enumerate() {
        volume.set_partition(col as u64, mock.clone()).unwrap();
    }

    let cache = StripeCache::new(
        CacheConfig {
            root: root.clone(),
            limit: 8,
            flush_policy: Duration::from_secs(3600), // long enough that no tick fires mid-test
        },
        partitions,
        B,
    )
    .unwrap();
    volume.enable_cache(Arc::new(cache));

    let payload: Vec<u8> = (0..(D as usize * B)).map(|i| (i % 256) as u8).collect();
    volume.write(&payload, 0).unwrap();

    let mut out = vec![0u8; payload.len()];
    volume.read(&mut out, 0).unwrap();
    assert_eq!(out, payload);

    std::fs::remove_dir_all(&root).ok();
}

#[test]
fn cache_root_is_wiped_on_drop() {
    let root = cache_root("wipe");
    let mocks: Vec<Arc<MockPartitionClient>> =
        (0..(D + C)).map(|_| MockPartitionClient::new(B)).collect();
    let partitions: Vec<Arc<dyn stripevolume::PartitionClient>> = mocks
        .iter()
        .map(|m| m.clone() as Arc<dyn stripevolume::PartitionClient>)
        .collect();

    let cache = StripeCache::new(
        CacheConfig {
            root: root.clone(),
            limit: 8,
            flush_policy: Duration::from_millis(50),
        },
        partitions,
        B,
    )
    .unwrap();
    cache.write(0, 0, &vec![7u8; B], 0).unwrap();
    drop(cache);

    let remaining: Vec<_> = std::fs::read_dir(&root)
        .map(|it| it.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(remaining.is_empty());

    std::fs::remove_dir_all(&root).ok();
}
