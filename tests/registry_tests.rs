//! Tests for the pull coordinator.
//!
//! Exercise the registry end to end against a counting mock fetcher: cache
//! hits, request coalescing, TTL expiry, retry by the next waiter and the
//! progress protocol. Conversions run the real pipeline with a fake
//! compression tool.

mod common;

use common::{FAKE_SQUASH_WAT, MockFetcher, SyntheticImage, TestAssets};
use spinrun::{
    Error, ImageFetcher, ModuleCache, ProgressSink, PullProgress, Registry, RegistryConfig,
};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

fn registry(temp: &TempDir, fetcher: Arc<dyn ImageFetcher>, ttl: Duration) -> Registry {
    common::init_tracing();
    let config = RegistryConfig::default()
        .with_root(temp.path().join("store"))
        .with_mirrors(["registry.test"])
        .with_ttl(ttl)
        .with_assets(TestAssets::with_tool(FAKE_SQUASH_WAT))
        .with_module_cache(Arc::new(ModuleCache::new().unwrap()));
    Registry::new(config, fetcher).unwrap()
}

async fn collect(mut rx: mpsc::Receiver<PullProgress>) -> Vec<PullProgress> {
    let mut seen = Vec::new();
    while let Some(p) = rx.recv().await {
        let done = p == PullProgress::Done;
        seen.push(p);
        if done {
            break;
        }
    }
    seen
}

// =============================================================================
// Pull Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_pulls_fetch_once() {
    let temp = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(SyntheticImage::hello());
    let registry = registry(&temp, fetcher.clone(), Duration::from_secs(120));

    registry.pull("library/alpine:latest", None).await.unwrap();
    registry.pull("library/alpine:latest", None).await.unwrap();

    assert_eq!(fetcher.fetch_count(), 1, "second pull should hit the cache");
    assert_eq!(fetcher.resolve_count(), 1);
    registry.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_pulls_share_one_fetch() {
    let temp = TempDir::new().unwrap();
    let mut fetcher = MockFetcher::build(SyntheticImage::hello());
    fetcher.delay = Duration::from_millis(300);
    let fetcher = Arc::new(fetcher);
    let registry = registry(&temp, fetcher.clone(), Duration::from_secs(120));

    let mut pulls = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let registry = registry.clone();
        pulls.spawn(async move { registry.pull("library/alpine:latest", None).await });
    }
    while let Some(result) = pulls.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(fetcher.fetch_count(), 1, "all waiters should share a fetch");
    assert_eq!(registry.store().list().unwrap().len(), 1);
    registry.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_pull_retried_by_next_waiter() {
    let temp = TempDir::new().unwrap();
    let mut fetcher = MockFetcher::build(SyntheticImage::hello());
    fetcher.delay = Duration::from_millis(300);
    fetcher.failures.store(1, Ordering::SeqCst);
    let fetcher = Arc::new(fetcher);
    let registry = registry(&temp, fetcher.clone(), Duration::from_secs(120));

    let first = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.pull("library/alpine:latest", None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.pull("library/alpine:latest", None).await })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();

    assert!(
        matches!(first, Err(Error::TransferFailed { .. })),
        "first waiter should see the failure: {:?}",
        first
    );
    assert!(second.is_ok(), "next waiter should retry and succeed");
    assert_eq!(fetcher.fetch_count(), 2);
    registry.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unresolvable_image() {
    let temp = TempDir::new().unwrap();
    let mut fetcher = MockFetcher::build(SyntheticImage::hello());
    fetcher.unknown.push("library/missing:latest".to_string());
    let fetcher = Arc::new(fetcher);

    common::init_tracing();
    let config = RegistryConfig::default()
        .with_root(temp.path().join("store"))
        .with_mirrors(["a.test", "b.test"])
        .with_assets(TestAssets::with_tool(FAKE_SQUASH_WAT))
        .with_module_cache(Arc::new(ModuleCache::new().unwrap()));
    let registry = Registry::new(config, fetcher.clone()).unwrap();

    let result = registry.pull("library/missing:latest", None).await;
    match result {
        Err(Error::ImageNotResolved { reference, reason }) => {
            assert_eq!(reference, "library/missing:latest");
            assert!(reason.contains("a.test"), "reason lists mirrors: {}", reason);
            assert!(reason.contains("b.test"), "reason lists mirrors: {}", reason);
        }
        other => panic!("unexpected: {:?}", other),
    }
    assert_eq!(fetcher.resolve_count(), 2, "every mirror should be tried");
    assert_eq!(fetcher.fetch_count(), 0);
    registry.close().await;
}

#[tokio::test]
async fn test_invalid_reference_rejected() {
    let temp = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(SyntheticImage::hello());
    let registry = registry(&temp, fetcher.clone(), Duration::from_secs(120));

    let (tx, rx) = mpsc::channel(8);
    let result = registry.pull("alpine; rm -rf /", Some(ProgressSink::new(tx))).await;
    assert!(matches!(result, Err(Error::InvalidImageReference { .. })));

    let seen = collect(rx).await;
    assert_eq!(seen.last(), Some(&PullProgress::Done));
    assert!(seen.iter().any(|p| p.completion() == Some(100) && p.error().is_some()));
    assert_eq!(fetcher.resolve_count(), 0);
    registry.close().await;
}

// =============================================================================
// Path and TTL Tests
// =============================================================================

#[tokio::test]
async fn test_path_before_pull_not_found() {
    let temp = TempDir::new().unwrap();
    let registry = registry(
        &temp,
        MockFetcher::new(SyntheticImage::hello()),
        Duration::from_secs(120),
    );

    assert!(matches!(
        registry.path("library/alpine:latest"),
        Err(Error::ImageNotFound(_))
    ));
    registry.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_path_expires_with_ttl() {
    let temp = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(SyntheticImage::hello());
    let registry = registry(&temp, fetcher.clone(), Duration::from_millis(300));

    registry.pull("library/alpine:latest", None).await.unwrap();
    let artifact = registry.path("library/alpine:latest").unwrap();
    assert!(artifact.is_file());

    tokio::time::sleep(Duration::from_millis(500)).await;

    assert!(
        matches!(
            registry.path("library/alpine:latest"),
            Err(Error::ImageNotFound(_))
        ),
        "expired digest should not be reported"
    );
    assert!(artifact.is_file(), "artifact stays on disk after expiry");

    // Re-pulling resolves again but finds the artifact in the store.
    registry.pull("library/alpine:latest", None).await.unwrap();
    assert_eq!(fetcher.resolve_count(), 2);
    assert_eq!(fetcher.fetch_count(), 1);
    assert_eq!(registry.path("library/alpine:latest").unwrap(), artifact);
    registry.close().await;
}

// =============================================================================
// Progress Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_milestones() {
    let temp = TempDir::new().unwrap();
    let registry = registry(
        &temp,
        MockFetcher::new(SyntheticImage::hello()),
        Duration::from_secs(120),
    );

    let (tx, rx) = mpsc::channel(64);
    let consumer = tokio::spawn(collect(rx));
    registry
        .pull("library/alpine:latest", Some(ProgressSink::new(tx)))
        .await
        .unwrap();
    let seen = consumer.await.unwrap();

    assert_eq!(seen.last(), Some(&PullProgress::Done));
    let percents: Vec<u8> = seen.iter().filter_map(|p| p.completion()).collect();
    assert!(
        percents.windows(2).all(|w| w[0] < w[1]),
        "milestones should increase: {:?}",
        percents
    );
    for milestone in [0, 1, 2, 3, 10, 50, 55, 65, 70, 73, 90, 98, 99, 100] {
        assert!(percents.contains(&milestone), "missing {}: {:?}", milestone, percents);
    }
    assert!(seen.iter().all(|p| p.error().is_none()));
    registry.close().await;
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[tokio::test]
async fn test_pull_after_close_fails() {
    let temp = TempDir::new().unwrap();
    let registry = registry(
        &temp,
        MockFetcher::new(SyntheticImage::hello()),
        Duration::from_secs(120),
    );

    registry.close().await;
    registry.close().await;
    assert!(registry.is_closed());
    assert!(matches!(
        registry.pull("library/alpine:latest", None).await,
        Err(Error::RegistryClosed)
    ));
}

// =============================================================================
// Scenario
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_hello_world_scenario() {
    let temp = TempDir::new().unwrap();
    let fetcher = MockFetcher::new(SyntheticImage::hello());
    let registry = registry(&temp, fetcher.clone(), Duration::from_secs(120));

    registry
        .pull("library/hello-world:latest", None)
        .await
        .unwrap();
    let artifact = registry.path("library/hello-world:latest").unwrap();

    assert_eq!(
        common::zip_names(&artifact),
        vec![
            "config/config.json",
            "config/imageconfig.json",
            "index.json",
            "rootfs.bin"
        ]
    );
    assert_eq!(
        common::squashed_files(&artifact),
        vec![("hello.txt".to_string(), b"hi".to_vec())]
    );

    registry
        .pull("library/hello-world:latest", None)
        .await
        .unwrap();
    assert_eq!(fetcher.fetch_count(), 1, "second pull should not fetch");
    registry.close().await;
}
