// Integration tests for the scan processors
//
// Fake protocol sources with injected failures and latency stand in for the
// upstream APIs; results and cache contents are checked after each scan.

mod common;

use common::{position, FakeMarket, FakeProtocol, Harness, CHAIN, WALLET};
use lp_scan_engine::cache_keys;
use lp_scan_engine::cache_layer::CacheStrategy;
use lp_scan_engine::jobs::payloads::{BulkScanPayload, ProtocolScanPayload, QuickScanPayload, WalletScanPayload};
use lp_scan_engine::jobs::{JobKind, JobOutput, JobPayload};
use lp_scan_engine::processors::{JobContext, JobHandler, ScanProcessor};
use lp_scan_engine::types::{LpPosition, WalletScanAggregate};
use std::sync::Arc;
use std::time::Duration;

fn wallet_scan(refresh: bool) -> WalletScanPayload {
    WalletScanPayload {
        wallet: WALLET.to_string(),
        chain: CHAIN.to_string(),
        protocols: None,
        refresh,
    }
}

/// Five protocols; `sushiswap` and `balancer` answer 503.
fn five_protocols() -> Vec<Arc<FakeProtocol>> {
    vec![
        FakeProtocol::with_positions(
            "uniswap-v3",
            WALLET,
            vec![
                position("u1", "uniswap-v3", "WETH", "USDC", 5_000.0, 18.0),
                position("u2", "uniswap-v3", "WBTC", "WETH", 2_500.0, 9.0),
            ],
        ),
        FakeProtocol::with_positions("curve", WALLET, vec![position("c1", "curve", "USDC", "USDT", 10_000.0, 4.0)]),
        FakeProtocol::with_positions("aerodrome", WALLET, Vec::new()),
        FakeProtocol::failing("sushiswap"),
        FakeProtocol::failing("balancer"),
    ]
}

#[tokio::test]
async fn test_wallet_scan_reports_partial_failures() {
    let harness = Harness::new(five_protocols(), FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let result = scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();
    assert!(!result.cached);
    assert_eq!(result.protocols_scanned, 3);
    assert_eq!(result.errors.len(), 2);
    assert!(result.errors.iter().any(|e| e.starts_with("sushiswap:")));
    assert!(result.errors.iter().any(|e| e.starts_with("balancer:")));
    assert_eq!(result.positions_found, 3);
    assert!((result.scan_results.total_value - 17_500.0).abs() < 1e-9);

    let cached = harness
        .cache
        .get::<WalletScanAggregate>(&cache_keys::scan(WALLET, CHAIN), CacheStrategy::ReadHeavy)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cached.total_positions, 3);

    let per_protocol = harness
        .cache
        .get::<Vec<LpPosition>>(&cache_keys::positions(WALLET, "curve", CHAIN), CacheStrategy::FastAccess)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(per_protocol.len(), 1);
}

#[tokio::test]
async fn test_cached_scan_skips_sources_until_refresh() {
    let protocols = five_protocols();
    let uniswap = protocols[0].clone();
    let harness = Harness::new(protocols, FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();
    assert_eq!(uniswap.calls(), 1);

    let second = scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();
    assert!(second.cached);
    assert_eq!(second.errors.len(), 2);
    assert_eq!(second.positions_found, 3);
    assert_eq!(uniswap.calls(), 1);

    let forced = scans.scan_wallet(None, &wallet_scan(true)).await.unwrap();
    assert!(!forced.cached);
    assert_eq!(uniswap.calls(), 2);
}

#[tokio::test]
async fn test_cached_partial_scan_keeps_its_errors() {
    let harness = Harness::new(five_protocols(), FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let first = scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();
    let second = scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();

    assert!(second.cached);
    assert_eq!(second.protocols_scanned, 3);
    assert_eq!(second.errors, first.errors);
    assert!(second.scan_results.is_partial());
    assert!(second.errors.iter().any(|e| e.starts_with("sushiswap:")));
    assert!(second.errors.iter().any(|e| e.starts_with("balancer:")));
}

#[tokio::test]
async fn test_scan_with_no_successful_protocol_is_not_cached() {
    let harness = Harness::new(
        vec![FakeProtocol::failing("curve"), FakeProtocol::failing("uniswap-v3")],
        FakeMarket::new(),
    );
    let scans = ScanProcessor::new(harness.deps.clone());

    let result = scans.scan_wallet(None, &wallet_scan(false)).await.unwrap();
    assert_eq!(result.protocols_scanned, 0);
    assert_eq!(result.errors.len(), 2);
    assert!(harness.cache.keys("scan:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requested_protocol_without_source_is_an_error_entry() {
    let harness = Harness::new(five_protocols(), FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let payload = WalletScanPayload {
        protocols: Some(vec!["curve".to_string(), "pendle".to_string()]),
        ..wallet_scan(false)
    };
    let result = scans.scan_wallet(None, &payload).await.unwrap();
    assert_eq!(result.protocols_scanned, 1);
    assert_eq!(result.errors, vec![format!("pendle: not available on {}", CHAIN)]);
}

#[tokio::test]
async fn test_protocol_scan_never_fails() {
    let harness = Harness::new(five_protocols(), FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let failed = scans
        .protocol_scan(&ProtocolScanPayload {
            wallet: WALLET.to_string(),
            chain: CHAIN.to_string(),
            protocol: "balancer".to_string(),
            refresh: false,
        })
        .await;
    assert!(!failed.success);
    assert!(failed.error.unwrap().contains("503"));

    let payload = ProtocolScanPayload {
        wallet: WALLET.to_string(),
        chain: CHAIN.to_string(),
        protocol: "uniswap-v3".to_string(),
        refresh: false,
    };
    let first = scans.protocol_scan(&payload).await;
    let second = scans.protocol_scan(&payload).await;
    assert!(first.success && !first.cached);
    assert!(second.success && second.cached);
    assert_eq!(second.positions, first.positions);
}

#[tokio::test]
async fn test_quick_scan_marks_slow_protocols_absent() {
    let protocols = five_protocols();
    protocols[1].set_delay(Duration::from_millis(500));
    let harness = Harness::new(protocols, FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let result = scans
        .quick_scan(
            None,
            &QuickScanPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                top_k: Some(3),
                timeout_ms: Some(50),
            },
        )
        .await;

    assert_eq!(result.protocols_absent, vec!["curve".to_string()]);
    assert_eq!(result.protocols_scanned, 2);
    assert_eq!(result.positions_found, 2);
    assert!(result.errors.is_empty());
    assert!(harness.cache.keys("scan:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_scan_isolates_wallet_failures() {
    let uniswap = FakeProtocol::new("uniswap-v3");
    uniswap.set_positions("0xa", vec![position("a1", "uniswap-v3", "WETH", "USDC", 100.0, 10.0)]);
    uniswap.set_positions("0xb", vec![position("b1", "uniswap-v3", "WETH", "USDC", 200.0, 10.0)]);
    uniswap.set_positions(
        "0xc",
        vec![
            position("c1", "uniswap-v3", "WETH", "USDC", 300.0, 10.0),
            position("c2", "uniswap-v3", "WBTC", "USDC", 400.0, 10.0),
        ],
    );
    let harness = Harness::new(vec![uniswap, FakeProtocol::failing("curve")], FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let result = scans
        .bulk_scan(
            None,
            &BulkScanPayload {
                wallets: vec!["0xa".into(), "0xb".into(), "0xc".into()],
                chain: CHAIN.to_string(),
                batch_size: Some(2),
                concurrency: Some(2),
                refresh: false,
            },
        )
        .await;

    assert_eq!(result.wallets_requested, 3);
    assert_eq!(result.wallets_scanned, 3);
    assert_eq!(result.wallets_failed, 0);
    assert_eq!(result.total_positions, 4);
    assert!((result.total_value - 1_000.0).abs() < 1e-9);
    // curve fails once per wallet
    assert_eq!(result.errors.len(), 3);
    assert_eq!(harness.cache.keys("scan:*").await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_handler_routes_scan_kinds_and_reports_progress() {
    let harness = Harness::new(five_protocols(), FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());

    let ctx = JobContext::detached(JobKind::WalletScan);
    let output = scans
        .handle(&ctx, JobPayload::WalletScan(wallet_scan(false)))
        .await
        .unwrap();
    assert!(matches!(output, JobOutput::WalletScan(ref r) if r.protocols_scanned == 3));
    assert_eq!(output.errors().len(), 2);
    assert_eq!(ctx.current_progress(), 100);
}
