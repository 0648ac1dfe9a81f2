// Integration tests for the analytics processors

mod common;

use common::{position, FakeMarket, FakeProtocol, Harness, CHAIN, WALLET};
use lp_scan_engine::cache_keys;
use lp_scan_engine::cache_layer::CacheStrategy;
use lp_scan_engine::jobs::payloads::{
    HistoricalPerformancePayload, PortfolioAnalyticsPayload, ProtocolAnalyticsPayload, ProtocolTvlRefreshPayload,
    RiskAnalysisPayload, RiskTolerance, WalletScanPayload, YieldOptimizationPayload,
};
use lp_scan_engine::jobs::{JobError, JobKind, JobPayload};
use lp_scan_engine::processors::{
    AnalyticsProcessor, JobContext, JobHandler, ProgressSink, RefreshProcessor, ScanProcessor,
};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct Recorder(Mutex<Vec<u8>>);

impl ProgressSink for Recorder {
    fn report(&self, _job_id: &str, progress: u8) {
        self.0.lock().unwrap().push(progress);
    }
}

fn setup() -> (Harness, Arc<ScanProcessor>, AnalyticsProcessor, Arc<FakeMarket>) {
    let uniswap = FakeProtocol::with_positions(
        "uniswap-v3",
        WALLET,
        vec![
            position("u1", "uniswap-v3", "WETH", "USDC", 6_000.0, 24.0),
            position("u2", "uniswap-v3", "WBTC", "USDC", 1_000.0, 3.0),
        ],
    );
    let curve = FakeProtocol::with_positions("curve", WALLET, vec![position("c1", "curve", "USDC", "USDT", 3_000.0, 4.0)]);
    let market = FakeMarket::new();
    let harness = Harness::new(vec![uniswap, curve], market.clone());
    let scans = Arc::new(ScanProcessor::new(harness.deps.clone()));
    let analytics = AnalyticsProcessor::new(harness.deps.clone());
    (harness, scans, analytics, market)
}

async fn scan(scans: &ScanProcessor) {
    scans
        .scan_wallet(
            None,
            &WalletScanPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                protocols: None,
                refresh: false,
            },
        )
        .await
        .unwrap();
}

fn portfolio() -> PortfolioAnalyticsPayload {
    PortfolioAnalyticsPayload {
        wallet: WALLET.to_string(),
        chain: CHAIN.to_string(),
    }
}

#[tokio::test]
async fn test_wallet_analytics_need_a_cached_scan() {
    let (_, _, analytics, _) = setup();
    let ctx = JobContext::detached(JobKind::PortfolioAnalytics);

    let err = analytics.portfolio(&ctx, &portfolio()).await.unwrap_err();
    match &err {
        JobError::MissingDependency { key, hint } => {
            assert_eq!(key, &cache_keys::scan(WALLET, CHAIN));
            assert!(hint.contains("wallet-scan"));
        }
        other => panic!("expected missing dependency, got {other:?}"),
    }
    assert!(!err.is_retryable());

    let ctx = JobContext::detached(JobKind::RiskAnalysis);
    let err = analytics
        .risk(
            &ctx,
            &RiskAnalysisPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::MissingDependency { .. }));
}

#[tokio::test]
async fn test_portfolio_reports_milestones_and_persists() {
    let (harness, scans, analytics, _) = setup();
    scan(&scans).await;

    let recorder = Arc::new(Recorder::default());
    let ctx = JobContext::new("job-1", "portfolio-analytics", JobKind::PortfolioAnalytics, 1, 2).with_sink(recorder.clone());
    let result = analytics.portfolio(&ctx, &portfolio()).await.unwrap();

    assert_eq!(*recorder.0.lock().unwrap(), vec![0, 20, 40, 60, 80, 100]);
    assert_eq!(result.cache_key, cache_keys::analytics(WALLET, CHAIN));
    assert_eq!(result.analytics.position_count, 3);
    assert_eq!(result.analytics.protocol_count, 2);
    assert!((result.analytics.total_value - 10_000.0).abs() < 1e-9);

    let entry = harness
        .cache
        .peek::<serde_json::Value>(&result.cache_key)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.strategy, CacheStrategy::Persistent);
    assert_eq!(entry.ttl_ms, None);
}

#[tokio::test]
async fn test_partial_scan_is_flagged_on_wallet_analytics() {
    let uniswap = FakeProtocol::with_positions(
        "uniswap-v3",
        WALLET,
        vec![position("u1", "uniswap-v3", "WETH", "USDC", 6_000.0, 24.0)],
    );
    let harness = Harness::new(vec![uniswap, FakeProtocol::failing("balancer")], FakeMarket::new());
    let scans = ScanProcessor::new(harness.deps.clone());
    let analytics = AnalyticsProcessor::new(harness.deps.clone());
    scan(&scans).await;

    let recorder = Arc::new(Recorder::default());
    let ctx = JobContext::new("job-2", "risk-analysis", JobKind::RiskAnalysis, 1, 2).with_sink(recorder.clone());
    let result = analytics
        .risk(
            &ctx,
            &RiskAnalysisPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
            },
        )
        .await
        .unwrap();

    assert_eq!(*recorder.0.lock().unwrap(), vec![0, 20, 40, 60, 80, 100]);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].starts_with("wallet scan: balancer:"));
    assert_eq!(result.analytics.protocol_count, 1);
}

#[tokio::test]
async fn test_rescan_evicts_wallet_analytics() {
    let (harness, scans, analytics, _) = setup();
    scan(&scans).await;
    let ctx = JobContext::detached(JobKind::PortfolioAnalytics);
    analytics.portfolio(&ctx, &portfolio()).await.unwrap();
    assert_eq!(harness.cache.keys("analytics:*").await.unwrap().len(), 1);

    scans
        .scan_wallet(
            None,
            &WalletScanPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                protocols: None,
                refresh: true,
            },
        )
        .await
        .unwrap();
    assert!(harness.cache.keys("analytics:*").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_protocol_analytics_need_cached_tvl() {
    let (harness, scans, analytics, market) = setup();
    scan(&scans).await;
    let ctx = JobContext::detached(JobKind::ProtocolAnalytics);
    let payload = ProtocolAnalyticsPayload {
        protocol: "curve".to_string(),
        chain: CHAIN.to_string(),
    };

    let err = analytics.protocol(&ctx, &payload).await.unwrap_err();
    assert!(matches!(err, JobError::MissingDependency { ref key, .. } if key == &cache_keys::tvl("curve", CHAIN)));

    market.set_tvl("curve", 1_000_000.0);
    let refresh = RefreshProcessor::new(harness.deps.clone(), scans.clone());
    refresh
        .tvl_refresh(
            &JobContext::detached(JobKind::ProtocolTvlRefresh),
            &ProtocolTvlRefreshPayload {
                protocols: vec!["curve".to_string()],
                chains: vec![CHAIN.to_string()],
            },
        )
        .await
        .unwrap();

    let result = analytics.protocol(&ctx, &payload).await.unwrap();
    assert_eq!(result.analytics.tracked_wallets, 1);
    assert_eq!(result.analytics.tracked_positions, 1);
    assert!((result.analytics.tracked_value_usd - 3_000.0).abs() < 1e-9);
    assert_eq!(result.cache_key, cache_keys::protocol_analytics("curve", CHAIN));
}

#[tokio::test]
async fn test_historical_rejects_inverted_range() {
    let (_, scans, analytics, _) = setup();
    scan(&scans).await;
    let ctx = JobContext::detached(JobKind::HistoricalPerformance);
    let err = analytics
        .historical(
            &ctx,
            &HistoricalPerformancePayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                start: 200,
                end: 100,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidPayload(_)));
    assert!(!err.is_retryable());

    let ok = analytics
        .historical(
            &ctx,
            &HistoricalPerformancePayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                start: 1_600_000_000,
                end: 1_700_000_000,
            },
        )
        .await
        .unwrap();
    assert_eq!(ok.cache_key, cache_keys::history(WALLET, CHAIN, 1_600_000_000, 1_700_000_000));
}

#[tokio::test]
async fn test_handler_routes_every_analytics_kind() {
    let (_, scans, analytics, _) = setup();
    scan(&scans).await;

    let payloads = vec![
        JobPayload::PortfolioAnalytics(portfolio()),
        JobPayload::YieldOptimization(YieldOptimizationPayload {
            wallet: WALLET.to_string(),
            chain: CHAIN.to_string(),
            risk_tolerance: RiskTolerance::High,
            min_apr_gain: Some(1.0),
        }),
        JobPayload::RiskAnalysis(RiskAnalysisPayload {
            wallet: WALLET.to_string(),
            chain: CHAIN.to_string(),
        }),
        JobPayload::HistoricalPerformance(HistoricalPerformancePayload {
            wallet: WALLET.to_string(),
            chain: CHAIN.to_string(),
            start: 0,
            end: 86_400,
        }),
    ];
    for payload in payloads {
        let kind = payload.kind();
        let ctx = JobContext::detached(kind);
        let output = analytics.handle(&ctx, payload).await.unwrap();
        assert_eq!(output.kind(), kind);
        assert_eq!(ctx.current_progress(), 100);
    }

    let ctx = JobContext::detached(JobKind::QuickScan);
    let err = analytics
        .handle(
            &ctx,
            JobPayload::WalletScan(WalletScanPayload {
                wallet: WALLET.to_string(),
                chain: CHAIN.to_string(),
                protocols: None,
                refresh: false,
            }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, JobError::InvalidPayload(_)));

    let unknown_wallet = analytics
        .handle(
            &JobContext::detached(JobKind::RiskAnalysis),
            JobPayload::RiskAnalysis(RiskAnalysisPayload {
                wallet: "0xnobody".to_string(),
                chain: CHAIN.to_string(),
            }),
        )
        .await;
    assert!(matches!(unknown_wallet, Err(JobError::MissingDependency { .. })));
}
