//! fincache Service
//!
//! Runs the cache subsystem standalone: connects the tiers, periodically logs
//! statistics and tuning recommendations, and exposes them for scraping.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         fincache                                │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐    ┌──────────────┐    ┌──────────────┐       │
//! │  │   Settings   │───▶│ CacheManager │───▶│ Stats Loop   │       │
//! │  │ (YAML + CLI) │    │  (L1/L2/L3)  │    │ + /metrics   │       │
//! │  └──────────────┘    └──────────────┘    └──────────────┘       │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, TextEncoder};
use tokio::net::TcpListener;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fincache::{CacheManager, CacheSettings, CacheTier, StrategyStats};

// =============================================================================
// CLI Arguments
// =============================================================================

/// fincache - multi-tier cache for financial planning services
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML settings file
    #[arg(long, env = "FINCACHE_SETTINGS")]
    settings: Option<PathBuf>,

    /// Redis endpoints (comma separated), overriding the settings file
    #[arg(long, env = "REDIS_URLS", value_delimiter = ',')]
    redis_url: Vec<String>,

    /// Edge endpoints (comma separated), overriding the settings file
    #[arg(long, env = "EDGE_URLS", value_delimiter = ',')]
    edge_url: Vec<String>,

    /// Redis connection pool size
    #[arg(long, env = "REDIS_POOL_SIZE")]
    pool_size: Option<usize>,

    /// Seconds between statistics reports
    #[arg(long, env = "STATS_INTERVAL_SECONDS", default_value = "60")]
    stats_interval_seconds: u64,

    /// Metrics and health server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9102")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let mut settings = match &args.settings {
        Some(path) => CacheSettings::from_yaml_file(path)
            .with_context(|| format!("failed to load settings from {}", path.display()))?,
        None => CacheSettings::default(),
    };
    if !args.redis_url.is_empty() {
        settings.l2.endpoints = args.redis_url.clone();
    }
    if !args.edge_url.is_empty() {
        settings.l3.endpoints = args.edge_url.clone();
    }
    if let Some(pool_size) = args.pool_size {
        settings.l2.pool_size = pool_size;
    }

    info!("Starting fincache");
    info!("  Redis endpoints: {}", settings.l2.endpoints.join(", "));
    info!("  Edge endpoints: {}", settings.l3.endpoints.len());
    info!("  Policy overrides: {}", settings.policies.len());

    let config = settings.into_config().context("invalid cache settings")?;
    let manager = Arc::new(
        CacheManager::init(config)
            .await
            .context("failed to initialize cache manager")?,
    );

    let gauges = Arc::new(CacheGauges::register().context("failed to register metrics")?);

    let metrics_addr: SocketAddr = args
        .metrics_addr
        .parse()
        .with_context(|| format!("invalid metrics address '{}'", args.metrics_addr))?;
    let server_manager = manager.clone();
    let server_gauges = gauges.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, server_manager, server_gauges).await {
            error!("Metrics server error: {:#}", e);
        }
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(args.stats_interval_seconds.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            _ = ticker.tick() => report(&manager.stats()),
        }
    }

    server.abort();
    manager.shutdown().await;
    info!("fincache shutdown complete");
    Ok(())
}

fn report(stats: &StrategyStats) {
    info!(
        requests = stats.router.request_count,
        hit_rate = stats.router.hit_rate,
        l1_hits = stats.router.l1_hits,
        l2_hits = stats.router.l2_hits,
        misses = stats.router.miss_count,
        coalesced = stats.router.coalesced,
        l1_entries = stats.l1.entries,
        l1_used_bytes = stats.l1.used_bytes,
        l2_errors = stats.l2.errors,
        l2_timeouts = stats.l2.timeouts,
        "Cache statistics"
    );
    for recommendation in &stats.recommendations {
        warn!("Recommendation: {}", recommendation);
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "redis=info", "reqwest=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Prometheus Gauges
// =============================================================================

/// Gauges mirrored from the latest statistics snapshot
struct CacheGauges {
    requests: IntGauge,
    hits: IntGaugeVec,
    misses: IntGauge,
    coalesced: IntGauge,
    hit_rate: Gauge,
    l1_entries: IntGauge,
    l1_used_bytes: IntGauge,
    l1_evictions: IntGauge,
    l2_errors: IntGauge,
    l2_timeouts: IntGauge,
    l3_failures: IntGauge,
    recommendations: IntGauge,
}

impl CacheGauges {
    fn register() -> prometheus::Result<Self> {
        Ok(Self {
            requests: prometheus::register_int_gauge!(
                "fincache_requests",
                "Logical cache lookups"
            )?,
            hits: prometheus::register_int_gauge_vec!(
                "fincache_hits",
                "Lookups served per tier",
                &["tier"]
            )?,
            misses: prometheus::register_int_gauge!("fincache_misses", "Lookups missing every tier")?,
            coalesced: prometheus::register_int_gauge!(
                "fincache_coalesced",
                "Misses served by a concurrent computation"
            )?,
            hit_rate: prometheus::register_gauge!("fincache_hit_rate", "Overall hit rate")?,
            l1_entries: prometheus::register_int_gauge!("fincache_l1_entries", "L1 entries")?,
            l1_used_bytes: prometheus::register_int_gauge!(
                "fincache_l1_used_bytes",
                "Packed bytes held by L1"
            )?,
            l1_evictions: prometheus::register_int_gauge!(
                "fincache_l1_evictions",
                "L1 capacity evictions"
            )?,
            l2_errors: prometheus::register_int_gauge!("fincache_l2_errors", "L2 backend errors")?,
            l2_timeouts: prometheus::register_int_gauge!(
                "fincache_l2_timeouts",
                "L2 calls that hit their deadline"
            )?,
            l3_failures: prometheus::register_int_gauge!(
                "fincache_l3_failures",
                "Failed or timed-out edge calls"
            )?,
            recommendations: prometheus::register_int_gauge!(
                "fincache_recommendations",
                "Active tuning recommendations"
            )?,
        })
    }

    fn update(&self, stats: &StrategyStats) {
        let router = &stats.router;
        self.requests.set(router.request_count as i64);
        for tier in CacheTier::ALL {
            let hits = match tier {
                CacheTier::L1 => router.l1_hits,
                CacheTier::L2 => router.l2_hits,
                CacheTier::L3 => router.l3_hits,
            };
            self.hits.with_label_values(&[tier.label()]).set(hits as i64);
        }
        self.misses.set(router.miss_count as i64);
        self.coalesced.set(router.coalesced as i64);
        self.hit_rate.set(router.hit_rate);
        self.l1_entries.set(stats.l1.entries as i64);
        self.l1_used_bytes.set(stats.l1.used_bytes as i64);
        self.l1_evictions.set(stats.l1.evictions as i64);
        self.l2_errors.set(stats.l2.errors as i64);
        self.l2_timeouts.set(stats.l2.timeouts as i64);
        self.l3_failures
            .set((stats.l3.failures + stats.l3.timeouts) as i64);
        self.recommendations.set(stats.recommendations.len() as i64);
    }
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(
    addr: SocketAddr,
    manager: Arc<CacheManager>,
    gauges: Arc<CacheGauges>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {}", addr))?;

    info!("Metrics server listening on {}", addr);

    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("metrics server accept error")?;

        let io = TokioIo::new(stream);
        let manager = manager.clone();
        let gauges = gauges.clone();

        tokio::spawn(async move {
            let service =
                service_fn(move |req| handle_request(req, manager.clone(), gauges.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                error!("Metrics server connection error: {}", e);
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    manager: Arc<CacheManager>,
    gauges: Arc<CacheGauges>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => match render_metrics(&manager, &gauges) {
            Ok((body, format_type)) => {
                let mut response = text_response(StatusCode::OK, body);
                if let Ok(content_type) = HeaderValue::from_str(&format_type) {
                    response.headers_mut().insert(CONTENT_TYPE, content_type);
                }
                response
            }
            Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        },
        "/healthz" | "/livez" => text_response(StatusCode::OK, "ok"),
        "/readyz" => {
            if manager.health_check().await {
                text_response(StatusCode::OK, "ok")
            } else {
                text_response(StatusCode::SERVICE_UNAVAILABLE, "distributed tier unavailable")
            }
        }
        _ => text_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

/// Refresh the gauges from current counters and encode the registry
fn render_metrics(
    manager: &CacheManager,
    gauges: &CacheGauges,
) -> prometheus::Result<(Vec<u8>, String)> {
    gauges.update(&manager.stats());
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok((buffer, encoder.format_type().to_string()))
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

// =============================================================================
// Tests
// =============================================================================
