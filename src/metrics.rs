// ===============================
// src/metrics.rs
// ===============================
use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, Method, Request, Response, Server, StatusCode};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::convert::Infallible;
use std::net::SocketAddr;
use tracing::{error, info};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Account feed --------
pub static FRAMES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("feed_frames_total", "parsed account frames").unwrap());

pub static FRAMES_MALFORMED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_frames_malformed_total", "frames dropped as unparseable").unwrap()
});

pub static KEYS_SKIPPED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("feed_keys_skipped_total", "non-numeric account keys skipped").unwrap()
});

pub static ACCOUNTS_DEGRADED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("feed_accounts_degraded", "accounts reporting an error in the last frame").unwrap()
});

// -------- WS health --------
pub static WS_CONNECTED: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("ws_connected", "1 if the account feed WS is connected, 0 otherwise").unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ws_reconnects_total", "scheduled reconnect attempts").unwrap()
});

pub static WS_EXHAUSTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ws_reconnect_exhausted_total", "times the reconnect budget ran out").unwrap()
});

pub static WS_LAST_FRAME_TS: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("ws_last_frame_ts", "Unix seconds of the last received frame").unwrap()
});

// -------- Statistics poll --------
pub static POLLS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stats_polls_total", "trading statistics requests (label: result)"),
        &["result"],
    )
    .unwrap()
});

// -------- Readiness coordination --------
pub static CYCLES: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("loading_cycles_total", "loading cycles started").unwrap());

pub static COORDINATED_STARTS: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("coordinated_starts_total", "coordinated animation signals emitted").unwrap()
});

pub fn init() {
    for m in [
        REGISTRY.register(Box::new(FRAMES.clone())),
        REGISTRY.register(Box::new(FRAMES_MALFORMED.clone())),
        REGISTRY.register(Box::new(KEYS_SKIPPED.clone())),
        REGISTRY.register(Box::new(ACCOUNTS_DEGRADED.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_EXHAUSTED.clone())),
        REGISTRY.register(Box::new(WS_LAST_FRAME_TS.clone())),
        REGISTRY.register(Box::new(POLLS.clone())),
        REGISTRY.register(Box::new(CYCLES.clone())),
        REGISTRY.register(Box::new(COORDINATED_STARTS.clone())),
    ] {
        if let Err(e) = m {
            error!(?e, "metric registration failed");
        }
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

async fn handle(req: Request<Body>) -> Result<Response<Body>, Infallible> {
    let rsp = match (req.method(), req.uri().path()) {
        (&Method::GET, "/") | (&Method::GET, "/metrics") => Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")
            .body(Body::from(encode_metrics())),
        _ => Response::builder().status(StatusCode::NOT_FOUND).body(Body::empty()),
    };
    Ok(rsp.unwrap_or_else(|_| Response::new(Body::empty())))
}

pub async fn serve_metrics(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let make_svc = make_service_fn(|_conn| async { Ok::<_, Infallible>(service_fn(handle)) });

    let server = match Server::try_bind(&addr) {
        Ok(b) => b.serve(make_svc),
        Err(e) => {
            error!(?e, %addr, "metrics bind failed");
            return;
        }
    };
    info!(%addr, "metrics listening on /metrics");
    if let Err(e) = server.await {
        error!(?e, "metrics server stopped");
    }
}
