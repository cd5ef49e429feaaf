// ===============================
// src/poll.rs (trading statistics poll)
// ===============================
//
// One-shot POST per loading cycle. The body is `{"username": "..."}` with dots
// in the username replaced by spaces, which is how the endpoint keys accounts.
//
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::coordinator::ReadinessCoordinator;
use crate::domain::TradingStats;
use crate::metrics::POLLS;

#[derive(Debug, Error)]
pub enum PollError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http {code}: {body}")]
    Status { code: u16, body: String },
    #[error("undecodable response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("endpoint rejected request: {0}")]
    Rejected(String),
}

#[derive(Debug, Serialize)]
struct StatsRequest {
    username: String,
}

pub fn request_username(username: &str) -> String {
    username.trim().replace('.', " ")
}

#[derive(Debug, Clone)]
pub struct StatsClient {
    http: reqwest::Client,
    url: String,
}

impl StatsClient {
    /// `timeout: None` keeps the request open until the server answers.
    pub fn new(url: impl Into<String>, timeout: Option<Duration>) -> Result<Self, PollError> {
        let mut builder = reqwest::Client::builder();
        if let Some(t) = timeout {
            builder = builder.timeout(t);
        }
        Ok(Self { http: builder.build()?, url: url.into() })
    }

    pub async fn fetch(&self, username: &str) -> Result<TradingStats, PollError> {
        let body = StatsRequest { username: request_username(username) };
        let rsp = self.http.post(&self.url).json(&body).send().await?;

        let code = rsp.status();
        let text = rsp.text().await?;
        if !code.is_success() {
            return Err(PollError::Status { code: code.as_u16(), body: text });
        }

        let stats: TradingStats = serde_json::from_str(&text).map_err(|e| {
            debug!(body = %text, "stats response body");
            PollError::from(e)
        })?;
        if !stats.success {
            return Err(PollError::Rejected(stats.message.unwrap_or_default()));
        }
        Ok(stats)
    }
}

#[derive(Debug, Clone)]
pub struct PollCycle {
    pub username: String,
    pub initial_delay: Duration,
    /// Mark the coordinator's poll source on success.
    pub coordinated: bool,
}

/// Wait, fetch once, hand the stats to the panel and report readiness.
pub async fn run_cycle(
    client: StatsClient,
    cycle: PollCycle,
    coordinator: ReadinessCoordinator,
    stats_tx: mpsc::Sender<TradingStats>,
) {
    if !cycle.initial_delay.is_zero() {
        sleep(cycle.initial_delay).await;
    }

    match client.fetch(&cycle.username).await {
        Ok(stats) => {
            POLLS.with_label_values(&["ok"]).inc();
            info!(
                trades = stats.number_of_trades,
                profit_loss = stats.profit_loss,
                best_trade = stats.best_trade,
                "trading statistics loaded"
            );
            let _ = stats_tx.send(stats).await;
            if cycle.coordinated {
                coordinator.mark_poll_fresh();
            }
        }
        Err(e) => {
            let label = match &e {
                PollError::Rejected(_) => "rejected",
                _ => "error",
            };
            POLLS.with_label_values(&[label]).inc();
            error!(error = %e, url = %client.url, "trading statistics poll failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorCfg;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::SocketAddr;
    use std::sync::{Arc, Mutex};

    /// Local endpoint answering every POST with `(status, body)`, recording request bodies.
    async fn endpoint(status: StatusCode, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_svc = seen.clone();
        let make_svc = make_service_fn(move |_| {
            let seen = seen_svc.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                    let seen = seen.clone();
                    async move {
                        let bytes = hyper::body::to_bytes(req.into_body()).await.unwrap();
                        seen.lock().unwrap().push(String::from_utf8_lossy(&bytes).into_owned());
                        Ok::<_, Infallible>(Response::builder().status(status).body(Body::from(body)).unwrap())
                    }
                }))
            }
        });
        let server = Server::bind(&SocketAddr::from(([127, 0, 0, 1], 0))).serve(make_svc);
        let url = format!("http://{}/get_trading_data", server.local_addr());
        tokio::spawn(server);
        (url, seen)
    }

    const OK_BODY: &str = r#"{"success":true,"message":"ok","profit_loss":152.5,"average_profit_loss":12.7,
        "number_of_trades":12,"average_trade_duration":"2h 10m","average_trade_volume":0.35,"best_trade":80.0}"#;

    #[test]
    fn username_dots_become_spaces() {
        assert_eq!(request_username("jane.doe"), "jane doe");
        assert_eq!(request_username(" a.b.c "), "a b c");
    }

    #[tokio::test]
    async fn fetch_decodes_stats_and_posts_username() {
        let (url, seen) = endpoint(StatusCode::OK, OK_BODY).await;
        let client = StatsClient::new(url, None).unwrap();

        let stats = client.fetch("jane.doe").await.unwrap();
        assert_eq!(stats.number_of_trades, 12);
        assert_eq!(stats.average_trade_duration, "2h 10m");

        let sent: serde_json::Value = serde_json::from_str(&seen.lock().unwrap()[0]).unwrap();
        assert_eq!(sent, serde_json::json!({ "username": "jane doe" }));
    }

    #[tokio::test]
    async fn unsuccessful_payload_is_rejected() {
        let (url, _) = endpoint(StatusCode::OK, r#"{"success":false,"message":"user not found"}"#).await;
        let client = StatsClient::new(url, None).unwrap();
        match client.fetch("ghost").await {
            Err(PollError::Rejected(m)) => assert_eq!(m, "user not found"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn http_errors_and_garbage_are_reported() {
        let (url, _) = endpoint(StatusCode::INTERNAL_SERVER_ERROR, "boom").await;
        let client = StatsClient::new(url, None).unwrap();
        assert!(matches!(client.fetch("x").await, Err(PollError::Status { code: 500, .. })));

        let (url, _) = endpoint(StatusCode::OK, "<html>").await;
        let client = StatsClient::new(url, None).unwrap();
        assert!(matches!(client.fetch("x").await, Err(PollError::Decode(_))));
    }

    #[tokio::test]
    async fn cycle_delivers_stats_and_marks_poll_fresh() {
        let (url, _) = endpoint(StatusCode::OK, OK_BODY).await;
        let client = StatsClient::new(url, None).unwrap();
        let co = ReadinessCoordinator::new(CoordinatorCfg::default());
        co.start_loading_cycle();
        let (tx, mut rx) = mpsc::channel(4);

        let cycle = PollCycle { username: "jane.doe".into(), initial_delay: Duration::ZERO, coordinated: true };
        run_cycle(client, cycle, co.clone(), tx).await;

        assert_eq!(rx.recv().await.unwrap().best_trade, 80.0);
        let flags = co.snapshot();
        assert!(flags.poll_fresh);
        assert!(!flags.socket_fresh);
    }
}
