// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : mt5_sync — live MT5 account synchronization core in Rust
Module  : config.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
Email   : kukuhtw@gmail.com
WhatsApp: https://wa.me/628129893706
LinkedIn: https://id.linkedin.com/in/kukuhtw
License : MIT (see LICENSE)

Summary : Keeps a live store of MT5 account snapshots fed by a WebSocket,
          reconnects on a fixed delay with a bounded budget, polls trading
          statistics over HTTP, gates dashboard reveals on both sources being
          fresh, exposes Prometheus metrics, and records JSONL events.

(c) 2025 Kukuh TW. All rights reserved where applicable.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

use crate::domain::AccountId;

/// Command line overrides; everything else comes from the environment / `.env`.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "mt5_sync", version, about = "Live MT5 account feed with readiness coordination")]
pub struct Cli {
    /// Account feed WebSocket (overrides WS_URL)
    #[arg(long)]
    pub ws_url: Option<String>,

    /// Select this account and persist it as the current one
    #[arg(long)]
    pub account: Option<AccountId>,

    /// Statistics username, persisted to the prefs file
    #[arg(long)]
    pub username: Option<String>,

    /// Preferences file (overrides PREFS_FILE)
    #[arg(long)]
    pub prefs_file: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{key}: invalid url {value:?}: {source}")]
    InvalidUrl {
        key: &'static str,
        value: String,
        source: url::ParseError,
    },
    #[error("{key}: scheme {scheme:?} not supported, expected one of {expected}")]
    Scheme {
        key: &'static str,
        scheme: String,
        expected: &'static str,
    },
    #[error("WATCHED_ACCOUNTS: {0:?} is not an account id")]
    WatchedAccount(String),
}

#[derive(Clone, Debug)]
pub struct Args {
    // account feed
    pub ws_url: Url,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub watched_accounts: Vec<AccountId>,

    // statistics poll
    pub stats_url: Url,
    pub stats_delay: Duration,
    pub stats_timeout: Option<Duration>, // None = no client timeout
    pub refresh_every: Option<Duration>, // periodic refresh, off by default

    // coordination
    pub use_coordinator: bool,
    pub settle_delay: Duration,
    pub stagger: Duration,

    // user
    pub prefs_file: String,
    pub account: Option<AccountId>,
    pub username: Option<String>,

    // files/metrics
    pub record_file: Option<String>,
    pub metrics_port: u16,
}

pub const DEFAULT_WS_URL: &str = "ws://127.0.0.1:8765";
pub const DEFAULT_STATS_URL: &str = "http://127.0.0.1/get_trading_data.php";
pub const DEFAULT_WATCHED: [AccountId; 2] = [590423106, 590454233];

pub fn load(cli: Cli) -> Result<Args, ConfigError> {
    // .env first so RECORD_FILE, WS_URL, etc. are picked up
    let _ = dotenv();
    from_lookup(cli, |k| env::var(k).ok())
}

/// Build `Args` from any key lookup; `load` passes the process environment.
pub fn from_lookup(cli: Cli, var: impl Fn(&str) -> Option<String>) -> Result<Args, ConfigError> {
    let num = |key: &str, default: u64| -> u64 {
        match var(key) {
            None => default,
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                warn!(key, value = %raw, default, "not a number, using default");
                default
            }),
        }
    };
    let millis = |key: &str, default: u64| Duration::from_millis(num(key, default));
    let optional_millis = |key: &str| match num(key, 0) {
        0 => None,
        ms => Some(Duration::from_millis(ms)),
    };

    // ===== Account feed =====
    let ws_raw = cli
        .ws_url
        .or_else(|| var("WS_URL"))
        .unwrap_or_else(|| DEFAULT_WS_URL.to_string());
    let ws_url = parse_url("WS_URL", &ws_raw, &["ws", "wss"], "ws, wss")?;

    let reconnect_interval = millis("RECONNECT_INTERVAL_MS", 5000);
    let max_reconnect_attempts = u32::try_from(num("MAX_RECONNECT_ATTEMPTS", 10)).unwrap_or(u32::MAX);

    // WATCHED_ACCOUNTS=590423106,590454233
    let watched_accounts = match var("WATCHED_ACCOUNTS") {
        None => DEFAULT_WATCHED.to_vec(),
        Some(list) => {
            let mut out = Vec::new();
            for t in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let id = t.parse::<AccountId>().map_err(|_| ConfigError::WatchedAccount(t.to_string()))?;
                if !out.contains(&id) {
                    out.push(id);
                }
            }
            out
        }
    };

    // ===== Statistics poll =====
    let stats_raw = var("STATS_URL").unwrap_or_else(|| DEFAULT_STATS_URL.to_string());
    let stats_url = parse_url("STATS_URL", &stats_raw, &["http", "https"], "http, https")?;
    let stats_delay = millis("STATS_DELAY_MS", 2000);
    let stats_timeout = optional_millis("STATS_TIMEOUT_MS");
    let refresh_every = match num("REFRESH_SECS", 0) {
        0 => None,
        s => Some(Duration::from_secs(s)),
    };

    // ===== Coordination =====
    let use_coordinator = var("USE_COORDINATOR").map_or(true, |v| {
        !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off")
    });
    let settle_delay = millis("SETTLE_DELAY_MS", 100);
    let stagger = millis("STAGGER_MS", 200);

    // ===== User =====
    let prefs_file = cli
        .prefs_file
        .or_else(|| var("PREFS_FILE"))
        .unwrap_or_else(|| "prefs.json".to_string());
    let username = cli.username.or_else(|| var("USERNAME")).filter(|u| !u.trim().is_empty());

    // ===== Files / metrics =====
    let record_file = var("RECORD_FILE").filter(|p| !p.trim().is_empty());
    let metrics_port = u16::try_from(num("METRICS_PORT", 9898)).unwrap_or(9898);

    Ok(Args {
        ws_url,
        reconnect_interval,
        max_reconnect_attempts,
        watched_accounts,
        stats_url,
        stats_delay,
        stats_timeout,
        refresh_every,
        use_coordinator,
        settle_delay,
        stagger,
        prefs_file,
        account: cli.account.filter(|id| *id != 0),
        username,
        record_file,
        metrics_port,
    })
}

fn parse_url(
    key: &'static str,
    raw: &str,
    schemes: &[&str],
    expected: &'static str,
) -> Result<Url, ConfigError> {
    let url = Url::parse(raw.trim()).map_err(|source| ConfigError::InvalidUrl {
        key,
        value: raw.to_string(),
        source,
    })?;
    if !schemes.contains(&url.scheme()) {
        return Err(ConfigError::Scheme { key, scheme: url.scheme().to_string(), expected });
    }
    Ok(url)
}
