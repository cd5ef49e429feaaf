// ===============================
// src/domain.rs
// ===============================
use ahash::AHashMap as HashMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub type AccountId = u64;
pub type AccountMap = HashMap<AccountId, AccountSnapshot>;

/// Threshold below which two metric values count as the same number.
pub const CHANGE_EPSILON: f64 = 0.001;

// null -> Default (the feed sends `null` for empty strings/lists)
fn nullable<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= CHANGE_EPSILON
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    #[serde(deserialize_with = "nullable")]
    pub symbol: String,
    #[serde(rename = "type", deserialize_with = "nullable")]
    pub side: String,
    #[serde(deserialize_with = "nullable")]
    pub volume: f64,
    #[serde(deserialize_with = "nullable")]
    pub open_price: f64,
    #[serde(deserialize_with = "nullable")]
    pub current_price: f64,
    #[serde(deserialize_with = "nullable")]
    pub profit: f64,
}

impl Position {
    fn materially_eq(&self, o: &Position) -> bool {
        self.symbol == o.symbol
            && self.side == o.side
            && close(self.volume, o.volume)
            && close(self.open_price, o.open_price)
            && close(self.current_price, o.current_price)
            && close(self.profit, o.profit)
    }
}

/// Full metrics record for one brokerage account as pushed by the feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSnapshot {
    #[serde(deserialize_with = "nullable")]
    pub name: String,
    #[serde(deserialize_with = "nullable")]
    pub login: u64,
    #[serde(deserialize_with = "nullable")]
    pub server: String,
    #[serde(deserialize_with = "nullable")]
    pub balance: f64,
    #[serde(deserialize_with = "nullable")]
    pub equity: f64,
    #[serde(deserialize_with = "nullable")]
    pub margin: f64,
    #[serde(deserialize_with = "nullable")]
    pub free_margin: f64,
    #[serde(deserialize_with = "nullable")]
    pub profit: f64,
    pub timestamp: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub positions: Vec<Position>,
    pub error: Option<String>,
}

impl AccountSnapshot {
    /// An account reporting an error carries stale numbers.
    pub fn is_degraded(&self) -> bool {
        self.error.as_deref().map_or(false, |e| !e.is_empty())
    }

    pub fn floating_pl(&self) -> f64 {
        self.equity - self.balance
    }

    /// Equality that ignores float noise and the feed timestamp.
    pub fn materially_eq(&self, o: &AccountSnapshot) -> bool {
        self.name == o.name
            && self.login == o.login
            && self.server == o.server
            && self.error == o.error
            && close(self.balance, o.balance)
            && close(self.equity, o.equity)
            && close(self.margin, o.margin)
            && close(self.free_margin, o.free_margin)
            && close(self.profit, o.profit)
            && self.positions.len() == o.positions.len()
            && self
                .positions
                .iter()
                .zip(&o.positions)
                .all(|(a, b)| a.materially_eq(b))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
    ReconnectScheduled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusKind {
    Connecting,
    Connected,
    Error(String),
    Closed(Option<String>),
    Reconnecting { attempt: u32, max: u32 },
    Exhausted { max: u32 },
    Closing,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub state: ConnState,
    pub attempts: u32,
    pub kind: StatusKind,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Connecting => write!(f, "Connecting..."),
            StatusKind::Connected => write!(f, "Connected"),
            StatusKind::Error(e) => write!(f, "Error: {e}"),
            StatusKind::Closed(Some(r)) => write!(f, "Disconnected ({r})"),
            StatusKind::Closed(None) => write!(f, "Disconnected"),
            StatusKind::Reconnecting { attempt, max } => {
                write!(f, "Reconnecting ({attempt}/{max})...")
            }
            StatusKind::Exhausted { max } => {
                write!(f, "Reconnect failed after {max} attempts")
            }
            StatusKind::Closing => write!(f, "Closing"),
            StatusKind::Disconnected => write!(f, "Disconnected"),
        }
    }
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

/// Aggregate notification: the whole store after one frame.
#[derive(Debug, Clone)]
pub struct AccountsUpdate {
    pub ts_ms: i64,
    pub accounts: Arc<AccountMap>,
}

#[derive(Debug, Clone)]
pub struct WatchedAccount {
    pub id: AccountId,
    pub snapshot: AccountSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoadingPhase {
    Started { cycle: u64 },
    Completed { cycle: u64 },
}

/// Coordinated "start animations" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnimationStart {
    pub cycle: u64,
    pub stagger: Duration,
}

/// Payload of the trading-statistics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingStats {
    #[serde(deserialize_with = "nullable")]
    pub success: bool,
    pub message: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub profit_loss: f64,
    #[serde(deserialize_with = "nullable")]
    pub average_profit_loss: f64,
    #[serde(deserialize_with = "nullable")]
    pub number_of_trades: i64,
    #[serde(deserialize_with = "nullable")]
    pub average_trade_duration: String,
    #[serde(deserialize_with = "nullable")]
    pub average_trade_volume: f64,
    #[serde(deserialize_with = "nullable")]
    pub best_trade: f64,
}

/// Journal line written by the recorder.
#[derive(Debug, Clone, Serialize)]
pub enum Event {
    Status(StatusUpdate),
    Accounts { ts_ms: i64, accounts: Vec<(AccountId, AccountSnapshot)> },
    Stats(TradingStats),
    Phase(LoadingPhase),
    Animation(AnimationStart),
    Note(String),
}
