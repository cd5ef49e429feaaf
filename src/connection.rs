// ===============================
// src/connection.rs (account feed lifecycle)
// ===============================
//
// Owns the socket: connect, dispatch frames into the demux (inline, so frames
// are applied strictly in arrival order), detect close/error and retry after a
// fixed delay up to `max_reconnect_attempts` consecutive failures. Running out
// of attempts parks the manager in `Disconnected` until `connect()` is called.
//
use chrono::Utc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::demux::Demux;
use crate::domain::{AccountId, ConnState, StatusKind, StatusUpdate};
use crate::metrics::{WS_CONNECTED, WS_EXHAUSTED, WS_LAST_FRAME_TS, WS_RECONNECTS};
use crate::notify::Notifier;
use crate::transport::{Connection, Inbound, Transport};

#[derive(Debug, Clone)]
pub struct ManagerCfg {
    pub url: Url,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFailure {
    Retry { attempt: u32 },
    Exhausted,
}

/// Connection state plus the reconnect counter. Pure bookkeeping, no I/O.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnState,
    attempts: u32,
    max_attempts: u32,
}

impl Lifecycle {
    pub fn new(max_attempts: u32) -> Self {
        Self { state: ConnState::Disconnected, attempts: 0, max_attempts: max_attempts.max(1) }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Explicit connect. Only valid from `Disconnected`; starts a fresh budget.
    pub fn connect_requested(&mut self) -> bool {
        if self.state != ConnState::Disconnected {
            return false;
        }
        self.attempts = 0;
        self.state = ConnState::Connecting;
        true
    }

    pub fn opened(&mut self) {
        self.attempts = 0;
        self.state = ConnState::Connected;
    }

    /// Open failed or an open connection dropped.
    pub fn failed(&mut self) -> AfterFailure {
        if self.attempts + 1 >= self.max_attempts {
            self.state = ConnState::Disconnected;
            AfterFailure::Exhausted
        } else {
            self.attempts += 1;
            self.state = ConnState::ReconnectScheduled;
            AfterFailure::Retry { attempt: self.attempts }
        }
    }

    /// Reconnect delay elapsed.
    pub fn retry_due(&mut self) {
        self.state = ConnState::Connecting;
    }

    pub fn closing(&mut self) {
        self.state = ConnState::Closing;
    }

    pub fn closed(&mut self) {
        self.state = ConnState::Disconnected;
    }
}

#[derive(Debug)]
pub enum Command {
    Connect,
    RequestAccount(AccountId),
    Disconnect,
    Shutdown,
}

/// Cheap cloneable front for the manager task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnState>,
}

impl ConnectionHandle {
    pub async fn connect(&self) {
        self.send(Command::Connect).await;
    }

    /// Fire-and-forget refresh request for one account.
    pub async fn request_account(&self, id: AccountId) {
        self.send(Command::RequestAccount(id)).await;
    }

    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }

    pub async fn shutdown(&self) {
        self.send(Command::Shutdown).await;
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnState> {
        self.state_rx.clone()
    }

    async fn send(&self, cmd: Command) {
        if let Err(e) = self.cmd_tx.send(cmd).await {
            debug!(cmd = ?e.0, "connection manager gone, command dropped");
        }
    }
}

enum Flow {
    Idle,
    Stop,
}

enum End {
    Dropped(Option<String>),
    Stop(Flow),
}

pub struct ConnectionManager<T: Transport> {
    transport: T,
    cfg: ManagerCfg,
    demux: Demux,
    notifier: Notifier,
    life: Lifecycle,
    cmd_rx: mpsc::Receiver<Command>,
    state_tx: watch::Sender<ConnState>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(transport: T, cfg: ManagerCfg, demux: Demux, notifier: Notifier) -> (Self, ConnectionHandle) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnState::Disconnected);
        let life = Lifecycle::new(cfg.max_reconnect_attempts);
        let mgr = Self { transport, cfg, demux, notifier, life, cmd_rx, state_tx };
        (mgr, ConnectionHandle { cmd_tx, state_rx })
    }

    pub async fn run(mut self) {
        info!(url = %self.cfg.url, max_attempts = self.cfg.max_reconnect_attempts, "connection manager started");
        loop {
            if !self.wait_for_connect().await {
                break;
            }
            match self.drive().await {
                Flow::Idle => continue,
                Flow::Stop => break,
            }
        }
        WS_CONNECTED.set(0);
        info!("connection manager stopped");
    }

    fn publish(&self, kind: StatusKind) {
        let state = self.life.state();
        let _ = self.state_tx.send(state);
        let update = StatusUpdate { state, attempts: self.life.attempts(), kind };
        info!(state = ?state, attempts = update.attempts, "feed status: {}", update);
        self.notifier.status(update);
    }

    /// Block in `Disconnected` until told to connect. False means stop.
    async fn wait_for_connect(&mut self) -> bool {
        loop {
            match self.cmd_rx.recv().await {
                None | Some(Command::Shutdown) => return false,
                Some(Command::Connect) => {
                    if self.life.connect_requested() {
                        self.publish(StatusKind::Connecting);
                        return true;
                    }
                }
                Some(Command::Disconnect) => {}
                Some(Command::RequestAccount(id)) => {
                    debug!(account_id = id, "not connected, account request dropped");
                }
            }
        }
    }

    /// Connecting -> Connected -> ... until exhausted or told to stop.
    async fn drive(&mut self) -> Flow {
        loop {
            // None: the open itself failed (already reported as an error)
            let dropped = match self.open().await {
                Ok(Some(conn)) => {
                    self.life.opened();
                    WS_CONNECTED.set(1);
                    self.publish(StatusKind::Connected);
                    match self.pump(conn).await {
                        End::Dropped(reason) => {
                            WS_CONNECTED.set(0);
                            Some(reason)
                        }
                        End::Stop(flow) => return flow,
                    }
                }
                Ok(None) => None,
                Err(flow) => return flow,
            };

            let next = self.life.failed();
            if let Some(reason) = dropped {
                self.publish(StatusKind::Closed(reason));
            }
            match next {
                AfterFailure::Exhausted => {
                    WS_EXHAUSTED.inc();
                    let max = self.cfg.max_reconnect_attempts;
                    error!(max, "reconnect budget exhausted, waiting for explicit connect");
                    self.publish(StatusKind::Exhausted { max });
                    return Flow::Idle;
                }
                AfterFailure::Retry { attempt } => {
                    WS_RECONNECTS.inc();
                    self.publish(StatusKind::Reconnecting { attempt, max: self.cfg.max_reconnect_attempts });
                    if let Some(flow) = self.wait_retry().await {
                        return flow;
                    }
                    self.life.retry_due();
                    self.publish(StatusKind::Connecting);
                }
            }
        }
    }

    /// Ok(Some) opened, Ok(None) open failed, Err(flow) interrupted by a command.
    async fn open(&mut self) -> Result<Option<T::Conn>, Flow> {
        let open = self.transport.open(&self.cfg.url);
        tokio::pin!(open);
        loop {
            tokio::select! {
                res = &mut open => {
                    return match res {
                        Ok(conn) => Ok(Some(conn)),
                        Err(e) => {
                            warn!(error = %e, url = %self.cfg.url, "feed open failed");
                            self.publish(StatusKind::Error(e.to_string()));
                            Ok(None)
                        }
                    };
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        self.life.closed();
                        self.publish(StatusKind::Disconnected);
                        return Err(Flow::Stop);
                    }
                    Some(Command::Disconnect) => {
                        self.life.closed();
                        self.publish(StatusKind::Disconnected);
                        return Err(Flow::Idle);
                    }
                    Some(Command::Connect) => {}
                    Some(Command::RequestAccount(id)) => {
                        debug!(account_id = id, "still connecting, account request dropped");
                    }
                },
            }
        }
    }

    async fn pump(&mut self, mut conn: T::Conn) -> End {
        loop {
            tokio::select! {
                item = conn.recv() => match item {
                    Some(Ok(Inbound::Text(text))) => {
                        WS_LAST_FRAME_TS.set(Utc::now().timestamp());
                        self.demux.on_frame(&text);
                    }
                    Some(Ok(Inbound::Closed(reason))) => return End::Dropped(reason),
                    Some(Err(e)) => {
                        warn!(error = %e, "feed read error");
                        self.publish(StatusKind::Error(e.to_string()));
                        return End::Dropped(Some(e.to_string()));
                    }
                    None => return End::Dropped(None),
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::RequestAccount(id)) => {
                        let body = serde_json::json!({ "request_account": id.to_string() }).to_string();
                        if let Err(e) = conn.send_text(body).await {
                            warn!(error = %e, account_id = id, "account request failed");
                            self.publish(StatusKind::Error(e.to_string()));
                            return End::Dropped(Some(e.to_string()));
                        }
                        debug!(account_id = id, "account refresh requested");
                    }
                    Some(Command::Connect) => debug!("already connected"),
                    Some(Command::Disconnect) => {
                        self.close(conn).await;
                        return End::Stop(Flow::Idle);
                    }
                    None | Some(Command::Shutdown) => {
                        self.close(conn).await;
                        return End::Stop(Flow::Stop);
                    }
                },
            }
        }
    }

    /// Deliberate close: frames are no longer dispatched and the close never
    /// feeds back into the retry path.
    async fn close(&mut self, mut conn: T::Conn) {
        self.life.closing();
        self.publish(StatusKind::Closing);
        conn.close().await;
        WS_CONNECTED.set(0);
        self.life.closed();
        self.publish(StatusKind::Disconnected);
    }

    /// Sleep out the reconnect delay. `Some(flow)` if a command cut it short.
    async fn wait_retry(&mut self) -> Option<Flow> {
        let delay = sleep(self.cfg.reconnect_interval);
        tokio::pin!(delay);
        loop {
            tokio::select! {
                _ = &mut delay => return None,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(Command::Shutdown) => {
                        self.life.closed();
                        self.publish(StatusKind::Disconnected);
                        return Some(Flow::Stop);
                    }
                    Some(Command::Disconnect) => {
                        self.life.closed();
                        self.publish(StatusKind::Disconnected);
                        return Some(Flow::Idle);
                    }
                    Some(Command::Connect) => {}
                    Some(Command::RequestAccount(id)) => {
                        debug!(account_id = id, "reconnect pending, account request dropped");
                    }
                },
            }
        }
    }
}
