// ===============================
// src/main.rs
// ===============================
/*
 # commands on stdin
   r            refresh (new loading cycle + statistics poll + account request)
   a <id>       switch the selected account
   s            force a coordinated start
   c / d        connect / disconnect the account feed
   q            quit

 # feed & poll health
curl -s localhost:9898/metrics | egrep '^(ws_|feed_|stats_polls|loading_cycles|coordinated_starts)'
*/
/*
=============================================================================
Project : mt5_sync — live MT5 account synchronization core in Rust
Module  : main.rs
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
mod bindings;
mod config;
mod connection;
mod coordinator;
mod demux;
mod domain;
mod metrics;
mod notify;
mod poll;
mod prefs;
mod recorder;
mod store;
mod transport;

use clap::Parser;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    select,
    sync::{broadcast, mpsc, watch},
    time::{interval, Duration, Interval, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bindings::{BalancePanel, StatsPanel};
use crate::connection::{ConnectionHandle, ConnectionManager, ManagerCfg};
use crate::coordinator::{CoordinatorCfg, ReadinessCoordinator};
use crate::demux::Demux;
use crate::domain::{AccountId, Event, TradingStats};
use crate::notify::Notifier;
use crate::poll::{PollCycle, StatsClient};
use crate::prefs::Prefs;
use crate::store::AccountStore;
use crate::transport::WsTransport;

/// What a user-triggered refresh needs to reach.
struct Refresher {
    coordinator: ReadinessCoordinator,
    handle: ConnectionHandle,
    stats: StatsClient,
    stats_tx: mpsc::Sender<TradingStats>,
    selection: watch::Sender<Option<AccountId>>,
    username: Option<String>,
    coordinated: bool,
}

impl Refresher {
    /// New loading cycle, one statistics poll after `delay`, re-request the selected account.
    async fn refresh(&self, delay: Duration) {
        let cycle = self.coordinator.start_loading_cycle();
        match &self.username {
            Some(u) => {
                let poll = PollCycle { username: u.clone(), initial_delay: delay, coordinated: self.coordinated };
                tokio::spawn(poll::run_cycle(
                    self.stats.clone(),
                    poll,
                    self.coordinator.clone(),
                    self.stats_tx.clone(),
                ));
            }
            None => {
                warn!(cycle, "no username configured, statistics poll skipped");
                // panels still get their start signal
                if self.coordinated {
                    self.coordinator.force_sync();
                }
            }
        }
        let selected = *self.selection.borrow();
        if let Some(id) = selected {
            self.handle.request_account(id).await;
        }
    }
}

enum Input {
    Refresh,
    Select(AccountId),
    ForceSync,
    Connect,
    Disconnect,
    Quit,
}

fn parse_input(line: &str) -> Option<Input> {
    let mut parts = line.split_whitespace();
    let cmd = parts.next()?;
    match cmd {
        "r" | "refresh" => Some(Input::Refresh),
        "a" | "account" => parts.next()?.parse().ok().filter(|id| *id != 0).map(Input::Select),
        "s" | "sync" => Some(Input::ForceSync),
        "c" | "connect" => Some(Input::Connect),
        "d" | "disconnect" => Some(Input::Disconnect),
        "q" | "quit" | "exit" => Some(Input::Quit),
        _ => None,
    }
}

async fn tick_opt(t: &mut Option<Interval>) {
    match t {
        Some(t) => {
            t.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let cli = config::Cli::parse();
    let args = match config::load(cli) {
        Ok(a) => a,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));

    // ---- Prefs: selected account & username ----
    let mut prefs = match Prefs::load(&args.prefs_file).await {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "prefs unreadable, starting empty");
            Prefs::empty(&args.prefs_file)
        }
    };
    if let Some(id) = args.account {
        prefs.set_current_account(id);
    }
    if let Some(u) = &args.username {
        prefs.set_string(prefs::USERNAME_KEY, u.clone());
    }
    if args.account.is_some() || args.username.is_some() {
        if let Err(e) = prefs.save().await {
            warn!(error = %e, "could not persist prefs");
        }
    }
    let username = prefs.username().map(str::to_string);

    info!(
        ws_url = %args.ws_url,
        stats_url = %args.stats_url,
        reconnect_ms = args.reconnect_interval.as_millis() as u64,
        max_attempts = args.max_reconnect_attempts,
        watched = ?args.watched_accounts,
        coordinated = args.use_coordinator,
        account = ?prefs.current_account_id(),
        username = ?username,
        "startup config"
    );

    // ---- Core ----
    let store = AccountStore::new();
    let notifier = Notifier::new(256);
    let coordinator = ReadinessCoordinator::new(CoordinatorCfg {
        settle_delay: args.settle_delay,
        stagger: args.stagger,
    });
    let (selection_tx, selection_rx) = watch::channel(prefs.current_account_id());

    let demux = Demux::new(store.clone(), args.watched_accounts.iter().copied(), notifier.clone());
    let (manager, handle) = ConnectionManager::new(
        WsTransport,
        ManagerCfg {
            url: args.ws_url.clone(),
            reconnect_interval: args.reconnect_interval,
            max_reconnect_attempts: args.max_reconnect_attempts,
        },
        demux,
        notifier.clone(),
    );

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Event>(8192);
    let recording = args.record_file.is_some();
    if let Some(path) = args.record_file.clone() {
        tokio::spawn(recorder::run(rec_rx, path));
        tokio::spawn(record_signals(notifier.clone(), coordinator.clone(), rec_tx.clone()));
        let _ = rec_tx.try_send(Event::Note(format!("started, feed {}", args.ws_url)));
    }

    // ---- Panels ----
    // Fan-out stats: poll -> (recorder, stats panel)
    let (stats_tx, mut stats_central_rx) = mpsc::channel::<TradingStats>(16);
    let (stats_panel_tx, stats_panel_rx) = mpsc::channel::<TradingStats>(16);
    tokio::spawn({
        let rec_tx = rec_tx.clone();
        async move {
            while let Some(s) = stats_central_rx.recv().await {
                if recording {
                    let _ = rec_tx.try_send(Event::Stats(s.clone()));
                }
                if stats_panel_tx.send(s).await.is_err() {
                    break;
                }
            }
        }
    });
    tokio::spawn(bindings::run_balance(
        BalancePanel::new(*selection_rx.borrow(), args.use_coordinator, args.stagger),
        notifier.clone(),
        coordinator.clone(),
        selection_rx.clone(),
    ));
    tokio::spawn(bindings::run_stats(
        StatsPanel::new(args.use_coordinator, args.stagger),
        stats_panel_rx,
        coordinator.clone(),
    ));

    // ---- Start ----
    let manager_task = tokio::spawn(manager.run());
    handle.connect().await;

    let stats = match StatsClient::new(args.stats_url.as_str(), args.stats_timeout) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "statistics client unavailable");
            std::process::exit(2);
        }
    };
    let refresher = Refresher {
        coordinator: coordinator.clone(),
        handle: handle.clone(),
        stats,
        stats_tx,
        selection: selection_tx,
        username,
        coordinated: args.use_coordinator,
    };
    refresher.refresh(args.stats_delay).await;

    // ---- Command loop + heartbeat ----
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut status_rx = notifier.subscribe_status();
    let mut watched_rx = notifier.subscribe_watched();
    let mut refresh_tick = args.refresh_every.map(|every| {
        let mut t = interval(every);
        t.set_missed_tick_behavior(MissedTickBehavior::Delay);
        t.reset();
        t
    });
    let mut heartbeat = interval(Duration::from_secs(30));
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(l)) => match parse_input(&l) {
                    Some(Input::Refresh) => refresher.refresh(Duration::ZERO).await,
                    Some(Input::Select(id)) => {
                        prefs.set_current_account(id);
                        if let Err(e) = prefs.save().await {
                            warn!(error = %e, "could not persist selected account");
                        }
                        refresher.selection.send_replace(Some(id));
                        info!(account_id = id, "account selected");
                        refresher.refresh(Duration::ZERO).await;
                    }
                    Some(Input::ForceSync) => coordinator.force_sync(),
                    Some(Input::Connect) => handle.connect().await,
                    Some(Input::Disconnect) => handle.disconnect().await,
                    Some(Input::Quit) => break,
                    None if l.trim().is_empty() => {}
                    None => warn!(input = %l.trim(), "unknown command (r, a <id>, s, c, d, q)"),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    warn!(error = %e, "stdin unreadable, commands disabled");
                    stdin_open = false;
                }
            },
            _ = tick_opt(&mut refresh_tick) => refresher.refresh(Duration::ZERO).await,
            st = status_rx.recv() => match st {
                Ok(u) => info!(state = ?u.state, attempts = u.attempts, status = %u, "feed status"),
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "status updates lagged"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            w = watched_rx.recv() => {
                if let Ok(w) = w {
                    info!(
                        account_id = w.id,
                        name = %w.snapshot.name,
                        balance = w.snapshot.balance,
                        equity = w.snapshot.equity,
                        degraded = w.snapshot.is_degraded(),
                        "watched account"
                    );
                }
            },
            _ = heartbeat.tick() => {
                let selected = *refresher.selection.borrow();
                let equity = selected.map(|id| store.value_or(id, |s| s.equity, 0.0));
                info!(state = ?handle.state(), accounts = store.len(), selected = ?selected, equity = ?equity, "heartbeat");
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("shutting down");
    handle.shutdown().await;
    let _ = manager_task.await;
}

/// Journal feed status, aggregate frames and coordination signals.
async fn record_signals(notifier: Notifier, coordinator: ReadinessCoordinator, tx: mpsc::Sender<Event>) {
    let mut status = notifier.subscribe_status();
    let mut accounts = notifier.subscribe_accounts();
    let mut phases = coordinator.subscribe_phases();
    let mut starts = coordinator.subscribe();

    loop {
        let ev = select! {
            Ok(u) = status.recv() => Event::Status(u),
            Ok(u) = accounts.recv() => {
                let mut list: Vec<_> = u.accounts.iter().map(|(id, s)| (*id, s.clone())).collect();
                list.sort_by_key(|(id, _)| *id);
                Event::Accounts { ts_ms: u.ts_ms, accounts: list }
            },
            Ok(p) = phases.recv() => Event::Phase(p),
            Ok(s) = starts.recv() => Event::Animation(s),
            else => break,
        };
        if tx.try_send(ev).is_err() {
            warn!("recorder queue full, event dropped");
        }
    }
}
