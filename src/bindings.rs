// ===============================
// src/bindings.rs (headless consumers)
// ===============================
//
// Balance and statistics panels without a GUI: they format what a dashboard
// would show, decide which elements animate, and log it. In coordinated mode
// the text is updated at once but the reveal waits for the coordinator's
// start signal; otherwise the reveal happens immediately.
//
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::coordinator::ReadinessCoordinator;
use crate::domain::{AccountId, AccountMap, AccountSnapshot, LoadingPhase, TradingStats, CHANGE_EPSILON};
use crate::notify::Notifier;

/// `1234567.891` -> `1,234,567.89`
pub fn fmt_money(v: f64) -> String {
    let s = format!("{:.2}", v.abs());
    let (int, frac) = s.split_once('.').unwrap_or((s.as_str(), "00"));
    let mut grouped = String::with_capacity(int.len() + int.len() / 3);
    for (i, ch) in int.chars().enumerate() {
        if i > 0 && (int.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    let sign = if v < 0.0 && s != "0.00" { "-" } else { "" };
    format!("{sign}{grouped}.{frac}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Positive,
    Negative,
    Neutral,
}

fn tone(v: f64) -> Tone {
    if v > CHANGE_EPSILON {
        Tone::Positive
    } else if v < -CHANGE_EPSILON {
        Tone::Negative
    } else {
        Tone::Neutral
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealStep {
    pub element: &'static str,
    pub delay: Duration,
}

/// Which elements animate in, and when relative to the signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reveal {
    pub steps: Vec<RevealStep>,
}

impl Reveal {
    fn staggered(elements: &[&'static str], stagger: Duration) -> Self {
        let steps = elements
            .iter()
            .enumerate()
            .map(|(i, e)| RevealStep { element: *e, delay: stagger * i as u32 })
            .collect();
        Self { steps }
    }
}

// ---------------- Balance ----------------

#[derive(Debug, Clone, PartialEq)]
pub struct BalanceView {
    pub account_id: AccountId,
    pub balance: String,
    pub equity: String,
    pub floating_pl: String,
    pub equity_tone: Tone,
    pub pl_tone: Tone,
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BalanceOutcome {
    NoSelection,
    NotFound(AccountId),
    /// Text updated; `reveal` is None while waiting for the coordinator.
    Updated { view: BalanceView, reveal: Option<Reveal> },
}

#[derive(Debug)]
pub struct BalancePanel {
    selected: Option<AccountId>,
    coordinated: bool,
    stagger: Duration,
    previous: Option<[f64; 3]>,
    first_update: bool,
    cached: Option<AccountSnapshot>,
}

impl BalancePanel {
    pub fn new(selected: Option<AccountId>, coordinated: bool, stagger: Duration) -> Self {
        Self { selected, coordinated, stagger, previous: None, first_update: true, cached: None }
    }

    pub fn selected(&self) -> Option<AccountId> {
        self.selected
    }

    pub fn select(&mut self, id: Option<AccountId>) {
        if self.selected != id {
            self.selected = id;
            self.cached = None;
            self.first_update = true;
        }
    }

    /// A new loading cycle forces every field to animate again.
    pub fn on_loading_started(&mut self) {
        self.first_update = true;
    }

    pub fn on_accounts(&mut self, accounts: &AccountMap) -> BalanceOutcome {
        let Some(id) = self.selected else {
            return BalanceOutcome::NoSelection;
        };
        let Some(snap) = accounts.get(&id) else {
            return BalanceOutcome::NotFound(id);
        };
        let view = view_of(id, snap);
        if self.coordinated {
            self.cached = Some(snap.clone());
            BalanceOutcome::Updated { view, reveal: None }
        } else {
            let reveal = self.reveal_for(snap, self.stagger);
            BalanceOutcome::Updated { view, reveal: Some(reveal) }
        }
    }

    /// Coordinated start; a zero stagger falls back to the panel's own.
    pub fn on_animation_start(&mut self, stagger: Duration) -> Option<Reveal> {
        let snap = self.cached.clone()?;
        let stagger = if stagger.is_zero() { self.stagger } else { stagger };
        Some(self.reveal_for(&snap, stagger))
    }

    fn reveal_for(&mut self, snap: &AccountSnapshot, stagger: Duration) -> Reveal {
        let now = [snap.balance, snap.equity, snap.floating_pl()];
        let changed: Vec<&'static str> = ["balance", "equity", "floating_pl"]
            .into_iter()
            .enumerate()
            .filter(|(i, _)| {
                self.first_update
                    || self.previous.map_or(true, |p| (p[*i] - now[*i]).abs() > CHANGE_EPSILON)
            })
            .map(|(_, name)| name)
            .collect();
        self.previous = Some(now);
        self.first_update = false;
        Reveal::staggered(&changed, stagger)
    }
}

fn view_of(id: AccountId, s: &AccountSnapshot) -> BalanceView {
    let pl = s.floating_pl();
    BalanceView {
        account_id: id,
        balance: format!("Balance: ${}", fmt_money(s.balance)),
        equity: format!("Equity: ${}", fmt_money(s.equity)),
        floating_pl: format!("Floating P/L: ${}", fmt_money(pl)),
        equity_tone: tone(pl),
        pl_tone: if pl >= 0.0 { Tone::Positive } else { Tone::Negative },
        warning: s.error.clone().filter(|e| !e.is_empty()),
    }
}

// ---------------- Trading statistics ----------------

#[derive(Debug, Clone, PartialEq)]
pub struct StatsView {
    pub profit_loss: String,
    pub average_profit_loss: String,
    pub number_of_trades: String,
    pub average_trade_duration: String,
    pub average_trade_volume: String,
    pub best_trade: String,
}

impl From<&TradingStats> for StatsView {
    fn from(s: &TradingStats) -> Self {
        Self {
            profit_loss: format!("${:.2}", s.profit_loss),
            average_profit_loss: format!("${:.2}", s.average_profit_loss),
            number_of_trades: format!("Trades: {}", s.number_of_trades),
            average_trade_duration: s.average_trade_duration.clone(),
            average_trade_volume: format!("{:.2}", s.average_trade_volume),
            best_trade: format!("${:.2}", s.best_trade),
        }
    }
}

const STATS_ELEMENTS: [&str; 6] = [
    "profit_loss",
    "average_profit_loss",
    "number_of_trades",
    "average_trade_duration",
    "average_trade_volume",
    "best_trade",
];

#[derive(Debug)]
pub struct StatsPanel {
    coordinated: bool,
    stagger: Duration,
    cached: Option<TradingStats>,
    revealed: bool,
}

impl StatsPanel {
    pub fn new(coordinated: bool, stagger: Duration) -> Self {
        Self { coordinated, stagger, cached: None, revealed: false }
    }

    pub fn on_refresh(&mut self) {
        self.revealed = false;
    }

    pub fn on_stats(&mut self, stats: TradingStats) -> (StatsView, Option<Reveal>) {
        let view = StatsView::from(&stats);
        self.cached = Some(stats);
        let reveal = if self.coordinated { None } else { self.reveal(self.stagger) };
        (view, reveal)
    }

    pub fn on_animation_start(&mut self, stagger: Duration) -> Option<Reveal> {
        match &self.cached {
            Some(s) if s.success => self.reveal(stagger),
            _ => None,
        }
    }

    // once per cycle
    fn reveal(&mut self, stagger: Duration) -> Option<Reveal> {
        if self.revealed {
            return None;
        }
        self.revealed = true;
        Some(Reveal::staggered(&STATS_ELEMENTS, stagger))
    }
}

// ---------------- Tasks ----------------

fn log_reveal(panel: &str, r: &Reveal) {
    let plan: Vec<String> = r.steps.iter().map(|s| format!("{}+{}ms", s.element, s.delay.as_millis())).collect();
    info!(panel, ?plan, "reveal");
}

pub async fn run_balance(
    mut panel: BalancePanel,
    notifier: Notifier,
    coordinator: ReadinessCoordinator,
    mut selection: watch::Receiver<Option<AccountId>>,
) {
    let mut accounts = notifier.subscribe_accounts();
    let mut starts = coordinator.subscribe();
    let mut phases = coordinator.subscribe_phases();

    loop {
        tokio::select! {
            update = accounts.recv() => match update {
                Ok(u) => match panel.on_accounts(&u.accounts) {
                    BalanceOutcome::Updated { view, reveal } => {
                        if let Some(w) = &view.warning {
                            warn!(account_id = view.account_id, warning = %w, "account degraded, values may be stale");
                        }
                        info!(account_id = view.account_id, balance = %view.balance, equity = %view.equity, pl = %view.floating_pl, "balance");
                        match reveal {
                            Some(r) => log_reveal("balance", &r),
                            None => coordinator.mark_socket_fresh(),
                        }
                    }
                    BalanceOutcome::NotFound(id) => debug!(account_id = id, "selected account not in frame"),
                    BalanceOutcome::NoSelection => debug!("no account selected"),
                },
                Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "balance panel lagging"),
                Err(broadcast::error::RecvError::Closed) => break,
            },
            sig = starts.recv() => match sig {
                Ok(s) => {
                    if let Some(r) = panel.on_animation_start(s.stagger) {
                        log_reveal("balance", &r);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            phase = phases.recv() => {
                if let Ok(LoadingPhase::Started { .. }) = phase {
                    panel.on_loading_started();
                }
            },
            changed = selection.changed() => {
                if changed.is_err() {
                    break;
                }
                let id = *selection.borrow();
                panel.select(id);
                info!(account_id = ?id, "balance panel switched account");
            },
        }
    }
}

pub async fn run_stats(
    mut panel: StatsPanel,
    mut stats_rx: mpsc::Receiver<TradingStats>,
    coordinator: ReadinessCoordinator,
) {
    let mut starts = coordinator.subscribe();
    let mut phases = coordinator.subscribe_phases();

    loop {
        tokio::select! {
            stats = stats_rx.recv() => {
                let Some(stats) = stats else { break };
                let (view, reveal) = panel.on_stats(stats);
                info!(
                    profit_loss = %view.profit_loss,
                    avg = %view.average_profit_loss,
                    trades = %view.number_of_trades,
                    duration = %view.average_trade_duration,
                    volume = %view.average_trade_volume,
                    best = %view.best_trade,
                    "trading statistics"
                );
                if let Some(r) = reveal {
                    log_reveal("stats", &r);
                }
            },
            sig = starts.recv() => match sig {
                Ok(s) => {
                    if let Some(r) = panel.on_animation_start(s.stagger) {
                        log_reveal("stats", &r);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            phase = phases.recv() => {
                if let Ok(LoadingPhase::Started { .. }) = phase {
                    panel.on_refresh();
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAGGER: Duration = Duration::from_millis(100);

    fn accounts(id: AccountId, balance: f64, equity: f64) -> AccountMap {
        let mut m = AccountMap::default();
        m.insert(id, AccountSnapshot { balance, equity, ..Default::default() });
        m
    }

    fn elements(r: &Reveal) -> Vec<&'static str> {
        r.steps.iter().map(|s| s.element).collect()
    }

    #[test]
    fn money_formatting() {
        assert_eq!(fmt_money(1234567.891), "1,234,567.89");
        assert_eq!(fmt_money(-20.0), "-20.00");
        assert_eq!(fmt_money(999.999), "1,000.00");
        assert_eq!(fmt_money(-0.001), "0.00");
    }

    #[test]
    fn immediate_mode_reveals_changed_fields_only() {
        let mut p = BalancePanel::new(Some(7), false, STAGGER);
        let BalanceOutcome::Updated { view, reveal } = p.on_accounts(&accounts(7, 1000.0, 980.0)) else {
            panic!("expected update");
        };
        assert_eq!(view.balance, "Balance: $1,000.00");
        assert_eq!(view.floating_pl, "Floating P/L: $-20.00");
        assert_eq!(view.equity_tone, Tone::Negative);
        let r = reveal.unwrap();
        assert_eq!(elements(&r), vec!["balance", "equity", "floating_pl"]);
        assert_eq!(r.steps[2].delay, Duration::from_millis(200));

        // only equity (and therefore P/L) moved
        let BalanceOutcome::Updated { reveal, .. } = p.on_accounts(&accounts(7, 1000.0, 990.0)) else {
            panic!("expected update");
        };
        assert_eq!(elements(&reveal.unwrap()), vec!["equity", "floating_pl"]);

        let BalanceOutcome::Updated { reveal, .. } = p.on_accounts(&accounts(7, 1000.0002, 990.0)) else {
            panic!("expected update");
        };
        assert!(reveal.unwrap().steps.is_empty());
    }

    #[test]
    fn coordinated_mode_defers_reveal() {
        let mut p = BalancePanel::new(Some(7), true, STAGGER);
        assert_eq!(p.on_animation_start(STAGGER), None);

        let out = p.on_accounts(&accounts(7, 10.0, 10.0));
        assert!(matches!(out, BalanceOutcome::Updated { reveal: None, .. }));

        let r = p.on_animation_start(Duration::from_millis(250)).unwrap();
        assert_eq!(r.steps.len(), 3);
        assert_eq!(r.steps[1].delay, Duration::from_millis(250));

        p.on_loading_started();
        assert_eq!(p.on_animation_start(Duration::ZERO).unwrap().steps[1].delay, STAGGER);
    }

    #[test]
    fn selection_and_missing_accounts() {
        let mut p = BalancePanel::new(None, false, STAGGER);
        assert_eq!(p.on_accounts(&accounts(7, 1.0, 1.0)), BalanceOutcome::NoSelection);
        p.select(Some(8));
        assert_eq!(p.on_accounts(&accounts(7, 1.0, 1.0)), BalanceOutcome::NotFound(8));
        assert_eq!(p.selected(), Some(8));
    }

    #[test]
    fn degraded_account_carries_warning() {
        let mut m = accounts(7, 1.0, 1.0);
        m.get_mut(&7).unwrap().error = Some("no connection to trade server".into());
        let mut p = BalancePanel::new(Some(7), false, STAGGER);
        let BalanceOutcome::Updated { view, .. } = p.on_accounts(&m) else { panic!() };
        assert_eq!(view.warning.as_deref(), Some("no connection to trade server"));
    }

    #[test]
    fn stats_reveal_once_per_cycle() {
        let stats = TradingStats { success: true, number_of_trades: 4, profit_loss: -3.5, ..Default::default() };

        let mut immediate = StatsPanel::new(false, STAGGER);
        let (view, reveal) = immediate.on_stats(stats.clone());
        assert_eq!(view.profit_loss, "$-3.50");
        assert_eq!(view.number_of_trades, "Trades: 4");
        assert_eq!(reveal.unwrap().steps.len(), 6);
        assert!(immediate.on_stats(stats.clone()).1.is_none());

        let mut coordinated = StatsPanel::new(true, STAGGER);
        assert!(coordinated.on_stats(stats).1.is_none());
        let r = coordinated.on_animation_start(STAGGER).unwrap();
        assert_eq!(r.steps[5], RevealStep { element: "best_trade", delay: STAGGER * 5 });
        assert!(coordinated.on_animation_start(STAGGER).is_none());
        coordinated.on_refresh();
        assert!(coordinated.on_animation_start(STAGGER).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn panel_tasks_drive_the_barrier() {
        use crate::coordinator::CoordinatorCfg;
        use crate::domain::AccountsUpdate;
        use std::sync::Arc;
        use tokio::time::sleep;

        let notifier = Notifier::new(16);
        let co = ReadinessCoordinator::new(CoordinatorCfg::default());
        let (_selection_tx, selection_rx) = watch::channel(Some(7));
        let (stats_tx, stats_rx) = mpsc::channel(4);
        let mut starts = co.subscribe();

        tokio::spawn(run_balance(BalancePanel::new(Some(7), true, STAGGER), notifier.clone(), co.clone(), selection_rx));
        let stats_task = tokio::spawn(run_stats(StatsPanel::new(true, STAGGER), stats_rx, co.clone()));
        sleep(Duration::from_millis(1)).await;

        let cycle = co.start_loading_cycle();
        sleep(Duration::from_millis(1)).await;

        // a frame without the selected account does not count
        notifier.accounts(AccountsUpdate { ts_ms: 1, accounts: Arc::new(accounts(8, 5.0, 5.0)) });
        sleep(Duration::from_millis(1)).await;
        assert!(!co.snapshot().socket_fresh);

        notifier.accounts(AccountsUpdate { ts_ms: 2, accounts: Arc::new(accounts(7, 1000.0, 980.0)) });
        stats_tx.send(TradingStats { success: true, ..Default::default() }).await.unwrap();
        sleep(Duration::from_millis(1)).await;

        let flags = co.snapshot();
        assert!(flags.socket_fresh);
        assert!(!flags.poll_fresh);
        assert!(starts.try_recv().is_err());

        co.mark_poll_fresh();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(starts.try_recv().unwrap().cycle, cycle);
        assert!(starts.try_recv().is_err());

        // a second aggregate in the same cycle does not fire again
        notifier.accounts(AccountsUpdate { ts_ms: 3, accounts: Arc::new(accounts(7, 1000.0, 985.0)) });
        sleep(Duration::from_secs(1)).await;
        assert!(starts.try_recv().is_err());

        drop(stats_tx);
        stats_task.await.unwrap();
    }
}
