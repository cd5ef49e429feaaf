// ===============================
// src/coordinator.rs (two-source readiness barrier)
// ===============================
//
// The socket feed and the statistics poll each mark themselves fresh. Once
// both are fresh in the current loading cycle the coordinator waits a short
// settle delay and emits one `AnimationStart`. Each source still displays its
// own data immediately; only the animation trigger is gated.
//
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::domain::{AnimationStart, LoadingPhase};
use crate::metrics::{COORDINATED_STARTS, CYCLES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Socket,
    Poll,
}

/// Flags of one loading cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadinessCycle {
    pub id: u64,
    pub started: bool,
    pub socket_fresh: bool,
    pub poll_fresh: bool,
    pub fired: bool,
}

impl ReadinessCycle {
    pub fn start(&mut self) -> u64 {
        self.id += 1;
        self.started = true;
        self.socket_fresh = false;
        self.poll_fresh = false;
        self.fired = false;
        self.id
    }

    /// Record a fresh source. Returns the cycle id when this call completes
    /// the barrier; later calls in the same cycle return None.
    pub fn mark(&mut self, source: Source) -> Option<u64> {
        if !self.started {
            self.start();
        }
        match source {
            Source::Socket => self.socket_fresh = true,
            Source::Poll => self.poll_fresh = true,
        }
        if self.socket_fresh && self.poll_fresh && !self.fired {
            self.fired = true;
            Some(self.id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorCfg {
    pub settle_delay: Duration,
    pub stagger: Duration,
}

impl Default for CoordinatorCfg {
    fn default() -> Self {
        Self { settle_delay: Duration::from_millis(100), stagger: Duration::from_millis(200) }
    }
}

#[derive(Debug)]
struct Inner {
    cycle: Mutex<ReadinessCycle>,
    cfg: CoordinatorCfg,
    start_tx: broadcast::Sender<AnimationStart>,
    phase_tx: broadcast::Sender<LoadingPhase>,
}

#[derive(Debug, Clone)]
pub struct ReadinessCoordinator {
    inner: Arc<Inner>,
}

impl ReadinessCoordinator {
    pub fn new(cfg: CoordinatorCfg) -> Self {
        let (start_tx, _) = broadcast::channel(32);
        let (phase_tx, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner { cycle: Mutex::new(ReadinessCycle::default()), cfg, start_tx, phase_tx }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AnimationStart> {
        self.inner.start_tx.subscribe()
    }

    pub fn subscribe_phases(&self) -> broadcast::Receiver<LoadingPhase> {
        self.inner.phase_tx.subscribe()
    }

    pub fn snapshot(&self) -> ReadinessCycle {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ReadinessCycle> {
        self.inner.cycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin a user-visible refresh; clears both flags and the fired guard.
    pub fn start_loading_cycle(&self) -> u64 {
        let id = self.lock().start();
        self.announce_start(id);
        id
    }

    fn announce_start(&self, id: u64) {
        CYCLES.inc();
        debug!(cycle = id, "loading cycle started");
        let _ = self.inner.phase_tx.send(LoadingPhase::Started { cycle: id });
    }

    pub fn mark_socket_fresh(&self) {
        self.mark(Source::Socket);
    }

    pub fn mark_poll_fresh(&self) {
        self.mark(Source::Poll);
    }

    fn mark(&self, source: Source) {
        // a mark with no cycle open starts one, announced like any other
        let (opened, fire) = {
            let mut c = self.lock();
            let opened = if c.started { None } else { Some(c.start()) };
            (opened, c.mark(source))
        };
        if let Some(id) = opened {
            self.announce_start(id);
        }
        if let Some(cycle) = fire {
            info!(cycle, "both sources fresh, scheduling coordinated start");
            let _ = self.inner.phase_tx.send(LoadingPhase::Completed { cycle });
            self.emit_after_settle(Some(cycle));
        }
    }

    /// Emit a start signal after the settle delay regardless of the flags.
    pub fn force_sync(&self) {
        self.emit_after_settle(None);
    }

    // `only_for`: drop the signal if a newer cycle started while settling.
    fn emit_after_settle(&self, only_for: Option<u64>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            sleep(inner.cfg.settle_delay).await;
            let current = inner.cycle.lock().unwrap_or_else(PoisonError::into_inner).id;
            if let Some(cycle) = only_for {
                if cycle != current {
                    debug!(cycle, current, "cycle superseded while settling, signal dropped");
                    return;
                }
            }
            COORDINATED_STARTS.inc();
            let _ = inner.start_tx.send(AnimationStart { cycle: current, stagger: inner.cfg.stagger });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    fn coordinator() -> ReadinessCoordinator {
        ReadinessCoordinator::new(CoordinatorCfg::default())
    }

    async fn settle() {
        sleep(Duration::from_secs(1)).await;
    }

    #[test]
    fn barrier_completes_once_per_cycle() {
        let mut c = ReadinessCycle::default();
        let id = c.start();
        assert_eq!(c.mark(Source::Socket), None);
        assert_eq!(c.mark(Source::Poll), Some(id));
        assert_eq!(c.mark(Source::Poll), None);
        assert_eq!(c.mark(Source::Socket), None);

        let next = c.start();
        assert_eq!(next, id + 1);
        assert_eq!(c.mark(Source::Poll), None);
        assert_eq!(c.mark(Source::Socket), Some(next));
    }

    #[test]
    fn marking_without_a_cycle_opens_one() {
        let mut c = ReadinessCycle::default();
        assert_eq!(c.mark(Source::Socket), None);
        assert!(c.started);
        assert_eq!(c.mark(Source::Poll), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn lazily_opened_cycle_is_announced() {
        let co = coordinator();
        let mut phases = co.subscribe_phases();
        let mut rx = co.subscribe();

        co.mark_poll_fresh();
        assert_eq!(phases.try_recv().unwrap(), LoadingPhase::Started { cycle: 1 });
        assert!(phases.try_recv().is_err());

        co.mark_socket_fresh();
        assert_eq!(phases.try_recv().unwrap(), LoadingPhase::Completed { cycle: 1 });
        settle().await;
        assert_eq!(rx.try_recv().unwrap().cycle, 1);

        // an explicit cycle afterwards is announced once, not twice
        co.start_loading_cycle();
        co.mark_socket_fresh();
        assert_eq!(phases.try_recv().unwrap(), LoadingPhase::Started { cycle: 2 });
        assert!(phases.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_exactly_once_after_settle_delay() {
        let co = coordinator();
        let mut rx = co.subscribe();

        let cycle = co.start_loading_cycle();
        co.mark_socket_fresh();
        co.mark_poll_fresh();
        co.mark_socket_fresh();
        co.mark_poll_fresh();

        // nothing before the settle delay
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        settle().await;

        let sig = rx.try_recv().unwrap();
        assert_eq!(sig, AnimationStart { cycle, stagger: Duration::from_millis(200) });
        co.mark_poll_fresh();
        settle().await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn order_of_sources_does_not_matter() {
        for sources in [[Source::Poll, Source::Socket], [Source::Socket, Source::Poll]] {
            let co = coordinator();
            let mut rx = co.subscribe();
            co.start_loading_cycle();
            for s in sources {
                co.mark(s);
            }
            settle().await;
            assert!(rx.try_recv().is_ok());
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn each_cycle_fires_again() {
        let co = coordinator();
        let mut rx = co.subscribe();
        let mut phases = co.subscribe_phases();

        for _ in 0..2 {
            co.start_loading_cycle();
            co.mark_poll_fresh();
            co.mark_socket_fresh();
            settle().await;
        }
        assert_eq!(rx.try_recv().unwrap().cycle, 1);
        assert_eq!(rx.try_recv().unwrap().cycle, 2);
        assert_eq!(phases.try_recv().unwrap(), LoadingPhase::Started { cycle: 1 });
        assert_eq!(phases.try_recv().unwrap(), LoadingPhase::Completed { cycle: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_cycle_does_not_fire() {
        let co = coordinator();
        let mut rx = co.subscribe();

        co.start_loading_cycle();
        co.mark_poll_fresh();
        co.mark_socket_fresh();
        // refresh before the settle delay elapses
        co.start_loading_cycle();
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(!co.snapshot().fired);
    }

    #[tokio::test(start_paused = true)]
    async fn single_source_never_fires_and_force_sync_does() {
        let co = coordinator();
        let mut rx = co.subscribe();
        co.start_loading_cycle();
        co.mark_socket_fresh();
        settle().await;
        assert!(rx.try_recv().is_err());

        co.force_sync();
        settle().await;
        assert_eq!(rx.try_recv().unwrap().cycle, 1);
    }
}
