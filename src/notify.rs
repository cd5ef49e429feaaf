// ===============================
// src/notify.rs (typed topics)
// ===============================
//
// One broadcast topic per notification kind. Subscribing returns a receiver;
// dropping it unsubscribes. Publishing with no subscriber is not an error.
//
use tokio::sync::broadcast;

use crate::domain::{AccountsUpdate, StatusUpdate, WatchedAccount};

#[derive(Debug, Clone)]
pub struct Notifier {
    status_tx: broadcast::Sender<StatusUpdate>,
    accounts_tx: broadcast::Sender<AccountsUpdate>,
    watched_tx: broadcast::Sender<WatchedAccount>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (status_tx, _) = broadcast::channel(capacity);
        let (accounts_tx, _) = broadcast::channel(capacity);
        let (watched_tx, _) = broadcast::channel(capacity);
        Self { status_tx, accounts_tx, watched_tx }
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusUpdate> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_accounts(&self) -> broadcast::Receiver<AccountsUpdate> {
        self.accounts_tx.subscribe()
    }

    pub fn subscribe_watched(&self) -> broadcast::Receiver<WatchedAccount> {
        self.watched_tx.subscribe()
    }

    pub fn status(&self, update: StatusUpdate) {
        let _ = self.status_tx.send(update);
    }

    pub fn accounts(&self, update: AccountsUpdate) {
        let _ = self.accounts_tx.send(update);
    }

    pub fn watched(&self, update: WatchedAccount) {
        let _ = self.watched_tx.send(update);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
