// ===============================
// src/demux.rs (frame -> per-account snapshots)
// ===============================
use ahash::AHashSet as HashSet;
use chrono::Utc;
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{AccountId, AccountSnapshot, AccountsUpdate, WatchedAccount};
use crate::metrics::{ACCOUNTS_DEGRADED, FRAMES, FRAMES_MALFORMED, KEYS_SKIPPED};
use crate::notify::Notifier;
use crate::store::{AccountStore, FrameApplied};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Default)]
pub struct DecodedFrame {
    pub accounts: Vec<(AccountId, AccountSnapshot)>,
    pub skipped: Vec<String>,
}

/// Parse `{ "<id>": {snapshot}, ... }`. Keys that are not account numbers are
/// collected in `skipped` instead of failing the frame.
pub fn decode_frame(text: &str) -> Result<DecodedFrame, FrameError> {
    let raw: BTreeMap<String, AccountSnapshot> = serde_json::from_str(text)?;
    let mut out = DecodedFrame::default();
    for (key, snap) in raw {
        match key.trim().parse::<AccountId>() {
            Ok(id) => out.accounts.push((id, snap)),
            Err(_) => out.skipped.push(key),
        }
    }
    Ok(out)
}

pub struct Demux {
    store: AccountStore,
    watched: HashSet<AccountId>,
    notifier: Notifier,
}

impl Demux {
    pub fn new(store: AccountStore, watched: impl IntoIterator<Item = AccountId>, notifier: Notifier) -> Self {
        Self { store, watched: watched.into_iter().collect(), notifier }
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Handle one text frame. Never fails: a bad frame is logged and dropped.
    pub fn on_frame(&self, text: &str) -> Option<FrameApplied> {
        let frame = match decode_frame(text) {
            Ok(f) => f,
            Err(e) => {
                FRAMES_MALFORMED.inc();
                warn!(error = %e, len = text.len(), "dropping malformed frame");
                return None;
            }
        };
        FRAMES.inc();

        for key in &frame.skipped {
            KEYS_SKIPPED.inc();
            debug!(%key, "skipping non-numeric account key");
        }

        let watched: Vec<WatchedAccount> = frame
            .accounts
            .iter()
            .filter(|(id, _)| self.watched.contains(id))
            .map(|(id, snap)| WatchedAccount { id: *id, snapshot: snap.clone() })
            .collect();

        let mut degraded = 0;
        for (id, snap) in &frame.accounts {
            if snap.is_degraded() {
                degraded += 1;
                warn!(account_id = id, error = ?snap.error, "account reports error, metrics are stale");
            }
        }
        ACCOUNTS_DEGRADED.set(degraded);

        let applied = self.store.apply_frame(frame.accounts);

        for w in watched {
            self.notifier.watched(w);
        }
        self.notifier.accounts(AccountsUpdate {
            ts_ms: Utc::now().timestamp_millis(),
            accounts: applied.accounts.clone(),
        });

        debug!(accounts = applied.accounts.len(), changed = applied.changed.len(), "account data updated");
        Some(applied)
    }
}
