// ===============================
// src/store.rs (latest snapshot per account)
// ===============================
//
// Copy-on-write map: writers clone the current map, apply the whole frame and
// swap the Arc in one step. Readers only ever hold a complete map.
//
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::{AccountId, AccountMap, AccountSnapshot};

#[derive(Debug, Clone, Default)]
pub struct AccountStore {
    inner: Arc<RwLock<Arc<AccountMap>>>,
}

/// Result of applying one frame.
#[derive(Debug, Clone)]
pub struct FrameApplied {
    pub changed: Vec<AccountId>,
    pub accounts: Arc<AccountMap>,
}

impl AccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace one record. Returns true when the value changed materially.
    pub fn upsert(&self, id: AccountId, snapshot: AccountSnapshot) -> bool {
        !self.apply_frame(vec![(id, snapshot)]).changed.is_empty()
    }

    pub fn apply_frame(&self, entries: Vec<(AccountId, AccountSnapshot)>) -> FrameApplied {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: AccountMap = (**guard).clone();
        let mut changed = Vec::with_capacity(entries.len());

        for (id, snap) in entries {
            let material = next.get(&id).map_or(true, |prev| !prev.materially_eq(&snap));
            if material && !changed.contains(&id) {
                changed.push(id);
            }
            next.insert(id, snap);
        }

        let accounts = Arc::new(next);
        *guard = accounts.clone();
        FrameApplied { changed, accounts }
    }

    pub fn get(&self, id: AccountId) -> Option<AccountSnapshot> {
        self.all().get(&id).cloned()
    }

    pub fn all(&self) -> Arc<AccountMap> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn contains(&self, id: AccountId) -> bool {
        self.all().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.all().len()
    }

    /// Read one field of an account, or `default` when the account is unknown.
    pub fn value_or<T>(&self, id: AccountId, select: impl FnOnce(&AccountSnapshot) -> T, default: T) -> T {
        self.all().get(&id).map(select).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(balance: f64, equity: f64) -> AccountSnapshot {
        AccountSnapshot { balance, equity, ..Default::default() }
    }

    #[test]
    fn upsert_reports_material_changes_only() {
        let store = AccountStore::new();
        assert!(store.upsert(1, snap(100.0, 100.0)));
        assert!(!store.upsert(1, snap(100.0002, 100.0)));
        assert!(store.upsert(1, snap(100.5, 100.0)));
        assert_eq!(store.get(1).unwrap().balance, 100.5);
    }

    #[test]
    fn frame_leaves_other_accounts_untouched() {
        let store = AccountStore::new();
        store.apply_frame(vec![(1, snap(1.0, 1.0)), (2, snap(2.0, 2.0))]);
        let applied = store.apply_frame(vec![(2, snap(3.0, 3.0))]);

        assert_eq!(applied.changed, vec![2]);
        assert_eq!(store.get(1), Some(snap(1.0, 1.0)));
        assert_eq!(store.get(2), Some(snap(3.0, 3.0)));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn views_are_immutable_snapshots() {
        let store = AccountStore::new();
        store.upsert(7, snap(10.0, 10.0));
        let before = store.all();
        store.upsert(7, snap(20.0, 20.0));
        assert_eq!(before.get(&7).unwrap().balance, 10.0);
        assert_eq!(store.all().get(&7).unwrap().balance, 20.0);
    }

    #[test]
    fn value_or_falls_back() {
        let store = AccountStore::new();
        store.upsert(5, snap(42.0, 40.0));
        assert_eq!(store.value_or(5, |s| s.balance, 0.0), 42.0);
        assert_eq!(store.value_or(6, |s| s.balance, 0.0), 0.0);
        assert!(store.contains(5));
    }
}
