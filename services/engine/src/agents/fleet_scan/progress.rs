//! Scan Progress Board
//!
//! One watch channel per account. The owning coordinator publishes whole
//! `ScanProgress` values, readers clone the latest one.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::watch;

use super::types::{AccountTarget, ScanProgress, ScanState};

/// Writer side for one account's progress
#[derive(Debug)]
pub struct ProgressHandle {
    tx: watch::Sender<ScanProgress>,
}

impl ProgressHandle {
    /// Handle with no board attached
    pub fn detached(account_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ScanProgress::pending(account_id));
        Self { tx }
    }

    pub fn current(&self) -> ScanProgress {
        self.tx.borrow().clone()
    }

    pub fn start(&self, services_total: usize) {
        self.update(|progress| {
            progress.state = ScanState::Running;
            progress.services_total = services_total;
        });
    }

    pub fn unit_finished(&self, succeeded: bool, error: Option<String>) {
        self.update(|progress| {
            if succeeded {
                progress.services_completed += 1;
            } else {
                progress.services_failed += 1;
            }
            if error.is_some() {
                progress.last_error = error;
            }
        });
    }

    pub fn unit_interrupted(&self) {
        self.update(|progress| progress.services_interrupted += 1);
    }

    pub fn finish(&self, state: ScanState, last_error: Option<String>) {
        self.update(|progress| {
            progress.state = state;
            if last_error.is_some() {
                progress.last_error = last_error;
            }
        });
    }

    /// Terminal states are final: later updates are dropped
    fn update(&self, apply: impl FnOnce(&mut ScanProgress)) {
        self.tx.send_if_modified(|progress| {
            if progress.state.is_terminal() {
                return false;
            }
            apply(progress);
            progress.updated_at = Utc::now();
            true
        });
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSummary {
    pub pending: usize,
    pub running: usize,
    pub partial: usize,
    pub done: usize,
    pub failed: usize,
}

/// Read side of every account's progress
#[derive(Debug)]
pub struct ProgressBoard {
    entries: BTreeMap<String, watch::Receiver<ScanProgress>>,
}

impl ProgressBoard {
    /// Board plus one writer handle per account
    pub fn register<'a, I>(accounts: I) -> (Self, HashMap<String, ProgressHandle>)
    where
        I: IntoIterator<Item = &'a AccountTarget>,
    {
        let mut entries = BTreeMap::new();
        let mut handles = HashMap::new();
        for account in accounts {
            let (tx, rx) = watch::channel(ScanProgress::pending(account.account_id.clone()));
            entries.insert(account.account_id.clone(), rx);
            handles.insert(account.account_id.clone(), ProgressHandle { tx });
        }
        (Self { entries }, handles)
    }

    pub fn snapshot(&self) -> BTreeMap<String, ScanProgress> {
        self.entries
            .iter()
            .map(|(account_id, rx)| (account_id.clone(), rx.borrow().clone()))
            .collect()
    }

    pub fn get(&self, account_id: &str) -> Option<ScanProgress> {
        self.entries.get(account_id).map(|rx| rx.borrow().clone())
    }

    pub fn subscribe(&self, account_id: &str) -> Option<watch::Receiver<ScanProgress>> {
        self.entries.get(account_id).cloned()
    }

    pub fn summary(&self) -> ProgressSummary {
        let mut summary = ProgressSummary::default();
        for rx in self.entries.values() {
            match rx.borrow().state {
                ScanState::Pending => summary.pending += 1,
                ScanState::Running => summary.running += 1,
                ScanState::Partial => summary.partial += 1,
                ScanState::Done => summary.done += 1,
                ScanState::Failed => summary.failed += 1,
            }
        }
        summary
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::fleet_scan::types::TrustRelationship;

    fn accounts() -> Vec<AccountTarget> {
        ["a", "b"]
            .into_iter()
            .map(|id| {
                AccountTarget::new(
                    id,
                    TrustRelationship::StaticSecret {
                        static_secret_ref: "X".to_string(),
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_snapshot_reflects_updates() {
        let accounts = accounts();
        let (board, handles) = ProgressBoard::register(&accounts);

        let a = &handles["a"];
        a.start(4);
        a.unit_finished(true, None);
        a.unit_finished(false, Some("denied".to_string()));

        let snapshot = board.snapshot();
        assert_eq!(snapshot["a"].state, ScanState::Running);
        assert_eq!(snapshot["a"].services_completed, 1);
        assert_eq!(snapshot["a"].services_failed, 1);
        assert_eq!(snapshot["a"].last_error.as_deref(), Some("denied"));
        assert_eq!(snapshot["b"].state, ScanState::Pending);
        assert_eq!(snapshot["a"].services_interrupted, 0);
        assert_eq!(board.summary(), ProgressSummary { pending: 1, running: 1, ..Default::default() });
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let accounts = accounts();
        let (board, handles) = ProgressBoard::register(&accounts);

        let b = &handles["b"];
        b.start(1);
        b.finish(ScanState::Done, None);
        b.start(9);
        b.finish(ScanState::Failed, Some("late".to_string()));

        let progress = board.get("b").unwrap();
        assert_eq!(progress.state, ScanState::Done);
        assert_eq!(progress.services_total, 1);
        assert!(progress.last_error.is_none());
    }

    #[test]
    fn test_detached_handle_tracks_state() {
        let handle = ProgressHandle::detached("solo");
        handle.start(2);
        handle.unit_finished(true, None);
        assert_eq!(handle.current().services_completed, 1);
    }

    #[test]
    fn test_interrupted_units_are_counted() {
        let accounts = accounts();
        let (board, handles) = ProgressBoard::register(&accounts);

        let a = &handles["a"];
        a.start(3);
        a.unit_finished(true, None);
        a.unit_interrupted();
        a.unit_interrupted();
        a.finish(ScanState::Partial, None);
        a.unit_interrupted();

        let progress = board.get("a").unwrap();
        assert_eq!(progress.services_completed, 1);
        assert_eq!(progress.services_interrupted, 2);
        assert_eq!(progress.state, ScanState::Partial);
    }
}
