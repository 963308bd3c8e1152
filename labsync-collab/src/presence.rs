//! Heartbeat-based member liveness.
//!
//! ## Architecture
//!
//! ```text
//! client touch() every 30s
//!       │
//!       ▼
//! PresenceTracker::touch()  ── offline→online? ──► PresenceTransition
//!       │
//!  maintenance task, every sweep_interval
//!       │
//!       ▼
//! PresenceTracker::sweep()  ── silent > timeout? ──► PresenceTransition
//! ```
//!
//! Each online/offline flip is reported exactly once; a sweep over an
//! already-offline member reports nothing. The tracker is the only owner of
//! a member's `is_online` flag.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use labsync_core::{Timestamp, UserId};

use crate::config::PresenceConfig;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Server-side liveness of one member. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub last_heartbeat: Timestamp,
    pub online: bool,
}

/// An online/offline flip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceTransition {
    pub user_id: UserId,
    pub online: bool,
    pub at: Timestamp,
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Per-session liveness table.
pub struct PresenceTracker {
    timeout_ms: u64,
    records: HashMap<UserId, PresenceRecord>,
}

impl PresenceTracker {
    pub fn new(config: &PresenceConfig) -> Self {
        Self {
            timeout_ms: config.timeout.as_millis() as u64,
            records: HashMap::new(),
        }
    }

    /// Start (or restart) tracking `user` as online.
    ///
    /// Returns a transition unless the user was already tracked online.
    pub fn track(&mut self, user_id: UserId, now: Timestamp) -> Option<PresenceTransition> {
        let previous = self.records.insert(
            user_id,
            PresenceRecord { user_id, last_heartbeat: now, online: true },
        );
        match previous {
            Some(record) if record.online => None,
            _ => Some(PresenceTransition { user_id, online: true, at: now }),
        }
    }

    /// Record a heartbeat. Untracked users are ignored.
    pub fn touch(&mut self, user_id: UserId, now: Timestamp) -> Option<PresenceTransition> {
        let record = self.records.get_mut(&user_id)?;
        record.last_heartbeat = record.last_heartbeat.max(now);
        if record.online {
            return None;
        }
        record.online = true;
        log::debug!("Presence: {user_id} back online");
        Some(PresenceTransition { user_id, online: true, at: now })
    }

    /// Stop tracking `user` entirely (leave / disconnect).
    pub fn untrack(&mut self, user_id: &UserId) -> Option<PresenceRecord> {
        self.records.remove(user_id)
    }

    /// Mark every member silent for longer than the timeout as offline.
    pub fn sweep(&mut self, now: Timestamp) -> Vec<PresenceTransition> {
        let timeout = self.timeout_ms;
        let mut transitions = Vec::new();
        for record in self.records.values_mut() {
            if record.online && now.saturating_sub(record.last_heartbeat) > timeout {
                record.online = false;
                transitions.push(PresenceTransition {
                    user_id: record.user_id,
                    online: false,
                    at: now,
                });
            }
        }
        if !transitions.is_empty() {
            log::info!("Presence sweep: {} member(s) timed out", transitions.len());
        }
        transitions
    }

    pub fn is_online(&self, user_id: &UserId) -> bool {
        self.records.get(user_id).is_some_and(|r| r.online)
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn tracker() -> PresenceTracker {
        PresenceTracker::new(&PresenceConfig {
            heartbeat_interval: Duration::from_secs(30),
            timeout: Duration::from_secs(90),
            sweep_interval: Duration::from_secs(10),
        })
    }

    #[test]
    fn test_track_reports_online_once() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        assert!(t.track(u, 0).is_some());
        assert!(t.track(u, 5).is_none());
        assert!(t.is_online(&u));
        assert_eq!(t.records.get(&u).map(|r| r.last_heartbeat), Some(5));
    }

    #[test]
    fn test_sweep_within_timeout_keeps_online() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 0);
        assert!(t.sweep(90_000).is_empty()); // exactly at timeout: still online
        assert!(t.is_online(&u));
    }

    #[test]
    fn test_offline_transition_exactly_once() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 0);

        let first = t.sweep(90_001);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].user_id, u);
        assert!(!first[0].online);

        assert!(t.sweep(120_000).is_empty());
        assert!(t.sweep(500_000).is_empty());
        assert!(!t.is_online(&u));
    }

    #[test]
    fn test_heartbeat_flips_back_once() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 0);
        t.sweep(100_000);

        let back = t.touch(u, 100_500).expect("transition");
        assert!(back.online);
        assert!(t.touch(u, 101_000).is_none());
        assert!(t.is_online(&u));
    }

    #[test]
    fn test_heartbeat_keeps_member_alive() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 0);
        for i in 1..10 {
            t.touch(u, i * 30_000);
            assert!(t.sweep(i * 30_000 + 10_000).is_empty());
        }
    }

    #[test]
    fn test_untracked_touch_ignored() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        assert!(t.touch(u, 1).is_none());
        assert!(!t.records.contains_key(&u));
    }

    #[test]
    fn test_untrack_stops_sweeps() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 0);
        assert!(t.untrack(&u).is_some());
        assert!(t.sweep(1_000_000).is_empty());
        assert!(t.records.is_empty());
    }

    #[test]
    fn test_sweep_splits_online_and_offline() {
        let mut t = tracker();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        t.track(a, 0);
        t.track(b, 50_000);
        t.sweep(95_000);
        assert!(!t.is_online(&a));
        assert!(t.is_online(&b));
    }

    #[test]
    fn test_stale_touch_does_not_rewind() {
        let mut t = tracker();
        let u = Uuid::new_v4();
        t.track(u, 10_000);
        t.touch(u, 5_000);
        assert_eq!(t.records.get(&u).map(|r| r.last_heartbeat), Some(10_000));
    }
}
