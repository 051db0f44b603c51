//! Short-term activity windows used for feature extraction.
//!
//! Detectors need the recent events of an actor (behavioral window, burst
//! analysis) and of a repository (coordination window). This tracker keeps
//! bounded, time-pruned views in memory; long-term baselines live in the
//! profile store.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

use crate::types::{EventKind, EventPayload, RawEvent};

/// Actor events are kept for a day (weekend/off-hours ratios read 24 h back).
const ACTOR_RETENTION_HOURS: i64 = 24;

/// Repo events only feed the coordination window.
const REPO_RETENTION_HOURS: i64 = 1;

const MAX_EVENTS_PER_ACTOR: usize = 1000;
const MAX_EVENTS_PER_REPO: usize = 4000;

/// Compact per-event record retained in an actor window.
#[derive(Debug, Clone)]
pub struct ActorEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub repo_id: i64,
    pub commit_count: u32,
    pub commit_message_len: u64,
    pub files_changed: u32,
}

/// Compact per-event record retained in a repo window.
#[derive(Debug, Clone, Copy)]
pub struct RepoEvent {
    pub ts: DateTime<Utc>,
    pub actor_id: i64,
}

/// Bounded sliding windows of recent activity per actor and per repo.
pub struct ActivityTracker {
    actors: Mutex<HashMap<i64, VecDeque<ActorEvent>>>,
    repos: Mutex<HashMap<i64, VecDeque<RepoEvent>>>,
}

impl ActivityTracker {
    pub fn new() -> Self {
        Self {
            actors: Mutex::new(HashMap::new()),
            repos: Mutex::new(HashMap::new()),
        }
    }

    /// Record an event into both windows.
    pub fn record(&self, event: &RawEvent, payload: &EventPayload) {
        let (commit_count, commit_message_len, files_changed) = match payload {
            EventPayload::Push(push) => {
                let messages: u64 = push.commits.iter().map(|c| c.message.len() as u64).sum();
                (push.commits.len() as u32, messages, push.size)
            }
            _ => (0, 0, 0),
        };

        {
            let mut actors = self.actors.lock();
            let window = actors.entry(event.actor.id).or_default();
            window.push_back(ActorEvent {
                ts: event.timestamp,
                kind: event.kind.clone(),
                repo_id: event.repository.id,
                commit_count,
                commit_message_len,
                files_changed,
            });
            Self::prune(window, event.timestamp - Duration::hours(ACTOR_RETENTION_HOURS), MAX_EVENTS_PER_ACTOR);
        }

        {
            let mut repos = self.repos.lock();
            let window = repos.entry(event.repository.id).or_default();
            window.push_back(RepoEvent {
                ts: event.timestamp,
                actor_id: event.actor.id,
            });
            Self::prune(window, event.timestamp - Duration::hours(REPO_RETENTION_HOURS), MAX_EVENTS_PER_REPO);
        }
    }

    /// Actor events at or after `since`, sorted oldest first.
    ///
    /// Upstream pages arrive newest-first, so insertion order cannot be
    /// trusted; snapshots are sorted before detectors see them.
    pub fn actor_window(&self, actor_id: i64, since: DateTime<Utc>) -> Vec<ActorEvent> {
        let mut window: Vec<ActorEvent> = self
            .actors
            .lock()
            .get(&actor_id)
            .map(|w| w.iter().filter(|e| e.ts >= since).cloned().collect())
            .unwrap_or_default();
        window.sort_by_key(|e| e.ts);
        window
    }

    /// Repo events at or after `since`, sorted oldest first.
    pub fn repo_window(&self, repo_id: i64, since: DateTime<Utc>) -> Vec<RepoEvent> {
        let mut window: Vec<RepoEvent> = self
            .repos
            .lock()
            .get(&repo_id)
            .map(|w| w.iter().filter(|e| e.ts >= since).copied().collect())
            .unwrap_or_default();
        window.sort_by_key(|e| e.ts);
        window
    }

    /// Drop empty windows; called periodically from the maintenance task.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let actor_cutoff = now - Duration::hours(ACTOR_RETENTION_HOURS);
        let mut actors = self.actors.lock();
        for window in actors.values_mut() {
            while window.front().is_some_and(|e| e.ts < actor_cutoff) {
                window.pop_front();
            }
        }
        actors.retain(|_, window| !window.is_empty());
        drop(actors);

        let repo_cutoff = now - Duration::hours(REPO_RETENTION_HOURS);
        let mut repos = self.repos.lock();
        for window in repos.values_mut() {
            while window.front().is_some_and(|e| e.ts < repo_cutoff) {
                window.pop_front();
            }
        }
        repos.retain(|_, window| !window.is_empty());
    }

    fn prune<T>(window: &mut VecDeque<T>, cutoff: DateTime<Utc>, cap: usize)
    where
        T: HasTimestamp,
    {
        while window.front().is_some_and(|e| e.ts() < cutoff) {
            window.pop_front();
        }
        while window.len() > cap {
            window.pop_front();
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

trait HasTimestamp {
    fn ts(&self) -> DateTime<Utc>;
}

impl HasTimestamp for ActorEvent {
    fn ts(&self) -> DateTime<Utc> {
        self.ts
    }
}

impl HasTimestamp for RepoEvent {
    fn ts(&self) -> DateTime<Utc> {
        self.ts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Actor, Priority, Repository};

    fn event(id: &str, actor_id: i64, repo_id: i64, ts: DateTime<Utc>) -> RawEvent {
        RawEvent {
            id: id.to_string(),
            kind: EventKind::Push,
            actor: Actor {
                id: actor_id,
                login: format!("user{actor_id}"),
            },
            repository: Repository {
                id: repo_id,
                full_name: format!("org/repo{repo_id}"),
            },
            timestamp: ts,
            payload: serde_json::Value::Null,
            priority: Priority::High,
        }
    }

    #[test]
    fn test_windows_filter_by_time() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();

        for i in 0..5 {
            let e = event(&i.to_string(), 1, 7, now - Duration::minutes(i * 30));
            tracker.record(&e, &EventPayload::Opaque);
        }

        let last_hour = tracker.actor_window(1, now - Duration::hours(1));
        assert_eq!(last_hour.len(), 3);

        let all = tracker.actor_window(1, now - Duration::hours(24));
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn test_repo_window_tracks_actors() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();

        for actor in 1..=4 {
            let e = event(&actor.to_string(), actor, 7, now);
            tracker.record(&e, &EventPayload::Opaque);
        }

        let window = tracker.repo_window(7, now - Duration::minutes(10));
        assert_eq!(window.len(), 4);
    }

    #[test]
    fn test_old_events_pruned_on_record() {
        let tracker = ActivityTracker::new();
        let now = Utc::now();

        let stale = event("old", 1, 7, now - Duration::hours(30));
        tracker.record(&stale, &EventPayload::Opaque);
        let fresh = event("new", 1, 7, now);
        tracker.record(&fresh, &EventPayload::Opaque);

        let all = tracker.actor_window(1, now - Duration::hours(48));
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].ts, now);
    }
}
