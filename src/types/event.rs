//! GitHub public event data structures

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of event types the pipeline understands.
///
/// Unknown upstream types are preserved in the `Other` variant so new event
/// kinds survive re-serialization into anomaly records.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Push,
    WorkflowRun,
    Delete,
    Member,
    PullRequest,
    Issues,
    Create,
    Release,
    Fork,
    Watch,
    Star,
    Other(String),
}

impl EventKind {
    /// Parse an upstream `type` tag.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PushEvent" => EventKind::Push,
            "WorkflowRunEvent" => EventKind::WorkflowRun,
            "DeleteEvent" => EventKind::Delete,
            "MemberEvent" => EventKind::Member,
            "PullRequestEvent" => EventKind::PullRequest,
            "IssuesEvent" => EventKind::Issues,
            "CreateEvent" => EventKind::Create,
            "ReleaseEvent" => EventKind::Release,
            "ForkEvent" => EventKind::Fork,
            "WatchEvent" => EventKind::Watch,
            "StarEvent" => EventKind::Star,
            other => EventKind::Other(other.to_string()),
        }
    }

    /// Upstream wire name for this kind.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Push => "PushEvent",
            EventKind::WorkflowRun => "WorkflowRunEvent",
            EventKind::Delete => "DeleteEvent",
            EventKind::Member => "MemberEvent",
            EventKind::PullRequest => "PullRequestEvent",
            EventKind::Issues => "IssuesEvent",
            EventKind::Create => "CreateEvent",
            EventKind::Release => "ReleaseEvent",
            EventKind::Fork => "ForkEvent",
            EventKind::Watch => "WatchEvent",
            EventKind::Star => "StarEvent",
            EventKind::Other(name) => name,
        }
    }

    /// Ingest priority under the poller's filter policy.
    pub fn priority(&self) -> Priority {
        match self {
            EventKind::Push | EventKind::WorkflowRun | EventKind::Delete | EventKind::Member => {
                Priority::High
            }
            EventKind::PullRequest
            | EventKind::Issues
            | EventKind::Create
            | EventKind::Release
            | EventKind::Fork => Priority::Medium,
            EventKind::Watch | EventKind::Star | EventKind::Other(_) => Priority::Low,
        }
    }

    /// Noise types that are dropped before priority classification.
    pub fn is_skipped(&self) -> bool {
        matches!(
            self,
            EventKind::Other(name) if matches!(
                name.as_str(),
                "FollowEvent"
                    | "GollumEvent"
                    | "CommitCommentEvent"
                    | "IssueCommentEvent"
                    | "PullRequestReviewCommentEvent"
                    | "PullRequestReviewEvent"
            )
        )
    }
}

impl Serialize for EventKind {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventKind {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(EventKind::parse(&raw))
    }
}

/// Ingest priority tag carried through the event queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

/// Event actor (the account that performed the action).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Actor {
    pub id: i64,
    pub login: String,
}

/// Repository the event happened in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: i64,
    /// `owner/name` as reported upstream.
    #[serde(alias = "name")]
    pub full_name: String,
}

/// An immutable event as carried on the queue wire format:
/// `{id, type, actor, repository, timestamp, payload, priority}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Monotonically increasing upstream identifier.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: EventKind,

    pub actor: Actor,

    pub repository: Repository,

    /// Event creation time (UTC).
    pub timestamp: DateTime<Utc>,

    /// Type-dependent payload, kept opaque until detection.
    #[serde(default)]
    pub payload: serde_json::Value,

    /// Priority assigned by the poller's filter policy.
    #[serde(default = "default_priority")]
    pub priority: Priority,
}

fn default_priority() -> Priority {
    Priority::Low
}

impl RawEvent {
    /// Parse the payload into the typed view detectors consume.
    ///
    /// Fields the detectors do not read stay behind in `self.payload`.
    pub fn typed_payload(&self) -> EventPayload {
        match self.kind {
            EventKind::Push => serde_json::from_value::<PushPayload>(self.payload.clone())
                .map(EventPayload::Push)
                .unwrap_or(EventPayload::Opaque),
            EventKind::Delete => serde_json::from_value::<DeletePayload>(self.payload.clone())
                .map(EventPayload::Delete)
                .unwrap_or(EventPayload::Opaque),
            EventKind::WorkflowRun => {
                serde_json::from_value::<WorkflowRunPayload>(self.payload.clone())
                    .map(EventPayload::WorkflowRun)
                    .unwrap_or(EventPayload::Opaque)
            }
            _ => EventPayload::Opaque,
        }
    }

    /// Whether the required fields survived ingest.
    pub fn is_well_formed(&self) -> bool {
        !self.id.is_empty() && !self.actor.login.is_empty() && !self.repository.full_name.is_empty()
    }
}

/// Typed payload view, parsed once per event before detection.
#[derive(Debug, Clone)]
pub enum EventPayload {
    Push(PushPayload),
    Delete(DeletePayload),
    WorkflowRun(WorkflowRunPayload),
    /// Anything detectors have no schema for.
    Opaque,
}

impl EventPayload {
    pub fn as_push(&self) -> Option<&PushPayload> {
        match self {
            EventPayload::Push(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_delete(&self) -> Option<&DeletePayload> {
        match self {
            EventPayload::Delete(p) => Some(p),
            _ => None,
        }
    }
}

/// Push event payload (the fields detectors read).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushPayload {
    #[serde(default)]
    pub r#ref: String,

    /// History rewrite marker.
    #[serde(default)]
    pub forced: bool,

    /// Number of changed files/commits reported upstream.
    #[serde(default)]
    pub size: u32,

    #[serde(default)]
    pub commits: Vec<Commit>,
}

impl PushPayload {
    /// Does this push target the repository default branch?
    pub fn targets_default_branch(&self) -> bool {
        let branch = self.r#ref.rsplit('/').next().unwrap_or("");
        matches!(branch, "main" | "master")
    }

    /// Total files removed across all commits.
    pub fn removed_file_count(&self) -> usize {
        self.commits.iter().map(|c| c.removed.len()).sum()
    }

    /// All file paths touched by this push.
    pub fn touched_files(&self) -> impl Iterator<Item = &str> {
        self.commits.iter().flat_map(|c| {
            c.added
                .iter()
                .chain(c.modified.iter())
                .chain(c.removed.iter())
                .map(String::as_str)
        })
    }
}

/// A single commit within a push payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Commit {
    #[serde(default)]
    pub sha: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub distinct: bool,

    #[serde(default)]
    pub added: Vec<String>,

    #[serde(default)]
    pub modified: Vec<String>,

    #[serde(default)]
    pub removed: Vec<String>,
}

/// Delete event payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeletePayload {
    #[serde(default, rename = "ref")]
    pub ref_name: String,

    /// `branch` or `tag`.
    #[serde(default)]
    pub ref_type: String,
}

/// Workflow run payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowRunPayload {
    #[serde(default)]
    pub action: String,

    #[serde(default)]
    pub conclusion: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_roundtrip() {
        assert_eq!(EventKind::parse("PushEvent"), EventKind::Push);
        assert_eq!(EventKind::Push.as_str(), "PushEvent");
        assert_eq!(
            EventKind::parse("SponsorshipEvent"),
            EventKind::Other("SponsorshipEvent".to_string())
        );
    }

    #[test]
    fn test_priority_policy() {
        assert_eq!(EventKind::Push.priority(), Priority::High);
        assert_eq!(EventKind::Delete.priority(), Priority::High);
        assert_eq!(EventKind::PullRequest.priority(), Priority::Medium);
        assert_eq!(EventKind::Watch.priority(), Priority::Low);
        assert_eq!(
            EventKind::Other("SponsorshipEvent".into()).priority(),
            Priority::Low
        );
    }

    #[test]
    fn test_skip_list() {
        assert!(EventKind::parse("IssueCommentEvent").is_skipped());
        assert!(!EventKind::Push.is_skipped());
    }

    #[test]
    fn test_event_serialization() {
        let event = RawEvent {
            id: "35783021201".to_string(),
            kind: EventKind::Push,
            actor: Actor {
                id: 42,
                login: "octocat".to_string(),
            },
            repository: Repository {
                id: 7,
                full_name: "octocat/hello-world".to_string(),
            },
            timestamp: Utc::now(),
            payload: serde_json::json!({"ref": "refs/heads/main", "forced": true}),
            priority: Priority::High,
        };

        let json = serde_json::to_string(&event).unwrap();
        let back: RawEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(back.id, event.id);
        assert_eq!(back.kind, EventKind::Push);
        assert_eq!(back.priority, Priority::High);

        let payload = back.typed_payload();
        let push = payload.as_push().unwrap();
        assert!(push.forced);
        assert!(push.targets_default_branch());
    }

    #[test]
    fn test_malformed_payload_is_opaque() {
        let event = RawEvent {
            id: "1".to_string(),
            kind: EventKind::Push,
            actor: Actor {
                id: 1,
                login: "a".to_string(),
            },
            repository: Repository {
                id: 1,
                full_name: "a/b".to_string(),
            },
            timestamp: Utc::now(),
            payload: serde_json::json!("not an object"),
            priority: Priority::High,
        };
        assert!(matches!(event.typed_payload(), EventPayload::Opaque));
    }

    #[test]
    fn test_removed_file_count() {
        let payload = PushPayload {
            commits: vec![
                Commit {
                    removed: vec!["a.txt".into(), "b.txt".into()],
                    ..Default::default()
                },
                Commit {
                    removed: vec!["c.txt".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        assert_eq!(payload.removed_file_count(), 3);
    }
}
