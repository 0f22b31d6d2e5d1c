//! Domain types for the work-item hierarchy: epics, tickets, stages, and the
//! dependency edges between them.

use crate::ids::Id;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The small set of statuses that exist regardless of which pipeline config is
/// loaded. Every other status string is a pipeline-defined phase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservedStatus {
    #[serde(rename = "Not Started")]
    NotStarted,
    Complete,
    #[serde(rename = "In Progress")]
    InProgress,
    Skipped,
}

impl ReservedStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReservedStatus::NotStarted => "Not Started",
            ReservedStatus::Complete => "Complete",
            ReservedStatus::InProgress => "In Progress",
            ReservedStatus::Skipped => "Skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "Not Started" => Some(ReservedStatus::NotStarted),
            "Complete" => Some(ReservedStatus::Complete),
            "In Progress" => Some(ReservedStatus::InProgress),
            "Skipped" => Some(ReservedStatus::Skipped),
            _ => None,
        }
    }
}

/// A stage status: either one of the reserved statuses or an open,
/// pipeline-defined phase status (e.g. `"PR Created"`). Kept as a thin wrapper
/// over `String` rather than a closed enum because the vocabulary is defined by
/// the externally loaded pipeline config, not by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageStatus(pub String);

impl StageStatus {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn reserved(self_: &str) -> Option<ReservedStatus> {
        ReservedStatus::from_str(self_)
    }

    pub fn is_complete(&self) -> bool {
        self.0 == ReservedStatus::Complete.as_str()
    }

    pub fn is_not_started(&self) -> bool {
        self.0 == ReservedStatus::NotStarted.as_str()
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<ReservedStatus> for StageStatus {
    fn from(value: ReservedStatus) -> Self {
        StageStatus(value.as_str().to_string())
    }
}

/// A derived, per-stage bucket name used for selection and display: one of the
/// four fixed names, or the snake-cased name of a pipeline phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KanbanColumn(pub String);

impl KanbanColumn {
    pub const TO_CONVERT: &'static str = "to_convert";
    pub const BACKLOG: &'static str = "backlog";
    pub const READY_FOR_WORK: &'static str = "ready_for_work";
    pub const DONE: &'static str = "done";

    pub fn backlog() -> Self {
        Self(Self::BACKLOG.to_string())
    }

    pub fn ready_for_work() -> Self {
        Self(Self::READY_FOR_WORK.to_string())
    }

    pub fn done() -> Self {
        Self(Self::DONE.to_string())
    }

    pub fn to_convert() -> Self {
        Self(Self::TO_CONVERT.to_string())
    }

    pub fn phase(name: &str) -> Self {
        Self(snake_case(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn snake_case(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

/// Where a ticket originated: authored directly in the repo, or imported from an
/// external tracker (Jira).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketSource {
    Local,
    Jira,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Epic {
    pub id: Id,
    pub repo_id: Id,
    pub title: String,
    pub status: StageStatus,
    pub jira_key: Option<String>,
    pub file_path: String,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: Id,
    pub epic_id: Id,
    pub repo_id: Id,
    pub title: String,
    pub status: StageStatus,
    pub jira_key: Option<String>,
    pub source: TicketSource,
    pub has_stages: bool,
    pub file_path: String,
    pub depends_on: Vec<String>,
    pub jira_links: Vec<String>,
}

/// A parent stage's merge info attached to a drafted child via soft resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMergeParent {
    pub stage_id: Id,
    pub branch: String,
    pub pr_url: String,
    pub pr_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub id: Id,
    pub ticket_id: Id,
    pub epic_id: Id,
    pub repo_id: Id,
    pub title: String,
    pub status: StageStatus,
    pub refinement_type: Vec<String>,
    pub worktree_branch: String,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub priority: i64,
    pub due_date: Option<DateTime<Utc>>,
    pub session_active: bool,
    pub is_draft: bool,
    pub pending_merge_parents: Vec<PendingMergeParent>,
    pub mr_target_branch: Option<String>,
    pub rebase_conflict: bool,
    pub file_path: String,
    pub depends_on: Vec<String>,
    /// Computed by the Sync Engine; never read from frontmatter.
    pub kanban_column: KanbanColumn,
}

/// The three entity types a dependency edge can connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Epic,
    Ticket,
    Stage,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Epic => "epic",
            EntityKind::Ticket => "ticket",
            EntityKind::Stage => "stage",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub repo_id: Id,
    pub from_id: Id,
    pub from_type: EntityKind,
    pub to_id: Id,
    pub to_type: EntityKind,
    /// True only on hard resolution; soft resolution never sets this.
    pub resolved: bool,
    pub target_repo_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repo {
    pub id: Id,
    pub path: String,
    pub name: String,
    pub slack_webhook: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentBranchTracking {
    pub child_stage_id: Id,
    pub parent_stage_id: Id,
    pub parent_branch: String,
    pub parent_pr_url: String,
    pub last_known_head: Option<String>,
    pub is_merged: bool,
    pub repo_id: Id,
    pub last_checked: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MrCommentTracking {
    pub stage_id: Id,
    pub last_poll_timestamp: Option<DateTime<Utc>>,
    pub last_known_unresolved_count: i64,
    pub repo_id: Id,
}
