//! Event types for the orchestrator's structured log stream (spec Section 7:
//! "a single structured log stream with fields `{ts, level, msg, stageId?,
//! context…}`"). Each variant below is one shape of `context`; callers emit it
//! through `tracing` (see `workflowd`'s scheduler/cron/exit-gate modules) and it
//! doubles as the payload recorded for tests and for any downstream consumer
//! that wants machine-readable events rather than formatted log lines.

use crate::ids::Id;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    SyncCompleted,
    CycleDetected,
    StageOnboarded,
    SessionSpawned,
    SessionFinished,
    ExitGateRan,
    ResolverFired,
    SkippedLocked,
    SkippedConflict,
    WorktreeAllocated,
    WorktreeReleased,
    CronJobDisabled,
    ShutdownDrainTimeout,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SyncCompleted => "SYNC_COMPLETED",
            Self::CycleDetected => "CYCLE_DETECTED",
            Self::StageOnboarded => "STAGE_ONBOARDED",
            Self::SessionSpawned => "SESSION_SPAWNED",
            Self::SessionFinished => "SESSION_FINISHED",
            Self::ExitGateRan => "EXIT_GATE_RAN",
            Self::ResolverFired => "RESOLVER_FIRED",
            Self::SkippedLocked => "SKIPPED_LOCKED",
            Self::SkippedConflict => "SKIPPED_CONFLICT",
            Self::WorktreeAllocated => "WORKTREE_ALLOCATED",
            Self::WorktreeReleased => "WORKTREE_RELEASED",
            Self::CronJobDisabled => "CRON_JOB_DISABLED",
            Self::ShutdownDrainTimeout => "SHUTDOWN_DRAIN_TIMEOUT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCompletedPayload {
    pub repo_id: Id,
    pub epics: usize,
    pub tickets: usize,
    pub stages: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleDetectedPayload {
    pub repo_id: Id,
    pub cycle: Vec<Id>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOnboardedPayload {
    pub stage_id: Id,
    pub entry_status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpawnedPayload {
    pub stage_id: Id,
    pub skill: String,
    pub worktree_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFinishedPayload {
    pub stage_id: Id,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub status_before: String,
    pub status_after: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitGatePayload {
    pub stage_id: Id,
    pub status_changed: bool,
    pub ticket_completed: bool,
    pub epic_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverFiredPayload {
    pub stage_id: Id,
    pub resolver: String,
    pub new_status: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedLockedPayload {
    pub stage_id: Id,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedConflictPayload {
    pub stage_id: Id,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeAllocatedPayload {
    pub stage_id: Id,
    pub worktree_index: u32,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeReleasedPayload {
    pub stage_id: Id,
    pub worktree_index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobDisabledPayload {
    pub job: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownDrainTimeoutPayload {
    pub pending_stage_ids: Vec<Id>,
}

/// A union of all event payload shapes, tagged implicitly by which variant is
/// present (serialized untagged: the event name lives alongside it, not inside
/// it, mirroring how the log line carries `msg`/`stageId` next to `context`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventPayload {
    SyncCompleted(SyncCompletedPayload),
    CycleDetected(CycleDetectedPayload),
    StageOnboarded(StageOnboardedPayload),
    SessionSpawned(SessionSpawnedPayload),
    SessionFinished(SessionFinishedPayload),
    ExitGate(ExitGatePayload),
    ResolverFired(ResolverFiredPayload),
    SkippedLocked(SkippedLockedPayload),
    SkippedConflict(SkippedConflictPayload),
    WorktreeAllocated(WorktreeAllocatedPayload),
    WorktreeReleased(WorktreeReleasedPayload),
    CronJobDisabled(CronJobDisabledPayload),
    ShutdownDrainTimeout(ShutdownDrainTimeoutPayload),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::SyncCompleted(_) => EventType::SyncCompleted,
            Self::CycleDetected(_) => EventType::CycleDetected,
            Self::StageOnboarded(_) => EventType::StageOnboarded,
            Self::SessionSpawned(_) => EventType::SessionSpawned,
            Self::SessionFinished(_) => EventType::SessionFinished,
            Self::ExitGate(_) => EventType::ExitGateRan,
            Self::ResolverFired(_) => EventType::ResolverFired,
            Self::SkippedLocked(_) => EventType::SkippedLocked,
            Self::SkippedConflict(_) => EventType::SkippedConflict,
            Self::WorktreeAllocated(_) => EventType::WorktreeAllocated,
            Self::WorktreeReleased(_) => EventType::WorktreeReleased,
            Self::CronJobDisabled(_) => EventType::CronJobDisabled,
            Self::ShutdownDrainTimeout(_) => EventType::ShutdownDrainTimeout,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_as_str_matches_screaming_snake_case() {
        assert_eq!(EventType::SkippedLocked.as_str(), "SKIPPED_LOCKED");
        assert_eq!(EventType::ExitGateRan.as_str(), "EXIT_GATE_RAN");
    }

    #[test]
    fn event_payload_event_type_dispatch() {
        let payload = EventPayload::SkippedConflict(SkippedConflictPayload {
            stage_id: Id::from_raw("STAGE-1-1-1"),
            reason: "rebase_conflict".to_string(),
        });
        assert_eq!(payload.event_type(), EventType::SkippedConflict);
    }

    #[test]
    fn event_payload_round_trips_through_json() {
        let payload = EventPayload::SessionFinished(SessionFinishedPayload {
            stage_id: Id::from_raw("STAGE-1-1-1"),
            exit_code: 0,
            duration_ms: 1500,
            status_before: "Design".to_string(),
            status_after: "PR Created".to_string(),
        });
        let json = payload.to_json();
        assert_eq!(json["exit_code"], 0);
        assert_eq!(json["status_after"], "PR Created");
    }

    #[test]
    fn serde_rename_uses_screaming_snake_case() {
        let s = serde_json::to_string(&EventType::WorktreeAllocated).unwrap();
        assert_eq!(s, "\"WORKTREE_ALLOCATED\"");
    }
}
