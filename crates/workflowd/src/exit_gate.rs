//! Exit gate (spec Section 4.F.1): invoked after any status transition — a
//! worker session finishing, a resolver write, or a cron-driven PR-merge
//! detection. Re-syncs the repo, then propagates completeness upward from
//! stage to ticket to epic.

use std::path::Path;

use thiserror::Error;

use workflow_core::frontmatter::{self, EpicFrontmatter, TicketFrontmatter};
use workflow_core::types::StageStatus;
use workflow_core::Id;

use crate::storage::{Store, StoreError};
use crate::sync::{SyncEngine, SyncReport};

#[derive(Debug, Error)]
pub enum ExitGateError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, ExitGateError>;

/// Identifies the stage whose session (or resolver/cron action) just
/// completed. Named after the worker-info the orchestrator already holds
/// when it calls the gate.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub stage_id: Id,
}

#[derive(Debug, Clone)]
pub struct ExitGateResult {
    pub status_changed: bool,
    pub status_before: StageStatus,
    pub status_after: StageStatus,
    pub ticket_updated: bool,
    pub epic_updated: bool,
    pub ticket_completed: bool,
    pub epic_completed: bool,
    pub sync_result: Option<SyncReport>,
}

/// `(workerInfo, repoPath, statusAfter)` per spec Section 4.F.1. `statusBefore`
/// is read from the Store before the resync runs, so R3 idempotence (double
/// detection by cron and a resolver both observing the same merge) holds even
/// when the caller doesn't track the prior status itself.
pub async fn run(
    store: &Store,
    repo_path: &Path,
    worker: &WorkerInfo,
    status_after: StageStatus,
) -> Result<ExitGateResult> {
    let status_before = store
        .find_stage(&worker.stage_id)
        .await?
        .map(|s| s.status)
        .unwrap_or_else(|| status_after.clone());

    if status_before == status_after {
        return Ok(ExitGateResult {
            status_changed: false,
            status_before,
            status_after,
            ticket_updated: false,
            epic_updated: false,
            ticket_completed: false,
            epic_completed: false,
            sync_result: None,
        });
    }

    let engine = SyncEngine::new(store);
    let sync_result = engine.sync_repo(repo_path).await.ok();

    let mut ticket_updated = false;
    let mut epic_updated = false;
    let mut ticket_completed = false;
    let mut epic_completed = false;

    if status_after.is_complete() {
        if let Some(stage) = store.find_stage(&worker.stage_id).await? {
            if let Some(ticket) = store.find_ticket(&stage.ticket_id).await? {
                let ticket_stages = store.list_stages_by_ticket(&ticket.id).await?;
                let all_complete =
                    !ticket_stages.is_empty() && ticket_stages.iter().all(|s| s.status.is_complete());
                if all_complete && !ticket.status.is_complete() {
                    if write_back_status(Path::new(&ticket.file_path), EntityFile::Ticket).is_ok() {
                        ticket_updated = true;
                        ticket_completed = true;
                    }

                    if let Some(epic) = store.find_epic(&ticket.epic_id).await? {
                        let epic_tickets = store.list_tickets_by_epic(&epic.id).await?;
                        let epic_all_complete = !epic_tickets.is_empty()
                            && epic_tickets
                                .iter()
                                .all(|t| t.id == ticket.id || t.status.is_complete());
                        if epic_all_complete && !epic.status.is_complete() {
                            if write_back_status(Path::new(&epic.file_path), EntityFile::Epic).is_ok()
                            {
                                epic_updated = true;
                                epic_completed = true;
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(ExitGateResult {
        status_changed: true,
        status_before,
        status_after,
        ticket_updated,
        epic_updated,
        ticket_completed,
        epic_completed,
        sync_result,
    })
}

enum EntityFile {
    Ticket,
    Epic,
}

/// Reads `path`, sets `status: Complete` while preserving every other key and
/// the body, and writes it back. ENOENT and any other io/parse failure are
/// reported to the caller as `Err` (the caller treats this non-fatally, per
/// spec Section 4.F.1 step 4).
fn write_back_status(path: &Path, kind: EntityFile) -> std::result::Result<(), ()> {
    let raw = std::fs::read_to_string(path).map_err(|_| ())?;
    let (yaml, body) = frontmatter::split(&raw).map_err(|_| ())?;

    let rendered = match kind {
        EntityFile::Ticket => {
            let mut fm: TicketFrontmatter = frontmatter::parse_typed(yaml).map_err(|_| ())?;
            fm.status = StageStatus::from(workflow_core::types::ReservedStatus::Complete)
                .as_str()
                .to_string();
            let mapping = frontmatter::to_mapping(&fm).map_err(|_| ())?;
            frontmatter::render(&mapping, body).map_err(|_| ())?
        }
        EntityFile::Epic => {
            let mut fm: EpicFrontmatter = frontmatter::parse_typed(yaml).map_err(|_| ())?;
            fm.status = StageStatus::from(workflow_core::types::ReservedStatus::Complete)
                .as_str()
                .to_string();
            let mapping = frontmatter::to_mapping(&fm).map_err(|_| ())?;
            frontmatter::render(&mapping, body).map_err(|_| ())?
        }
    };

    std::fs::write(path, rendered).map_err(|_| ())
}
