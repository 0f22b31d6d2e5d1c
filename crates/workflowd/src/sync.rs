//! Sync Engine (spec Section 4.B): reads work-item files off disk, upserts the
//! Store inside one transaction, resolves dependencies, computes kanban
//! columns and pending-merge-parents, then writes the computed fields back to
//! the stage files that changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde_yaml::Mapping;
use thiserror::Error;
use tracing::warn;

use workflow_core::frontmatter::{self, EpicFrontmatter, StageFrontmatter, TicketFrontmatter};
use workflow_core::ids::{DepRef, IdKind};
use workflow_core::types::{
    Dependency, EntityKind, Epic, KanbanColumn, PendingMergeParent, Stage, StageStatus, Ticket,
    TicketSource,
};
use workflow_core::Id;

use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// A non-fatal problem surfaced during a sync pass (spec Section 7:
/// `ParseError` / `ValidationError` — recorded, not fatal).
#[derive(Debug, Clone)]
pub struct SyncIssue {
    pub file: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct SyncReport {
    pub epics: usize,
    pub tickets: usize,
    pub stages: usize,
    pub errors: Vec<SyncIssue>,
}

pub struct SyncEngine<'a> {
    store: &'a Store,
}

impl<'a> SyncEngine<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    pub async fn sync_repo(&self, repo_path: &Path) -> Result<SyncReport> {
        let repo_name = crate::git::repo_name(repo_path);
        let repo = self
            .store
            .upsert_by_path(&repo_path.to_string_lossy(), &repo_name)
            .await?;

        let mut report = SyncReport::default();
        let files = discover_files(repo_path);

        let mut epics: Vec<Epic> = Vec::new();
        let mut tickets: Vec<Ticket> = Vec::new();
        let mut stages: Vec<Stage> = Vec::new();
        // (stage, its source file path, original frontmatter mapping, body)
        let mut stage_sources: HashMap<Id, (PathBuf, Mapping, String)> = HashMap::new();

        for path in &files {
            let raw = match std::fs::read_to_string(path) {
                Ok(raw) => raw,
                Err(e) => {
                    report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("read error: {e}"),
                    });
                    continue;
                }
            };

            let (yaml, body) = match frontmatter::split(&raw) {
                Ok(parts) => parts,
                Err(e) => {
                    report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("frontmatter error: {e}"),
                    });
                    continue;
                }
            };

            let value: serde_yaml::Value = match serde_yaml::from_str(yaml) {
                Ok(v) => v,
                Err(e) => {
                    report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("yaml error: {e}"),
                    });
                    continue;
                }
            };
            let Some(raw_id) = value.get("id").and_then(|v| v.as_str()) else {
                report.errors.push(SyncIssue {
                    file: path.clone(),
                    message: "frontmatter missing `id`".to_string(),
                });
                continue;
            };
            let Ok(id) = Id::new(raw_id) else {
                report.errors.push(SyncIssue {
                    file: path.clone(),
                    message: format!("unrecognized id prefix: {raw_id:?}"),
                });
                continue;
            };
            let Ok(kind) = id.kind() else {
                continue;
            };

            match kind {
                IdKind::Epic => match frontmatter::parse_typed::<EpicFrontmatter>(yaml) {
                    Ok(fm) => epics.push(epic_from_frontmatter(&repo.id, path, &fm)),
                    Err(e) => report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("epic shape error: {e}"),
                    }),
                },
                IdKind::Ticket => match frontmatter::parse_typed::<TicketFrontmatter>(yaml) {
                    Ok(fm) => tickets.push(ticket_from_frontmatter(&repo.id, path, &fm)),
                    Err(e) => report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("ticket shape error: {e}"),
                    }),
                },
                IdKind::Stage => match frontmatter::parse_typed::<StageFrontmatter>(yaml) {
                    Ok(fm) => {
                        let stage = stage_from_frontmatter(&repo.id, path, &fm);
                        stage_sources.insert(
                            stage.id.clone(),
                            (path.clone(), fm.extra.clone(), body.to_string()),
                        );
                        stages.push(stage);
                    }
                    Err(e) => report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("stage shape error: {e}"),
                    }),
                },
            }
        }

        // has_stages is derived, not read from frontmatter.
        for ticket in &mut tickets {
            ticket.has_stages = stages.iter().any(|s| s.ticket_id == ticket.id);
        }

        let mut dependencies = build_dependencies(&repo.id, &epics, &tickets, &stages, &mut report);
        resolve_dependencies(&epics, &tickets, &stages, &mut dependencies);

        compute_kanban_columns(&mut stages, &dependencies);
        compute_pending_merge_parents(&mut stages, &dependencies);

        let live_epics: Vec<Id> = epics.iter().map(|e| e.id.clone()).collect();
        let live_tickets: Vec<Id> = tickets.iter().map(|t| t.id.clone()).collect();
        let live_stages: Vec<Id> = stages.iter().map(|s| s.id.clone()).collect();

        let mut tx = self.store.begin_sync().await?;
        Store::delete_dependencies_for_repo(&mut tx, &repo.id).await?;
        Store::delete_stale_entities(&mut tx, &repo.id, &live_epics, &live_tickets, &live_stages)
            .await?;
        for epic in &epics {
            Store::upsert_epic_tx(&mut tx, epic).await?;
        }
        for ticket in &tickets {
            Store::upsert_ticket_tx(&mut tx, ticket).await?;
        }
        for stage in &stages {
            Store::upsert_stage_tx(&mut tx, stage).await?;
        }
        for dep in &dependencies {
            Store::upsert_dependency_tx(&mut tx, dep).await?;
        }
        tx.commit().await?;

        report.epics = epics.len();
        report.tickets = tickets.len();
        report.stages = stages.len();

        for stage in &stages {
            let Some((path, extra, body)) = stage_sources.get(&stage.id) else {
                continue;
            };
            if let Err(e) = write_back_stage(path, extra, body, stage) {
                match e.source.kind() {
                    std::io::ErrorKind::NotFound => {}
                    _ => report.errors.push(SyncIssue {
                        file: path.clone(),
                        message: format!("write-back error: {}", e.source),
                    }),
                }
            }
        }

        Ok(report)
    }
}

fn discover_files(repo_path: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let epics_dir = repo_path.join("epics");
    walk(&epics_dir, &mut out);
    out.sort();
    out
}

fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            out.push(path);
        }
    }
}

fn epic_from_frontmatter(repo_id: &Id, path: &Path, fm: &EpicFrontmatter) -> Epic {
    Epic {
        id: Id::from_raw(&fm.id),
        repo_id: repo_id.clone(),
        title: fm.title.clone(),
        status: StageStatus::new(fm.status.clone()),
        jira_key: fm.jira_key.clone(),
        file_path: path.to_string_lossy().to_string(),
        depends_on: fm.depends_on.clone(),
    }
}

fn ticket_from_frontmatter(repo_id: &Id, path: &Path, fm: &TicketFrontmatter) -> Ticket {
    Ticket {
        id: Id::from_raw(&fm.id),
        epic_id: Id::from_raw(&fm.epic),
        repo_id: repo_id.clone(),
        title: fm.title.clone(),
        status: StageStatus::new(fm.status.clone()),
        jira_key: fm.jira_key.clone(),
        source: match fm.source.as_deref() {
            Some("jira") => TicketSource::Jira,
            _ => TicketSource::Local,
        },
        has_stages: false,
        file_path: path.to_string_lossy().to_string(),
        depends_on: fm.depends_on.clone(),
        jira_links: fm.jira_links.clone(),
    }
}

fn stage_from_frontmatter(repo_id: &Id, path: &Path, fm: &StageFrontmatter) -> Stage {
    Stage {
        id: Id::from_raw(&fm.id),
        ticket_id: Id::from_raw(&fm.ticket),
        epic_id: Id::from_raw(&fm.epic),
        repo_id: repo_id.clone(),
        title: fm.title.clone(),
        status: StageStatus::new(fm.status.clone()),
        refinement_type: fm.refinement_type.clone(),
        worktree_branch: fm.worktree_branch.clone(),
        pr_url: fm.pr_url.clone(),
        pr_number: fm.pr_number,
        priority: fm.priority,
        due_date: fm.due_date.as_deref().and_then(parse_due_date),
        session_active: fm.session_active,
        is_draft: fm.is_draft,
        pending_merge_parents: fm.pending_merge_parents.clone(),
        mr_target_branch: fm.mr_target_branch.clone(),
        rebase_conflict: fm.rebase_conflict,
        file_path: path.to_string_lossy().to_string(),
        depends_on: fm.depends_on.clone(),
        kanban_column: KanbanColumn::backlog(),
    }
}

fn parse_due_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

/// Build dependency rows for every entity, rejecting edges that violate the
/// type rules in spec Section 3 (the violation is recorded, not fatal).
fn build_dependencies(
    repo_id: &Id,
    epics: &[Epic],
    tickets: &[Ticket],
    stages: &[Stage],
    report: &mut SyncReport,
) -> Vec<Dependency> {
    let mut out = Vec::new();

    let mut push_all = |from_id: &Id, from_type: EntityKind, refs: &[String], file: &str| {
        for raw in refs {
            let dep_ref = match DepRef::parse(raw) {
                Ok(d) => d,
                Err(e) => {
                    report.errors.push(SyncIssue {
                        file: PathBuf::from(file),
                        message: format!("invalid depends_on entry {raw:?}: {e}"),
                    });
                    continue;
                }
            };
            let to_type = match dep_ref.id().kind() {
                Ok(k) => entity_kind_from_idkind(k),
                Err(e) => {
                    report.errors.push(SyncIssue {
                        file: PathBuf::from(file),
                        message: format!("depends_on {raw:?}: {e}"),
                    });
                    continue;
                }
            };
            if !dependency_type_allowed(from_type, to_type) {
                report.errors.push(SyncIssue {
                    file: PathBuf::from(file),
                    message: format!(
                        "depends_on: {from_type} may not depend on {to_type} ({raw:?})"
                    ),
                });
                continue;
            }
            out.push(Dependency {
                repo_id: repo_id.clone(),
                from_id: from_id.clone(),
                from_type,
                to_id: dep_ref.id().clone(),
                to_type,
                resolved: false,
                target_repo_name: dep_ref.repo().map(|s| s.to_string()),
            });
        }
    };

    for epic in epics {
        push_all(&epic.id, EntityKind::Epic, &epic.depends_on, &epic.file_path);
    }
    for ticket in tickets {
        push_all(&ticket.id, EntityKind::Ticket, &ticket.depends_on, &ticket.file_path);
    }
    for stage in stages {
        push_all(&stage.id, EntityKind::Stage, &stage.depends_on, &stage.file_path);
    }

    out
}

fn entity_kind_from_idkind(kind: IdKind) -> EntityKind {
    match kind {
        IdKind::Epic => EntityKind::Epic,
        IdKind::Ticket => EntityKind::Ticket,
        IdKind::Stage => EntityKind::Stage,
    }
}

fn dependency_type_allowed(from: EntityKind, to: EntityKind) -> bool {
    matches!(
        (from, to),
        (EntityKind::Epic, EntityKind::Epic)
            | (EntityKind::Ticket, EntityKind::Ticket)
            | (EntityKind::Ticket, EntityKind::Epic)
            | (EntityKind::Stage, EntityKind::Stage)
            | (EntityKind::Stage, EntityKind::Ticket)
            | (EntityKind::Stage, EntityKind::Epic)
    )
}

const SOFT_RESOLVED_STATUSES: [&str; 2] = ["PR Created", "Addressing Comments"];

/// Mark `resolved` (hard resolution) on every local dependency row. Cross-repo
/// deps are left `resolved=false`: this repo has no visibility into another
/// checkout's status (see `DESIGN.md` on the cross-repo carve-out).
fn resolve_dependencies(epics: &[Epic], tickets: &[Ticket], stages: &[Stage], deps: &mut [Dependency]) {
    let stage_by_id: HashMap<&Id, &Stage> = stages.iter().map(|s| (&s.id, s)).collect();
    let ticket_by_id: HashMap<&Id, &Ticket> = tickets.iter().map(|t| (&t.id, t)).collect();
    let epic_by_id: HashMap<&Id, &Epic> = epics.iter().map(|e| (&e.id, e)).collect();

    let ticket_hard_resolved = |ticket_id: &Id| -> bool {
        let Some(ticket) = ticket_by_id.get(ticket_id) else {
            return false;
        };
        let ticket_stages: Vec<&&Stage> =
            stage_by_id.values().filter(|s| &s.ticket_id == &ticket.id).collect();
        !ticket_stages.is_empty() && ticket_stages.iter().all(|s| s.status.is_complete())
    };

    let epic_hard_resolved = |epic_id: &Id| -> bool {
        if !epic_by_id.contains_key(epic_id) {
            return false;
        }
        let epic_stages: Vec<&&Stage> =
            stage_by_id.values().filter(|s| &s.epic_id == epic_id).collect();
        !epic_stages.is_empty() && epic_stages.iter().all(|s| s.status.is_complete())
    };

    for dep in deps.iter_mut() {
        if dep.target_repo_name.is_some() {
            continue;
        }
        dep.resolved = match dep.to_type {
            EntityKind::Stage => stage_by_id
                .get(&dep.to_id)
                .map(|s| s.status.is_complete())
                .unwrap_or(false),
            EntityKind::Ticket => ticket_hard_resolved(&dep.to_id),
            EntityKind::Epic => epic_hard_resolved(&dep.to_id),
        };
    }
}

fn is_soft_resolved(target_status: &StageStatus) -> bool {
    SOFT_RESOLVED_STATUSES.contains(&target_status.as_str())
}

/// A stage's deps are "satisfied" for columning/selection purposes if every
/// one is hard-resolved, or (stage→stage only) soft-resolved.
fn stage_deps_satisfied(stage_id: &Id, stages: &[Stage], deps: &[Dependency]) -> bool {
    let stage_by_id: HashMap<&Id, &Stage> = stages.iter().map(|s| (&s.id, s)).collect();
    deps.iter()
        .filter(|d| &d.from_id == stage_id)
        .all(|d| {
            if d.resolved {
                return true;
            }
            if d.to_type == EntityKind::Stage && d.target_repo_name.is_none() {
                if let Some(target) = stage_by_id.get(&d.to_id) {
                    return is_soft_resolved(&target.status);
                }
            }
            false
        })
}

fn compute_kanban_columns(stages: &mut [Stage], deps: &[Dependency]) {
    let ids: Vec<Id> = stages.iter().map(|s| s.id.clone()).collect();
    let snapshot = stages.to_vec();
    for (stage, id) in stages.iter_mut().zip(ids.iter()) {
        let satisfied = stage_deps_satisfied(id, &snapshot, deps);
        stage.kanban_column = if !satisfied {
            KanbanColumn::backlog()
        } else if stage.status.is_complete() {
            KanbanColumn::done()
        } else if stage.status.is_not_started() {
            KanbanColumn::ready_for_work()
        } else {
            KanbanColumn::phase(stage.status.as_str())
        };
    }
}

/// Spec Section 4.B step 6: for each child stage whose deps are all
/// satisfied but at least one stage→stage dep is *only* soft-resolved,
/// collect that parent's merge info.
fn compute_pending_merge_parents(stages: &mut [Stage], deps: &[Dependency]) {
    let stage_by_id: HashMap<Id, Stage> =
        stages.iter().map(|s| (s.id.clone(), s.clone())).collect();

    for stage in stages.iter_mut() {
        if !stage_deps_satisfied(&stage.id, &stage_by_id.values().cloned().collect::<Vec<_>>(), deps) {
            stage.pending_merge_parents = Vec::new();
            stage.is_draft = false;
            continue;
        }

        let mut parents = Vec::new();
        for dep in deps.iter().filter(|d| d.from_id == stage.id) {
            if dep.to_type != EntityKind::Stage || dep.target_repo_name.is_some() || dep.resolved {
                continue;
            }
            let Some(parent) = stage_by_id.get(&dep.to_id) else {
                continue;
            };
            if !is_soft_resolved(&parent.status) {
                continue;
            }
            let (Some(pr_url), Some(pr_number)) = (parent.pr_url.clone(), parent.pr_number) else {
                continue;
            };
            parents.push(PendingMergeParent {
                stage_id: parent.id.clone(),
                branch: parent.worktree_branch.clone(),
                pr_url,
                pr_number,
            });
        }
        stage.is_draft = !parents.is_empty();
        stage.pending_merge_parents = parents;
    }
}

struct WriteBackIoError {
    source: std::io::Error,
}

fn write_back_stage(
    path: &Path,
    extra: &Mapping,
    body: &str,
    stage: &Stage,
) -> std::result::Result<(), WriteBackIoError> {
    let mut mapping = frontmatter::to_mapping(&StageFrontmatter {
        id: stage.id.as_str().to_string(),
        ticket: stage.ticket_id.as_str().to_string(),
        epic: stage.epic_id.as_str().to_string(),
        title: stage.title.clone(),
        status: stage.status.as_str().to_string(),
        refinement_type: stage.refinement_type.clone(),
        worktree_branch: stage.worktree_branch.clone(),
        pr_url: stage.pr_url.clone(),
        pr_number: stage.pr_number,
        priority: stage.priority,
        due_date: stage.due_date.map(|d| d.to_rfc3339()),
        session_active: stage.session_active,
        depends_on: stage.depends_on.clone(),
        pending_merge_parents: stage.pending_merge_parents.clone(),
        is_draft: stage.is_draft,
        mr_target_branch: stage.mr_target_branch.clone(),
        rebase_conflict: stage.rebase_conflict,
        extra: Mapping::new(),
    })
    .unwrap_or_default();
    for (k, v) in extra.iter() {
        if !mapping.contains_key(k) {
            mapping.insert(k.clone(), v.clone());
        }
    }

    let rendered = frontmatter::render(&mapping, body).map_err(|e| WriteBackIoError {
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()),
    })?;
    match std::fs::write(path, rendered) {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "stage write-back failed");
            Err(WriteBackIoError { source: e })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_file(dir: &Path, rel: &str, content: &str) {
        let path = dir.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    async fn store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.migrate_embedded().await.unwrap();
        store
    }

    #[tokio::test]
    async fn soft_unblock_scenario() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/TICKET-1.md",
            "---\nid: TICKET-1\nepic: EPIC-1\ntitle: Ticket\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-A.md",
            "---\nid: STAGE-A\nticket: TICKET-1\nepic: EPIC-1\ntitle: A\nstatus: \"PR Created\"\nworktree_branch: feat/a\npr_url: \"https://example/10\"\npr_number: 10\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-B.md",
            "---\nid: STAGE-B\nticket: TICKET-1\nepic: EPIC-1\ntitle: B\nstatus: \"Not Started\"\nworktree_branch: feat/b\ndepends_on: [STAGE-A]\n---\nbody\n",
        );

        let store = store().await;
        let engine = SyncEngine::new(&store);
        let report = engine.sync_repo(dir.path()).await.unwrap();
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert_eq!(report.stages, 2);

        let repo = store.find_repo_by_path(&dir.path().to_string_lossy()).await.unwrap().unwrap();
        let b = store
            .find_stage(&Id::from_raw("STAGE-B"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(b.kanban_column.as_str(), "ready_for_work");
        assert!(b.is_draft);
        assert_eq!(b.pending_merge_parents.len(), 1);
        assert_eq!(b.pending_merge_parents[0].stage_id.as_str(), "STAGE-A");

        let deps = store
            .list_dependencies_from(&repo.id, &Id::from_raw("STAGE-B"))
            .await
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert!(!deps[0].resolved);

        let written = std::fs::read_to_string(dir.path().join("epics/e1/TICKET-1/STAGE-B.md")).unwrap();
        assert!(written.contains("is_draft: true"));
    }

    #[tokio::test]
    async fn hard_cleanup_scenario() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/TICKET-1.md",
            "---\nid: TICKET-1\nepic: EPIC-1\ntitle: Ticket\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-A.md",
            "---\nid: STAGE-A\nticket: TICKET-1\nepic: EPIC-1\ntitle: A\nstatus: Complete\nworktree_branch: feat/a\npr_url: \"https://example/10\"\npr_number: 10\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-B.md",
            "---\nid: STAGE-B\nticket: TICKET-1\nepic: EPIC-1\ntitle: B\nstatus: \"Not Started\"\nworktree_branch: feat/b\ndepends_on: [STAGE-A]\n---\nbody\n",
        );

        let store = store().await;
        let engine = SyncEngine::new(&store);
        engine.sync_repo(dir.path()).await.unwrap();

        let b = store
            .find_stage(&Id::from_raw("STAGE-B"))
            .await
            .unwrap()
            .unwrap();
        assert!(b.pending_merge_parents.is_empty());
        assert!(!b.is_draft);
        assert_eq!(b.kanban_column.as_str(), "ready_for_work");
    }

    #[tokio::test]
    async fn mixed_deps_stays_backlog() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/TICKET-1.md",
            "---\nid: TICKET-1\nepic: EPIC-1\ntitle: Ticket\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-Y.md",
            "---\nid: STAGE-Y\nticket: TICKET-1\nepic: EPIC-1\ntitle: Y\nstatus: Complete\nworktree_branch: feat/y\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-Z.md",
            "---\nid: STAGE-Z\nticket: TICKET-1\nepic: EPIC-1\ntitle: Z\nstatus: Build\nworktree_branch: feat/z\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-X.md",
            "---\nid: STAGE-X\nticket: TICKET-1\nepic: EPIC-1\ntitle: X\nstatus: \"Not Started\"\nworktree_branch: feat/x\ndepends_on: [STAGE-Y, STAGE-Z]\n---\nbody\n",
        );

        let store = store().await;
        let engine = SyncEngine::new(&store);
        engine.sync_repo(dir.path()).await.unwrap();

        let x = store
            .find_stage(&Id::from_raw("STAGE-X"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(x.kanban_column.as_str(), "backlog");
        assert!(x.pending_merge_parents.is_empty());
    }

    #[tokio::test]
    async fn invalid_dependency_type_is_recorded_not_fatal() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\ndepends_on: [TICKET-9]\n---\nbody\n",
        );

        let store = store().await;
        let engine = SyncEngine::new(&store);
        let report = engine.sync_repo(dir.path()).await.unwrap();
        assert_eq!(report.epics, 1);
        assert!(report.errors.iter().any(|e| e.message.contains("ticket")));
    }

    #[tokio::test]
    async fn sync_is_idempotent() {
        let dir = TempDir::new().unwrap();
        write_file(
            dir.path(),
            "epics/e1/EPIC-1.md",
            "---\nid: EPIC-1\ntitle: Epic\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/TICKET-1.md",
            "---\nid: TICKET-1\nepic: EPIC-1\ntitle: Ticket\nstatus: Not Started\n---\nbody\n",
        );
        write_file(
            dir.path(),
            "epics/e1/TICKET-1/STAGE-A.md",
            "---\nid: STAGE-A\nticket: TICKET-1\nepic: EPIC-1\ntitle: A\nstatus: \"Not Started\"\nworktree_branch: feat/a\n---\nbody\n",
        );

        let store = store().await;
        let engine = SyncEngine::new(&store);
        engine.sync_repo(dir.path()).await.unwrap();
        let first = std::fs::read_to_string(dir.path().join("epics/e1/TICKET-1/STAGE-A.md")).unwrap();
        engine.sync_repo(dir.path()).await.unwrap();
        let second = std::fs::read_to_string(dir.path().join("epics/e1/TICKET-1/STAGE-A.md")).unwrap();
        assert_eq!(first, second);
    }
}
