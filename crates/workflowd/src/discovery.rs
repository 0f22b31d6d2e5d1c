//! Discovery + Selection (spec Section 4.D): query the Store for stages ready
//! to execute, score and order them, and report the counts used by `summary`
//! and `board`.

use chrono::Utc;
use thiserror::Error;
use workflow_core::types::{KanbanColumn, Stage};
use workflow_core::Id;

use crate::storage::{Store, StoreError};

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, DiscoveryError>;

#[derive(Debug, Clone)]
pub struct ReadyStage {
    pub stage: Stage,
    pub score: i64,
    pub needs_human: bool,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryResult {
    pub ready: Vec<ReadyStage>,
    pub blocked_count: usize,
    pub in_progress_count: usize,
    pub to_convert_count: usize,
}

/// `discover(repoPath, maxSlots)`. Operates against the already-synced Store
/// rather than the filesystem directly — callers sync first.
pub async fn discover(store: &Store, repo_id: &Id, max_slots: usize) -> Result<DiscoveryResult> {
    let stages = store.list_stages_by_repo(repo_id).await?;
    let tickets = store.list_tickets_by_repo(repo_id).await?;

    let blocked_count = stages
        .iter()
        .filter(|s| s.kanban_column.as_str() == KanbanColumn::BACKLOG)
        .count();
    let in_progress_count = stages.iter().filter(|s| s.session_active).count();
    let to_convert_count = tickets.iter().filter(|t| !t.has_stages).count();

    let mut ready: Vec<ReadyStage> = stages
        .into_iter()
        .filter(|s| is_selectable(s))
        .map(|stage| {
            let score = priority_score(&stage);
            let needs_human = is_manual_testing_band(&stage);
            ReadyStage { stage, score, needs_human }
        })
        .collect();

    ready.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then_with(|| a.stage.id.as_str().cmp(b.stage.id.as_str()))
    });
    ready.truncate(max_slots);

    Ok(DiscoveryResult {
        ready,
        blocked_count,
        in_progress_count,
        to_convert_count,
    })
}

fn is_selectable(stage: &Stage) -> bool {
    if stage.session_active {
        return false;
    }
    !matches!(
        stage.kanban_column.as_str(),
        KanbanColumn::BACKLOG | KanbanColumn::DONE | KanbanColumn::TO_CONVERT
    )
}

fn is_manual_testing_band(stage: &Stage) -> bool {
    stage.status.as_str() == "Manual Testing"
}

/// Priority scoring (spec Section 4.D): a status-derived band, plus the
/// frontmatter `priority` field, plus a due-date bonus.
fn priority_score(stage: &Stage) -> i64 {
    let base = match stage.status.as_str() {
        "Addressing Comments" => 700,
        "Manual Testing" => 600,
        "Automatic Testing" => 500,
        _ if stage.kanban_column.as_str() == "build" => 400,
        _ if stage.kanban_column.as_str() == KanbanColumn::READY_FOR_WORK => 300,
        _ => 200,
    };
    base + stage.priority + due_date_bonus(stage)
}

fn due_date_bonus(stage: &Stage) -> i64 {
    let Some(due) = stage.due_date else {
        return 0;
    };
    let days = (due - Utc::now()).num_days();
    if days > 14 {
        return 0;
    }
    ((14 - days).max(0) * 5).min(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use workflow_core::types::{PendingMergeParent, StageStatus};

    fn stage(id: &str, status: &str, column: &str) -> Stage {
        Stage {
            id: Id::from_raw(id),
            ticket_id: Id::from_raw("TICKET-1"),
            epic_id: Id::from_raw("EPIC-1"),
            repo_id: Id::from_raw("REPO-1"),
            title: "Stage".to_string(),
            status: StageStatus::new(status),
            refinement_type: vec![],
            worktree_branch: format!("run/{id}"),
            pr_url: None,
            pr_number: None,
            priority: 0,
            due_date: None,
            session_active: false,
            is_draft: false,
            pending_merge_parents: Vec::<PendingMergeParent>::new(),
            mr_target_branch: None,
            rebase_conflict: false,
            file_path: String::new(),
            depends_on: vec![],
            kanban_column: KanbanColumn(column.to_string()),
        }
    }

    #[tokio::test]
    async fn priority_order_matches_spec_scenario() {
        let store = Store::in_memory().await.unwrap();
        store.migrate_embedded().await.unwrap();
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();

        let mut s1 = stage("STAGE-S1", "Addressing Comments", "addressing_comments");
        s1.repo_id = repo.id.clone();
        let mut s2 = stage("STAGE-S2", "Build", "build");
        s2.repo_id = repo.id.clone();
        let mut s3 = stage("STAGE-S3", "Not Started", "ready_for_work");
        s3.repo_id = repo.id.clone();

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s1).await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s2).await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s3).await.unwrap();
        tx.commit().await.unwrap();

        let result = discover(&store, &repo.id, 10).await.unwrap();
        let ids: Vec<&str> = result.ready.iter().map(|r| r.stage.id.as_str()).collect();
        assert_eq!(ids, vec!["STAGE-S1", "STAGE-S2", "STAGE-S3"]);
    }

    #[tokio::test]
    async fn session_active_excludes_from_ready() {
        let store = Store::in_memory().await.unwrap();
        store.migrate_embedded().await.unwrap();
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let mut s = stage("STAGE-A", "Design", "design");
        s.repo_id = repo.id.clone();
        s.session_active = true;

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s).await.unwrap();
        tx.commit().await.unwrap();

        let result = discover(&store, &repo.id, 10).await.unwrap();
        assert!(result.ready.is_empty());
        assert_eq!(result.in_progress_count, 1);
    }

    #[tokio::test]
    async fn backlog_and_done_are_excluded_and_counted() {
        let store = Store::in_memory().await.unwrap();
        store.migrate_embedded().await.unwrap();
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let mut blocked = stage("STAGE-A", "Not Started", KanbanColumn::BACKLOG);
        blocked.repo_id = repo.id.clone();
        let mut done = stage("STAGE-B", "Complete", KanbanColumn::DONE);
        done.repo_id = repo.id.clone();

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &blocked).await.unwrap();
        Store::upsert_stage_tx(&mut tx, &done).await.unwrap();
        tx.commit().await.unwrap();

        let result = discover(&store, &repo.id, 10).await.unwrap();
        assert!(result.ready.is_empty());
        assert_eq!(result.blocked_count, 1);
    }

    #[test]
    fn due_date_bonus_decays_past_14_days() {
        let mut s = stage("STAGE-A", "Design", "design");
        s.due_date = Some(Utc::now() + Duration::days(20));
        assert_eq!(due_date_bonus(&s), 0);

        s.due_date = Some(Utc::now() + Duration::days(1));
        assert!(due_date_bonus(&s) > 0);
    }
}
