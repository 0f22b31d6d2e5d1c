//! `SQLite`-backed mirror of the work-item hierarchy (spec Section 4.A).
//!
//! Single-writer, many-reader: every write path that touches more than one
//! row for a given repo (a full sync) runs inside one `sqlx::Transaction`, so
//! a reader connecting mid-sync sees either the pre-sync or the post-sync
//! graph, never a partial one.

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Sqlite, Transaction};
use std::path::Path;
use thiserror::Error;
use workflow_core::types::{
    Dependency, EntityKind, Epic, KanbanColumn, MrCommentTracking, ParentBranchTracking,
    PendingMergeParent, Repo, Stage, StageStatus, Ticket, TicketSource,
};
use workflow_core::Id;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("repo not found for path {0:?}")]
    RepoNotFoundByPath(String),
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Embedded mirror of work items and dependencies, backed by one `SQLite` file
/// per registered repo-set (spec Section 4.A).
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA foreign_keys = ON").execute(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];
        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");
            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if !trimmed.is_empty() {
                    sqlx::query(trimmed).execute(&self.pool).await?;
                }
            }
        }
        Ok(())
    }

    // --- Repo ---

    /// Create the repo row on first sync, or return the existing one.
    pub async fn upsert_by_path(&self, path: &str, name: &str) -> Result<Repo> {
        if let Some(existing) = self.find_repo_by_path(path).await? {
            return Ok(existing);
        }
        let id = Id::from_raw(format!("REPO-{}", uuid_like(path)));
        sqlx::query("INSERT INTO repos (id, path, name, slack_webhook) VALUES (?1, ?2, ?3, NULL)")
            .bind(id.as_str())
            .bind(path)
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(Repo {
            id,
            path: path.to_string(),
            name: name.to_string(),
            slack_webhook: None,
        })
    }

    pub async fn find_repo_by_path(&self, path: &str) -> Result<Option<Repo>> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT id, path, name, slack_webhook FROM repos WHERE path = ?1",
        )
        .bind(path)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RepoRow::into_domain))
    }

    pub async fn find_repo(&self, id: &Id) -> Result<Option<Repo>> {
        let row = sqlx::query_as::<_, RepoRow>(
            "SELECT id, path, name, slack_webhook FROM repos WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RepoRow::into_domain))
    }

    pub async fn list_repos(&self) -> Result<Vec<Repo>> {
        let rows = sqlx::query_as::<_, RepoRow>("SELECT id, path, name, slack_webhook FROM repos")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(RepoRow::into_domain).collect())
    }

    // --- Transactional repo-sync (spec Section 4.A, 4.B step 3) ---

    pub async fn begin_sync(&self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn delete_dependencies_for_repo(
        tx: &mut Transaction<'_, Sqlite>,
        repo_id: &Id,
    ) -> Result<()> {
        sqlx::query("DELETE FROM dependencies WHERE repo_id = ?1")
            .bind(repo_id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    pub async fn delete_stale_entities(
        tx: &mut Transaction<'_, Sqlite>,
        repo_id: &Id,
        live_epics: &[Id],
        live_tickets: &[Id],
        live_stages: &[Id],
    ) -> Result<()> {
        delete_stale(tx, "epics", repo_id, live_epics).await?;
        delete_stale(tx, "tickets", repo_id, live_tickets).await?;
        delete_stale(tx, "stages", repo_id, live_stages).await?;
        Ok(())
    }

    pub async fn upsert_epic_tx(tx: &mut Transaction<'_, Sqlite>, epic: &Epic) -> Result<()> {
        let depends_on = serde_json::to_string(&epic.depends_on)?;
        sqlx::query(
            r#"
            INSERT INTO epics (id, repo_id, title, status, jira_key, file_path, depends_on)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(id) DO UPDATE SET
                repo_id = excluded.repo_id, title = excluded.title, status = excluded.status,
                jira_key = excluded.jira_key, file_path = excluded.file_path,
                depends_on = excluded.depends_on
            "#,
        )
        .bind(epic.id.as_str())
        .bind(epic.repo_id.as_str())
        .bind(&epic.title)
        .bind(epic.status.as_str())
        .bind(&epic.jira_key)
        .bind(&epic.file_path)
        .bind(depends_on)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_ticket_tx(tx: &mut Transaction<'_, Sqlite>, ticket: &Ticket) -> Result<()> {
        let depends_on = serde_json::to_string(&ticket.depends_on)?;
        let jira_links = serde_json::to_string(&ticket.jira_links)?;
        let source = match ticket.source {
            TicketSource::Local => "local",
            TicketSource::Jira => "jira",
        };
        sqlx::query(
            r#"
            INSERT INTO tickets (id, epic_id, repo_id, title, status, jira_key, source,
                                  has_stages, file_path, depends_on, jira_links)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT(id) DO UPDATE SET
                epic_id = excluded.epic_id, repo_id = excluded.repo_id, title = excluded.title,
                status = excluded.status, jira_key = excluded.jira_key, source = excluded.source,
                has_stages = excluded.has_stages, file_path = excluded.file_path,
                depends_on = excluded.depends_on, jira_links = excluded.jira_links
            "#,
        )
        .bind(ticket.id.as_str())
        .bind(ticket.epic_id.as_str())
        .bind(ticket.repo_id.as_str())
        .bind(&ticket.title)
        .bind(ticket.status.as_str())
        .bind(&ticket.jira_key)
        .bind(source)
        .bind(ticket.has_stages)
        .bind(&ticket.file_path)
        .bind(depends_on)
        .bind(jira_links)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_stage_tx(tx: &mut Transaction<'_, Sqlite>, stage: &Stage) -> Result<()> {
        let refinement_type = serde_json::to_string(&stage.refinement_type)?;
        let depends_on = serde_json::to_string(&stage.depends_on)?;
        let pending_merge_parents = serde_json::to_string(&stage.pending_merge_parents)?;
        let due_date = stage.due_date.map(|d| d.timestamp_millis());
        sqlx::query(
            r#"
            INSERT INTO stages (id, ticket_id, epic_id, repo_id, title, status, refinement_type,
                                 worktree_branch, pr_url, pr_number, priority, due_date,
                                 session_active, is_draft, pending_merge_parents, mr_target_branch,
                                 rebase_conflict, file_path, depends_on, kanban_column)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
            ON CONFLICT(id) DO UPDATE SET
                ticket_id = excluded.ticket_id, epic_id = excluded.epic_id,
                repo_id = excluded.repo_id, title = excluded.title, status = excluded.status,
                refinement_type = excluded.refinement_type, worktree_branch = excluded.worktree_branch,
                pr_url = excluded.pr_url, pr_number = excluded.pr_number, priority = excluded.priority,
                due_date = excluded.due_date, pending_merge_parents = excluded.pending_merge_parents,
                is_draft = excluded.is_draft, mr_target_branch = excluded.mr_target_branch,
                rebase_conflict = excluded.rebase_conflict, file_path = excluded.file_path,
                depends_on = excluded.depends_on, kanban_column = excluded.kanban_column
            "#,
        )
        .bind(stage.id.as_str())
        .bind(stage.ticket_id.as_str())
        .bind(stage.epic_id.as_str())
        .bind(stage.repo_id.as_str())
        .bind(&stage.title)
        .bind(stage.status.as_str())
        .bind(refinement_type)
        .bind(&stage.worktree_branch)
        .bind(&stage.pr_url)
        .bind(stage.pr_number)
        .bind(stage.priority)
        .bind(due_date)
        .bind(stage.session_active)
        .bind(stage.is_draft)
        .bind(pending_merge_parents)
        .bind(&stage.mr_target_branch)
        .bind(stage.rebase_conflict)
        .bind(&stage.file_path)
        .bind(depends_on)
        .bind(stage.kanban_column.as_str())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    pub async fn upsert_dependency_tx(
        tx: &mut Transaction<'_, Sqlite>,
        dep: &Dependency,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dependencies (repo_id, from_id, from_type, to_id, to_type, resolved, target_repo_name)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(repo_id, from_id, to_id) DO UPDATE SET
                from_type = excluded.from_type, to_type = excluded.to_type,
                resolved = excluded.resolved, target_repo_name = excluded.target_repo_name
            "#,
        )
        .bind(dep.repo_id.as_str())
        .bind(dep.from_id.as_str())
        .bind(entity_kind_str(dep.from_type))
        .bind(dep.to_id.as_str())
        .bind(entity_kind_str(dep.to_type))
        .bind(dep.resolved)
        .bind(&dep.target_repo_name)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    // --- Reads ---

    pub async fn find_epic(&self, id: &Id) -> Result<Option<Epic>> {
        let row = sqlx::query_as::<_, EpicRow>(
            "SELECT id, repo_id, title, status, jira_key, file_path, depends_on FROM epics WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(EpicRow::into_domain).transpose()
    }

    pub async fn list_epics_by_repo(&self, repo_id: &Id) -> Result<Vec<Epic>> {
        let rows = sqlx::query_as::<_, EpicRow>(
            "SELECT id, repo_id, title, status, jira_key, file_path, depends_on FROM epics WHERE repo_id = ?1",
        )
        .bind(repo_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(EpicRow::into_domain).collect()
    }

    pub async fn find_ticket(&self, id: &Id) -> Result<Option<Ticket>> {
        let row = sqlx::query_as::<_, TicketRow>(
            "SELECT id, epic_id, repo_id, title, status, jira_key, source, has_stages, file_path, depends_on, jira_links FROM tickets WHERE id = ?1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(TicketRow::into_domain).transpose()
    }

    pub async fn list_tickets_by_repo(&self, repo_id: &Id) -> Result<Vec<Ticket>> {
        let rows = sqlx::query_as::<_, TicketRow>(
            "SELECT id, epic_id, repo_id, title, status, jira_key, source, has_stages, file_path, depends_on, jira_links FROM tickets WHERE repo_id = ?1",
        )
        .bind(repo_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TicketRow::into_domain).collect()
    }

    pub async fn list_tickets_by_epic(&self, epic_id: &Id) -> Result<Vec<Ticket>> {
        let rows = sqlx::query_as::<_, TicketRow>(
            "SELECT id, epic_id, repo_id, title, status, jira_key, source, has_stages, file_path, depends_on, jira_links FROM tickets WHERE epic_id = ?1",
        )
        .bind(epic_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TicketRow::into_domain).collect()
    }

    pub async fn find_stage(&self, id: &Id) -> Result<Option<Stage>> {
        let row = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE id = ?1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(StageRow::into_domain).transpose()
    }

    pub async fn list_stages_by_repo(&self, repo_id: &Id) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE repo_id = ?1"
        ))
        .bind(repo_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRow::into_domain).collect()
    }

    pub async fn list_stages_by_ticket(&self, ticket_id: &Id) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE ticket_id = ?1"
        ))
        .bind(ticket_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRow::into_domain).collect()
    }

    pub async fn list_stages_by_epic(&self, epic_id: &Id) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE epic_id = ?1"
        ))
        .bind(epic_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRow::into_domain).collect()
    }

    pub async fn list_dependencies_from(&self, repo_id: &Id, from_id: &Id) -> Result<Vec<Dependency>> {
        let rows = sqlx::query_as::<_, DependencyRow>(
            "SELECT repo_id, from_id, from_type, to_id, to_type, resolved, target_repo_name \
             FROM dependencies WHERE repo_id = ?1 AND from_id = ?2",
        )
        .bind(repo_id.as_str())
        .bind(from_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DependencyRow::into_domain).collect()
    }

    pub async fn list_dependencies_by_repo(&self, repo_id: &Id) -> Result<Vec<Dependency>> {
        let rows = sqlx::query_as::<_, DependencyRow>(
            "SELECT repo_id, from_id, from_type, to_id, to_type, resolved, target_repo_name \
             FROM dependencies WHERE repo_id = ?1",
        )
        .bind(repo_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(DependencyRow::into_domain).collect()
    }

    /// True iff every outbound dependency edge from `from_id` is hard-resolved.
    pub async fn all_resolved(&self, repo_id: &Id, from_id: &Id) -> Result<bool> {
        let deps = self.list_dependencies_from(repo_id, from_id).await?;
        Ok(deps.iter().all(|d| d.resolved))
    }

    // --- Targeted stage mutators (spec Section 4.A operations list) ---

    pub async fn update_kanban_column(&self, id: &Id, column: &KanbanColumn) -> Result<()> {
        sqlx::query("UPDATE stages SET kanban_column = ?1 WHERE id = ?2")
            .bind(column.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_session_active(&self, id: &Id, active: bool) -> Result<()> {
        sqlx::query("UPDATE stages SET session_active = ?1 WHERE id = ?2")
            .bind(active)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_pending_merge_parents(
        &self,
        id: &Id,
        parents: &[PendingMergeParent],
    ) -> Result<()> {
        let json = serde_json::to_string(parents)?;
        sqlx::query("UPDATE stages SET pending_merge_parents = ?1, is_draft = ?2 WHERE id = ?3")
            .bind(json)
            .bind(!parents.is_empty())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_status(&self, id: &Id, status: &StageStatus) -> Result<()> {
        sqlx::query("UPDATE stages SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // --- Parent-branch / MR-comment tracking (cron subsystem, spec Section 4.E.6) ---

    pub async fn upsert_parent_branch_tracking(&self, row: &ParentBranchTracking) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO parent_branch_tracking
                (child_stage_id, parent_stage_id, parent_branch, parent_pr_url,
                 last_known_head, is_merged, repo_id, last_checked)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(child_stage_id, parent_stage_id) DO UPDATE SET
                parent_branch = excluded.parent_branch, parent_pr_url = excluded.parent_pr_url,
                last_known_head = excluded.last_known_head, is_merged = excluded.is_merged,
                repo_id = excluded.repo_id, last_checked = excluded.last_checked
            "#,
        )
        .bind(row.child_stage_id.as_str())
        .bind(row.parent_stage_id.as_str())
        .bind(&row.parent_branch)
        .bind(&row.parent_pr_url)
        .bind(&row.last_known_head)
        .bind(row.is_merged)
        .bind(row.repo_id.as_str())
        .bind(row.last_checked.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_unmerged_parent_branch_tracking(
        &self,
        repo_id: &Id,
    ) -> Result<Vec<ParentBranchTracking>> {
        let rows = sqlx::query_as::<_, ParentBranchTrackingRow>(
            "SELECT child_stage_id, parent_stage_id, parent_branch, parent_pr_url, \
             last_known_head, is_merged, repo_id, last_checked \
             FROM parent_branch_tracking WHERE repo_id = ?1 AND is_merged = 0",
        )
        .bind(repo_id.as_str())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ParentBranchTrackingRow::into_domain).collect())
    }

    pub async fn upsert_mr_comment_tracking(&self, row: &MrCommentTracking) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO mr_comment_tracking
                (stage_id, last_poll_timestamp, last_known_unresolved_count, repo_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(stage_id) DO UPDATE SET
                last_poll_timestamp = excluded.last_poll_timestamp,
                last_known_unresolved_count = excluded.last_known_unresolved_count,
                repo_id = excluded.repo_id
            "#,
        )
        .bind(row.stage_id.as_str())
        .bind(row.last_poll_timestamp.map(|t| t.timestamp_millis()))
        .bind(row.last_known_unresolved_count)
        .bind(row.repo_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_mr_comment_tracking(&self, stage_id: &Id) -> Result<Option<MrCommentTracking>> {
        let row = sqlx::query_as::<_, MrCommentTrackingRow>(
            "SELECT stage_id, last_poll_timestamp, last_known_unresolved_count, repo_id \
             FROM mr_comment_tracking WHERE stage_id = ?1",
        )
        .bind(stage_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(MrCommentTrackingRow::into_domain))
    }

    /// Stages in a given status with `session_active = false` — the race guard
    /// cron relies on (spec Section 4.E.6, R1).
    pub async fn list_stages_by_status_idle(&self, repo_id: &Id, status: &str) -> Result<Vec<Stage>> {
        let rows = sqlx::query_as::<_, StageRow>(&format!(
            "SELECT {STAGE_COLUMNS} FROM stages WHERE repo_id = ?1 AND status = ?2 AND session_active = 0"
        ))
        .bind(repo_id.as_str())
        .bind(status)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(StageRow::into_domain).collect()
    }
}

async fn delete_stale(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    repo_id: &Id,
    live_ids: &[Id],
) -> Result<()> {
    let existing: Vec<(String,)> =
        sqlx::query_as(&format!("SELECT id FROM {table} WHERE repo_id = ?1"))
            .bind(repo_id.as_str())
            .fetch_all(&mut **tx)
            .await?;
    for (existing_id,) in existing {
        if !live_ids.iter().any(|id| id.as_str() == existing_id) {
            sqlx::query(&format!("DELETE FROM {table} WHERE id = ?1"))
                .bind(&existing_id)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

fn entity_kind_str(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Epic => "epic",
        EntityKind::Ticket => "ticket",
        EntityKind::Stage => "stage",
    }
}

fn entity_kind_from_str(s: &str) -> EntityKind {
    match s {
        "ticket" => EntityKind::Ticket,
        "stage" => EntityKind::Stage,
        _ => EntityKind::Epic,
    }
}

/// Deterministic repo-id suffix derived from the path, so re-registering the
/// same path always yields the same id across process restarts.
fn uuid_like(path: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

const STAGE_COLUMNS: &str = "id, ticket_id, epic_id, repo_id, title, status, refinement_type, \
    worktree_branch, pr_url, pr_number, priority, due_date, session_active, is_draft, \
    pending_merge_parents, mr_target_branch, rebase_conflict, file_path, depends_on, kanban_column";

#[derive(sqlx::FromRow)]
struct RepoRow {
    id: String,
    path: String,
    name: String,
    slack_webhook: Option<String>,
}

impl RepoRow {
    fn into_domain(self) -> Repo {
        Repo {
            id: Id::from_raw(self.id),
            path: self.path,
            name: self.name,
            slack_webhook: self.slack_webhook,
        }
    }
}

#[derive(sqlx::FromRow)]
struct EpicRow {
    id: String,
    repo_id: String,
    title: String,
    status: String,
    jira_key: Option<String>,
    file_path: String,
    depends_on: String,
}

impl EpicRow {
    fn into_domain(self) -> Result<Epic> {
        Ok(Epic {
            id: Id::from_raw(self.id),
            repo_id: Id::from_raw(self.repo_id),
            title: self.title,
            status: StageStatus::new(self.status),
            jira_key: self.jira_key,
            file_path: self.file_path,
            depends_on: serde_json::from_str(&self.depends_on)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TicketRow {
    id: String,
    epic_id: String,
    repo_id: String,
    title: String,
    status: String,
    jira_key: Option<String>,
    source: String,
    has_stages: bool,
    file_path: String,
    depends_on: String,
    jira_links: String,
}

impl TicketRow {
    fn into_domain(self) -> Result<Ticket> {
        Ok(Ticket {
            id: Id::from_raw(self.id),
            epic_id: Id::from_raw(self.epic_id),
            repo_id: Id::from_raw(self.repo_id),
            title: self.title,
            status: StageStatus::new(self.status),
            jira_key: self.jira_key,
            source: if self.source == "jira" {
                TicketSource::Jira
            } else {
                TicketSource::Local
            },
            has_stages: self.has_stages,
            file_path: self.file_path,
            depends_on: serde_json::from_str(&self.depends_on)?,
            jira_links: serde_json::from_str(&self.jira_links)?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StageRow {
    id: String,
    ticket_id: String,
    epic_id: String,
    repo_id: String,
    title: String,
    status: String,
    refinement_type: String,
    worktree_branch: String,
    pr_url: Option<String>,
    pr_number: Option<i64>,
    priority: i64,
    due_date: Option<i64>,
    session_active: bool,
    is_draft: bool,
    pending_merge_parents: String,
    mr_target_branch: Option<String>,
    rebase_conflict: bool,
    file_path: String,
    depends_on: String,
    kanban_column: String,
}

impl StageRow {
    fn into_domain(self) -> Result<Stage> {
        Ok(Stage {
            id: Id::from_raw(self.id),
            ticket_id: Id::from_raw(self.ticket_id),
            epic_id: Id::from_raw(self.epic_id),
            repo_id: Id::from_raw(self.repo_id),
            title: self.title,
            status: StageStatus::new(self.status),
            refinement_type: serde_json::from_str(&self.refinement_type)?,
            worktree_branch: self.worktree_branch,
            pr_url: self.pr_url,
            pr_number: self.pr_number,
            priority: self.priority,
            due_date: self.due_date.and_then(DateTime::<Utc>::from_timestamp_millis),
            session_active: self.session_active,
            is_draft: self.is_draft,
            pending_merge_parents: serde_json::from_str(&self.pending_merge_parents)?,
            mr_target_branch: self.mr_target_branch,
            rebase_conflict: self.rebase_conflict,
            file_path: self.file_path,
            depends_on: serde_json::from_str(&self.depends_on)?,
            kanban_column: KanbanColumn(self.kanban_column),
        })
    }
}

#[derive(sqlx::FromRow)]
struct DependencyRow {
    repo_id: String,
    from_id: String,
    from_type: String,
    to_id: String,
    to_type: String,
    resolved: bool,
    target_repo_name: Option<String>,
}

impl DependencyRow {
    fn into_domain(self) -> Result<Dependency> {
        Ok(Dependency {
            repo_id: Id::from_raw(self.repo_id),
            from_id: Id::from_raw(self.from_id),
            from_type: entity_kind_from_str(&self.from_type),
            to_id: Id::from_raw(self.to_id),
            to_type: entity_kind_from_str(&self.to_type),
            resolved: self.resolved,
            target_repo_name: self.target_repo_name,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ParentBranchTrackingRow {
    child_stage_id: String,
    parent_stage_id: String,
    parent_branch: String,
    parent_pr_url: String,
    last_known_head: Option<String>,
    is_merged: bool,
    repo_id: String,
    last_checked: Option<i64>,
}

impl ParentBranchTrackingRow {
    fn into_domain(self) -> ParentBranchTracking {
        ParentBranchTracking {
            child_stage_id: Id::from_raw(self.child_stage_id),
            parent_stage_id: Id::from_raw(self.parent_stage_id),
            parent_branch: self.parent_branch,
            parent_pr_url: self.parent_pr_url,
            last_known_head: self.last_known_head,
            is_merged: self.is_merged,
            repo_id: Id::from_raw(self.repo_id),
            last_checked: self.last_checked.and_then(DateTime::<Utc>::from_timestamp_millis),
        }
    }
}

#[derive(sqlx::FromRow)]
struct MrCommentTrackingRow {
    stage_id: String,
    last_poll_timestamp: Option<i64>,
    last_known_unresolved_count: i64,
    repo_id: String,
}

impl MrCommentTrackingRow {
    fn into_domain(self) -> MrCommentTracking {
        MrCommentTracking {
            stage_id: Id::from_raw(self.stage_id),
            last_poll_timestamp: self
                .last_poll_timestamp
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            last_known_unresolved_count: self.last_known_unresolved_count,
            repo_id: Id::from_raw(self.repo_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> Store {
        let store = Store::in_memory().await.unwrap();
        store.migrate_embedded().await.unwrap();
        store
    }

    fn sample_stage(repo_id: &Id, id: &str) -> Stage {
        Stage {
            id: Id::from_raw(id),
            ticket_id: Id::from_raw("TICKET-1"),
            epic_id: Id::from_raw("EPIC-1"),
            repo_id: repo_id.clone(),
            title: "A stage".to_string(),
            status: StageStatus::new("Not Started"),
            refinement_type: vec![],
            worktree_branch: format!("run/{id}"),
            pr_url: None,
            pr_number: None,
            priority: 0,
            due_date: None,
            session_active: false,
            is_draft: false,
            pending_merge_parents: vec![],
            mr_target_branch: None,
            rebase_conflict: false,
            file_path: format!("epics/e/t/{id}.md"),
            depends_on: vec![],
            kanban_column: KanbanColumn::ready_for_work(),
        }
    }

    #[tokio::test]
    async fn upsert_by_path_is_idempotent() {
        let store = test_store().await;
        let first = store.upsert_by_path("/repo", "repo").await.unwrap();
        let second = store.upsert_by_path("/repo", "repo").await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn stage_round_trips_through_transaction() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let stage = sample_stage(&repo.id, "STAGE-1-1-1");

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &stage).await.unwrap();
        tx.commit().await.unwrap();

        let fetched = store.find_stage(&stage.id).await.unwrap().unwrap();
        assert_eq!(fetched.title, "A stage");
        assert_eq!(fetched.kanban_column.as_str(), "ready_for_work");
    }

    #[tokio::test]
    async fn delete_stale_removes_rows_missing_from_live_set() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let s1 = sample_stage(&repo.id, "STAGE-1-1-1");
        let s2 = sample_stage(&repo.id, "STAGE-1-1-2");

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s1).await.unwrap();
        Store::upsert_stage_tx(&mut tx, &s2).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin_sync().await.unwrap();
        Store::delete_stale_entities(&mut tx, &repo.id, &[], &[], &[s1.id.clone()])
            .await
            .unwrap();
        tx.commit().await.unwrap();

        assert!(store.find_stage(&s1.id).await.unwrap().is_some());
        assert!(store.find_stage(&s2.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_pending_merge_parents_sets_is_draft() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let stage = sample_stage(&repo.id, "STAGE-1-1-1");
        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &stage).await.unwrap();
        tx.commit().await.unwrap();

        let parent = PendingMergeParent {
            stage_id: Id::from_raw("STAGE-1-1-0"),
            branch: "feat/a".to_string(),
            pr_url: "https://example/10".to_string(),
            pr_number: 10,
        };
        store
            .update_pending_merge_parents(&stage.id, std::slice::from_ref(&parent))
            .await
            .unwrap();
        let fetched = store.find_stage(&stage.id).await.unwrap().unwrap();
        assert!(fetched.is_draft);
        assert_eq!(fetched.pending_merge_parents.len(), 1);

        store.update_pending_merge_parents(&stage.id, &[]).await.unwrap();
        let fetched = store.find_stage(&stage.id).await.unwrap().unwrap();
        assert!(!fetched.is_draft);
    }

    #[tokio::test]
    async fn all_resolved_true_when_no_deps() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        assert!(store
            .all_resolved(&repo.id, &Id::from_raw("STAGE-1-1-1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn dependency_upsert_and_list_round_trip() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let dep = Dependency {
            repo_id: repo.id.clone(),
            from_id: Id::from_raw("STAGE-1-1-2"),
            from_type: EntityKind::Stage,
            to_id: Id::from_raw("STAGE-1-1-1"),
            to_type: EntityKind::Stage,
            resolved: false,
            target_repo_name: None,
        };
        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_dependency_tx(&mut tx, &dep).await.unwrap();
        tx.commit().await.unwrap();

        let deps = store
            .list_dependencies_from(&repo.id, &dep.from_id)
            .await
            .unwrap();
        assert_eq!(deps.len(), 1);
        assert!(!deps[0].resolved);
        assert!(!store.all_resolved(&repo.id, &dep.from_id).await.unwrap());
    }

    #[tokio::test]
    async fn list_stages_by_status_idle_excludes_active_sessions() {
        let store = test_store().await;
        let repo = store.upsert_by_path("/repo", "repo").await.unwrap();
        let mut idle = sample_stage(&repo.id, "STAGE-1-1-1");
        idle.status = StageStatus::new("PR Created");
        let mut active = sample_stage(&repo.id, "STAGE-1-1-2");
        active.status = StageStatus::new("PR Created");
        active.session_active = true;

        let mut tx = store.begin_sync().await.unwrap();
        Store::upsert_stage_tx(&mut tx, &idle).await.unwrap();
        Store::upsert_stage_tx(&mut tx, &active).await.unwrap();
        tx.commit().await.unwrap();

        let found = store
            .list_stages_by_status_idle(&repo.id, "PR Created")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, idle.id);
    }
}
