//! Resolvers (spec Section 4.F.2): named, pluggable observers bound to a
//! pipeline's resolver phases. Each tick the orchestrator runs every
//! registered resolver over every stage whose current status maps to a
//! resolver phase; a non-null return writes the frontmatter and runs the
//! exit gate without spawning a session.

use async_trait::async_trait;
use thiserror::Error;

use workflow_core::types::{Stage, StageStatus};

use crate::codehost::CodeHost;

#[derive(Debug, Error)]
pub enum ResolverError {
    #[error("code host error: {0}")]
    CodeHost(#[from] crate::codehost::CodeHostError),
}

pub type Result<T> = std::result::Result<T, ResolverError>;

#[async_trait]
pub trait Resolver: Send + Sync {
    /// The resolver's name, matched against a pipeline phase's `resolver` key.
    fn name(&self) -> &str;

    /// Returns the new status, or `None` for no transition. Must never panic
    /// on a missing code-host adapter — that is a graceful no-op per spec
    /// Section 4.F.2.
    async fn resolve(&self, stage: &Stage, code_host: &dyn CodeHost) -> Result<Option<StageStatus>>;
}

/// The `pr-status` resolver the core ships (spec Section 4.F.2): merged PR =>
/// `Done`; unresolved comments => `Addressing Comments`; otherwise no-op.
#[derive(Debug, Default)]
pub struct PrStatusResolver;

#[async_trait]
impl Resolver for PrStatusResolver {
    fn name(&self) -> &str {
        "pr-status"
    }

    async fn resolve(&self, stage: &Stage, code_host: &dyn CodeHost) -> Result<Option<StageStatus>> {
        let Some(pr_url) = &stage.pr_url else {
            return Ok(None);
        };
        let Some(status) = code_host.get_pr_status(pr_url).await? else {
            return Ok(None);
        };
        if status.merged {
            return Ok(Some(StageStatus::new("Done")));
        }
        if status.has_unresolved_comments {
            return Ok(Some(StageStatus::new("Addressing Comments")));
        }
        Ok(None)
    }
}

/// A registry of resolvers keyed by name, matching pipeline phase `resolver`
/// fields. Registration order is the order resolvers run within a tick (spec
/// Section 9 open question: order left unspecified; here it is registration
/// order, documented in `DESIGN.md`).
#[derive(Default)]
pub struct ResolverRegistry {
    resolvers: Vec<Box<dyn Resolver>>,
}

impl std::fmt::Debug for ResolverRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverRegistry")
            .field("names", &self.resolvers.iter().map(Resolver::name).collect::<Vec<_>>())
            .finish()
    }
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self { resolvers: Vec::new() }
    }

    /// The default registry: `pr-status` only, matching the one resolver the
    /// core ships.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(PrStatusResolver));
        registry
    }

    pub fn register(&mut self, resolver: Box<dyn Resolver>) {
        self.resolvers.push(resolver);
    }

    pub fn find(&self, name: &str) -> Option<&dyn Resolver> {
        self.resolvers.iter().find(|r| r.name() == name).map(std::convert::AsRef::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codehost::{NullCodeHost, PrStatus};
    use workflow_core::types::{KanbanColumn, PendingMergeParent};
    use workflow_core::Id;

    fn stage_with_pr(pr_url: Option<&str>) -> Stage {
        Stage {
            id: Id::from_raw("STAGE-A"),
            ticket_id: Id::from_raw("TICKET-1"),
            epic_id: Id::from_raw("EPIC-1"),
            repo_id: Id::from_raw("REPO-1"),
            title: "A".to_string(),
            status: StageStatus::new("PR Created"),
            refinement_type: vec![],
            worktree_branch: "feat/a".to_string(),
            pr_url: pr_url.map(str::to_string),
            pr_number: Some(1),
            priority: 0,
            due_date: None,
            session_active: false,
            is_draft: false,
            pending_merge_parents: Vec::<PendingMergeParent>::new(),
            mr_target_branch: None,
            rebase_conflict: false,
            file_path: String::new(),
            depends_on: vec![],
            kanban_column: KanbanColumn::phase("PR Created"),
        }
    }

    struct FakeCodeHost(PrStatus);

    #[async_trait]
    impl CodeHost for FakeCodeHost {
        async fn get_pr_status(
            &self,
            _url: &str,
        ) -> crate::codehost::Result<Option<PrStatus>> {
            Ok(Some(self.0.clone()))
        }
        async fn get_branch_head(&self, _branch: &str) -> crate::codehost::Result<Option<String>> {
            Ok(None)
        }
        async fn edit_pr_base(&self, _pr_number: i64, _target_branch: &str) -> crate::codehost::Result<()> {
            Ok(())
        }
        async fn mark_pr_ready(&self, _pr_number: i64) -> crate::codehost::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn missing_pr_url_is_a_no_op() {
        let resolver = PrStatusResolver;
        let stage = stage_with_pr(None);
        let result = resolver.resolve(&stage, &NullCodeHost).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_code_host_adapter_is_a_graceful_no_op() {
        let resolver = PrStatusResolver;
        let stage = stage_with_pr(Some("https://example/1"));
        let result = resolver.resolve(&stage, &NullCodeHost).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn merged_pr_transitions_to_done() {
        let resolver = PrStatusResolver;
        let stage = stage_with_pr(Some("https://example/1"));
        let host = FakeCodeHost(PrStatus {
            merged: true,
            has_unresolved_comments: false,
            unresolved_thread_count: 0,
            state: "closed".to_string(),
        });
        let result = resolver.resolve(&stage, &host).await.unwrap();
        assert_eq!(result.unwrap().as_str(), "Done");
    }

    #[tokio::test]
    async fn unresolved_comments_transition_to_addressing_comments() {
        let resolver = PrStatusResolver;
        let stage = stage_with_pr(Some("https://example/1"));
        let host = FakeCodeHost(PrStatus {
            merged: false,
            has_unresolved_comments: true,
            unresolved_thread_count: 2,
            state: "open".to_string(),
        });
        let result = resolver.resolve(&stage, &host).await.unwrap();
        assert_eq!(result.unwrap().as_str(), "Addressing Comments");
    }

    #[test]
    fn registry_looks_up_by_name() {
        let registry = ResolverRegistry::with_defaults();
        assert!(registry.find("pr-status").is_some());
        assert!(registry.find("unknown").is_none());
    }
}
