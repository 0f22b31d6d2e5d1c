//! Code-host capability seam (spec Section 6, 9): `getPRStatus`,
//! `getBranchHead`, `editPRBase`, `markPRReady`. The actual GitHub/GitLab CLI
//! wrappers are an explicit external collaborator (spec Section 1) — out of
//! scope here. What lives in this crate is the trait that resolvers and cron
//! jobs code against, plus the null-object implementation a factory falls
//! back to when no adapter fits a platform (spec Section 9: "unknown platform
//! => null-object that returns null from every method").

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodeHostError {
    #[error("code host request failed: {0}")]
    Request(String),
}

pub type Result<T> = std::result::Result<T, CodeHostError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrStatus {
    pub merged: bool,
    pub has_unresolved_comments: bool,
    pub unresolved_thread_count: u32,
    pub state: String,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn get_pr_status(&self, url: &str) -> Result<Option<PrStatus>>;
    async fn get_branch_head(&self, branch: &str) -> Result<Option<String>>;
    async fn edit_pr_base(&self, pr_number: i64, target_branch: &str) -> Result<()>;
    async fn mark_pr_ready(&self, pr_number: i64) -> Result<()>;
}

/// Returned by the factory when no adapter matches the platform tag. Every
/// method is a graceful no-op, matching the design note that an unknown
/// platform must never hard-fail the orchestrator.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCodeHost;

#[async_trait]
impl CodeHost for NullCodeHost {
    async fn get_pr_status(&self, _url: &str) -> Result<Option<PrStatus>> {
        Ok(None)
    }

    async fn get_branch_head(&self, _branch: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn edit_pr_base(&self, _pr_number: i64, _target_branch: &str) -> Result<()> {
        Ok(())
    }

    async fn mark_pr_ready(&self, _pr_number: i64) -> Result<()> {
        Ok(())
    }
}

/// Resolve a platform tag to an adapter. No real adapter ships in this core
/// (GitHub/GitLab clients are external collaborators) so every tag currently
/// falls back to the null object; this is the seam an integration would plug
/// a real client into.
pub fn for_platform(_platform: &str) -> Box<dyn CodeHost> {
    Box::new(NullCodeHost)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_code_host_is_a_graceful_no_op() {
        let host = NullCodeHost;
        assert_eq!(host.get_pr_status("https://example/1").await.unwrap(), None);
        assert_eq!(host.get_branch_head("main").await.unwrap(), None);
        host.edit_pr_base(1, "main").await.unwrap();
        host.mark_pr_ready(1).await.unwrap();
    }

    #[tokio::test]
    async fn for_platform_falls_back_to_null_object() {
        let host = for_platform("unknown-platform");
        assert_eq!(host.get_pr_status("url").await.unwrap(), None);
    }
}
