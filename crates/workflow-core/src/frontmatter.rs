//! Frontmatter splitting, shape-checking, and write-back for work-item files.
//!
//! The tokenizer itself (finding the `---` delimited block) is the one piece of
//! this module that crosses into otherwise-out-of-scope territory: there is no
//! external tokenizer to depend on in a standalone Rust crate, so a minimal
//! delimiter scan lives here. Everything past that — shape-checking the parsed
//! YAML into entities, and writing computed fields back — is squarely in scope.

use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("file has no frontmatter block (expected `---` delimited header)")]
    MissingBlock,
    #[error("frontmatter YAML is malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Split `---\n<yaml>\n---\n<body>` into its two halves. Tolerant of `\r\n`.
pub fn split(input: &str) -> Result<(&str, &str), FrontmatterError> {
    let input = input.strip_prefix('\u{feff}').unwrap_or(input);
    let rest = input
        .strip_prefix("---\n")
        .or_else(|| input.strip_prefix("---\r\n"))
        .ok_or(FrontmatterError::MissingBlock)?;

    let end = rest
        .find("\n---\n")
        .map(|i| (i + 1, i + 5))
        .or_else(|| rest.find("\r\n---\r\n").map(|i| (i + 2, i + 8)))
        .or_else(|| rest.find("\n---\r\n").map(|i| (i + 1, i + 6)))
        .ok_or(FrontmatterError::MissingBlock)?;

    let (yaml_end, body_start) = end;
    Ok((&rest[..yaml_end], &rest[body_start..]))
}

/// Render a frontmatter mapping and body back into a full file, preserving the
/// `---` delimiters. Keys are emitted in serde_yaml's natural map order.
pub fn render(frontmatter: &Mapping, body: &str) -> Result<String, FrontmatterError> {
    let yaml = serde_yaml::to_string(frontmatter)?;
    Ok(format!("---\n{yaml}---\n{body}"))
}

/// Parse a frontmatter block into a typed struct while preserving unknown keys
/// via `extra`, so write-back round-trips anything we don't model explicitly.
pub fn parse_typed<T: for<'de> Deserialize<'de>>(yaml: &str) -> Result<T, FrontmatterError> {
    Ok(serde_yaml::from_str(yaml)?)
}

/// Merge a typed struct's known fields with its preserved `extra` mapping, then
/// serialize to a `Mapping` ready for [`render`].
pub fn to_mapping<T: Serialize>(value: &T) -> Result<Mapping, FrontmatterError> {
    let yaml_value = serde_yaml::to_value(value)?;
    match yaml_value {
        serde_yaml::Value::Mapping(m) => Ok(m),
        _ => Ok(Mapping::new()),
    }
}

/// Shape of a stage file's frontmatter, as read off disk. `extra` captures any
/// key this crate doesn't model so it survives write-back untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageFrontmatter {
    pub id: String,
    pub ticket: String,
    pub epic: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub refinement_type: Vec<String>,
    pub worktree_branch: String,
    #[serde(default)]
    pub pr_url: Option<String>,
    #[serde(default)]
    pub pr_number: Option<i64>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub session_active: bool,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub pending_merge_parents: Vec<crate::types::PendingMergeParent>,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub mr_target_branch: Option<String>,
    #[serde(default)]
    pub rebase_conflict: bool,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TicketFrontmatter {
    pub id: String,
    pub epic: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub jira_key: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub jira_links: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicFrontmatter {
    pub id: String,
    pub title: String,
    pub status: String,
    #[serde(default)]
    pub jira_key: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(flatten)]
    pub extra: Mapping,
}
