//! Typed, prefix-encoded identifiers for the work-item hierarchy.
//!
//! An [`Id`] carries its entity kind in its textual prefix (`EPIC-`, `TICKET-`,
//! `STAGE-`); this is a hard invariant relied on throughout dependency validation.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The three entity kinds addressable by an [`Id`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdKind {
    Epic,
    Ticket,
    Stage,
}

impl IdKind {
    pub fn prefix(self) -> &'static str {
        match self {
            IdKind::Epic => "EPIC-",
            IdKind::Ticket => "TICKET-",
            IdKind::Stage => "STAGE-",
        }
    }
}

#[derive(Debug, Error)]
pub enum IdError {
    #[error("id {0:?} does not start with a recognized prefix (EPIC-, TICKET-, STAGE-)")]
    UnrecognizedPrefix(String),
}

/// A prefix-typed identifier, e.g. `STAGE-001-002-003`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(pub String);

impl Id {
    pub fn new(raw: impl Into<String>) -> Result<Self, IdError> {
        let raw = raw.into();
        if IdKind::Epic
            .prefix()
            .len()
            .min(raw.len())
            .eq(&0)
        {
            return Err(IdError::UnrecognizedPrefix(raw));
        }
        let id = Self(raw);
        id.kind()?;
        Ok(id)
    }

    /// Construct without validating the prefix. Used for IDs already known to be
    /// well-formed (e.g. round-tripped from the store).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> Result<IdKind, IdError> {
        if self.0.starts_with(IdKind::Stage.prefix()) {
            Ok(IdKind::Stage)
        } else if self.0.starts_with(IdKind::Ticket.prefix()) {
            Ok(IdKind::Ticket)
        } else if self.0.starts_with(IdKind::Epic.prefix()) {
            Ok(IdKind::Epic)
        } else {
            Err(IdError::UnrecognizedPrefix(self.0.clone()))
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A dependency reference as written in `depends_on`: either a local [`Id`] or a
/// `repo:ID` cross-repo reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    Local(Id),
    CrossRepo { repo: String, id: Id },
}

impl DepRef {
    pub fn parse(raw: &str) -> Result<Self, IdError> {
        match raw.split_once(':') {
            Some((repo, id)) if !repo.is_empty() => Ok(DepRef::CrossRepo {
                repo: repo.to_string(),
                id: Id::new(id)?,
            }),
            _ => Ok(DepRef::Local(Id::new(raw)?)),
        }
    }

    pub fn id(&self) -> &Id {
        match self {
            DepRef::Local(id) | DepRef::CrossRepo { id, .. } => id,
        }
    }

    pub fn repo(&self) -> Option<&str> {
        match self {
            DepRef::Local(_) => None,
            DepRef::CrossRepo { repo, .. } => Some(repo),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_derives_from_prefix() {
        assert_eq!(Id::new("EPIC-001").unwrap().kind().unwrap(), IdKind::Epic);
        assert_eq!(
            Id::new("TICKET-001-002").unwrap().kind().unwrap(),
            IdKind::Ticket
        );
        assert_eq!(
            Id::new("STAGE-001-002-003").unwrap().kind().unwrap(),
            IdKind::Stage
        );
    }

    #[test]
    fn unrecognized_prefix_is_an_error() {
        assert!(Id::new("BUG-001").is_err());
        assert!(Id::new("").is_err());
    }

    #[test]
    fn dep_ref_parses_local_and_cross_repo() {
        let local = DepRef::parse("STAGE-001-002-003").unwrap();
        assert!(matches!(local, DepRef::Local(_)));
        assert_eq!(local.repo(), None);

        let cross = DepRef::parse("billing-service:STAGE-001-002-003").unwrap();
        match &cross {
            DepRef::CrossRepo { repo, id } => {
                assert_eq!(repo, "billing-service");
                assert_eq!(id.as_str(), "STAGE-001-002-003");
            }
            DepRef::Local(_) => panic!("expected cross-repo ref"),
        }
        assert_eq!(cross.repo(), Some("billing-service"));
    }

    #[test]
    fn dep_ref_rejects_malformed_id_after_colon() {
        assert!(DepRef::parse("billing-service:not-an-id").is_err());
    }
}
