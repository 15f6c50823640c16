use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdentityError;

/// Selects which configured bucket a key lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    /// Mutable, in-progress records.
    Drafts,
    /// Finalized, immutable records.
    Submissions,
    /// SOP definitions.
    Sops,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [Self::Drafts, Self::Submissions, Self::Sops];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drafts => "drafts",
            Self::Submissions => "submissions",
            Self::Sops => "sops",
        }
    }

    /// The status every record of this type must carry, if any.
    pub fn expected_status(&self) -> Option<Status> {
        match self {
            Self::Drafts => Some(Status::Draft),
            Self::Submissions => Some(Status::Final),
            Self::Sops => None,
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drafts" => Ok(Self::Drafts),
            "submissions" => Ok(Self::Submissions),
            "sops" => Ok(Self::Sops),
            other => Err(IdentityError::InvalidDocumentType(other.to_string())),
        }
    }
}

/// Lifecycle status embedded as the first filename component.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Draft,
    Final,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Final => "final",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "final" => Ok(Self::Final),
            other => Err(IdentityError::InvalidStatus(other.to_string())),
        }
    }
}
