use serde::{Deserialize, Serialize};

/// An already-authenticated caller, as handed over by the auth layer.
///
/// The store reads only `username` (the record owner) and `id`; permission
/// decisions stay with the caller of this crate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub is_admin: bool,
}

impl CallerIdentity {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            username: username.into(),
            ..Self::default()
        }
    }

    /// The owner recorded on documents this caller writes.
    pub fn user_id(&self) -> &str {
        &self.username
    }
}
