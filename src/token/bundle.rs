use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The OAuth2 token bundle persisted by the Token Store.
///
/// `extra` preserves any fields returned by the token endpoint that this
/// crate does not model explicitly, so a round-trip through the store never
/// drops data the upstream might later start relying on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBundle {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub last_refresh: DateTime<Utc>,
    pub scopes: BTreeSet<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TokenBundle {
    pub fn is_valid(&self) -> bool {
        !self.access_token.is_empty() && !self.refresh_token.is_empty()
    }

    pub fn has_required_scopes(&self, required: &[&str]) -> bool {
        required.iter().all(|scope| self.scopes.contains(*scope))
    }
}
