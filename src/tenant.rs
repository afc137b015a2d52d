use std::fmt::Display;
use std::ops::Deref;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const MAX_TENANT_ID_LEN: usize = 128;

/// Identifier of one tenant (a store). It doubles as the snapshot file stem,
/// so only ASCII alphanumerics, `-`, `_` and `.` are allowed.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

#[derive(Debug, thiserror::Error, PartialEq)]
#[error("invalid tenant id {0:?}: use 1-128 chars of [A-Za-z0-9._-], not starting with '.'")]
pub struct InvalidTenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Result<Self, InvalidTenantId> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_TENANT_ID_LEN
            && !id.starts_with('.')
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(TenantId(id))
        } else {
            Err(InvalidTenantId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TenantId {
    type Err = InvalidTenantId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TenantId::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        TenantId::new(value)
    }
}

impl From<TenantId> for String {
    fn from(fr: TenantId) -> Self {
        fr.0
    }
}

impl Deref for TenantId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_ids() {
        for id in ["42", "acme-store", "acme.myshopify.com", "shop_7"] {
            assert!(TenantId::new(id).is_ok(), "{id} should be valid");
        }
    }

    #[test]
    fn test_rejects_path_like_ids() {
        for id in ["", "../etc", "a/b", ".hidden", "white space", "ü"] {
            assert!(TenantId::new(id).is_err(), "{id} should be rejected");
        }
        assert!(TenantId::new("x".repeat(129)).is_err());
    }

    #[test]
    fn test_serde_validates() {
        let ok: TenantId = serde_json::from_str("\"acme\"").unwrap();
        assert_eq!(ok.as_str(), "acme");

        let bad: Result<TenantId, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }
}
