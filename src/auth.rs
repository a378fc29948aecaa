//! Principals for realtime clients.
//!
//! Token issuance lives elsewhere; this process only maps an opaque bearer token to the claims
//! it was issued with. The directory is a JSON file:
//!
//! ```text
//! { "tokens": { "<token>": { "userId": "u-1", "organizationId": 3, "departmentIds": [7], "isAdmin": false } } }
//! ```

use crate::models::telemetry::{DepartmentId, OrganizationId};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<OrganizationId>,
    #[serde(default)]
    pub department_ids: Vec<DepartmentId>,
    #[serde(default)]
    pub is_admin: bool,
    /// Set when the token matched a directory entry, whatever claims it carries.
    #[serde(skip)]
    pub authenticated: bool,
}

impl Principal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        !self.authenticated
    }
}

pub trait Authenticator: Send + Sync {
    /// Unknown or missing tokens resolve to an anonymous principal.
    fn authenticate(&self, token: Option<&str>) -> Principal;
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenDirectory {
    #[serde(default)]
    tokens: HashMap<String, Principal>,
}

impl TokenDirectory {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(json: &str) -> Result<Self, String> {
        let de = &mut serde_json::Deserializer::from_str(json);
        serde_path_to_error::deserialize(de).map_err(|e| format!("invalid token directory at {}: {}", e.path(), e.inner()))
    }

    pub fn load(path: &Path) -> Result<Self, String> {
        let json = std::fs::read_to_string(path).map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
        Self::from_json(&json).map_err(|e| format!("{}: {}", path.display(), e))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }
}

impl Authenticator for TokenDirectory {
    fn authenticate(&self, token: Option<&str>) -> Principal {
        token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .and_then(|t| self.tokens.get(t))
            .map(|claims| Principal {
                authenticated: true,
                ..claims.clone()
            })
            .unwrap_or_else(Principal::anonymous)
    }
}
