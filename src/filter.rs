//! Namespace filtering and rename mapping
//!
//! Filtering policy is an external collaborator: the engine queries these
//! traits per record and never hard-codes which namespaces replicate. The
//! list-configured implementations here cover the common cases; embedders
//! with richer policies implement the traits directly.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::HashSet;

/// Inclusion policy queried per record before an edit is constructed.
pub trait NamespaceFilter: Send + Sync {
    /// Should writes to `db.coll` be replicated?
    fn includes(&self, db: &str, coll: &str) -> bool;

    /// Should this field of `db.coll` be carried? Defaults to yes.
    fn includes_field(&self, _db: &str, _coll: &str, _field: &str) -> bool {
        true
    }

    /// Should command records against `db` be forwarded to the destination?
    ///
    /// Commands may legitimately not apply to a narrower replicated scope;
    /// this hook lets the embedder decide instead of the engine guessing.
    /// Defaults to forwarding.
    fn forward_commands(&self, _db: &str) -> bool {
        true
    }
}

/// Rename mapping queried per record: `(db, coll)` on the source becomes
/// `map(db, coll)` on the destination.
pub trait NamespaceMapping: Send + Sync {
    fn map(&self, db: &str, coll: &str) -> (String, String);
}

/// Filter that replicates everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeAll;

impl NamespaceFilter for IncludeAll {
    fn includes(&self, _db: &str, _coll: &str) -> bool {
        true
    }
}

/// Mapping that keeps every namespace unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityMapping;

impl NamespaceMapping for IdentityMapping {
    fn map(&self, db: &str, coll: &str) -> (String, String) {
        (db.to_string(), coll.to_string())
    }
}

/// Static filter configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Namespaces to include as `db.coll`; empty means include all
    #[serde(default)]
    pub include: Vec<String>,
    /// Namespaces to exclude, evaluated after includes
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Databases whose command records are not forwarded
    #[serde(default)]
    pub skip_commands_for: Vec<String>,
}

/// List-configured filter compiled from [`FilterConfig`].
#[derive(Debug, Clone)]
pub struct StaticFilter {
    include: HashSet<String>,
    exclude: HashSet<String>,
    skip_commands_for: HashSet<String>,
}

impl StaticFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self {
            include: config.include.into_iter().collect(),
            exclude: config.exclude.into_iter().collect(),
            skip_commands_for: config.skip_commands_for.into_iter().collect(),
        }
    }
}

impl NamespaceFilter for StaticFilter {
    fn includes(&self, db: &str, coll: &str) -> bool {
        let ns = format!("{}.{}", db, coll);
        if self.exclude.contains(&ns) {
            return false;
        }
        self.include.is_empty() || self.include.contains(&ns)
    }

    fn forward_commands(&self, db: &str) -> bool {
        !self.skip_commands_for.contains(db)
    }
}

/// Rename mapping over an explicit table, identity for unlisted namespaces.
#[derive(Debug, Clone, Default)]
pub struct RenameMapping {
    renames: HashMap<(String, String), (String, String)>,
}

impl RenameMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rename rule.
    pub fn rename(
        mut self,
        from_db: impl Into<String>,
        from_coll: impl Into<String>,
        to_db: impl Into<String>,
        to_coll: impl Into<String>,
    ) -> Self {
        self.renames.insert(
            (from_db.into(), from_coll.into()),
            (to_db.into(), to_coll.into()),
        );
        self
    }
}

impl NamespaceMapping for RenameMapping {
    fn map(&self, db: &str, coll: &str) -> (String, String) {
        match self.renames.get(&(db.to_string(), coll.to_string())) {
            Some((d, c)) => (d.clone(), c.clone()),
            None => (db.to_string(), coll.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_include_all() {
        let f = IncludeAll;
        assert!(f.includes("any", "thing"));
        assert!(f.includes_field("any", "thing", "field"));
        assert!(f.forward_commands("any"));
    }

    #[test]
    fn test_static_filter_include_list() {
        let f = StaticFilter::new(FilterConfig {
            include: vec!["app.users".into(), "app.orders".into()],
            ..Default::default()
        });
        assert!(f.includes("app", "users"));
        assert!(f.includes("app", "orders"));
        assert!(!f.includes("app", "sessions"));
        assert!(!f.includes("other", "users"));
    }

    #[test]
    fn test_static_filter_exclude_wins() {
        let f = StaticFilter::new(FilterConfig {
            exclude: vec!["app.audit".into()],
            ..Default::default()
        });
        assert!(f.includes("app", "users"));
        assert!(!f.includes("app", "audit"));
    }

    #[test]
    fn test_static_filter_command_policy() {
        let f = StaticFilter::new(FilterConfig {
            skip_commands_for: vec!["app".into()],
            ..Default::default()
        });
        assert!(!f.forward_commands("app"));
        assert!(f.forward_commands("other"));
    }

    #[test]
    fn test_identity_mapping() {
        let m = IdentityMapping;
        assert_eq!(m.map("db", "coll"), ("db".to_string(), "coll".to_string()));
    }

    #[test]
    fn test_rename_mapping() {
        let m = RenameMapping::new().rename("src", "users", "dst", "people");
        assert_eq!(
            m.map("src", "users"),
            ("dst".to_string(), "people".to_string())
        );
        assert_eq!(
            m.map("src", "orders"),
            ("src".to_string(), "orders".to_string())
        );
    }
}
