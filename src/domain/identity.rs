//! Source identities and compilation tiers.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Canonical identity of one compilable unit.
///
/// The path is compared case-insensitively through [`SourceKey`]; the type
/// name is the logical `namespace.type` derived from the path's position under
/// the site root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceIdentity {
    path: PathBuf,
    type_name: String,
    key: SourceKey,
}

impl SourceIdentity {
    pub fn new(path: impl Into<PathBuf>, type_name: impl Into<String>) -> Self {
        let path = path.into();
        let key = SourceKey::from_path(&path);
        Self {
            path,
            type_name: type_name.into(),
            key,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn key(&self) -> &SourceKey {
        &self.key
    }
}

impl fmt::Display for SourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.type_name, self.path.display())
    }
}

/// Case-insensitive cache key derived from a source path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceKey(String);

impl SourceKey {
    pub fn from_path(path: &Path) -> Self {
        Self(path.to_string_lossy().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compilation layer defining reference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Framework base types shared by every site.
    Foundation,
    /// The optional single global unit of a site.
    SiteGlobal,
    /// One handler script or template.
    Leaf,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Foundation => "foundation",
            Tier::SiteGlobal => "site_global",
            Tier::Leaf => "leaf",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a leaf unit was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// Plain script source.
    Script,
    /// Markup template transpiled into a `<Type>Window` subclass.
    Template,
}
