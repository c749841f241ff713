//! Maps request paths to source identities under a site root.

use std::path::{Component, Path, PathBuf};

use crate::domain::{KilnError, SourceIdentity};

/// File name of the optional site-global unit, relative to the site root.
pub const GLOBAL_UNIT_STEM: &str = "global";

const DEFAULT_DOCUMENT: &str = "index";

/// Naming rules shared by the locator, the watcher and the transpiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    /// Namespace prefixed to every derived type name. May be empty.
    pub root_namespace: String,
    /// Extension of leaf scripts, without the dot.
    pub leaf_extension: String,
    /// Extension appended to a code-behind path to form its markup file.
    pub markup_suffix: String,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            root_namespace: "Site".to_string(),
            leaf_extension: "ks".to_string(),
            markup_suffix: "html".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceLocator {
    root: PathBuf,
    convention: NamingConvention,
}

impl SourceLocator {
    pub fn new(root: impl Into<PathBuf>, convention: NamingConvention) -> Self {
        Self {
            root: root.into(),
            convention,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn convention(&self) -> &NamingConvention {
        &self.convention
    }

    /// Resolve a logical request path to its identity.
    ///
    /// Existence is not checked; the build step reports a missing file.
    pub fn resolve(&self, raw_path: &str) -> Result<SourceIdentity, KilnError> {
        let trimmed = raw_path.trim();
        if trimmed.is_empty() {
            return Err(KilnError::invalid_path(raw_path, "path must not be empty"));
        }

        let normalized = trimmed.replace('\\', "/");
        let candidate = Path::new(&normalized);
        let relative = if candidate.is_absolute() {
            self.strip_root(candidate)
                .ok_or_else(|| KilnError::invalid_path(raw_path, "path is outside the site root"))?
        } else {
            PathBuf::from(normalized.trim_start_matches('/'))
        };

        let mut segments = relative_segments(&relative, raw_path)?;
        if normalized.ends_with('/') || segments.is_empty() {
            segments.push(DEFAULT_DOCUMENT.to_string());
        }
        if let Some(last) = segments.last_mut() {
            *last = self.code_behind_file_name(last);
        }

        let mut path = self.root.clone();
        for segment in &segments {
            path.push(segment);
        }
        let type_name = self.type_name_for_segments(&segments);
        Ok(SourceIdentity::new(path, type_name))
    }

    /// Identity for a file seen on disk, if it belongs to this site.
    ///
    /// Markup files map to their code-behind identity.
    pub fn identity_for_file(&self, path: &Path) -> Option<SourceIdentity> {
        let relative = self.strip_root(path)?;
        let relative = relative.as_path();
        let file_name = relative.file_name()?.to_str()?;
        if !self.is_leaf_file_name(file_name) && !self.is_markup_file_name(file_name) {
            return None;
        }
        let mut segments = relative_segments(relative, &path.to_string_lossy()).ok()?;
        let last = segments.last_mut()?;
        *last = self.code_behind_file_name(last);

        let mut resolved = self.root.clone();
        for segment in &segments {
            resolved.push(segment);
        }
        let type_name = self.type_name_for_segments(&segments);
        Some(SourceIdentity::new(resolved, type_name))
    }

    /// Identity of the site-global unit. The file may not exist.
    pub fn global_identity(&self) -> SourceIdentity {
        let file_name = format!("{GLOBAL_UNIT_STEM}.{}", self.convention.leaf_extension);
        let type_name = self.type_name_for_segments(&[file_name.clone()]);
        SourceIdentity::new(self.root.join(file_name), type_name)
    }

    pub fn is_global(&self, identity: &SourceIdentity) -> bool {
        identity.key() == self.global_identity().key()
    }

    /// Markup file paired with a code-behind identity.
    pub fn markup_path(&self, identity: &SourceIdentity) -> PathBuf {
        let mut os = identity.path().as_os_str().to_os_string();
        os.push(".");
        os.push(&self.convention.markup_suffix);
        PathBuf::from(os)
    }

    pub fn is_leaf_file_name(&self, file_name: &str) -> bool {
        has_extension(file_name, &self.convention.leaf_extension)
    }

    pub fn is_markup_file_name(&self, file_name: &str) -> bool {
        let suffix = format!(
            "{}.{}",
            self.convention.leaf_extension, self.convention.markup_suffix
        );
        has_extension(file_name, &suffix)
    }

    /// `path` relative to the root. Identities are keyed without regard to
    /// case, so a root spelled differently still matches.
    fn strip_root(&self, path: &Path) -> Option<PathBuf> {
        if let Ok(relative) = path.strip_prefix(&self.root) {
            return Some(relative.to_path_buf());
        }
        let mut components = path.components();
        for expected in self.root.components() {
            let actual = components.next()?;
            if !actual
                .as_os_str()
                .to_string_lossy()
                .eq_ignore_ascii_case(&expected.as_os_str().to_string_lossy())
            {
                return None;
            }
        }
        Some(components.as_path().to_path_buf())
    }

    fn code_behind_file_name(&self, file_name: &str) -> String {
        if self.is_markup_file_name(file_name) {
            let cut = file_name.len() - self.convention.markup_suffix.len() - 1;
            return file_name[..cut].to_string();
        }
        if self.is_leaf_file_name(file_name) {
            return file_name.to_string();
        }
        format!("{file_name}.{}", self.convention.leaf_extension)
    }

    fn type_name_for_segments(&self, segments: &[String]) -> String {
        let extension_len = self.convention.leaf_extension.len() + 1;
        let mut parts: Vec<String> = Vec::with_capacity(segments.len() + 1);
        if !self.convention.root_namespace.is_empty() {
            parts.push(self.convention.root_namespace.clone());
        }
        for (index, segment) in segments.iter().enumerate() {
            let stem = if index + 1 == segments.len() && segment.len() > extension_len {
                &segment[..segment.len() - extension_len]
            } else {
                segment.as_str()
            };
            parts.push(stem.replace('-', "_"));
        }
        parts.join(".")
    }
}

fn relative_segments(relative: &Path, raw_path: &str) -> Result<Vec<String>, KilnError> {
    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| KilnError::invalid_path(raw_path, "path is not valid UTF-8"))?;
                segments.push(part.to_string());
            }
            Component::CurDir => {}
            Component::ParentDir => {
                return Err(KilnError::invalid_path(
                    raw_path,
                    "parent directory segments are not allowed",
                ));
            }
            Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(segments)
}

fn has_extension(file_name: &str, extension: &str) -> bool {
    let suffix_len = extension.len() + 1;
    file_name.len() > suffix_len
        && file_name.is_char_boundary(file_name.len() - suffix_len)
        && file_name[file_name.len() - suffix_len..]
            .strip_prefix('.')
            .is_some_and(|tail| tail.eq_ignore_ascii_case(extension))
}
