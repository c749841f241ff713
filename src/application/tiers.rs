//! Tiered reference graph: Foundation, optional SiteGlobal, then Leaf units.
//!
//! Every leaf is compiled against the foundation artifact and, when the site
//! has a global unit on disk, the global artifact. All three tiers live in the
//! same [`ArtifactCache`], so eviction and single-flight apply uniformly.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backend::{CompileBackend, SourceText};
use crate::cache::{ArtifactCache, BuildResult, CompiledArtifact, EntryStatus, WatchEvent, WatchEventKind};
use crate::domain::{CompileError, KilnError, SourceIdentity, Tier, UnitKind};
use crate::template::{TemplateUnit, transpile};

use super::locator::SourceLocator;

const FOUNDATION_PATH: &str = "<foundation>";
const FOUNDATION_TYPE: &str = "Kiln";

/// Identity of the foundation artifact. Not backed by a site file.
pub fn foundation_identity() -> SourceIdentity {
    SourceIdentity::new(FOUNDATION_PATH, FOUNDATION_TYPE)
}

/// Every artifact of one site, compiled eagerly.
#[derive(Debug)]
pub struct SiteBuild {
    pub foundation: Arc<CompiledArtifact>,
    pub global: Option<Arc<CompiledArtifact>>,
    pub leaves: Vec<Arc<CompiledArtifact>>,
    /// Leaf units that failed, with their identity.
    pub failures: Vec<(SourceIdentity, KilnError)>,
}

#[derive(Clone)]
pub struct TierGraph {
    backend: Arc<dyn CompileBackend>,
    locator: SourceLocator,
    cache: Arc<ArtifactCache>,
    shared_references: Arc<[PathBuf]>,
}

impl TierGraph {
    pub fn new(
        backend: Arc<dyn CompileBackend>,
        locator: SourceLocator,
        cache: Arc<ArtifactCache>,
        shared_references: Vec<PathBuf>,
    ) -> Self {
        Self {
            backend,
            locator,
            cache,
            shared_references: shared_references.into(),
        }
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    pub fn backend(&self) -> &Arc<dyn CompileBackend> {
        &self.backend
    }

    /// Base library plus the configured shared reference sources.
    pub async fn foundation(&self) -> BuildResult {
        let identity = foundation_identity();
        let graph = self.clone();
        self.cache
            .get_or_build(&identity, Tier::Foundation, move || async move {
                graph.build_foundation().await
            })
            .await
    }

    /// The site-global artifact, or `None` when the site has no global unit.
    pub async fn global(&self) -> Result<Option<Arc<CompiledArtifact>>, KilnError> {
        let identity = self.locator.global_identity();
        if self.cache.status(&identity) != Some(EntryStatus::Built)
            && !tokio::fs::try_exists(identity.path()).await.unwrap_or(false)
        {
            return Ok(None);
        }

        let graph = self.clone();
        let build_identity = identity.clone();
        let result = self
            .cache
            .get_or_build(&identity, Tier::SiteGlobal, move || async move {
                let foundation = graph.foundation().await?;
                graph
                    .build_unit(build_identity, Tier::SiteGlobal, vec![foundation])
                    .await
            })
            .await;

        match result {
            Ok(artifact) => Ok(Some(artifact)),
            // Deleted between the existence check and the read.
            Err(KilnError::NotFound { .. }) => Ok(None),
            Err(error) => Err(error),
        }
    }

    /// The leaf artifact for `identity`. The global identity routes to the
    /// SiteGlobal tier.
    pub async fn leaf(&self, identity: &SourceIdentity) -> BuildResult {
        if self.locator.is_global(identity) {
            return self
                .global()
                .await?
                .ok_or_else(|| KilnError::not_found(identity.path()));
        }

        let graph = self.clone();
        let build_identity = identity.clone();
        self.cache
            .get_or_build(identity, Tier::Leaf, move || async move {
                let mut references = vec![graph.foundation().await?];
                references.extend(graph.global().await?);
                graph
                    .build_unit(build_identity, Tier::Leaf, references)
                    .await
            })
            .await
    }

    /// Apply one watcher event to the cache. Returns how many entries changed.
    ///
    /// A global change also invalidates every leaf, even when the global entry
    /// has never been built: a newly created global changes what leaves link
    /// against.
    pub fn apply_event(&self, event: &WatchEvent) -> usize {
        let Some(identity) = self.locator.identity_for_file(event.path()) else {
            return match event.kind {
                WatchEventKind::Renamed => self.cache.remove_under(event.path()),
                WatchEventKind::Modified => 0,
            };
        };

        let mut changed = match event.kind {
            WatchEventKind::Modified => usize::from(self.cache.invalidate(&identity)),
            WatchEventKind::Renamed => usize::from(self.cache.remove(&identity)),
        };
        if self.locator.is_global(&identity) {
            changed += self.cache.invalidate_tier(Tier::Leaf);
        }
        debug!(
            target = "kiln::application::tiers",
            unit = identity.type_name(),
            kind = event.kind.as_str(),
            changed,
            "watch event applied"
        );
        changed
    }

    /// Compile the foundation, the global unit and every leaf found on disk.
    ///
    /// Foundation and global failures abort; leaf failures are collected.
    pub async fn build_all(&self) -> Result<SiteBuild, KilnError> {
        let foundation = self.foundation().await?;
        let global = self.global().await?;

        let identities = discover_units(&self.locator).await.map_err(|error| {
            CompileError::single(
                self.locator.root().display().to_string(),
                format!("failed to scan site root: {error}"),
            )
        })?;

        let mut leaves = Vec::with_capacity(identities.len());
        let mut failures = Vec::new();
        for identity in identities {
            match self.leaf(&identity).await {
                Ok(artifact) => leaves.push(artifact),
                Err(error) => failures.push((identity, error)),
            }
        }

        Ok(SiteBuild {
            foundation,
            global,
            leaves,
            failures,
        })
    }

    async fn build_foundation(&self) -> BuildResult {
        let identity = foundation_identity();
        let mut sources = self.backend.foundation_sources();
        for path in self.shared_references.iter() {
            let text = tokio::fs::read_to_string(path).await.map_err(|error| {
                CompileError::single(
                    identity.type_name(),
                    format!("failed to read shared reference {}: {error}", path.display()),
                )
            })?;
            sources.push(SourceText::new(path.clone(), text));
        }
        self.compile(identity, Tier::Foundation, UnitKind::Script, sources, Vec::new())
            .await
    }

    /// Read the code-behind and markup of one unit, transpiling the markup
    /// when present, and compile them as one artifact.
    async fn build_unit(
        &self,
        identity: SourceIdentity,
        tier: Tier,
        references: Vec<Arc<CompiledArtifact>>,
    ) -> BuildResult {
        let (identity, code_behind, markup) = match self.read_unit(&identity).await? {
            Some(found) => found,
            None => {
                let respelled = self.on_disk_identity(&identity).await;
                match respelled {
                    Some(canonical) => self
                        .read_unit(&canonical)
                        .await?
                        .ok_or_else(|| KilnError::not_found(identity.path()))?,
                    None => return Err(KilnError::not_found(identity.path())),
                }
            }
        };
        let unit = identity.type_name();
        let markup_path = self.locator.markup_path(&identity);

        let mut sources = Vec::with_capacity(2);
        let mut kind = UnitKind::Script;
        let has_code_behind = code_behind.is_some();
        if let Some(text) = code_behind {
            sources.push(SourceText::new(identity.path(), text));
        }
        if let Some(markup) = markup {
            let generated = transpile(&TemplateUnit {
                type_name: unit,
                markup_path: &markup_path,
                markup: &markup,
                has_code_behind,
            })
            .map_err(|diagnostic| CompileError::new(unit, vec![diagnostic]))?;
            sources.push(SourceText::new(generated_path(&markup_path), generated));
            kind = UnitKind::Template;
        }

        self.compile(identity, tier, kind, sources, references).await
    }

    /// Code-behind and markup text of `identity`, or `None` when neither
    /// file exists under that exact spelling.
    async fn read_unit(
        &self,
        identity: &SourceIdentity,
    ) -> Result<Option<(SourceIdentity, Option<String>, Option<String>)>, KilnError> {
        let unit = identity.type_name();
        let code_behind = read_optional(identity.path(), unit).await?;
        let markup = read_optional(&self.locator.markup_path(identity), unit).await?;
        if code_behind.is_none() && markup.is_none() {
            return Ok(None);
        }
        Ok(Some((identity.clone(), code_behind, markup)))
    }

    /// The identity as the files are actually spelled on disk, when the
    /// requested spelling differs only in letter case.
    async fn on_disk_identity(&self, identity: &SourceIdentity) -> Option<SourceIdentity> {
        let root = self.locator.root();
        for candidate in [
            identity.path().to_path_buf(),
            self.locator.markup_path(identity),
        ] {
            let Ok(relative) = candidate.strip_prefix(root) else {
                continue;
            };
            if let Some(found) = find_ignoring_case(root, relative).await {
                let canonical = self.locator.identity_for_file(&found)?;
                debug!(
                    target = "kiln::application::tiers",
                    requested = %identity,
                    resolved = %canonical,
                    "request spelling differs from the file on disk"
                );
                return Some(canonical);
            }
        }
        None
    }

    async fn compile(
        &self,
        identity: SourceIdentity,
        tier: Tier,
        kind: UnitKind,
        sources: Vec<SourceText>,
        references: Vec<Arc<CompiledArtifact>>,
    ) -> BuildResult {
        let backend = Arc::clone(&self.backend);
        let unit = identity.type_name().to_string();
        let (module, sources, references) = tokio::task::spawn_blocking(move || {
            let module = backend.compile(&sources, &references);
            (module, sources, references)
        })
        .await
        .map_err(|join_error| {
            let reason = if join_error.is_panic() {
                "compilation panicked"
            } else {
                "compilation was cancelled"
            };
            warn!(
                target = "kiln::application::tiers",
                unit = %unit,
                reason,
                "backend did not return"
            );
            CompileError::single(unit.clone(), reason)
        })?;

        let module = module.map_err(|diagnostics| CompileError::new(unit, diagnostics))?;
        Ok(Arc::new(CompiledArtifact::new(
            identity, tier, kind, module, references, &sources,
        )))
    }
}

/// Every leaf identity under the site root, sorted by type name. The global
/// unit is excluded; markup and code-behind pairs appear once.
pub async fn discover_units(locator: &SourceLocator) -> std::io::Result<Vec<SourceIdentity>> {
    let mut pending = vec![locator.root().to_path_buf()];
    let mut found: Vec<SourceIdentity> = Vec::new();

    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if let Some(identity) = locator.identity_for_file(&path)
                && !locator.is_global(&identity)
                && !found.iter().any(|known| known.key() == identity.key())
            {
                found.push(identity);
            }
        }
    }

    found.sort_by(|a, b| a.type_name().cmp(b.type_name()));
    Ok(found)
}

/// Walk `relative` below `root`, matching each component without regard to
/// ASCII case.
async fn find_ignoring_case(root: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = root.to_path_buf();
    for component in relative.components() {
        let wanted = component.as_os_str().to_str()?;
        let mut entries = tokio::fs::read_dir(&current).await.ok()?;
        let mut matched = None;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.eq_ignore_ascii_case(wanted))
            {
                matched = Some(entry.path());
                break;
            }
        }
        current = matched?;
    }
    Some(current)
}

fn generated_path(markup_path: &Path) -> PathBuf {
    PathBuf::from(format!("{} (generated)", markup_path.display()))
}

async fn read_optional(path: &Path, unit: &str) -> Result<Option<String>, KilnError> {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(None),
        Err(error) => Err(CompileError::single(
            unit,
            format!("failed to read {}: {error}", path.display()),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::application::locator::NamingConvention;
    use crate::backend::HandlerRequest;
    use crate::backend::script::ScriptBackend;
    use crate::cache::CacheConfig;

    fn graph(root: &Path) -> TierGraph {
        TierGraph::new(
            Arc::new(ScriptBackend::new()),
            SourceLocator::new(root, NamingConvention::default()),
            Arc::new(ArtifactCache::new(CacheConfig::default())),
            Vec::new(),
        )
    }

    fn write(root: &Path, relative: &str, text: &str) {
        let path = root.join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create dirs");
        }
        std::fs::write(path, text).expect("write source");
    }

    fn render(artifact: &CompiledArtifact, type_name: &str) -> String {
        let mut handler = artifact
            .type_factory(type_name)
            .expect("type present")
            .construct(&[])
            .expect("constructs");
        handler
            .process(&HandlerRequest::get("/"))
            .expect("runs")
            .body
    }

    #[tokio::test]
    async fn leaf_references_foundation_and_global() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "global.ks",
            "namespace Site { public class Layout : Kiln.Handler { public void Banner() { Response.Write(\"[site]\"); } } }",
        );
        write(
            dir.path(),
            "index.ks",
            "namespace Site { public class index : Layout { public override void Render() { Banner(); } } }",
        );

        let graph = graph(dir.path());
        let identity = graph.locator().resolve("index").expect("resolves");
        let artifact = graph.leaf(&identity).await.expect("builds");

        let references: Vec<Tier> = artifact.references().iter().map(|r| r.tier()).collect();
        assert_eq!(references, vec![Tier::Foundation, Tier::SiteGlobal]);
        assert_eq!(render(&artifact, "Site.index"), "[site]");
    }

    #[tokio::test]
    async fn missing_unit_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        let graph = graph(dir.path());
        let identity = graph.locator().resolve("nowhere").expect("resolves");
        let error = graph.leaf(&identity).await.expect_err("missing");
        assert!(matches!(error, KilnError::NotFound { .. }));

        let global = graph.locator().global_identity();
        assert!(matches!(
            graph.leaf(&global).await,
            Err(KilnError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn markup_only_unit_derives_from_page() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "hello.ks.html", "<p>Hi <% Response.Write(Request.Path); %></p>");

        let graph = graph(dir.path());
        let identity = graph.locator().resolve("hello").expect("resolves");
        let artifact = graph.leaf(&identity).await.expect("builds");

        assert!(artifact.is_template());
        assert_eq!(render(&artifact, "Site.helloWindow"), "<p>Hi /</p>");
    }

    #[tokio::test]
    async fn malformed_template_is_a_compile_error() {
        let dir = TempDir::new().expect("tempdir");
        write(dir.path(), "broken.ks.html", "<p><% Response.Write(1);");

        let graph = graph(dir.path());
        let identity = graph.locator().resolve("broken").expect("resolves");
        match graph.leaf(&identity).await {
            Err(KilnError::Compile(error)) => {
                assert!(error.to_string().contains("malformed template"))
            }
            other => panic!("expected compile error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creating_a_global_invalidates_leaves() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "index.ks",
            "namespace Site { public class index : Kiln.Handler { } }",
        );
        let graph = graph(dir.path());
        let identity = graph.locator().resolve("index").expect("resolves");
        graph.leaf(&identity).await.expect("builds");

        write(
            dir.path(),
            "global.ks",
            "namespace Site { public class Shared : Kiln.Handler { } }",
        );
        let changed = graph.apply_event(&WatchEvent::modified(dir.path().join("global.ks")));
        assert_eq!(changed, 1);
        assert_eq!(
            graph.cache().status(&identity),
            Some(EntryStatus::Invalidated)
        );

        let rebuilt = graph.leaf(&identity).await.expect("rebuilds");
        assert_eq!(rebuilt.references().len(), 2);
    }

    #[tokio::test]
    async fn build_all_collects_leaf_failures() {
        let dir = TempDir::new().expect("tempdir");
        write(
            dir.path(),
            "good.ks",
            "namespace Site { public class good : Kiln.Handler { } }",
        );
        write(
            dir.path(),
            "nested/bad.ks",
            "namespace Site.nested { public class bad : Missing { } }",
        );
        write(dir.path(), "notes.txt", "ignored");

        let build = graph(dir.path()).build_all().await.expect("foundation builds");
        assert!(build.global.is_none());
        assert_eq!(build.leaves.len(), 1);
        assert_eq!(build.failures.len(), 1);
        assert_eq!(build.failures[0].0.type_name(), "Site.nested.bad");
    }

    #[tokio::test]
    async fn shared_reference_failure_names_the_file() {
        let dir = TempDir::new().expect("tempdir");
        let graph = TierGraph::new(
            Arc::new(ScriptBackend::new()),
            SourceLocator::new(dir.path(), NamingConvention::default()),
            Arc::new(ArtifactCache::new(CacheConfig::default())),
            vec![dir.path().join("lib/missing.ks")],
        );
        let error = graph.foundation().await.expect_err("missing reference");
        assert!(error.to_string().contains("missing.ks"));
    }
}
