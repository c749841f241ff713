//! One hosted site: its locator, its cache and its watcher.
//!
//! Sites share nothing. Reloading a site drops its runtime, which stops the
//! watcher and releases every cached artifact, and starts a fresh one.

use std::collections::BTreeSet;
use std::sync::Arc;

use tracing::info;

use crate::backend::{CompileBackend, Handler, Value};
use crate::cache::{ArtifactCache, CacheConfig, CompiledArtifact, WatchEvent};
use crate::config::{CompilerSettings, SiteSettings};
use crate::domain::KilnError;
use crate::infra::error::InfraError;
use crate::infra::watcher::SiteWatcher;
use crate::template::window_type_name;

use super::error::AppError;
use super::factory;
use super::locator::SourceLocator;
use super::prebuilt::PrebuiltBundle;
use super::tiers::TierGraph;

enum SiteMode {
    Live(TierGraph),
    Prebuilt {
        artifact: Arc<CompiledArtifact>,
        template_types: BTreeSet<String>,
    },
}

pub struct SiteRuntime {
    name: String,
    hosts: Vec<String>,
    locator: SourceLocator,
    mode: SiteMode,
    watcher: Option<SiteWatcher>,
}

impl SiteRuntime {
    /// Start a site from its settings. A configured prebuilt bundle takes
    /// precedence: the site then never compiles and never watches.
    pub async fn start(
        site: &SiteSettings,
        compiler: &CompilerSettings,
        backend: Arc<dyn CompileBackend>,
    ) -> Result<Self, AppError> {
        let root = tokio::fs::canonicalize(&site.root).await.map_err(|err| {
            InfraError::configuration(format!(
                "site `{}` root {} is not accessible: {err}",
                site.name,
                site.root.display()
            ))
        })?;
        let locator = SourceLocator::new(root, site.naming(compiler));

        if let Some(path) = &site.prebuilt {
            let bundle = PrebuiltBundle::read(path).await?;
            let artifact = bundle.load(backend.as_ref(), path)?;
            info!(
                target = "kiln::application::site",
                site = %site.name,
                bundle = %path.display(),
                types = artifact.module().type_names().count(),
                "site serving prebuilt bundle"
            );
            return Ok(Self {
                name: site.name.clone(),
                hosts: site.hosts.clone(),
                locator,
                mode: SiteMode::Prebuilt {
                    artifact,
                    template_types: bundle.template_types,
                },
                watcher: None,
            });
        }

        let cache = Arc::new(ArtifactCache::new(CacheConfig::from(compiler)));
        let graph = TierGraph::new(
            backend,
            locator.clone(),
            cache,
            compiler.shared_references.clone(),
        );

        let watcher = if site.watch {
            let filter = locator.clone();
            let sink = graph.clone();
            Some(SiteWatcher::start(
                locator.root(),
                move |path| {
                    path.file_name()
                        .and_then(|name| name.to_str())
                        .is_some_and(|name| {
                            filter.is_leaf_file_name(name) || filter.is_markup_file_name(name)
                        })
                },
                move |event| {
                    sink.apply_event(&event);
                },
            )?)
        } else {
            None
        };

        info!(
            target = "kiln::application::site",
            site = %site.name,
            root = %locator.root().display(),
            watch = watcher.is_some(),
            "site started"
        );

        Ok(Self {
            name: site.name.clone(),
            hosts: site.hosts.clone(),
            locator,
            mode: SiteMode::Live(graph),
            watcher,
        })
    }

    /// Tear this runtime down and start a fresh one from `site`.
    pub async fn reload(
        self,
        site: &SiteSettings,
        compiler: &CompilerSettings,
        backend: Arc<dyn CompileBackend>,
    ) -> Result<Self, AppError> {
        info!(
            target = "kiln::application::site",
            site = %self.name,
            "site reloading"
        );
        drop(self);
        Self::start(site, compiler, backend).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    pub fn locator(&self) -> &SourceLocator {
        &self.locator
    }

    pub fn is_prebuilt(&self) -> bool {
        matches!(self.mode, SiteMode::Prebuilt { .. })
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// The cache of a live site.
    pub fn cache(&self) -> Option<&Arc<ArtifactCache>> {
        match &self.mode {
            SiteMode::Live(graph) => Some(graph.cache()),
            SiteMode::Prebuilt { .. } => None,
        }
    }

    /// Resolve `path`, build or reuse its artifact and construct an instance.
    ///
    /// `type_name` defaults to the type derived from the path.
    pub async fn create_instance(
        &self,
        path: &str,
        type_name: Option<&str>,
        args: &[Value],
    ) -> Result<Box<dyn Handler>, KilnError> {
        let identity = self.locator.resolve(path)?;

        match &self.mode {
            SiteMode::Live(graph) => {
                let artifact = graph.leaf(&identity).await?;
                // The artifact's identity carries the on-disk spelling, which
                // may differ in case from this request.
                let requested = type_name.unwrap_or(artifact.identity().type_name());
                let instance_type = factory::instance_type_name(&artifact, requested);
                factory::create_instance(&artifact, &instance_type, args)
            }
            SiteMode::Prebuilt {
                artifact,
                template_types,
            } => {
                let instance_type = match type_name {
                    Some(explicit) if template_types.contains(explicit) => {
                        window_type_name(explicit)
                    }
                    Some(explicit) => explicit.to_string(),
                    None => {
                        let derived = identity.type_name();
                        if let Some(template) = template_types
                            .iter()
                            .find(|name| name.eq_ignore_ascii_case(derived))
                        {
                            window_type_name(template)
                        } else {
                            artifact
                                .module()
                                .type_names()
                                .find(|name| name.eq_ignore_ascii_case(derived))
                                .map(str::to_owned)
                                .ok_or_else(|| KilnError::not_found(identity.path()))?
                        }
                    }
                };
                factory::create_instance(artifact, &instance_type, args)
            }
        }
    }

    /// Apply a watcher event directly. Returns how many entries changed.
    pub fn apply_event(&self, event: &WatchEvent) -> usize {
        match &self.mode {
            SiteMode::Live(graph) => graph.apply_event(event),
            SiteMode::Prebuilt { .. } => 0,
        }
    }

    /// Drop every cached artifact of a live site.
    pub fn reset(&self) {
        if let SiteMode::Live(graph) = &self.mode {
            graph.cache().reset();
        }
    }

    /// The tier graph of a live site.
    pub fn graph(&self) -> Option<&TierGraph> {
        match &self.mode {
            SiteMode::Live(graph) => Some(graph),
            SiteMode::Prebuilt { .. } => None,
        }
    }
}

impl std::fmt::Debug for SiteRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SiteRuntime")
            .field("name", &self.name)
            .field("root", &self.locator.root())
            .field("prebuilt", &self.is_prebuilt())
            .field("watcher", &self.watcher)
            .finish()
    }
}
