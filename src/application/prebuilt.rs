//! Prebuilt bundles: a whole site exported as one file and loaded without
//! compiling.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::backend::CompileBackend;
use crate::cache::CompiledArtifact;
use crate::domain::{CompileError, KilnError, SourceIdentity, Tier, UnitKind};
use crate::infra::error::InfraError;

use super::error::AppError;
use super::tiers::SiteBuild;

pub const BUNDLE_FORMAT: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrebuiltBundle {
    pub format: u32,
    pub backend: String,
    pub site: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    /// Unit type names that were produced from markup templates.
    pub template_types: BTreeSet<String>,
    /// Exported modules: foundation, then global when present, then leaves.
    pub parts: Vec<serde_json::Value>,
}

impl PrebuiltBundle {
    /// Export every artifact of a fully successful site build.
    pub fn from_build(
        site: &str,
        backend: &dyn CompileBackend,
        build: &SiteBuild,
    ) -> Result<Self, AppError> {
        if !build.failures.is_empty() {
            return Err(AppError::validation(format!(
                "{} unit(s) of site `{site}` failed to compile",
                build.failures.len()
            )));
        }

        let artifacts = std::iter::once(&build.foundation)
            .chain(build.global.iter())
            .chain(build.leaves.iter());
        let mut parts = Vec::new();
        for artifact in artifacts {
            let part = backend.export(artifact.module()).ok_or_else(|| {
                AppError::unexpected(format!(
                    "backend `{}` cannot export {}",
                    backend.name(),
                    artifact.identity()
                ))
            })?;
            parts.push(part);
        }

        let template_types = build
            .leaves
            .iter()
            .filter(|artifact| artifact.is_template())
            .map(|artifact| artifact.identity().type_name().to_string())
            .collect();

        Ok(Self {
            format: BUNDLE_FORMAT,
            backend: backend.name().to_string(),
            site: site.to_string(),
            created_at: OffsetDateTime::now_utc(),
            template_types,
            parts,
        })
    }

    pub async fn read(path: &Path) -> Result<Self, InfraError> {
        let bytes = tokio::fs::read(path).await?;
        let bundle: Self = serde_json::from_slice(&bytes)
            .map_err(|err| InfraError::bundle(format!("{}: {err}", path.display())))?;
        if bundle.format != BUNDLE_FORMAT {
            return Err(InfraError::bundle(format!(
                "{}: unsupported format {} (expected {BUNDLE_FORMAT})",
                path.display(),
                bundle.format
            )));
        }
        Ok(bundle)
    }

    pub async fn write(&self, path: &Path) -> Result<(), InfraError> {
        let encoded = serde_json::to_vec_pretty(self)
            .map_err(|err| InfraError::bundle(format!("failed to encode bundle: {err}")))?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, encoded).await?;
        Ok(())
    }

    /// Link every part into a single artifact.
    pub fn load(
        &self,
        backend: &dyn CompileBackend,
        path: &Path,
    ) -> Result<Arc<CompiledArtifact>, KilnError> {
        let identity = SourceIdentity::new(path, format!("{} (prebuilt)", self.site));
        if self.backend != backend.name() {
            return Err(CompileError::single(
                identity.type_name(),
                format!(
                    "bundle was built by `{}` but the site uses `{}`",
                    self.backend,
                    backend.name()
                ),
            )
            .into());
        }
        let module = backend
            .load_prebuilt(&self.parts)
            .map_err(|diagnostics| CompileError::new(identity.type_name(), diagnostics))?;
        Ok(Arc::new(CompiledArtifact::new(
            identity,
            Tier::Leaf,
            UnitKind::Script,
            module,
            Vec::new(),
            &[],
        )))
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::application::locator::{NamingConvention, SourceLocator};
    use crate::application::tiers::TierGraph;
    use crate::backend::HandlerRequest;
    use crate::backend::script::ScriptBackend;
    use crate::cache::{ArtifactCache, CacheConfig};

    #[tokio::test]
    async fn bundle_round_trips_through_disk() {
        let dir = TempDir::new().expect("tempdir");
        std::fs::write(
            dir.path().join("index.ks"),
            "namespace Site { public class index : Kiln.Handler { public override void Render() { Response.Write(\"live\"); } } }",
        )
        .expect("write index");
        std::fs::write(dir.path().join("about.ks.html"), "<h1>About</h1>").expect("write about");

        let backend = Arc::new(ScriptBackend::new());
        let graph = TierGraph::new(
            backend.clone(),
            SourceLocator::new(dir.path(), NamingConvention::default()),
            Arc::new(ArtifactCache::new(CacheConfig::default())),
            Vec::new(),
        );
        let build = graph.build_all().await.expect("builds");
        let bundle = PrebuiltBundle::from_build("demo", backend.as_ref(), &build).expect("exports");
        assert_eq!(bundle.parts.len(), 3);
        assert!(bundle.template_types.contains("Site.about"));

        let path = dir.path().join("out/demo.json");
        bundle.write(&path).await.expect("writes");
        let loaded = PrebuiltBundle::read(&path).await.expect("reads");
        let artifact = loaded.load(backend.as_ref(), &path).expect("loads");

        let mut handler = artifact
            .type_factory("Site.aboutWindow")
            .expect("window type")
            .construct(&[])
            .expect("constructs");
        let response = handler.process(&HandlerRequest::get("/about")).expect("runs");
        assert_eq!(response.body, "<h1>About</h1>");
        assert!(artifact.type_factory("Site.index").is_some());
    }

    #[tokio::test]
    async fn unsupported_format_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("bundle.json");
        std::fs::write(
            &path,
            r#"{"format":9,"backend":"kiln-script","site":"x","created_at":"2026-01-01T00:00:00Z","template_types":[],"parts":[]}"#,
        )
        .expect("write bundle");
        let error = PrebuiltBundle::read(&path).await.expect_err("format");
        assert!(error.to_string().contains("unsupported format 9"));
    }

    #[test]
    fn mismatched_backend_is_a_compile_error() {
        let bundle = PrebuiltBundle {
            format: BUNDLE_FORMAT,
            backend: "other".to_string(),
            site: "demo".to_string(),
            created_at: OffsetDateTime::UNIX_EPOCH,
            template_types: BTreeSet::new(),
            parts: Vec::new(),
        };
        let error = bundle
            .load(&ScriptBackend::new(), Path::new("demo.json"))
            .expect_err("mismatch");
        assert!(matches!(error, KilnError::Compile(_)));
    }
}
