//! Immutable compile output held by cache entries.

use std::fmt;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::backend::{CompiledModule, SourceText, TypeFactory};
use crate::domain::{SourceIdentity, Tier, UnitKind};

/// One compiled unit together with the artifacts it was linked against.
///
/// Never mutated after construction; a changed source produces a new
/// artifact with a new id.
pub struct CompiledArtifact {
    id: Uuid,
    tier: Tier,
    identity: SourceIdentity,
    kind: UnitKind,
    module: CompiledModule,
    references: Vec<Arc<CompiledArtifact>>,
    source_hash: String,
    built_at: OffsetDateTime,
}

impl CompiledArtifact {
    pub fn new(
        identity: SourceIdentity,
        tier: Tier,
        kind: UnitKind,
        module: CompiledModule,
        references: Vec<Arc<CompiledArtifact>>,
        sources: &[SourceText],
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tier,
            identity,
            kind,
            module,
            references,
            source_hash: hash_sources(sources),
            built_at: OffsetDateTime::now_utc(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub fn identity(&self) -> &SourceIdentity {
        &self.identity
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    pub fn is_template(&self) -> bool {
        self.kind == UnitKind::Template
    }

    pub fn module(&self) -> &CompiledModule {
        &self.module
    }

    /// Reference artifacts in the order they were handed to the backend.
    pub fn references(&self) -> &[Arc<CompiledArtifact>] {
        &self.references
    }

    /// Hex SHA-256 over every source path and text, in compile order.
    pub fn source_hash(&self) -> &str {
        &self.source_hash
    }

    pub fn built_at(&self) -> OffsetDateTime {
        self.built_at
    }

    pub fn type_factory(&self, type_name: &str) -> Option<&Arc<dyn TypeFactory>> {
        self.module.type_factory(type_name)
    }
}

impl fmt::Debug for CompiledArtifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledArtifact")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("identity", &self.identity)
            .field("kind", &self.kind)
            .field(
                "references",
                &self
                    .references
                    .iter()
                    .map(|artifact| artifact.identity.type_name())
                    .collect::<Vec<_>>(),
            )
            .field("source_hash", &self.source_hash)
            .finish()
    }
}

fn hash_sources(sources: &[SourceText]) -> String {
    let mut hasher = Sha256::new();
    for source in sources {
        hasher.update(source.path.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(source.text.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn artifact(text: &str) -> CompiledArtifact {
        CompiledArtifact::new(
            SourceIdentity::new("/site/index.ks", "Site.index"),
            Tier::Leaf,
            UnitKind::Script,
            CompiledModule::new(Arc::new(()), BTreeMap::new()),
            Vec::new(),
            &[SourceText::new("/site/index.ks", text)],
        )
    }

    #[test]
    fn hash_tracks_source_text() {
        let first = artifact("class A { }");
        let same = artifact("class A { }");
        let changed = artifact("class B { }");
        assert_eq!(first.source_hash(), same.source_hash());
        assert_ne!(first.source_hash(), changed.source_hash());
        assert_eq!(first.source_hash().len(), 64);
        assert_ne!(first.id(), same.id());
    }
}
