//! Compile backends.
//!
//! The cache, tiers and watcher only see [`CompileBackend`]: sources plus
//! reference artifacts in, a [`CompiledModule`] or diagnostics out. The
//! built-in [`script::ScriptBackend`] implements it for the kiln script
//! language.

pub mod handler;
pub mod script;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cache::CompiledArtifact;
use crate::domain::Diagnostic;

pub use handler::{Handler, HandlerRequest, HandlerResponse, InvokeError, TypeFactory, Value};

/// One source text handed to a backend.
#[derive(Debug, Clone)]
pub struct SourceText {
    pub path: PathBuf,
    pub text: String,
}

impl SourceText {
    pub fn new(path: impl Into<PathBuf>, text: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            text: text.into(),
        }
    }
}

/// Backend output: an opaque payload plus the type table built from it.
#[derive(Clone)]
pub struct CompiledModule {
    payload: Arc<dyn Any + Send + Sync>,
    types: BTreeMap<String, Arc<dyn TypeFactory>>,
}

impl CompiledModule {
    pub fn new(
        payload: Arc<dyn Any + Send + Sync>,
        types: BTreeMap<String, Arc<dyn TypeFactory>>,
    ) -> Self {
        Self { payload, types }
    }

    pub fn payload(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.payload
    }

    /// Downcast the payload to the backend's own module type.
    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.payload).downcast::<T>().ok()
    }

    pub fn type_factory(&self, type_name: &str) -> Option<&Arc<dyn TypeFactory>> {
        self.types.get(type_name)
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.keys().map(String::as_str)
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Pluggable compiler.
pub trait CompileBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sources of the base library compiled into the Foundation tier.
    fn foundation_sources(&self) -> Vec<SourceText>;

    fn compile(
        &self,
        sources: &[SourceText],
        references: &[Arc<CompiledArtifact>],
    ) -> Result<CompiledModule, Vec<Diagnostic>>;

    /// Serialize a module for a prebuilt bundle, if the backend supports it.
    fn export(&self, module: &CompiledModule) -> Option<serde_json::Value>;

    /// Load modules exported by [`CompileBackend::export`] as one module,
    /// without compiling.
    fn load_prebuilt(&self, parts: &[serde_json::Value])
    -> Result<CompiledModule, Vec<Diagnostic>>;
}
