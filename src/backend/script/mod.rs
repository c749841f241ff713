//! The built-in `kiln-script` backend.
//!
//! A small C#-flavoured language: `using`, nested `namespace` blocks, classes
//! with a single base, `void` methods and an optional constructor. Method
//! bodies are call statements over string and integer expressions. Linking
//! resolves every base and static type reference against the batch and the
//! reference artifacts, so a unit that links will not hit a missing type at
//! runtime.

pub mod ast;
pub mod foundation;
pub mod lexer;
pub mod link;
pub mod parser;
pub mod runtime;

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::CompiledArtifact;
use crate::domain::Diagnostic;

use super::{CompileBackend, CompiledModule, SourceText, TypeFactory};
use ast::ScriptUnit;
use link::{ScriptModule, link};
use runtime::ScriptTypeFactory;

pub use runtime::html_encode;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptBackend;

impl ScriptBackend {
    pub fn new() -> Self {
        Self
    }

    fn finish(module: ScriptModule) -> CompiledModule {
        let module = Arc::new(module);
        let types: BTreeMap<String, Arc<dyn TypeFactory>> = module
            .classes
            .iter()
            .map(|(name, class)| {
                let factory: Arc<dyn TypeFactory> = Arc::new(ScriptTypeFactory::new(
                    Arc::clone(&module),
                    Arc::clone(class),
                ));
                (name.clone(), factory)
            })
            .collect();
        let payload: Arc<dyn Any + Send + Sync> = module;
        CompiledModule::new(payload, types)
    }
}

impl CompileBackend for ScriptBackend {
    fn name(&self) -> &'static str {
        "kiln-script"
    }

    fn foundation_sources(&self) -> Vec<SourceText> {
        vec![SourceText::new(
            foundation::FOUNDATION_FILE,
            foundation::FOUNDATION_SOURCE,
        )]
    }

    fn compile(
        &self,
        sources: &[SourceText],
        references: &[Arc<CompiledArtifact>],
    ) -> Result<CompiledModule, Vec<Diagnostic>> {
        let mut diagnostics = Vec::new();
        let mut units = Vec::with_capacity(sources.len());
        for source in sources {
            match parser::parse(&source.path, &source.text) {
                Ok(unit) => units.push(unit),
                Err(diagnostic) => diagnostics.push(diagnostic),
            }
        }

        let mut modules = Vec::with_capacity(references.len());
        for artifact in references {
            match artifact.module().downcast::<ScriptModule>() {
                Some(module) => modules.push(module),
                None => diagnostics.push(Diagnostic::error(format!(
                    "reference `{}` was not produced by the {} backend",
                    artifact.identity(),
                    self.name()
                ))),
            }
        }

        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }
        link(units, modules).map(Self::finish)
    }

    fn export(&self, module: &CompiledModule) -> Option<serde_json::Value> {
        let module = module.downcast::<ScriptModule>()?;
        serde_json::to_value(&module.units).ok()
    }

    fn load_prebuilt(
        &self,
        parts: &[serde_json::Value],
    ) -> Result<CompiledModule, Vec<Diagnostic>> {
        let mut units = Vec::new();
        let mut diagnostics = Vec::new();
        for (index, part) in parts.iter().enumerate() {
            match serde_json::from_value::<Vec<ScriptUnit>>(part.clone()) {
                Ok(mut parsed) => units.append(&mut parsed),
                Err(error) => diagnostics.push(Diagnostic::error(format!(
                    "prebuilt part {index} is not a {} module: {error}",
                    self.name()
                ))),
            }
        }
        if !diagnostics.is_empty() {
            return Err(diagnostics);
        }
        link(units, Vec::new()).map(Self::finish)
    }
}
