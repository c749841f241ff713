//! Instance creation from an artifact's type table.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use tracing::warn;

use crate::backend::{Handler, Value};
use crate::cache::CompiledArtifact;
use crate::domain::KilnError;
use crate::template::window_type_name;

/// Type actually instantiated for a request naming `requested`.
///
/// Template-derived artifacts expose their code-behind type through the
/// synthesized `<Type>Window` subclass, so asking for the unit's own type
/// name yields the window.
pub fn instance_type_name(artifact: &CompiledArtifact, requested: &str) -> String {
    if artifact.is_template() && requested == artifact.identity().type_name() {
        window_type_name(requested)
    } else {
        requested.to_string()
    }
}

/// Construct `type_name` from `artifact`, passing `args` to its constructor.
///
/// A constructor that fails or panics is reported as an instantiation error.
pub fn create_instance(
    artifact: &CompiledArtifact,
    type_name: &str,
    args: &[Value],
) -> Result<Box<dyn Handler>, KilnError> {
    let factory = artifact
        .type_factory(type_name)
        .ok_or_else(|| KilnError::type_not_found(type_name, artifact.identity().type_name()))?;

    match panic::catch_unwind(AssertUnwindSafe(|| factory.construct(args))) {
        Ok(Ok(handler)) => Ok(handler),
        Ok(Err(reason)) => Err(KilnError::instantiation(type_name, reason)),
        Err(payload) => {
            let reason = panic_message(payload.as_ref());
            warn!(
                target = "kiln::application::factory",
                type_name,
                reason = %reason,
                "constructor panicked"
            );
            Err(KilnError::instantiation(
                type_name,
                format!("constructor panicked: {reason}"),
            ))
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
