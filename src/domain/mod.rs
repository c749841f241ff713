//! Domain types shared by every layer: identities, tiers, diagnostics, errors.

pub mod diagnostics;
pub mod error;
pub mod identity;

pub use diagnostics::{Diagnostic, Severity, SourceLocation};
pub use error::{CompileError, KilnError};
pub use identity::{SourceIdentity, SourceKey, Tier, UnitKind};
