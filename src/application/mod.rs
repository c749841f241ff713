//! Lookup core: locating sources, compiling them through the tier graph and
//! creating instances, one runtime per site.

pub mod error;
pub mod factory;
pub mod locator;
pub mod prebuilt;
pub mod site;
pub mod tiers;

pub use error::{AppError, ErrorReport, HttpError};
pub use locator::{NamingConvention, SourceLocator};
pub use site::SiteRuntime;
pub use tiers::{SiteBuild, TierGraph};
