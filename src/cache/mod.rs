//! Kiln artifact cache
//!
//! Maps source identities to lazily compiled, memoized artifacts:
//!
//! - **Entries** move through `Empty`, `Building`, `Built` and `Invalidated`;
//!   a failed build returns the entry to `Empty`.
//! - **Builds** run on their own task under a timeout and are shared by every
//!   caller waiting on the same key.
//! - **Eviction** comes from watcher events or explicit calls; invalidating the
//!   site-global entry invalidates every leaf.

mod artifact;
mod config;
mod entry;
mod events;
mod lock;
mod store;

pub use artifact::CompiledArtifact;
pub use config::CacheConfig;
pub use entry::{BuildResult, CacheEntry, EntryStatus};
pub use events::{WatchEvent, WatchEventKind};
pub use store::ArtifactCache;
pub(crate) use store::{
    METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_COMPILE, METRIC_COMPILE_FAILURE, METRIC_COMPILE_MS,
    METRIC_INVALIDATION,
};
