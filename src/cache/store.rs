//! Artifact cache: one lazily built, memoized artifact per source identity.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::FutureExt;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use crate::domain::{CompileError, SourceIdentity, SourceKey, Tier};

use super::artifact::CompiledArtifact;
use super::config::CacheConfig;
use super::entry::{BuildResult, CacheEntry, EntryState, EntryStatus, Flight};

pub(crate) const METRIC_CACHE_HIT: &str = "kiln_cache_hit_total";
pub(crate) const METRIC_CACHE_MISS: &str = "kiln_cache_miss_total";
pub(crate) const METRIC_COMPILE: &str = "kiln_compile_total";
pub(crate) const METRIC_COMPILE_FAILURE: &str = "kiln_compile_failure_total";
pub(crate) const METRIC_INVALIDATION: &str = "kiln_cache_invalidation_total";
pub(crate) const METRIC_COMPILE_MS: &str = "kiln_compile_ms";

enum Lookup {
    Hit(Arc<CompiledArtifact>),
    Wait(Flight),
}

/// Concurrent map from source key to cache entry.
///
/// At most one build runs per key; different keys never wait on each other.
/// Failed builds are handed to every waiter and then forgotten.
pub struct ArtifactCache {
    config: CacheConfig,
    entries: DashMap<SourceKey, Arc<CacheEntry>>,
    generation: AtomicU64,
}

impl ArtifactCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
            generation: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Return the built artifact for `identity`, running `build` if there is
    /// none and no build is already in flight.
    ///
    /// The build runs on its own task, so it completes and publishes even if
    /// every caller stops waiting.
    pub async fn get_or_build<F, Fut>(
        &self,
        identity: &SourceIdentity,
        tier: Tier,
        build: F,
    ) -> BuildResult
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = BuildResult> + Send + 'static,
    {
        let entry = self.entry(identity, tier);
        let lookup = entry.with_state("get_or_build", |state| match state {
            EntryState::Built(artifact) => Lookup::Hit(Arc::clone(artifact)),
            EntryState::Building { flight, .. } => {
                debug!(
                    target = "kiln::cache::store",
                    unit = identity.type_name(),
                    "joining in-flight build"
                );
                Lookup::Wait(flight.clone())
            }
            EntryState::Empty | EntryState::Invalidated => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let flight = spawn_build(
                    Arc::clone(&entry),
                    generation,
                    self.config.compile_timeout,
                    build,
                );
                *state = EntryState::Building {
                    flight: flight.clone(),
                    generation,
                };
                counter!(METRIC_CACHE_MISS, "tier" => tier.as_str()).increment(1);
                Lookup::Wait(flight)
            }
        });

        match lookup {
            Lookup::Hit(artifact) => {
                counter!(METRIC_CACHE_HIT, "tier" => tier.as_str()).increment(1);
                Ok(artifact)
            }
            Lookup::Wait(flight) => flight.await,
        }
    }

    /// Force a rebuild on next access. Invalidating a site-global entry also
    /// invalidates every leaf, since leaves hold the old global as a reference.
    pub fn invalidate(&self, identity: &SourceIdentity) -> bool {
        let Some(entry) = self.lookup(identity.key()) else {
            return false;
        };
        let dropped = entry.invalidate();
        if dropped {
            counter!(METRIC_INVALIDATION, "reason" => "invalidate").increment(1);
            info!(
                target = "kiln::cache::store",
                unit = identity.type_name(),
                tier = entry.tier().as_str(),
                "cache entry invalidated"
            );
        }
        if entry.tier() == Tier::SiteGlobal {
            self.invalidate_tier(Tier::Leaf);
        }
        dropped
    }

    /// Invalidate every entry of one tier. Returns how many held an artifact
    /// or a build.
    pub fn invalidate_tier(&self, tier: Tier) -> usize {
        let entries: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .filter(|item| item.value().tier() == tier)
            .map(|item| Arc::clone(item.value()))
            .collect();
        let dropped = entries.iter().filter(|entry| entry.invalidate()).count();
        if dropped > 0 {
            counter!(METRIC_INVALIDATION, "reason" => "tier").increment(dropped as u64);
            info!(
                target = "kiln::cache::store",
                tier = tier.as_str(),
                dropped,
                "cache tier invalidated"
            );
        }
        dropped
    }

    /// Forget `identity` entirely.
    pub fn remove(&self, identity: &SourceIdentity) -> bool {
        let Some((_, entry)) = self.entries.remove(identity.key()) else {
            return false;
        };
        // A build still running for the removed entry must not publish.
        entry.invalidate();
        counter!(METRIC_INVALIDATION, "reason" => "remove").increment(1);
        info!(
            target = "kiln::cache::store",
            unit = identity.type_name(),
            tier = entry.tier().as_str(),
            "cache entry removed"
        );
        if entry.tier() == Tier::SiteGlobal {
            self.invalidate_tier(Tier::Leaf);
        }
        true
    }

    /// Forget every entry whose source lives under `dir`. Used when a
    /// directory is renamed or deleted as a whole.
    pub fn remove_under(&self, dir: &Path) -> usize {
        let mut prefix = SourceKey::from_path(dir).as_str().to_string();
        if !prefix.ends_with(std::path::MAIN_SEPARATOR) {
            prefix.push(std::path::MAIN_SEPARATOR);
        }
        let doomed: Vec<SourceIdentity> = self
            .entries
            .iter()
            .filter(|item| item.key().as_str().starts_with(&prefix))
            .map(|item| item.value().identity().clone())
            .collect();
        doomed.iter().filter(|identity| self.remove(identity)).count()
    }

    /// Drop every entry.
    pub fn reset(&self) {
        let entries: Vec<Arc<CacheEntry>> = self
            .entries
            .iter()
            .map(|item| Arc::clone(item.value()))
            .collect();
        self.entries.clear();
        for entry in &entries {
            entry.invalidate();
        }
        counter!(METRIC_INVALIDATION, "reason" => "reset").increment(entries.len() as u64);
        info!(
            target = "kiln::cache::store",
            dropped = entries.len(),
            "cache reset"
        );
    }

    pub fn status(&self, identity: &SourceIdentity) -> Option<EntryStatus> {
        self.lookup(identity.key()).map(|entry| entry.status())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn lookup(&self, key: &SourceKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(key).map(|item| Arc::clone(item.value()))
    }

    fn entry(&self, identity: &SourceIdentity, tier: Tier) -> Arc<CacheEntry> {
        Arc::clone(
            self.entries
                .entry(identity.key().clone())
                .or_insert_with(|| Arc::new(CacheEntry::new(identity.clone(), tier)))
                .value(),
        )
    }
}

fn spawn_build<F, Fut>(
    entry: Arc<CacheEntry>,
    generation: u64,
    timeout: Duration,
    build: F,
) -> Flight
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = BuildResult> + Send + 'static,
{
    let unit = entry.identity().type_name().to_string();
    let tier = entry.tier();

    let task_entry = Arc::clone(&entry);
    let task_unit = unit.clone();
    let handle = tokio::spawn(async move {
        let started_at = Instant::now();
        let result = match tokio::time::timeout(timeout, build()).await {
            Ok(result) => result,
            Err(_) => Err(CompileError::single(
                task_unit.clone(),
                format!("compilation timed out after {}s", timeout.as_secs_f64()),
            )
            .into()),
        };
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;

        counter!(METRIC_COMPILE, "tier" => tier.as_str()).increment(1);
        histogram!(METRIC_COMPILE_MS, "tier" => tier.as_str()).record(elapsed_ms);
        match &result {
            Ok(artifact) => info!(
                target = "kiln::cache::store",
                unit = %task_unit,
                tier = tier.as_str(),
                artifact_id = %artifact.id(),
                elapsed_ms,
                "unit compiled"
            ),
            Err(error) => {
                counter!(METRIC_COMPILE_FAILURE, "tier" => tier.as_str(), "kind" => error.kind())
                    .increment(1);
                warn!(
                    target = "kiln::cache::store",
                    unit = %task_unit,
                    tier = tier.as_str(),
                    error = %error,
                    elapsed_ms,
                    "unit failed to build"
                );
            }
        }

        if !task_entry.publish(generation, &result) {
            debug!(
                target = "kiln::cache::store",
                unit = %task_unit,
                "entry changed during build; result not published"
            );
        }
        result
    });

    async move {
        let result = match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let reason = if join_error.is_panic() {
                    "compilation panicked"
                } else {
                    "compilation was cancelled"
                };
                Err(CompileError::single(unit, reason).into())
            }
        };
        // The task has already published unless it panicked; this resets a
        // panicked build to empty.
        entry.publish(generation, &result);
        result
    }
    .boxed()
    .shared()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;
    use crate::backend::{CompiledModule, SourceText};
    use crate::domain::{KilnError, UnitKind};

    fn identity(name: &str) -> SourceIdentity {
        SourceIdentity::new(format!("/site/{name}.ks"), format!("Site.{name}"))
    }

    fn artifact(identity: &SourceIdentity) -> Arc<CompiledArtifact> {
        Arc::new(CompiledArtifact::new(
            identity.clone(),
            Tier::Leaf,
            UnitKind::Script,
            CompiledModule::new(Arc::new(()), BTreeMap::new()),
            Vec::new(),
            &[SourceText::new(identity.path(), "")],
        ))
    }

    fn counting_build(
        identity: &SourceIdentity,
        builds: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> futures::future::BoxFuture<'static, BuildResult> + Send + 'static {
        let identity = identity.clone();
        let builds = Arc::clone(builds);
        move || {
            async move {
                builds.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(artifact(&identity))
            }
            .boxed()
        }
    }

    async fn stalled_build() -> BuildResult {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Err(KilnError::not_found("/never"))
    }

    async fn exploding_build() -> BuildResult {
        panic!("backend exploded")
    }

    #[tokio::test]
    async fn repeated_lookups_return_the_same_artifact() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let id = identity("index");
        let builds = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
            .await
            .expect("builds");
        let second = cache
            .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
            .await
            .expect("hits");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(&id), Some(EntryStatus::Built));
    }

    #[tokio::test]
    async fn keys_differing_only_in_case_share_an_entry() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let lower = SourceIdentity::new("/site/about.ks", "Site.about");
        let upper = SourceIdentity::new("/site/ABOUT.ks", "Site.ABOUT");
        let builds = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_build(&lower, Tier::Leaf, counting_build(&lower, &builds))
            .await
            .expect("builds");
        cache
            .get_or_build(&upper, Tier::Leaf, counting_build(&upper, &builds))
            .await
            .expect("hits");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn invalidate_during_build_keeps_result_out_of_the_entry() {
        let cache = Arc::new(ArtifactCache::new(CacheConfig::default()));
        let id = identity("slow");
        let (release, gate) = oneshot::channel::<()>();

        let pending = {
            let cache = Arc::clone(&cache);
            let id = id.clone();
            tokio::spawn(async move {
                let build_id = id.clone();
                cache
                    .get_or_build(&id, Tier::Leaf, move || async move {
                        let _ = gate.await;
                        Ok::<_, KilnError>(artifact(&build_id))
                    })
                    .await
            })
        };

        while cache.status(&id) != Some(EntryStatus::Building) {
            tokio::task::yield_now().await;
        }
        assert!(cache.invalidate(&id));
        release.send(()).expect("build waiting");

        let stale = pending.await.expect("task").expect("build result");
        assert_eq!(cache.status(&id), Some(EntryStatus::Invalidated));

        let builds = Arc::new(AtomicUsize::new(0));
        let fresh = cache
            .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
            .await
            .expect("rebuilds");
        assert_ne!(stale.id(), fresh.id());
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidating_global_cascades_to_leaves() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let global = SourceIdentity::new("/site/global.ks", "Site.global");
        let leaf = identity("index");
        let builds = Arc::new(AtomicUsize::new(0));

        cache
            .get_or_build(&global, Tier::SiteGlobal, counting_build(&global, &builds))
            .await
            .expect("global");
        cache
            .get_or_build(&leaf, Tier::Leaf, counting_build(&leaf, &builds))
            .await
            .expect("leaf");

        assert!(cache.invalidate(&global));
        assert_eq!(cache.status(&leaf), Some(EntryStatus::Invalidated));
    }

    #[tokio::test]
    async fn remove_forgets_the_entry() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let id = identity("gone");
        let builds = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
            .await
            .expect("builds");

        assert!(cache.remove(&id));
        assert!(!cache.remove(&id));
        assert_eq!(cache.status(&id), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn timeout_resets_the_entry() {
        let cache = ArtifactCache::new(CacheConfig {
            compile_timeout: Duration::from_millis(20),
        });
        let id = identity("stuck");
        let result = cache.get_or_build(&id, Tier::Leaf, stalled_build).await;

        match result {
            Err(KilnError::Compile(error)) => assert!(error.to_string().contains("timed out")),
            other => panic!("expected a compile error, got {other:?}"),
        }
        assert_eq!(cache.status(&id), Some(EntryStatus::Empty));
    }

    #[tokio::test]
    async fn panicking_build_is_reported_and_not_cached() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let id = identity("boom");
        let result = cache
            .get_or_build(&id, Tier::Leaf, exploding_build)
            .await;
        assert!(matches!(result, Err(KilnError::Compile(ref e)) if e.to_string().contains("panicked")));
        assert_eq!(cache.status(&id), Some(EntryStatus::Empty));

        let builds = Arc::new(AtomicUsize::new(0));
        cache
            .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
            .await
            .expect("recovers");
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_under_drops_a_whole_directory() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let builds = Arc::new(AtomicUsize::new(0));
        for name in ["blog/first", "blog/second", "blogroll", "index"] {
            let id = identity(name);
            cache
                .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
                .await
                .expect("builds");
        }

        assert_eq!(cache.remove_under(Path::new("/site/Blog")), 2);
        assert_eq!(cache.len(), 2);
        assert!(cache.status(&identity("blogroll")).is_some());
    }

    #[tokio::test]
    async fn reset_drops_everything() {
        let cache = ArtifactCache::new(CacheConfig::default());
        let builds = Arc::new(AtomicUsize::new(0));
        for name in ["a", "b", "c"] {
            let id = identity(name);
            cache
                .get_or_build(&id, Tier::Leaf, counting_build(&id, &builds))
                .await
                .expect("builds");
        }
        assert_eq!(cache.len(), 3);
        cache.reset();
        assert!(cache.is_empty());
    }
}
