//! Cache behaviour observed through the tier graph with a real backend.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use kiln::application::factory;
use kiln::application::{NamingConvention, SourceLocator, TierGraph};
use kiln::backend::script::ScriptBackend;
use kiln::backend::{CompileBackend, CompiledModule, HandlerRequest, SourceText};
use kiln::cache::{ArtifactCache, CacheConfig, CompiledArtifact, EntryStatus, WatchEvent};
use kiln::domain::{Diagnostic, KilnError};
use tempfile::TempDir;

/// Script backend that records every compiled file and can hold back one
/// file until released.
#[derive(Default)]
struct CountingBackend {
    inner: ScriptBackend,
    compiled: Mutex<Vec<PathBuf>>,
    delay: Duration,
    gate: Option<(String, Arc<(Mutex<bool>, Condvar)>)>,
}

impl CountingBackend {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn gated(file_name: &str) -> (Self, Arc<(Mutex<bool>, Condvar)>) {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let backend = Self {
            gate: Some((file_name.to_string(), Arc::clone(&gate))),
            ..Default::default()
        };
        (backend, gate)
    }

    fn compilations_of(&self, path: &Path) -> usize {
        self.compiled
            .lock()
            .expect("compile log lock")
            .iter()
            .filter(|compiled| compiled.as_path() == path)
            .count()
    }
}

impl CompileBackend for CountingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn foundation_sources(&self) -> Vec<SourceText> {
        self.inner.foundation_sources()
    }

    fn compile(
        &self,
        sources: &[SourceText],
        references: &[Arc<CompiledArtifact>],
    ) -> Result<CompiledModule, Vec<Diagnostic>> {
        {
            let mut compiled = self.compiled.lock().expect("compile log lock");
            compiled.extend(sources.iter().map(|source| source.path.clone()));
        }
        if let Some((file_name, gate)) = &self.gate
            && sources
                .iter()
                .any(|source| source.path.ends_with(file_name))
        {
            let (open, signal) = &**gate;
            let guard = open.lock().expect("gate lock");
            let _released = signal
                .wait_timeout_while(guard, Duration::from_secs(10), |open| !*open)
                .expect("gate wait");
        }
        std::thread::sleep(self.delay);
        self.inner.compile(sources, references)
    }

    fn export(&self, module: &CompiledModule) -> Option<serde_json::Value> {
        self.inner.export(module)
    }

    fn load_prebuilt(
        &self,
        parts: &[serde_json::Value],
    ) -> Result<CompiledModule, Vec<Diagnostic>> {
        self.inner.load_prebuilt(parts)
    }
}

fn graph(root: &Path, backend: Arc<CountingBackend>) -> TierGraph {
    TierGraph::new(
        backend,
        SourceLocator::new(root, NamingConvention::default()),
        Arc::new(ArtifactCache::new(CacheConfig::default())),
        Vec::new(),
    )
}

fn handler_source(class: &str, body: &str) -> String {
    format!(
        "namespace Site {{ public class {class} : Kiln.Handler {{ public override void Render() {{ Response.Write(\"{body}\"); }} }} }}"
    )
}

fn render(artifact: &CompiledArtifact) -> String {
    let type_name = factory::instance_type_name(artifact, artifact.identity().type_name());
    let mut handler = factory::create_instance(artifact, &type_name, &[]).expect("instance");
    handler
        .process(&HandlerRequest::get("/"))
        .expect("handler runs")
        .body
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_lookups_share_one_compilation() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("index.ks"), handler_source("index", "home")).expect("write");
    let backend = Arc::new(CountingBackend::with_delay(Duration::from_millis(100)));
    let graph = graph(dir.path(), Arc::clone(&backend));
    let identity = graph.locator().resolve("index").expect("resolves");

    let lookups = (0..16).map(|_| {
        let graph = graph.clone();
        let identity = identity.clone();
        tokio::spawn(async move { graph.leaf(&identity).await })
    });
    let artifacts: Vec<Arc<CompiledArtifact>> = futures::future::join_all(lookups)
        .await
        .into_iter()
        .map(|joined| joined.expect("task").expect("builds"))
        .collect();

    assert!(
        artifacts
            .windows(2)
            .all(|pair| Arc::ptr_eq(&pair[0], &pair[1]))
    );
    assert_eq!(backend.compilations_of(identity.path()), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn distinct_keys_do_not_wait_on_each_other() {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("slow.ks"), handler_source("slow", "slow")).expect("write");
    std::fs::write(dir.path().join("fast.ks"), handler_source("fast", "fast")).expect("write");
    let (backend, gate) = CountingBackend::gated("slow.ks");
    let graph = graph(dir.path(), Arc::new(backend));

    let slow = graph.locator().resolve("slow").expect("resolves");
    let pending = {
        let graph = graph.clone();
        let slow = slow.clone();
        tokio::spawn(async move { graph.leaf(&slow).await })
    };
    while graph.cache().status(&slow) != Some(EntryStatus::Building) {
        tokio::task::yield_now().await;
    }

    let fast = graph.locator().resolve("fast").expect("resolves");
    let artifact = graph.leaf(&fast).await.expect("fast builds");
    assert_eq!(render(&artifact), "fast");
    assert_eq!(graph.cache().status(&slow), Some(EntryStatus::Building));

    {
        let (open, signal) = &*gate;
        *open.lock().expect("gate lock") = true;
        signal.notify_all();
    }
    let artifact = pending.await.expect("task").expect("slow builds");
    assert_eq!(render(&artifact), "slow");
}

#[tokio::test]
async fn modification_round_trip_yields_a_fresh_artifact() {
    let dir = TempDir::new().expect("tempdir");
    let file = dir.path().join("index.ks");
    std::fs::write(&file, handler_source("index", "one")).expect("write");
    let backend = Arc::new(CountingBackend::default());
    let graph = graph(dir.path(), Arc::clone(&backend));
    let identity = graph.locator().resolve("index").expect("resolves");

    let first = graph.leaf(&identity).await.expect("builds");
    let again = graph.leaf(&identity).await.expect("hits");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(render(&first), "one");

    std::fs::write(&file, handler_source("index", "two")).expect("rewrite");
    assert_eq!(graph.apply_event(&WatchEvent::modified(&file)), 1);
    assert_eq!(
        graph.cache().status(&identity),
        Some(EntryStatus::Invalidated)
    );

    let second = graph.leaf(&identity).await.expect("rebuilds");
    assert_ne!(first.id(), second.id());
    assert_ne!(first.source_hash(), second.source_hash());
    assert_eq!(render(&second), "two");
    assert_eq!(backend.compilations_of(identity.path()), 2);

    // The old artifact is still usable by whoever holds it.
    assert_eq!(render(&first), "one");
}

#[tokio::test]
async fn markup_edit_invalidates_the_code_behind_key() {
    let dir = TempDir::new().expect("tempdir");
    let markup = dir.path().join("about.ks.html");
    std::fs::write(&markup, "<p>v1</p>").expect("write");
    let graph = graph(dir.path(), Arc::new(CountingBackend::default()));
    let identity = graph.locator().resolve("about").expect("resolves");

    assert_eq!(render(&graph.leaf(&identity).await.expect("builds")), "<p>v1</p>");

    std::fs::write(&markup, "<p>v2</p>").expect("rewrite");
    graph.apply_event(&WatchEvent::modified(&markup));
    assert_eq!(render(&graph.leaf(&identity).await.expect("rebuilds")), "<p>v2</p>");
}

#[tokio::test]
async fn renamed_source_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let original = dir.path().join("about.ks");
    std::fs::write(&original, handler_source("about", "about")).expect("write");
    let graph = graph(dir.path(), Arc::new(CountingBackend::default()));
    let identity = graph.locator().resolve("about").expect("resolves");
    graph.leaf(&identity).await.expect("builds");

    std::fs::rename(&original, dir.path().join("renamed.ks")).expect("rename");
    graph.apply_event(&WatchEvent::renamed(&original));
    assert_eq!(graph.cache().status(&identity), None);

    let error = graph.leaf(&identity).await.expect_err("gone");
    assert!(matches!(error, KilnError::NotFound { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failures_reach_every_waiter_and_are_not_cached() {
    let dir = TempDir::new().expect("tempdir");
    let file = dir.path().join("broken.ks");
    std::fs::write(
        &file,
        "namespace Site { public class broken : Missing { } }",
    )
    .expect("write");
    let backend = Arc::new(CountingBackend::with_delay(Duration::from_millis(200)));
    let graph = graph(dir.path(), Arc::clone(&backend));
    let identity = graph.locator().resolve("broken").expect("resolves");

    let lookups = (0..4).map(|_| {
        let graph = graph.clone();
        let identity = identity.clone();
        tokio::spawn(async move { graph.leaf(&identity).await })
    });
    let messages: Vec<String> = futures::future::join_all(lookups)
        .await
        .into_iter()
        .map(|joined| match joined.expect("task") {
            Err(KilnError::Compile(error)) => error.to_string(),
            other => panic!("expected compile error, got {other:?}"),
        })
        .collect();
    assert!(messages.iter().all(|message| message == &messages[0]));
    assert!(messages[0].contains("unknown base type `Missing`"));
    assert_eq!(backend.compilations_of(identity.path()), 1);
    assert_eq!(graph.cache().status(&identity), Some(EntryStatus::Empty));

    // No watcher event: the next lookup simply compiles again.
    std::fs::write(&file, handler_source("broken", "fixed")).expect("fix");
    let artifact = graph.leaf(&identity).await.expect("builds after fix");
    assert_eq!(render(&artifact), "fixed");
}
