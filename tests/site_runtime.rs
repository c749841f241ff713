//! Whole-site behaviour: the bundled demo site, live file watching and the
//! prebuilt override.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kiln::application::SiteRuntime;
use kiln::application::prebuilt::PrebuiltBundle;
use kiln::backend::script::ScriptBackend;
use kiln::backend::{CompileBackend, HandlerRequest, Value};
use kiln::config::{CompilerSettings, SiteSettings};
use kiln::domain::KilnError;
use tempfile::TempDir;

fn settings(root: &Path, watch: bool) -> SiteSettings {
    SiteSettings {
        name: "demo".to_string(),
        root: root.to_path_buf(),
        hosts: Vec::new(),
        namespace: "Site".to_string(),
        prebuilt: None,
        watch,
    }
}

fn demo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("sites/demo")
}

async fn body(site: &SiteRuntime, path: &str, request: &HandlerRequest) -> Result<String, KilnError> {
    let mut handler = site
        .create_instance(path, None, &[Value::from(site.name())])
        .await?;
    Ok(handler.process(request).expect("handler runs").body)
}

#[tokio::test]
async fn demo_site_compiles_without_failures() {
    let site = SiteRuntime::start(
        &settings(&demo_root(), false),
        &CompilerSettings::default(),
        Arc::new(ScriptBackend::new()),
    )
    .await
    .expect("demo site starts");
    let build = site
        .graph()
        .expect("live site")
        .build_all()
        .await
        .expect("foundation and global build");

    assert!(build.global.is_some());
    assert!(build.failures.is_empty(), "{:?}", build.failures);
    let names: Vec<&str> = build
        .leaves
        .iter()
        .map(|artifact| artifact.identity().type_name())
        .collect();
    assert_eq!(names, vec!["Site.about", "Site.blog.first_post", "Site.index"]);

    let about = body(
        &site,
        "about",
        &HandlerRequest::get("/about").with_query("name", "<Ada>"),
    )
    .await
    .expect("about renders");
    assert!(about.contains("Hello, &lt;Ada&gt;."), "{about}");
    assert!(about.contains("\"<% and %>\""), "{about}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_evicts_changed_sources() {
    let dir = TempDir::new().expect("tempdir");
    let file = dir.path().join("index.ks");
    let source = |text: &str| {
        format!(
            "namespace Site {{ public class index : Kiln.Handler {{ public override void Render() {{ Response.Write(\"{text}\"); }} }} }}"
        )
    };
    std::fs::write(&file, source("before")).expect("write");

    let site = SiteRuntime::start(
        &settings(dir.path(), true),
        &CompilerSettings::default(),
        Arc::new(ScriptBackend::new()),
    )
    .await
    .expect("site starts");
    assert!(site.is_watching());

    let request = HandlerRequest::get("/");
    assert_eq!(body(&site, "index", &request).await.expect("renders"), "before");

    std::fs::write(&file, source("after")).expect("rewrite");
    let mut latest = String::new();
    for _ in 0..100 {
        latest = body(&site, "index", &request).await.expect("renders");
        if latest == "after" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(latest, "after");

    std::fs::remove_file(&file).expect("delete");
    let mut gone = false;
    for _ in 0..100 {
        if matches!(
            body(&site, "index", &request).await,
            Err(KilnError::NotFound { .. })
        ) {
            gone = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(gone, "deleted source should stop resolving");
}

#[tokio::test]
async fn prebuilt_override_never_compiles() {
    let dir = TempDir::new().expect("tempdir");
    let root = dir.path().join("site");
    std::fs::create_dir_all(&root).expect("site dir");
    std::fs::write(
        root.join("index.ks"),
        "namespace Site { public class index : Kiln.Handler { public override void Render() { Response.Write(\"bundled\"); } } }",
    )
    .expect("write index");
    std::fs::write(root.join("page.ks.html"), "<b>page</b>").expect("write page");

    let backend: Arc<dyn CompileBackend> = Arc::new(ScriptBackend::new());
    let compiler = CompilerSettings::default();
    let live = SiteRuntime::start(&settings(&root, false), &compiler, Arc::clone(&backend))
        .await
        .expect("live site");
    let build = live
        .graph()
        .expect("live")
        .build_all()
        .await
        .expect("builds");
    let bundle_path = dir.path().join("demo.bundle.json");
    PrebuiltBundle::from_build("demo", backend.as_ref(), &build)
        .expect("exports")
        .write(&bundle_path)
        .await
        .expect("writes");

    // Sources changing on disk no longer matter.
    std::fs::write(root.join("index.ks"), "this does not parse").expect("clobber");

    let mut prebuilt_settings = settings(&root, true);
    prebuilt_settings.prebuilt = Some(bundle_path);
    let site = SiteRuntime::start(&prebuilt_settings, &compiler, backend)
        .await
        .expect("prebuilt site");
    assert!(site.is_prebuilt());
    assert!(!site.is_watching());
    assert!(site.cache().is_none());

    let request = HandlerRequest::get("/");
    assert_eq!(body(&site, "index", &request).await.expect("renders"), "bundled");
    assert_eq!(body(&site, "page", &request).await.expect("renders"), "<b>page</b>");
    assert_eq!(body(&site, "INDEX", &request).await.expect("renders"), "bundled");
    assert_eq!(body(&site, "Page", &request).await.expect("renders"), "<b>page</b>");
    assert!(matches!(
        body(&site, "absent", &request).await,
        Err(KilnError::NotFound { .. })
    ));
}
