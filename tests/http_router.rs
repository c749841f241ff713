//! The HTTP host driven in-process through `tower::ServiceExt::oneshot`.

use std::path::Path;
use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use kiln::application::SiteRuntime;
use kiln::backend::script::ScriptBackend;
use kiln::config::{CompilerSettings, SiteSettings};
use kiln::infra::http::{HttpState, build_router};
use tempfile::TempDir;
use tower::ServiceExt;

const MAIN_GLOBAL: &str = r#"using Kiln;
namespace Site
{
    public class Layout : Page
    {
        public Layout(site) { Fields.Set("site", site); }
        public void Banner() { Response.Write("[" + Fields.Get("site") + "]"); }
    }
}
"#;

const MAIN_INDEX: &str = r#"using Kiln;
namespace Site
{
    public class index : Layout
    {
        public override void Render() { Banner(); Response.Write(" home " + Request.Query("q")); }
        public void Ping() { Response.ContentType("text/plain"); Response.Status(202); Response.Write("pong"); }
        void Hidden() { Response.Write("secret"); }
    }
}
"#;

const MAIN_BOOM: &str = r#"namespace Site
{
    public class boom : Kiln.Handler
    {
        public override void Render() { Fail("exploded"); }
    }
}
"#;

struct Fixture {
    _dirs: Vec<TempDir>,
    router: Router,
}

fn write(root: &Path, relative: &str, text: &str) {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create dirs");
    }
    std::fs::write(path, text).expect("write source");
}

fn site_settings(name: &str, root: &Path, hosts: &[&str]) -> SiteSettings {
    SiteSettings {
        name: name.to_string(),
        root: root.to_path_buf(),
        hosts: hosts.iter().map(|host| host.to_string()).collect(),
        namespace: "Site".to_string(),
        prebuilt: None,
        watch: false,
    }
}

async fn fixture() -> Fixture {
    let main = TempDir::new().expect("tempdir");
    write(main.path(), "global.ks", MAIN_GLOBAL);
    write(main.path(), "index.ks", MAIN_INDEX);
    write(main.path(), "boom.ks", MAIN_BOOM);
    write(main.path(), "docs/guide.ks.html", "<h2>Guide</h2>");
    write(
        main.path(),
        "broken.ks",
        "namespace Site { public class broken : Nowhere { } }",
    );

    let second = TempDir::new().expect("tempdir");
    write(
        second.path(),
        "index.ks",
        "namespace Site { public class index : Kiln.Handler { public override void Render() { Response.Write(\"second site\"); } } }",
    );

    let compiler = CompilerSettings::default();
    let backend = Arc::new(ScriptBackend::new());
    let main_site = SiteRuntime::start(
        &site_settings("main", main.path(), &["main.test"]),
        &compiler,
        backend.clone(),
    )
    .await
    .expect("main site starts");
    let second_site = SiteRuntime::start(
        &site_settings("second", second.path(), &["second.test"]),
        &compiler,
        backend,
    )
    .await
    .expect("second site starts");

    Fixture {
        _dirs: vec![main, second],
        router: build_router(HttpState::new(vec![main_site, second_site])),
    }
}

async fn send(router: &Router, host: Option<&str>, uri: &str) -> (StatusCode, String, String) {
    let mut builder = Request::builder().uri(uri);
    if let Some(host) = host {
        builder = builder.header(header::HOST, host);
    }
    let request = builder.body(Body::empty()).expect("request should build");
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("router should respond");

    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    (
        status,
        content_type,
        String::from_utf8(bytes.to_vec()).expect("utf-8 body"),
    )
}

#[tokio::test]
async fn root_serves_index_of_default_site() {
    let fixture = fixture().await;
    let (status, content_type, body) = send(&fixture.router, None, "/?q=rust").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "text/html; charset=utf-8");
    assert_eq!(body, "[main] home rust");
}

#[tokio::test]
async fn host_header_selects_the_site() {
    let fixture = fixture().await;
    let (status, _, body) = send(&fixture.router, Some("Second.TEST:8080"), "/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "second site");

    let (_, _, body) = send(&fixture.router, Some("unknown.test"), "/").await;
    assert_eq!(body, "[main] home ");
}

#[tokio::test]
async fn actions_dispatch_through_the_registry() {
    let fixture = fixture().await;
    let (status, content_type, body) = send(&fixture.router, None, "/index?action=Ping").await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(content_type, "text/plain");
    assert_eq!(body, "pong");

    let (status, _, _) = send(&fixture.router, None, "/index?action=Hidden").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn templates_without_code_behind_render() {
    let fixture = fixture().await;
    let (status, _, body) = send(&fixture.router, None, "/docs/guide").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "<h2>Guide</h2>");
}

#[tokio::test]
async fn errors_map_to_statuses() {
    let fixture = fixture().await;

    let (status, _, _) = send(&fixture.router, None, "/missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = send(&fixture.router, None, "/docs/../../etc/passwd").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = send(&fixture.router, None, "/broken").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, "Handler failed to compile");

    let (status, _, _) = send(&fixture.router, None, "/boom").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn health_endpoint_answers_without_a_site() {
    let router = build_router(HttpState::new(Vec::new()));
    let (status, _, _) = send(&router, None, "/_health").await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = send(&router, None, "/").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn request_ids_are_echoed() {
    let router = build_router(HttpState::new(Vec::new()));
    let request = Request::builder()
        .uri("/_health")
        .header("x-request-id", "trace-42")
        .body(Body::empty())
        .expect("request should build");
    let response = router.clone().oneshot(request).await.expect("responds");
    assert_eq!(
        response.headers().get("x-request-id").and_then(|v| v.to_str().ok()),
        Some("trace-42")
    );

    let request = Request::builder()
        .uri("/_health")
        .body(Body::empty())
        .expect("request should build");
    let response = router.oneshot(request).await.expect("responds");
    let generated = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .expect("generated id");
    assert_eq!(generated.len(), 36);
}
