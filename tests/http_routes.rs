// HTTP route integration tests
//
// Drives the axum router in-process with tower's oneshot; no socket is bound.
//
// Routes covered:
// - GET  /network/{networkId}/tokens/{tokenId}[/render|/image]
// - POST /network/{networkId}/tokens/{tokenId}[/{kind}]/invalidate
// - GET  /network/{networkId}/modules/{name}
// - POST /network/{networkId}/preview
// - /admin/* behind a bearer token
//
// To run: `cargo test --test http_routes`

mod common;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use code_modules::render::ConcurrencyLimiter;
use code_modules::{HttpServer, MemoryLedger, ModuleStore};
use common::*;
use std::sync::Arc;
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "test-admin-token";

struct TestApp {
    router: Router,
    ledger: Arc<MemoryLedger>,
    limiter: ConcurrencyLimiter,
}

impl TestApp {
    fn new() -> Self {
        let ledger = ledger_with(&[("palette", &[])]);
        let mut art = draft("art", &["palette"], "(palette) => (seed) => palette + seed");
        art.is_invocable = true;
        ledger.create_module(OWNER, art).unwrap();
        ledger.set_invocations_max(OWNER, &name("art"), 100).unwrap();
        let ledger = Arc::new(ledger);

        let limiter = ConcurrencyLimiter::new(1);
        let service = service(ledger.clone(), Arc::new(FakeSnapshotter::new()))
            .with_limiter(limiter.clone())
            .with_web_url_root("https://modules.example");

        let router = HttpServer::new("127.0.0.1:0", Arc::new(service))
            .with_admin_token(Some(ADMIN_TOKEN.to_string()))
            .router();

        Self {
            router,
            ledger,
            limiter,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible")
    }

    async fn get(&self, uri: &str) -> Response {
        self.send(Request::get(uri).body(Body::empty()).unwrap()).await
    }

    async fn post(&self, uri: &str) -> Response {
        self.send(Request::post(uri).body(Body::empty()).unwrap()).await
    }

    fn admin(method: &str, uri: &str, body: impl Into<Body>) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {}", ADMIN_TOKEN))
            .body(body.into())
            .unwrap()
    }

    fn invocation(&self) -> u64 {
        self.ledger.create_invocation(OWNER, &name("art")).unwrap()
    }
}

async fn text(response: Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_token_metadata() {
    let app = TestApp::new();
    let token = app.invocation();

    let response = app.get(&format!("/network/{}/tokens/{}", NETWORK, token)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

    let body = json(response).await;
    assert_eq!(body["name"], format!("art@{}", token));
    assert_eq!(body["description"], "art module");
    assert_eq!(
        body["animation_url"],
        format!("https://modules.example/network/{}/tokens/{}/render", NETWORK, token)
    );
    assert_eq!(
        body["external_url"],
        format!("https://modules.example/modules/invocation/{}", token)
    );
    assert!(body["attributes"].is_array());
}

#[tokio::test]
async fn test_unknown_token_and_network() {
    let app = TestApp::new();

    let response = app.get(&format!("/network/{}/tokens/404/render", NETWORK)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(text(response).await, "Token does not exist");

    let response = app.get("/network/1/tokens/1/render").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(text(response).await, "Network is not available");
}

#[tokio::test]
async fn test_render_then_invalidate() {
    let app = TestApp::new();
    let token = app.invocation();
    let render = format!("/network/{}/tokens/{}/render", NETWORK, token);

    let response = app.get(&render).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-cache"], "miss");
    let html = text(response).await;
    assert!(html.contains("__modules"));

    assert_eq!(app.get(&render).await.headers()["x-cache"], "hit");

    let invalidate = format!("/network/{}/tokens/{}/render/invalidate", NETWORK, token);
    assert_eq!(text(app.post(&invalidate).await).await, "Done");
    assert_eq!(text(app.post(&invalidate).await).await, "Not in cache");

    let response = app
        .post(&format!("/network/{}/tokens/{}/bogus/invalidate", NETWORK, token))
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_image_capacity_is_503() {
    let app = TestApp::new();
    let token = app.invocation();

    let response = app
        .send(TestApp::admin("POST", "/admin/featured/art", Body::empty()))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let _held = app.limiter.try_acquire().unwrap();
    let response = app
        .get(&format!("/network/{}/tokens/{}/image", NETWORK, token))
        .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(
        text(response).await,
        "Max capacity reached, please try again later"
    );
}

#[tokio::test]
async fn test_image_for_featured_module() {
    let app = TestApp::new();
    let token = app.invocation();
    let image = format!("/network/{}/tokens/{}/image", NETWORK, token);

    let response = app.get(&image).await;
    assert_eq!(response.headers()["x-cache"], "placeholder");

    app.send(TestApp::admin(
        "POST",
        &format!("/admin/network/{}/whitelisted/art", NETWORK),
        Body::empty(),
    ))
    .await;

    let response = app.get(&image).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
    assert_eq!(response.headers()["x-cache"], "miss");

    let response = app
        .send(TestApp::admin(
            "GET",
            &format!("/admin/network/{}/whitelisted", NETWORK),
            Body::empty(),
        ))
        .await;
    assert_eq!(json(response).await, serde_json::json!(["art"]));
}

#[tokio::test]
async fn test_module_inspection() {
    let app = TestApp::new();
    let inspect = format!("/network/{}/modules/art", NETWORK);

    let response = app.get(&inspect).await;
    assert_eq!(response.status(), StatusCode::OK);

    let body = json(response).await;
    assert_eq!(body["allDependencies"], serde_json::json!(["palette"]));
    assert_eq!(body["isMutable"], true);
    assert_eq!(body["module"]["name"], "art");

    app.ledger.finalize(OWNER, &name("palette")).unwrap();
    assert_eq!(json(app.get(&inspect).await).await["isMutable"], false);

    // A leaf has an empty closure, finalized or not
    let body = json(app.get(&format!("/network/{}/modules/palette", NETWORK)).await).await;
    assert_eq!(body["isMutable"], false);

    let response = app.get(&format!("/network/{}/modules/ghost", NETWORK)).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_preview() {
    let app = TestApp::new();
    let preview = format!("/network/{}/preview", NETWORK);

    let request = |payload: serde_json::Value| {
        Request::post(preview.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload.to_string()))
            .unwrap()
    };

    let response = app
        .send(request(serde_json::json!({
            "dependencies": ["palette"],
            "code": STANDARD.encode("(palette) => (seed) => palette + seed"),
            "isInvocable": true,
        })))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let html = text(response).await;
    assert!(html.contains("root(\"0x00\")"));

    let response = app
        .send(request(serde_json::json!({
            "code": STANDARD.encode("not a function"),
        })))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text(response).await, "");

    // Editing palette to depend on art would close a loop
    let response = app
        .send(request(serde_json::json!({
            "name": "palette",
            "dependencies": ["art"],
            "code": STANDARD.encode("(art) => 1"),
        })))
        .await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_admin_template() {
    let app = TestApp::new();
    let token = app.invocation();

    let response = app
        .send(TestApp::admin("PUT", "/admin/template", "<html>no marker</html>"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .send(TestApp::admin(
            "PUT",
            "/admin/template",
            "<main><script>{{inject}}</script></main>",
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    let html = text(
        app.get(&format!("/network/{}/tokens/{}/render", NETWORK, token))
            .await,
    )
    .await;
    assert!(html.starts_with("<main><script>"));
    assert!(html.ends_with("</script></main>"));
}

#[tokio::test]
async fn test_admin_requires_bearer() {
    let app = TestApp::new();

    let response = app.post("/admin/featured/art").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .send(
            Request::post("/admin/featured/art")
                .header(header::AUTHORIZATION, "Bearer nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let response = app
        .send(TestApp::admin("DELETE", "/admin/featured/art", Body::empty()))
        .await;
    assert_eq!(text(response).await, "Not flagged");
    assert!(app.ledger.exists(&name("art")));
}

#[tokio::test]
async fn test_health_and_stats() {
    let app = TestApp::new();
    assert_eq!(text(app.get("/health").await).await, "OK");

    let body = json(app.get("/stats").await).await;
    assert_eq!(body["snapshotSlots"]["max"], 1);
    assert_eq!(body["networks"], serde_json::json!([NETWORK]));
}
