//! End-to-end tests over the assembled pipeline.
//!
//! Requests go through the full middleware chain with `tower::ServiceExt::oneshot`;
//! no sockets are opened and every backing service is disabled.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use trellis_api::{
    components, AppError, HandlerCatalog, LoadError, Pipeline, Reply, RequestContext, RouteNext,
    RoutingTable,
};
use trellis_core::{AppConfig, RateLimitSettings, RunMode};
use trellis_services::ServiceRegistry;

const BUNDLED: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/components");

fn config(mode: RunMode) -> AppConfig {
    AppConfig {
        mode,
        components_dir: BUNDLED.into(),
        ..AppConfig::default()
    }
}

async fn bundled_app(config: &AppConfig) -> Router {
    let registry = Arc::new(ServiceRegistry::empty());
    let catalog = components::catalog(config.mode, registry.clone());
    let table = RoutingTable::load(catalog, &config.components_dir).await.unwrap();
    Pipeline::new(config, registry).build(table)
}

fn write(root: &Path, rel: &str, yaml: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, yaml).unwrap();
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// -- Built-in routes ---------------------------------------------------------

#[tokio::test]
async fn index_reports_mode() {
    let app = bundled_app(&config(RunMode::Test)).await;
    let (status, _, body) = send(&app, get("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["env"], "test");
    assert!(body["data"]["timestamp"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn echo_wraps_message() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (status, _, body) = send(&app, post_json("/echo", json!({"message": "hi"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["originalMessage"], "hi");
}

#[tokio::test]
async fn echo_without_message_is_bad_request() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (status, _, body) = send(&app, post_json("/echo", json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body, json!({"message": "Message is required"}));
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let request = Request::builder()
        .method("POST")
        .uri("/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].is_string());
}

#[tokio::test]
async fn disabled_service_is_unavailable() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (status, _, body) = send(&app, get("/users")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["message"].as_str().unwrap().contains("database"));
    assert!(body.get("data").is_none());
}

#[tokio::test]
async fn readiness_with_no_services_is_ready() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (status, _, body) = send(&app, get("/health/readiness")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["ready"], true);
}

// -- Error normalization -----------------------------------------------------

#[tokio::test]
async fn unknown_path_is_enveloped_404() {
    let app = bundled_app(&config(RunMode::Production)).await;
    let (status, headers, body) = send(&app, get("/nowhere")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({"message": "Not Found"}));
    assert_eq!(headers[header::CONTENT_TYPE], "application/json");
}

#[tokio::test]
async fn wrong_method_is_enveloped_405() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let request = Request::builder()
        .method("DELETE")
        .uri("/echo")
        .body(Body::empty())
        .unwrap();
    let (status, _, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert!(body["message"].is_string());
}

async fn failing_app(mode: RunMode) -> Router {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "boom/boom.route.yaml",
        "method: GET\npath: /boom\nhandler: boom\n",
    );
    write(
        dir.path(),
        "boom/panic.route.yaml",
        "method: GET\npath: /panic\nhandler: panic\n",
    );
    let catalog = HandlerCatalog::new()
        .handler("boom", |_ctx: RequestContext| async {
            Err::<Reply, _>(AppError::internal("connection reset by peer"))
        })
        .handler("panic", |_ctx: RequestContext| async {
            if true {
                panic!("handler blew up");
            }
            Ok::<_, AppError>(Reply::no_content())
        });
    let table = RoutingTable::load(catalog, dir.path()).await.unwrap();
    Pipeline::new(&config(mode), Arc::new(ServiceRegistry::empty())).build(table)
}

#[tokio::test]
async fn internal_error_is_masked_in_production() {
    let app = failing_app(RunMode::Production).await;
    let (status, _, body) = send(&app, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"message": "Internal Server Error"}));
}

#[tokio::test]
async fn internal_error_is_detailed_in_development() {
    let app = failing_app(RunMode::Development).await;
    let (status, _, body) = send(&app, get("/boom")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["message"], "connection reset by peer");
    assert!(body["stack"].is_array());
}

#[tokio::test]
async fn panic_becomes_internal_error() {
    let app = failing_app(RunMode::Production).await;
    let (status, headers, body) = send(&app, get("/panic")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({"message": "Internal Server Error"}));
    assert!(headers.contains_key("x-request-id"));
}

// -- Ambient headers ---------------------------------------------------------

#[tokio::test]
async fn every_response_carries_ambient_headers() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (_, headers, _) = send(&app, get("/health/liveness")).await;
    assert!(headers["x-response-time"].to_str().unwrap().ends_with("ms"));
    assert!(!headers["x-request-id"].is_empty());
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
    assert!(headers.contains_key("x-ratelimit-limit"));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let request = Request::builder()
        .uri("/health/liveness")
        .header("x-request-id", "trace-42")
        .body(Body::empty())
        .unwrap();
    let (_, headers, _) = send(&app, request).await;
    assert_eq!(headers["x-request-id"], "trace-42");
}

#[tokio::test]
async fn cors_preflight_is_answered() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let request = Request::builder()
        .method("OPTIONS")
        .uri("/echo")
        .header(header::ORIGIN, "https://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = send(&app, request).await;
    assert!(status.is_success());
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

// -- Admission control -------------------------------------------------------

#[tokio::test]
async fn rate_limit_rejects_before_the_handler_runs() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "count.route.yaml",
        "method: GET\npath: /count\nhandler: count\n",
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let catalog = HandlerCatalog::new().handler("count", move |_ctx: RequestContext| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AppError>(Reply::no_content())
        }
    });
    let table = RoutingTable::load(catalog, dir.path()).await.unwrap();
    let config = AppConfig {
        rate_limit: RateLimitSettings {
            max_requests: 1,
            window: Duration::from_secs(60),
        },
        ..config(RunMode::Development)
    };
    let app = Pipeline::new(&config, Arc::new(ServiceRegistry::empty())).build(table);

    let (first, _, _) = send(&app, get("/count")).await;
    let (second, headers, body) = send(&app, get("/count")).await;

    assert_eq!(first, StatusCode::NO_CONTENT);
    assert_eq!(second, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Too many requests, please try again later.");
    assert!(headers.contains_key(header::RETRY_AFTER));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let config = AppConfig {
        body_limit_bytes: 16,
        ..config(RunMode::Development)
    };
    let app = bundled_app(&config).await;
    let (status, _, body) = send(&app, post_json("/echo", json!({"message": "x".repeat(64)}))).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(body["message"].is_string());
}

// -- Route middleware --------------------------------------------------------

#[tokio::test]
async fn route_middleware_sees_params_and_query() {
    let dir = tempfile::tempdir().unwrap();
    write(
        dir.path(),
        "greet/greet.route.yaml",
        "method: GET\npath: /greet/:name\nhandler: greet\nmiddleware: [shout]\n",
    );
    let catalog = HandlerCatalog::new()
        .handler("greet", |ctx: RequestContext| async move {
            let name = ctx.param("name").unwrap_or_default().to_string();
            let punct = ctx.query("punct").unwrap_or(".").to_string();
            Ok::<_, AppError>(Reply::ok(json!({
                "greeting": format!("hello {name}{punct}"),
                "component": ctx.component(),
            })))
        })
        .middleware("shout", |ctx: RequestContext, next: RouteNext| async move {
            let reply = next.run(ctx).await?;
            Ok::<_, AppError>(match reply {
                Reply::Json { status, data } => Reply::Json {
                    status,
                    data: json!({ "shouted": data }),
                },
                other => other,
            })
        });
    let table = RoutingTable::load(catalog, dir.path()).await.unwrap();
    let app = Pipeline::new(&config(RunMode::Test), Arc::new(ServiceRegistry::empty())).build(table);

    let (status, _, body) = send(&app, get("/greet/ada?punct=!")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["shouted"]["greeting"], "hello ada!");
    assert_eq!(body["data"]["shouted"]["component"], "greet");
}

#[tokio::test]
async fn require_json_rejects_form_bodies() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let request = Request::builder()
        .method("POST")
        .uri("/users")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from("name=ada"))
        .unwrap();
    let (status, _, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNSUPPORTED_MEDIA_TYPE);
}

#[tokio::test]
async fn user_creation_has_a_strict_limit() {
    let app = bundled_app(&config(RunMode::Development)).await;
    for _ in 0..30 {
        let (status, _, _) = send(&app, post_json("/users", json!({"name": "ada"}))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    let (status, _, body) = send(&app, post_json("/users", json!({"name": "ada"}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["message"], "Too many API requests, please try again later.");

    // Other routes keep their own budget.
    let (status, _, _) = send(&app, get("/users")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

// -- Loading -----------------------------------------------------------------

#[tokio::test]
async fn duplicate_route_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let yaml = "method: GET\npath: /dup\nhandler: hello.echo\n";
    write(dir.path(), "a/one.route.yaml", yaml);
    write(dir.path(), "b/two.route.yaml", yaml);
    let catalog = components::catalog(RunMode::Test, Arc::new(ServiceRegistry::empty()));

    let err = RoutingTable::load(catalog, dir.path()).await.unwrap_err();
    assert!(matches!(err, LoadError::DuplicateRoute { .. }), "{err}");
}

#[tokio::test]
async fn descriptor_without_handler_fails_to_load() {
    let dir = tempfile::tempdir().unwrap();
    write(dir.path(), "x.route.yaml", "method: GET\npath: /x\n");
    let catalog = components::catalog(RunMode::Test, Arc::new(ServiceRegistry::empty()));

    let err = RoutingTable::load(catalog, dir.path()).await.unwrap_err();
    assert!(matches!(err, LoadError::MissingField { .. }), "{err}");
}

#[tokio::test]
async fn bundled_descriptors_cover_the_catalog() {
    let registry = Arc::new(ServiceRegistry::empty());
    let catalog = components::catalog(RunMode::Test, registry);
    let handlers: Vec<String> = catalog.handler_names().map(str::to_string).collect();
    let table = RoutingTable::load(catalog, BUNDLED).await.unwrap();

    let mut routed: Vec<String> = table
        .routes()
        .iter()
        .map(|r| r.descriptor.handler.clone())
        .collect();
    routed.sort();
    assert_eq!(routed, handlers);
}

// -- Documentation -----------------------------------------------------------

#[tokio::test]
async fn docs_are_served_outside_production() {
    let app = bundled_app(&config(RunMode::Development)).await;
    let (status, _, spec) = send(&app, get("/docs/openapi.json")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(spec["paths"]["/users/{id}"]["get"]["operationId"], "users.get");

    let (status, headers, _) = send(&app, get("/docs")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers[header::CONTENT_TYPE].to_str().unwrap().starts_with("text/html"));
}

#[tokio::test]
async fn docs_are_hidden_in_production() {
    let app = bundled_app(&config(RunMode::Production)).await;
    let (status, _, _) = send(&app, get("/docs/openapi.json")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
