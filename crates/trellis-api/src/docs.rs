//! # API Documentation
//!
//! Builds an OpenAPI document from the routing table (descriptors carry an
//! optional `summary` and `tags`) and serves it with a Swagger UI page:
//!
//! - `GET /docs`: Swagger UI
//! - `GET /docs/openapi.json`: the document
//!
//! Mounted outside production only.

use std::sync::Arc;

use axum::http::{header, Method};
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use utoipa::openapi::path::{HttpMethod, OperationBuilder, ParameterBuilder, ParameterIn};
use utoipa::openapi::request_body::RequestBodyBuilder;
use utoipa::openapi::response::ResponseBuilder;
use utoipa::openapi::schema::{ObjectBuilder, Schema, Type};
use utoipa::openapi::{
    ComponentsBuilder, ContentBuilder, InfoBuilder, OpenApi, OpenApiBuilder, PathItem, PathsBuilder,
    Ref, RefOr, Required,
};

use crate::envelope::ErrorEnvelope;
use crate::error::FieldError;
use crate::loader::RoutingTable;

pub const DOCS_PATH: &str = "/docs";
pub const SPEC_PATH: &str = "/docs/openapi.json";

const SWAGGER_UI_VERSION: &str = "5.17.14";

fn http_method(method: &Method) -> HttpMethod {
    match *method {
        Method::POST => HttpMethod::Post,
        Method::PUT => HttpMethod::Put,
        Method::PATCH => HttpMethod::Patch,
        Method::DELETE => HttpMethod::Delete,
        Method::HEAD => HttpMethod::Head,
        Method::OPTIONS => HttpMethod::Options,
        _ => HttpMethod::Get,
    }
}

fn string_schema() -> RefOr<Schema> {
    RefOr::T(Schema::Object(ObjectBuilder::new().schema_type(Type::String).build()))
}

/// The OpenAPI document for every route in `table`.
pub fn openapi(table: &RoutingTable) -> OpenApi {
    let error_response = ResponseBuilder::new()
        .description("Error envelope")
        .content(
            "application/json",
            ContentBuilder::new()
                .schema(Some(Ref::from_schema_name("ErrorEnvelope")))
                .build(),
        )
        .build();

    let mut paths = PathsBuilder::new();
    for route in table.routes() {
        let descriptor = &route.descriptor;
        let mut operation = OperationBuilder::new()
            .operation_id(Some(descriptor.handler.clone()))
            .summary(descriptor.summary.clone())
            .tags(Some(if descriptor.tags.is_empty() {
                vec![route.component.clone()]
            } else {
                descriptor.tags.clone()
            }))
            .response("200", ResponseBuilder::new().description("Success").build())
            .response("default", error_response.clone());

        for name in descriptor.pattern.param_names() {
            operation = operation.parameter(
                ParameterBuilder::new()
                    .name(name)
                    .parameter_in(ParameterIn::Path)
                    .required(Required::True)
                    .schema(Some(string_schema())),
            );
        }

        if matches!(descriptor.method, Method::POST | Method::PUT | Method::PATCH) {
            operation = operation.request_body(Some(
                RequestBodyBuilder::new()
                    .content(
                        "application/json",
                        ContentBuilder::new()
                            .schema(Some(RefOr::T(Schema::Object(
                                ObjectBuilder::new().schema_type(Type::Object).build(),
                            ))))
                            .build(),
                    )
                    .build(),
            ));
        }

        paths = paths.path(
            descriptor.pattern.to_openapi_path(),
            PathItem::new(http_method(&descriptor.method), operation.build()),
        );
    }

    OpenApiBuilder::new()
        .info(
            InfoBuilder::new()
                .title("Trellis API")
                .version(env!("CARGO_PKG_VERSION"))
                .description(Some("Routes discovered from component descriptors."))
                .build(),
        )
        .paths(paths.build())
        .components(Some(
            ComponentsBuilder::new()
                .schema_from::<FieldError>()
                .schema_from::<ErrorEnvelope>()
                .build(),
        ))
        .build()
}

fn swagger_page() -> String {
    format!(
        r##"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8" />
  <title>Trellis API</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@{v}/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@{v}/swagger-ui-bundle.js"></script>
  <script>
    window.ui = SwaggerUIBundle({{ url: "{spec}", dom_id: "#swagger-ui" }});
  </script>
</body>
</html>"##,
        v = SWAGGER_UI_VERSION,
        spec = SPEC_PATH,
    )
}

/// Swagger UI needs the CDN and an inline bootstrap script.
const DOCS_CSP: &str = "default-src 'self';script-src 'self' 'unsafe-inline' https://unpkg.com;\
                        style-src 'self' 'unsafe-inline' https://unpkg.com;img-src 'self' data: https:";

/// Routes serving `doc` and its Swagger UI page.
pub fn router(doc: &OpenApi) -> Router {
    let spec: Arc<str> = match doc.to_json() {
        Ok(json) => json.into(),
        Err(err) => {
            tracing::error!(namespace = "docs", "failed to serialize OpenAPI document: {err}");
            Arc::from("{}")
        }
    };
    let page: Arc<str> = swagger_page().into();

    Router::new()
        .route(
            DOCS_PATH,
            get(move || {
                let page = page.clone();
                async move {
                    (
                        [(header::CONTENT_SECURITY_POLICY, DOCS_CSP)],
                        Html(page.to_string()),
                    )
                        .into_response()
                }
            }),
        )
        .route(
            SPEC_PATH,
            get(move || {
                let spec = spec.clone();
                async move { ([(header::CONTENT_TYPE, "application/json")], spec.to_string()).into_response() }
            }),
        )
}
