//! # Service Injection
//!
//! Puts a [`ServiceClients`] snapshot on every request. Degraded handles
//! whose backoff has elapsed get a background reconnect kicked off here,
//! so recovery is driven by traffic and never blocks the request.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use trellis_services::{ServiceClients, ServiceRegistry};

pub async fn inject_services(
    State(registry): State<Arc<ServiceRegistry>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = registry.reconnect_due();
    if started > 0 {
        tracing::debug!(namespace = "middleware:services", started, "background reconnects started");
    }
    request.extensions_mut().insert::<ServiceClients>(registry.clients());
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::middleware::from_fn_with_state;
    use axum::routing::get;
    use axum::{Extension, Router};
    use tower::ServiceExt;
    use trellis_core::Capability;

    #[tokio::test]
    async fn empty_registry_injects_disabled_clients() {
        let app = Router::new()
            .route(
                "/",
                get(|Extension(clients): Extension<ServiceClients>| async move {
                    clients.is_ready(Capability::Database).to_string()
                }),
            )
            .layer(from_fn_with_state(Arc::new(ServiceRegistry::empty()), inject_services));

        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }
}
