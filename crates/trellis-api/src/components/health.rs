//! Liveness and readiness checks.
//!
//! A failed readiness check is the one non-2xx response that does not use
//! the failure envelope. The body stays `{"data": report}` so the state of
//! each capability is visible to whoever polls it.

use std::sync::Arc;

use axum::http::StatusCode;
use serde_json::json;
use trellis_services::ServiceRegistry;

use crate::catalog::HandlerResult;
use crate::context::RequestContext;
use crate::envelope::Reply;

/// Always 200 while the process is serving.
pub async fn liveness(_ctx: RequestContext) -> HandlerResult {
    Ok(Reply::ok(json!({ "status": "ok" })))
}

/// Pings every enabled service, then reports. 503 when any capability
/// with the fatal startup policy is not ready; the report is the body
/// either way.
pub async fn readiness(_ctx: RequestContext, registry: Arc<ServiceRegistry>) -> HandlerResult {
    registry.health_check_all().await;
    let report = registry.status();
    let status = if report.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok(Reply::json(status, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Method;
    use trellis_core::{Capability, StartupPolicy};
    use trellis_services::{ManagedService, ServiceError, ServiceState};

    #[tokio::test]
    async fn empty_registry_is_ready() {
        let ctx = RequestContext::new(Method::GET, "/health/readiness");
        let reply = readiness(ctx, Arc::new(ServiceRegistry::empty())).await.unwrap();
        assert_eq!(reply.status(), StatusCode::OK);
    }

    /// A fatal database that never comes up.
    struct Stalled;

    #[async_trait::async_trait]
    impl ManagedService for Stalled {
        fn capability(&self) -> Capability {
            Capability::Database
        }

        fn state(&self) -> ServiceState {
            ServiceState::Degraded
        }

        fn last_error(&self) -> Option<ServiceError> {
            None
        }

        fn startup_policy(&self) -> StartupPolicy {
            StartupPolicy::Fatal
        }

        async fn connect(&self) -> Result<ServiceState, ServiceError> {
            Ok(ServiceState::Degraded)
        }

        async fn reconnect(&self) -> Result<ServiceState, ServiceError> {
            Ok(ServiceState::Degraded)
        }

        async fn health_check(&self) -> Result<ServiceState, ServiceError> {
            Ok(ServiceState::Degraded)
        }

        async fn close(&self) {}

        fn spawn_reconnect_if_due(self: Arc<Self>) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn fatal_service_down_is_503_with_report() {
        let registry = ServiceRegistry::builder().service(Arc::new(Stalled)).unwrap().build();
        let ctx = RequestContext::new(Method::GET, "/health/readiness");

        let reply = readiness(ctx, Arc::new(registry)).await.unwrap();

        assert_eq!(reply.status(), StatusCode::SERVICE_UNAVAILABLE);
        let Reply::Json { data, .. } = reply else {
            panic!("readiness replies with JSON");
        };
        assert_eq!(data["ready"], false);
        assert_eq!(data["services"][0]["capability"], "database");
        assert_eq!(data["services"][0]["state"], "degraded");
        assert_eq!(data["services"][0]["fatal"], true);
    }
}
