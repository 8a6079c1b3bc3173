//! # Handler Catalog
//!
//! Route descriptors name their handler and per-route middleware; this
//! catalog is where those names resolve to compiled code. A descriptor
//! naming an entry that is not in the catalog fails to load.
//!
//! Per-route middleware is onion-shaped: each middleware receives the
//! context and a [`RouteNext`] it may run to continue the chain.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::context::RequestContext;
use crate::envelope::Reply;
use crate::error::AppError;

pub type HandlerResult = Result<Reply, AppError>;

/// The terminal step of a route.
pub trait RouteHandler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RouteHandler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(ctx))
    }
}

/// A step that runs before the handler and may short-circuit it.
pub trait RouteMiddleware: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext, next: RouteNext) -> BoxFuture<'static, HandlerResult>;
}

impl<F, Fut> RouteMiddleware for F
where
    F: Fn(RequestContext, RouteNext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext, next: RouteNext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self)(ctx, next))
    }
}

/// The remainder of a route's chain.
#[derive(Clone)]
pub struct RouteNext {
    chain: Arc<[Arc<dyn RouteMiddleware>]>,
    handler: Arc<dyn RouteHandler>,
    index: usize,
}

impl RouteNext {
    pub(crate) fn new(chain: Arc<[Arc<dyn RouteMiddleware>]>, handler: Arc<dyn RouteHandler>) -> Self {
        Self {
            chain,
            handler,
            index: 0,
        }
    }

    /// Runs the next middleware, or the handler once the chain is spent.
    pub async fn run(self, ctx: RequestContext) -> HandlerResult {
        match self.chain.get(self.index).cloned() {
            Some(middleware) => {
                let next = Self {
                    index: self.index + 1,
                    ..self
                };
                middleware.call(ctx, next).await
            }
            None => self.handler.call(ctx).await,
        }
    }
}

/// Named handlers and middleware available to route descriptors.
#[derive(Clone, Default)]
pub struct HandlerCatalog {
    handlers: BTreeMap<String, Arc<dyn RouteHandler>>,
    middleware: BTreeMap<String, Arc<dyn RouteMiddleware>>,
}

impl std::fmt::Debug for HandlerCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerCatalog")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("middleware", &self.middleware.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler under `name`, replacing any previous entry.
    pub fn handler(mut self, name: impl Into<String>, handler: impl RouteHandler) -> Self {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    /// Adds a route middleware under `name`, replacing any previous entry.
    pub fn middleware(mut self, name: impl Into<String>, middleware: impl RouteMiddleware) -> Self {
        self.middleware.insert(name.into(), Arc::new(middleware));
        self
    }

    /// Combines two catalogs; entries in `other` win on name clashes.
    pub fn merge(mut self, other: HandlerCatalog) -> Self {
        self.handlers.extend(other.handlers);
        self.middleware.extend(other.middleware);
        self
    }

    pub fn resolve_handler(&self, name: &str) -> Option<Arc<dyn RouteHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn resolve_middleware(&self, name: &str) -> Option<Arc<dyn RouteMiddleware>> {
        self.middleware.get(name).cloned()
    }

    pub fn handler_names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use parking_lot::Mutex;

    fn ctx() -> RequestContext {
        RequestContext::new(Method::GET, "/")
    }

    #[tokio::test]
    async fn middleware_runs_in_declared_order() {
        let trace = Arc::new(Mutex::new(Vec::new()));
        let record = |label: &'static str, trace: Arc<Mutex<Vec<&'static str>>>| {
            move |ctx: RequestContext, next: RouteNext| {
                let trace = trace.clone();
                async move {
                    trace.lock().push(label);
                    next.run(ctx).await
                }
            }
        };

        let handler_trace = trace.clone();
        let catalog = HandlerCatalog::new()
            .handler("h", move |_ctx: RequestContext| {
                let trace = handler_trace.clone();
                async move {
                    trace.lock().push("handler");
                    Ok::<_, AppError>(Reply::text("done"))
                }
            })
            .middleware("a", record("a", trace.clone()))
            .middleware("b", record("b", trace.clone()));

        let chain: Arc<[Arc<dyn RouteMiddleware>]> = vec![
            catalog.resolve_middleware("a").unwrap(),
            catalog.resolve_middleware("b").unwrap(),
        ]
        .into();
        let next = RouteNext::new(chain, catalog.resolve_handler("h").unwrap());
        next.run(ctx()).await.unwrap();

        assert_eq!(*trace.lock(), vec!["a", "b", "handler"]);
    }

    #[tokio::test]
    async fn middleware_can_short_circuit() {
        let catalog = HandlerCatalog::new()
            .handler("h", |_ctx: RequestContext| async {
                Ok::<_, AppError>(Reply::text("reached"))
            })
            .middleware("deny", |_ctx: RequestContext, _next: RouteNext| async {
                Err::<Reply, _>(AppError::status(StatusCode::FORBIDDEN, "denied"))
            });

        let chain: Arc<[Arc<dyn RouteMiddleware>]> =
            vec![catalog.resolve_middleware("deny").unwrap()].into();
        let result = RouteNext::new(chain, catalog.resolve_handler("h").unwrap())
            .run(ctx())
            .await;
        assert_eq!(result.unwrap_err().status_code(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn unknown_names_do_not_resolve() {
        let catalog = HandlerCatalog::new();
        assert!(catalog.resolve_handler("missing").is_none());
        assert!(catalog.resolve_middleware("missing").is_none());
    }
}
