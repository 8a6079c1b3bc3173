//! # Built-in Components
//!
//! Handlers and route middleware shipped with the server. Descriptors under
//! the components directory refer to them by the names registered in
//! [`catalog`].
//!
//! | Name               | Route                         |
//! |--------------------|-------------------------------|
//! | `hello.index`      | `GET /`                       |
//! | `hello.echo`       | `POST /echo`                  |
//! | `health.liveness`  | `GET /health/liveness`        |
//! | `health.readiness` | `GET /health/readiness`       |
//! | `users.*`          | `/users`, `/users/:id`        |
//! | `cache.*`          | `/cache/:key`                 |
//! | `files.*`          | `/files/:name`                |
//!
//! Route middleware: `require-json`, `require-database`, `require-cache`,
//! `require-storage` and `rate-limit-strict` (30 requests a minute per
//! client and route).

use std::sync::Arc;

use trellis_core::RunMode;
use trellis_services::ServiceRegistry;

use crate::catalog::{HandlerCatalog, RouteNext};
use crate::context::RequestContext;
use crate::middleware::rate_limit::RateLimiter;

pub mod cache;
pub mod files;
pub mod guards;
pub mod health;
pub mod hello;
pub mod users;

/// Every built-in handler and route middleware.
pub fn catalog(mode: RunMode, registry: Arc<ServiceRegistry>) -> HandlerCatalog {
    let strict = RateLimiter::strict();
    HandlerCatalog::new()
        .handler("hello.index", move |ctx: RequestContext| hello::index(ctx, mode))
        .handler("hello.echo", hello::echo)
        .handler("health.liveness", health::liveness)
        .handler("health.readiness", move |ctx: RequestContext| {
            health::readiness(ctx, registry.clone())
        })
        .handler("users.list", users::list)
        .handler("users.create", users::create)
        .handler("users.get", users::get)
        .handler("users.update", users::update)
        .handler("users.delete", users::delete)
        .handler("cache.get", cache::get)
        .handler("cache.put", cache::put)
        .handler("cache.delete", cache::delete)
        .handler("files.put", files::put)
        .handler("files.get", files::get)
        .handler("files.delete", files::delete)
        .middleware("require-json", guards::require_json)
        .middleware("require-database", guards::require_database)
        .middleware("require-cache", guards::require_cache)
        .middleware("require-storage", guards::require_storage)
        .middleware("rate-limit-strict", move |ctx: RequestContext, next: RouteNext| {
            guards::rate_limit_strict(ctx, next, strict.clone())
        })
}
