//! # trellis-api: HTTP Request Pipeline
//!
//! Turns a directory of route descriptors into a running HTTP service.
//!
//! ## Request Flow
//!
//! normalizer → panic catcher → security headers → CORS → compression →
//! body parsing → rate limiting → service injection → route
//!
//! Routes come from `*.route.yaml` files below the components directory.
//! Each names a handler and an ordered list of route middleware from the
//! [`HandlerCatalog`]; the [`RoutingTable`] validates them at startup and
//! refuses to start on duplicates, unknown names or malformed paths.
//!
//! ## Responses
//!
//! Successful handlers return a [`Reply`] rendered as `{"data": ...}`.
//! Failures are [`AppError`]s, rendered once by the outermost normalizer
//! as `{"message", "details"?, "stack"?}` with the status on the response
//! line. `stack` only appears on 5xx responses outside production.
//!
//! ## Crate Policy
//!
//! - Handlers reach backing services only through [`RequestContext`].
//! - Every error response is produced by the normalizer.
//! - Shutdown is owned by a single [`ShutdownCoordinator`].

pub mod bootstrap;
pub mod catalog;
pub mod components;
pub mod context;
pub mod descriptor;
pub mod docs;
pub mod envelope;
pub mod error;
pub mod loader;
pub mod middleware;
pub mod pipeline;
pub mod shutdown;

pub use bootstrap::{build, run, serve, App, StartupError};
pub use catalog::{HandlerCatalog, HandlerResult, RouteNext};
pub use context::{ParsedBody, RequestContext};
pub use descriptor::{PathPattern, RouteDescriptor};
pub use envelope::{ErrorEnvelope, Reply};
pub use error::{AppError, FieldError, Validate};
pub use loader::{LoadError, RoutingTable};
pub use pipeline::Pipeline;
pub use shutdown::ShutdownCoordinator;
