//! # Middleware Modules
//!
//! The request-wide layers of the pipeline, outermost first:
//!
//! ```text
//! normalizer → (panic catcher) → security_headers → CORS → compression
//!            → body → rate_limit → services → docs / routes
//! ```
//!
//! CORS and compression come from `tower-http`; the rest are
//! `axum::middleware::from_fn` functions defined here. The order is fixed
//! by [`crate::pipeline::Pipeline::build`].

pub mod body;
pub mod normalizer;
pub mod rate_limit;
pub mod security_headers;
pub mod services;
