//! # Route Loader
//!
//! Discovers `*.route.yaml` descriptors below the components directory,
//! validates each one against the [`HandlerCatalog`], and collects the
//! results into a [`RoutingTable`]. Loading is all-or-nothing: the first
//! invalid descriptor aborts with a [`LoadError`] naming its file, and no
//! router is produced.
//!
//! Discovery is depth-first with siblings visited in lexicographic order,
//! so the registration order (and any error reported) is stable across
//! platforms.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{ConnectInfo, FromRequestParts, RawPathParams, Request};
use axum::http::Method;
use axum::response::{IntoResponse, Response};
use axum::routing::{MethodRouter, Router};
use serde::Serialize;
use thiserror::Error;
use trellis_core::Logger;
use trellis_services::ServiceClients;

use crate::catalog::{HandlerCatalog, RouteHandler, RouteMiddleware, RouteNext};
use crate::context::{ParsedBody, RequestContext, RequestId};
use crate::descriptor::{DescriptorError, RawDescriptor, RouteDescriptor};

/// Component name for descriptors placed directly in the components root.
pub const ROOT_COMPONENT: &str = "(root)";

/// Paths owned by the pipeline itself.
pub const RESERVED_PATHS: [&str; 3] = ["/docs", "/docs/openapi.json", "/metrics"];

const LOG: Logger = Logger::new("router");

/// Why loading the routing table failed.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("components directory {} does not exist", path.display())]
    ComponentsDirMissing { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid descriptor: {source}", file.display())]
    Parse {
        file: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: missing required field `{field}`", file.display())]
    MissingField { file: PathBuf, field: &'static str },

    #[error("{}: unsupported method {method:?}", file.display())]
    UnsupportedMethod { file: PathBuf, method: String },

    #[error("{}: invalid path {path:?}: {reason}", file.display())]
    InvalidPath {
        file: PathBuf,
        path: String,
        reason: String,
    },

    #[error("{}: handler {name:?} is not in the catalog", file.display())]
    UnknownHandler { file: PathBuf, name: String },

    #[error("{}: middleware {name:?} is not in the catalog", file.display())]
    UnknownMiddleware { file: PathBuf, name: String },

    #[error("{}: path {path} is reserved", file.display())]
    ReservedPath { file: PathBuf, path: String },

    #[error("{}: {method} {path} is already declared by {}", file.display(), first.display())]
    DuplicateRoute {
        file: PathBuf,
        first: PathBuf,
        method: Method,
        path: String,
    },

    #[error(
        "{}: path {path} conflicts with {existing} declared by {}",
        file.display(),
        first.display()
    )]
    ConflictingPattern {
        file: PathBuf,
        first: PathBuf,
        path: String,
        existing: String,
    },
}

impl LoadError {
    fn from_descriptor(file: &Path, err: DescriptorError) -> Self {
        let file = file.to_path_buf();
        match err {
            DescriptorError::MissingField(field) => Self::MissingField { file, field },
            DescriptorError::UnsupportedMethod(method) => Self::UnsupportedMethod { file, method },
            DescriptorError::InvalidPath { path, reason } => Self::InvalidPath { file, path, reason },
        }
    }
}

/// One row of the startup route audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RouteAudit {
    pub method: String,
    pub path: String,
    pub component: String,
}

/// A registered route with its resolved handler and middleware chain.
#[derive(Clone)]
pub struct RouteEntry {
    pub descriptor: RouteDescriptor,
    pub component: String,
    pub origin: PathBuf,
    handler: Arc<dyn RouteHandler>,
    chain: Arc<[Arc<dyn RouteMiddleware>]>,
}

impl std::fmt::Debug for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEntry")
            .field("method", &self.descriptor.method)
            .field("path", &self.descriptor.pattern.as_str())
            .field("component", &self.component)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Validated routes in discovery order.
#[derive(Debug)]
pub struct RoutingTable {
    catalog: HandlerCatalog,
    routes: Vec<RouteEntry>,
    // (method, router path) -> index into `routes`
    declared: HashMap<(Method, String), usize>,
}

impl RoutingTable {
    pub fn new(catalog: HandlerCatalog) -> Self {
        Self {
            catalog,
            routes: Vec::new(),
            declared: HashMap::new(),
        }
    }

    /// Builds a table from every descriptor below `root`.
    pub async fn load(catalog: HandlerCatalog, root: impl AsRef<Path>) -> Result<Self, LoadError> {
        let mut table = Self::new(catalog);
        table.load_dir(root.as_ref()).await?;
        Ok(table)
    }

    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Walks `root` and registers every descriptor found. Returns the
    /// number of routes added.
    pub async fn load_dir(&mut self, root: &Path) -> Result<usize, LoadError> {
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(LoadError::ComponentsDirMissing {
                    path: root.to_path_buf(),
                })
            }
        }

        let before = self.routes.len();
        let mut stack = vec![(root.to_path_buf(), true)];

        while let Some((path, is_dir)) = stack.pop() {
            if !is_dir {
                let component = component_of(root, &path);
                self.load_file(&path, component).await?;
                continue;
            }

            let mut entries = Vec::new();
            let mut dir = tokio::fs::read_dir(&path).await.map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })?;
            while let Some(entry) = dir.next_entry().await.map_err(|source| LoadError::Io {
                path: path.clone(),
                source,
            })? {
                let file_type = entry.file_type().await.map_err(|source| LoadError::Io {
                    path: entry.path(),
                    source,
                })?;
                if file_type.is_dir() {
                    entries.push((entry.path(), true));
                } else if file_type.is_file() && is_descriptor(&entry.path()) {
                    entries.push((entry.path(), false));
                }
            }

            // Reverse so the smallest name is popped first.
            entries.sort_by(|a, b| b.0.file_name().cmp(&a.0.file_name()));
            stack.extend(entries);
        }

        let added = self.routes.len() - before;
        LOG.debug(format!("loaded {added} route(s) from {}", root.display()));
        Ok(added)
    }

    async fn load_file(&mut self, file: &Path, component: String) -> Result<(), LoadError> {
        let text = tokio::fs::read_to_string(file).await.map_err(|source| LoadError::Io {
            path: file.to_path_buf(),
            source,
        })?;
        let raw: RawDescriptor = serde_yaml::from_str(&text).map_err(|source| LoadError::Parse {
            file: file.to_path_buf(),
            source,
        })?;
        let descriptor = raw
            .validate()
            .map_err(|err| LoadError::from_descriptor(file, err))?;
        self.register(descriptor, component, file)
    }

    /// Adds one validated descriptor. `origin` is reported in errors and
    /// need not be a real file.
    pub fn register(
        &mut self,
        descriptor: RouteDescriptor,
        component: impl Into<String>,
        origin: impl Into<PathBuf>,
    ) -> Result<(), LoadError> {
        let origin = origin.into();

        let handler = self
            .catalog
            .resolve_handler(&descriptor.handler)
            .ok_or_else(|| LoadError::UnknownHandler {
                file: origin.clone(),
                name: descriptor.handler.clone(),
            })?;

        let chain = descriptor
            .middleware
            .iter()
            .map(|name| {
                self.catalog
                    .resolve_middleware(name)
                    .ok_or_else(|| LoadError::UnknownMiddleware {
                        file: origin.clone(),
                        name: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let router_path = descriptor.pattern.to_router_path();
        if RESERVED_PATHS.contains(&router_path.as_str()) {
            return Err(LoadError::ReservedPath {
                file: origin,
                path: descriptor.pattern.to_string(),
            });
        }

        let key = (descriptor.method.clone(), router_path.clone());
        if let Some(&index) = self.declared.get(&key) {
            return Err(LoadError::DuplicateRoute {
                file: origin,
                first: self.routes[index].origin.clone(),
                method: descriptor.method,
                path: descriptor.pattern.to_string(),
            });
        }

        if let Some(existing) = self
            .routes
            .iter()
            .find(|route| route.descriptor.pattern.conflicts_with(&descriptor.pattern))
        {
            return Err(LoadError::ConflictingPattern {
                file: origin,
                first: existing.origin.clone(),
                path: descriptor.pattern.to_string(),
                existing: existing.descriptor.pattern.to_string(),
            });
        }

        self.declared.insert(key, self.routes.len());
        self.routes.push(RouteEntry {
            descriptor,
            component: component.into(),
            origin,
            handler,
            chain: chain.into(),
        });
        Ok(())
    }

    /// Routes sorted by component, then path.
    pub fn audit(&self) -> Vec<RouteAudit> {
        let mut audit: Vec<RouteAudit> = self
            .routes
            .iter()
            .map(|route| RouteAudit {
                method: route.descriptor.method.to_string(),
                path: route.descriptor.pattern.to_string(),
                component: route.component.clone(),
            })
            .collect();
        audit.sort_by(|a, b| {
            (a.component.as_str(), a.path.as_str(), a.method.as_str())
                .cmp(&(b.component.as_str(), b.path.as_str(), b.method.as_str()))
        });
        audit
    }

    pub fn log_audit(&self) {
        let audit = self.audit();
        LOG.info(format!("{} route(s) registered", audit.len()));
        for row in &audit {
            tracing::info!(
                namespace = LOG.namespace(),
                method = %row.method,
                path = %row.path,
                component = %row.component,
                "route"
            );
        }
    }

    /// One axum route per distinct path, each method bound to its chain.
    pub fn into_router(self) -> Router {
        let mut by_path: Vec<(String, MethodRouter)> = Vec::new();

        for route in self.routes {
            let path = route.descriptor.pattern.to_router_path();
            let filter = route.descriptor.method_filter();
            let bound = Arc::new(BoundRoute {
                route: format!("{} {}", route.descriptor.method, route.descriptor.pattern),
                component: route.component,
                handler: route.handler,
                chain: route.chain,
            });
            let adapter = move |request: Request| {
                let bound = bound.clone();
                async move { bound.dispatch(request).await }
            };

            match by_path.iter_mut().find(|(p, _)| *p == path) {
                Some((_, method_router)) => {
                    let existing = std::mem::take(method_router);
                    *method_router = existing.on(filter, adapter);
                }
                None => by_path.push((path, axum::routing::on(filter, adapter))),
            }
        }

        by_path
            .into_iter()
            .fold(Router::new(), |router, (path, method_router)| {
                router.route(&path, method_router)
            })
    }
}

struct BoundRoute {
    route: String,
    component: String,
    handler: Arc<dyn RouteHandler>,
    chain: Arc<[Arc<dyn RouteMiddleware>]>,
}

impl BoundRoute {
    async fn dispatch(&self, request: Request) -> Response {
        let (mut parts, _body) = request.into_parts();

        let params = match RawPathParams::from_request_parts(&mut parts, &()).await {
            Ok(raw) => raw
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
            Err(_) => HashMap::new(),
        };
        let query = parts
            .uri
            .query()
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();

        let ctx = RequestContext {
            method: parts.method.clone(),
            path: parts.uri.path().to_string(),
            route: self.route.clone(),
            client: parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip()),
            component: self.component.clone(),
            params,
            query,
            body: parts.extensions.remove::<ParsedBody>().unwrap_or_default(),
            services: parts
                .extensions
                .remove::<ServiceClients>()
                .unwrap_or_else(ServiceClients::disabled),
            request_id: parts.extensions.get::<RequestId>().map(|id| id.0.clone()),
            headers: parts.headers,
        };

        let next = RouteNext::new(self.chain.clone(), self.handler.clone());
        match next.run(ctx).await {
            Ok(reply) => reply.into_response(),
            Err(err) => err.into_response(),
        }
    }
}

fn is_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(".route.yaml") || n.ends_with(".route.yml"))
}

fn component_of(root: &Path, file: &Path) -> String {
    let relative = file
        .parent()
        .and_then(|parent| parent.strip_prefix(root).ok())
        .map(|rel| {
            rel.components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    if relative.is_empty() {
        ROOT_COMPONENT.to_string()
    } else {
        relative
    }
}
