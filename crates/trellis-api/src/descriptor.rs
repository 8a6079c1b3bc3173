//! # Route Descriptors
//!
//! A descriptor binds one HTTP method and path pattern to a named handler
//! plus an ordered list of named route middleware. On disk it is a YAML
//! file:
//!
//! ```yaml
//! method: GET
//! path: /users/:id
//! handler: users.get
//! middleware: [require-database]
//! summary: Fetch one user
//! tags: [Users]
//! ```
//!
//! Parsing happens in two steps. [`RawDescriptor`] accepts any shape with
//! every field optional so that a missing field is reported by name rather
//! than as a generic YAML error. [`RawDescriptor::validate`] then checks
//! the method and path grammar and produces a [`RouteDescriptor`].
//!
//! ## Path grammar
//!
//! - starts with `/`; `/` alone is the root
//! - no empty segments (`//`) and no trailing slash
//! - `:name` binds one segment; names are identifiers and unique per path
//! - `*name` binds the remainder and may only be the last segment
//! - literal segments may not contain `{`, `}`, `:` or `*`

use std::collections::HashSet;

use axum::http::Method;
use axum::routing::MethodFilter;
use serde::Deserialize;

/// Methods a descriptor may declare.
pub const SUPPORTED_METHODS: [&str; 7] = ["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD", "OPTIONS"];

/// Descriptor as read from disk, before validation.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawDescriptor {
    pub method: Option<String>,
    pub path: Option<String>,
    pub handler: Option<String>,
    #[serde(default)]
    pub middleware: Vec<String>,
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Why a descriptor failed validation. The loader adds the file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorError {
    MissingField(&'static str),
    UnsupportedMethod(String),
    InvalidPath { path: String, reason: String },
}

impl RawDescriptor {
    pub fn validate(self) -> Result<RouteDescriptor, DescriptorError> {
        let method = self
            .method
            .filter(|m| !m.trim().is_empty())
            .ok_or(DescriptorError::MissingField("method"))?;
        let path = self
            .path
            .filter(|p| !p.trim().is_empty())
            .ok_or(DescriptorError::MissingField("path"))?;
        let handler = self
            .handler
            .filter(|h| !h.trim().is_empty())
            .ok_or(DescriptorError::MissingField("handler"))?;

        let method = parse_method(&method)?;
        let pattern = PathPattern::parse(path.trim())?;

        Ok(RouteDescriptor {
            method,
            pattern,
            handler: handler.trim().to_string(),
            middleware: self.middleware,
            summary: self.summary,
            tags: self.tags,
        })
    }
}

fn parse_method(raw: &str) -> Result<Method, DescriptorError> {
    let upper = raw.trim().to_ascii_uppercase();
    if !SUPPORTED_METHODS.contains(&upper.as_str()) {
        return Err(DescriptorError::UnsupportedMethod(raw.to_string()));
    }
    Method::from_bytes(upper.as_bytes()).map_err(|_| DescriptorError::UnsupportedMethod(raw.to_string()))
}

/// A validated descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDescriptor {
    pub method: Method,
    pub pattern: PathPattern,
    pub handler: String,
    pub middleware: Vec<String>,
    pub summary: Option<String>,
    pub tags: Vec<String>,
}

impl RouteDescriptor {
    /// Validates a descriptor built in code.
    pub fn new(method: &str, path: &str, handler: &str) -> Result<Self, DescriptorError> {
        RawDescriptor {
            method: Some(method.to_string()),
            path: Some(path.to_string()),
            handler: Some(handler.to_string()),
            ..RawDescriptor::default()
        }
        .validate()
    }

    pub fn with_middleware(mut self, names: &[&str]) -> Self {
        self.middleware = names.iter().map(|n| n.to_string()).collect();
        self
    }

    pub fn method_filter(&self) -> MethodFilter {
        method_filter(&self.method)
    }
}

pub(crate) fn method_filter(method: &Method) -> MethodFilter {
    match *method {
        Method::GET => MethodFilter::GET,
        Method::POST => MethodFilter::POST,
        Method::PUT => MethodFilter::PUT,
        Method::PATCH => MethodFilter::PATCH,
        Method::DELETE => MethodFilter::DELETE,
        Method::HEAD => MethodFilter::HEAD,
        _ => MethodFilter::OPTIONS,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    Param(String),
    Wildcard(String),
}

/// A validated path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(raw: &str) -> Result<Self, DescriptorError> {
        let invalid = |reason: &str| DescriptorError::InvalidPath {
            path: raw.to_string(),
            reason: reason.to_string(),
        };

        if !raw.starts_with('/') {
            return Err(invalid("must start with '/'"));
        }
        if raw == "/" {
            return Ok(Self {
                raw: raw.to_string(),
                segments: Vec::new(),
            });
        }

        let parts: Vec<&str> = raw[1..].split('/').collect();
        let mut names = HashSet::new();
        let mut segments = Vec::with_capacity(parts.len());

        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() {
                return Err(invalid("contains an empty segment"));
            }
            let segment = if let Some(name) = part.strip_prefix(':') {
                Segment::Param(name.to_string())
            } else if let Some(name) = part.strip_prefix('*') {
                if i != parts.len() - 1 {
                    return Err(invalid("a wildcard must be the last segment"));
                }
                Segment::Wildcard(name.to_string())
            } else {
                if part.contains(['{', '}', ':', '*']) {
                    return Err(invalid("literal segments may not contain '{', '}', ':' or '*'"));
                }
                Segment::Literal(part.to_string())
            };

            if let Segment::Param(name) | Segment::Wildcard(name) = &segment {
                if !is_identifier(name) {
                    return Err(invalid(&format!("parameter name {name:?} is not an identifier")));
                }
                if !names.insert(name.clone()) {
                    return Err(invalid(&format!("parameter {name:?} appears more than once")));
                }
            }
            segments.push(segment);
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    /// The pattern as written in the descriptor.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// The pattern in the router's syntax: `:id` becomes `{id}` and
    /// `*rest` becomes `{*rest}`.
    pub fn to_router_path(&self) -> String {
        self.render(|seg| match seg {
            Segment::Literal(s) => s.clone(),
            Segment::Param(name) => format!("{{{name}}}"),
            Segment::Wildcard(name) => format!("{{*{name}}}"),
        })
    }

    /// The pattern in OpenAPI syntax, where a wildcard is a plain
    /// parameter.
    pub fn to_openapi_path(&self) -> String {
        self.render(|seg| match seg {
            Segment::Literal(s) => s.clone(),
            Segment::Param(name) | Segment::Wildcard(name) => format!("{{{name}}}"),
        })
    }

    /// Whether the router cannot hold both patterns. Walking both from the
    /// left, the first position where they differ decides: two distinct
    /// literals, or a literal against a parameter, diverge cleanly; a
    /// wildcard against anything else, or two parameter names, conflict.
    pub fn conflicts_with(&self, other: &PathPattern) -> bool {
        for (a, b) in self.segments.iter().zip(&other.segments) {
            match (a, b) {
                (Segment::Literal(x), Segment::Literal(y)) if x == y => continue,
                (Segment::Param(x), Segment::Param(y)) if x == y => continue,
                (Segment::Wildcard(x), Segment::Wildcard(y)) if x == y => continue,
                (Segment::Wildcard(_), _) | (_, Segment::Wildcard(_)) => return true,
                (Segment::Literal(_), _) | (_, Segment::Literal(_)) => return false,
                (Segment::Param(_), Segment::Param(_)) => return true,
            }
        }
        false
    }

    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|seg| match seg {
            Segment::Param(name) | Segment::Wildcard(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn render(&self, f: impl Fn(&Segment) -> String) -> String {
        if self.segments.is_empty() {
            return "/".to_string();
        }
        self.segments.iter().map(|s| format!("/{}", f(s))).collect()
    }
}

impl std::fmt::Display for PathPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn raw(yaml: &str) -> RawDescriptor {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn full_descriptor_validates() {
        let d = raw("method: get\npath: /users/:id\nhandler: users.get\nmiddleware: [require-database]\n")
            .validate()
            .unwrap();
        assert_eq!(d.method, Method::GET);
        assert_eq!(d.pattern.to_router_path(), "/users/{id}");
        assert_eq!(d.middleware, vec!["require-database"]);
    }

    #[test]
    fn missing_fields_are_named() {
        assert_eq!(
            raw("path: /x\nhandler: h\n").validate().unwrap_err(),
            DescriptorError::MissingField("method")
        );
        assert_eq!(
            raw("method: GET\nhandler: h\n").validate().unwrap_err(),
            DescriptorError::MissingField("path")
        );
        assert_eq!(
            raw("method: GET\npath: /x\n").validate().unwrap_err(),
            DescriptorError::MissingField("handler")
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<RawDescriptor>("method: GET\nhandlr: h\n").is_err());
    }

    #[test]
    fn unsupported_method() {
        assert!(matches!(
            RouteDescriptor::new("TRACE", "/", "h"),
            Err(DescriptorError::UnsupportedMethod(_))
        ));
    }

    #[test]
    fn path_rules() {
        for bad in ["users", "/users/", "/a//b", "/:", "/:1abc", "/:id/:id", "/*rest/more", "/a{b}", "/a:b"] {
            assert!(
                matches!(PathPattern::parse(bad), Err(DescriptorError::InvalidPath { .. })),
                "{bad} should be rejected"
            );
        }
        for good in ["/", "/echo", "/users/:id", "/files/*name", "/a/:b/c/:d_2"] {
            assert!(PathPattern::parse(good).is_ok(), "{good} should be accepted");
        }
    }

    #[test]
    fn router_and_openapi_paths() {
        let p = PathPattern::parse("/files/:bucket/*key").unwrap();
        assert_eq!(p.to_router_path(), "/files/{bucket}/{*key}");
        assert_eq!(p.to_openapi_path(), "/files/{bucket}/{key}");
        assert_eq!(p.param_names().collect::<Vec<_>>(), vec!["bucket", "key"]);
        assert_eq!(PathPattern::parse("/").unwrap().to_router_path(), "/");
    }

    fn conflict(a: &str, b: &str) -> bool {
        PathPattern::parse(a)
            .unwrap()
            .conflicts_with(&PathPattern::parse(b).unwrap())
    }

    #[test]
    fn dynamic_segments_at_the_same_position_must_agree() {
        assert!(conflict("/a/:x", "/a/*rest"));
        assert!(conflict("/a/*rest", "/a/:x/b"));
        assert!(conflict("/a/:x/b", "/a/:y/c"));
        assert!(conflict("/files/*key", "/files/*name"));
        assert!(conflict("/a/b", "/a/*rest"));

        assert!(!conflict("/a/:x", "/a/:x/*rest"));
        assert!(!conflict("/a/:x", "/a/b"));
        assert!(!conflict("/a/:x", "/b/*rest"));
        assert!(!conflict("/users/:id", "/users/:id"));
        assert!(!conflict("/", "/:x"));
    }

    proptest! {
        #[test]
        fn literal_paths_round_trip(segments in proptest::collection::vec("[a-z][a-z0-9_-]{0,8}", 1..5)) {
            let raw = format!("/{}", segments.join("/"));
            let pattern = PathPattern::parse(&raw).unwrap();
            prop_assert_eq!(pattern.to_router_path(), raw);
        }

        #[test]
        fn renamed_params_conflict(a in "[a-z_][a-z0-9_]{0,6}", b in "[a-z_][a-z0-9_]{0,6}") {
            let left = PathPattern::parse(&format!("/items/:{a}")).unwrap();
            let right = PathPattern::parse(&format!("/items/:{b}/detail")).unwrap();
            prop_assert_eq!(left.conflicts_with(&right), a != b);
            prop_assert_eq!(right.conflicts_with(&left), a != b);
        }
    }
}
