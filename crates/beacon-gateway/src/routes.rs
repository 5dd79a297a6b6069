//! Route table: maps (service, path, method) onto a message pattern.
//!
//! Patterns are classified and compiled once at registration time; matching
//! is a linear scan in declaration order, first match wins.

use std::collections::{HashMap, HashSet};

use dashmap::DashMap;
use regex::Regex;
use serde::Deserialize;

/// One declared route for a service.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutePattern {
    /// HTTP method, or `"*"` to match any.
    pub method: String,
    /// Literal path, `:param`-bearing path, or raw regex (starts with `/`
    /// and contains `(`).
    pub path: String,
    /// Message pattern invoked when this route matches, e.g. `auth.login`.
    pub message_pattern: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// The full ordered route list for one service.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceRouteConfig {
    pub service_name: String,
    pub routes: Vec<RoutePattern>,
}

/// Result of a successful route lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteMatch {
    pub message_pattern: String,
    pub path_params: HashMap<String, String>,
}

#[derive(Debug)]
enum RoutePatternKind {
    Literal(String),
    Param { regex: Regex, names: Vec<String> },
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledRoute {
    method: String,
    kind: RoutePatternKind,
    message_pattern: String,
}

impl CompiledRoute {
    /// Compiles a declared pattern. Invalid regexes are reported once here
    /// and the route is dropped, which is equivalent to never matching.
    fn compile(pattern: &RoutePattern) -> Option<Self> {
        let kind = if pattern.path.contains(':') {
            let (regex, names) = compile_param_pattern(&pattern.path)?;
            RoutePatternKind::Param { regex, names }
        } else if pattern.path.starts_with('/') && pattern.path.contains('(') {
            match Regex::new(&format!("^{}$", pattern.path)) {
                Ok(regex) => RoutePatternKind::Regex(regex),
                Err(e) => {
                    tracing::warn!(
                        path = %pattern.path,
                        error = %e,
                        "Invalid regex route pattern, route will never match"
                    );
                    return None;
                }
            }
        } else {
            RoutePatternKind::Literal(pattern.path.clone())
        };

        Some(Self {
            method: pattern.method.to_ascii_uppercase(),
            kind,
            message_pattern: pattern.message_pattern.clone(),
        })
    }

    fn matches_method(&self, method: &str) -> bool {
        self.method == "*" || self.method == "ALL" || self.method.eq_ignore_ascii_case(method)
    }

    fn match_path(&self, path: &str) -> Option<HashMap<String, String>> {
        match &self.kind {
            RoutePatternKind::Literal(literal) => (literal == path).then(HashMap::new),
            RoutePatternKind::Param { regex, names } => {
                let captures = regex.captures(path)?;
                let params = names
                    .iter()
                    .zip(captures.iter().skip(1))
                    .filter_map(|(name, capture)| {
                        capture.map(|c| (name.clone(), c.as_str().to_string()))
                    })
                    .collect();
                Some(params)
            }
            RoutePatternKind::Regex(regex) => regex.is_match(path).then(HashMap::new),
        }
    }
}

/// Compiles `/users/:id` into `^/users/([^/]+)$` plus the ordered parameter names.
fn compile_param_pattern(path: &str) -> Option<(Regex, Vec<String>)> {
    let mut names = Vec::new();
    let pattern: String = path
        .split('/')
        .map(|segment| {
            if let Some(name) = segment.strip_prefix(':') {
                names.push(name.to_string());
                "([^/]+)".to_string()
            } else {
                regex::escape(segment)
            }
        })
        .collect::<Vec<_>>()
        .join("/");

    match Regex::new(&format!("^{pattern}$")) {
        Ok(regex) => Some((regex, names)),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "Invalid param route pattern");
            None
        }
    }
}

/// In-memory mapping from service name to its compiled routes, plus the
/// capability cache maintained by the discovery client.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: DashMap<String, Vec<CompiledRoute>>,
    capabilities: DashMap<String, HashSet<String>>,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the route list for a service and derives its declared
    /// capability set from the message patterns.
    pub fn register_service_routes(&self, config: &ServiceRouteConfig) {
        let compiled: Vec<_> = config
            .routes
            .iter()
            .filter_map(CompiledRoute::compile)
            .collect();

        let declared: HashSet<String> = compiled
            .iter()
            .map(|r| r.message_pattern.clone())
            .collect();

        tracing::info!(
            service = %config.service_name,
            routes = compiled.len(),
            "Registered service routes"
        );

        self.routes.insert(config.service_name.clone(), compiled);
        self.capabilities
            .insert(config.service_name.clone(), declared);
    }

    /// First matching route in registration order, or `None`.
    pub fn find_route(&self, service: &str, path: &str, method: &str) -> Option<RouteMatch> {
        let routes = self.routes.get(service)?;

        for route in routes.iter() {
            if !route.matches_method(method) {
                continue;
            }
            if let Some(path_params) = route.match_path(path) {
                return Some(RouteMatch {
                    message_pattern: route.message_pattern.clone(),
                    path_params,
                });
            }
        }

        None
    }

    /// Overwrites the capability cache for a live service instance.
    pub fn update_service_capabilities(&self, service: &str, capabilities: &[String]) {
        let advertised: HashSet<String> = capabilities.iter().cloned().collect();

        if let Some(declared) = self.routes.get(service) {
            for route in declared.iter() {
                if !advertised.contains(&route.message_pattern) {
                    tracing::warn!(
                        service = %service,
                        pattern = %route.message_pattern,
                        "Declared route has no advertised capability"
                    );
                }
            }
        }

        self.capabilities.insert(service.to_string(), advertised);
    }

    /// Drops the capability cache for a vanished service; the route list
    /// itself stays, ready for the next instance.
    pub fn remove_service(&self, service: &str) {
        self.capabilities.remove(service);
    }

    pub fn capabilities(&self, service: &str) -> Option<HashSet<String>> {
        self.capabilities.get(service).map(|c| c.clone())
    }

    pub fn has_routes(&self, service: &str) -> bool {
        self.routes.contains_key(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(service: &str, routes: Vec<(&str, &str, &str)>) -> RouteTable {
        let table = RouteTable::new();
        table.register_service_routes(&ServiceRouteConfig {
            service_name: service.to_string(),
            routes: routes
                .into_iter()
                .map(|(method, path, pattern)| RoutePattern {
                    method: method.to_string(),
                    path: path.to_string(),
                    message_pattern: pattern.to_string(),
                    description: None,
                })
                .collect(),
        });
        table
    }

    #[test]
    fn literal_match() {
        let table = table_with("users", vec![("GET", "/", "users.listAll")]);

        let found = table.find_route("users", "/", "GET").unwrap();
        assert_eq!(found.message_pattern, "users.listAll");
        assert!(found.path_params.is_empty());
    }

    #[test]
    fn param_match_extracts_values() {
        let table = table_with("users", vec![("GET", "/users/:id", "users.getById")]);

        let found = table.find_route("users", "/users/abc123", "GET").unwrap();
        assert_eq!(found.message_pattern, "users.getById");
        assert_eq!(found.path_params["id"], "abc123");

        assert!(table.find_route("users", "/users/abc/extra", "GET").is_none());
    }

    #[test]
    fn multiple_params() {
        let table = table_with(
            "chat",
            vec![("GET", "/rooms/:room/messages/:id", "chat.getMessage")],
        );

        let found = table
            .find_route("chat", "/rooms/lobby/messages/42", "GET")
            .unwrap();
        assert_eq!(found.path_params["room"], "lobby");
        assert_eq!(found.path_params["id"], "42");
    }

    #[test]
    fn regex_match() {
        let table = table_with("files", vec![("GET", "/files/(.+\\.png)", "files.getPng")]);

        assert!(table.find_route("files", "/files/logo.png", "GET").is_some());
        assert!(table.find_route("files", "/files/logo.jpg", "GET").is_none());
    }

    #[test]
    fn invalid_regex_never_matches_but_other_routes_survive() {
        let table = table_with(
            "files",
            vec![
                ("GET", "/files/(unclosed", "files.broken"),
                ("GET", "/files", "files.list"),
            ],
        );

        assert!(table.find_route("files", "/files/(unclosed", "GET").is_none());
        assert!(table.find_route("files", "/files", "GET").is_some());
    }

    #[test]
    fn first_match_wins_in_registration_order() {
        let table = table_with(
            "users",
            vec![
                ("GET", "/users/me", "users.getSelf"),
                ("GET", "/users/:id", "users.getById"),
            ],
        );

        let found = table.find_route("users", "/users/me", "GET").unwrap();
        assert_eq!(found.message_pattern, "users.getSelf");

        let found = table.find_route("users", "/users/other", "GET").unwrap();
        assert_eq!(found.message_pattern, "users.getById");
    }

    #[test]
    fn method_filtering_and_wildcard() {
        let table = table_with(
            "users",
            vec![
                ("POST", "/users", "users.create"),
                ("*", "/anything", "users.any"),
            ],
        );

        assert!(table.find_route("users", "/users", "GET").is_none());
        assert!(table.find_route("users", "/users", "POST").is_some());
        assert!(table.find_route("users", "/anything", "DELETE").is_some());
    }

    #[test]
    fn unknown_service_returns_none() {
        let table = RouteTable::new();
        assert!(table.find_route("ghost", "/", "GET").is_none());
    }

    #[test]
    fn capabilities_derived_and_removable() {
        let table = table_with(
            "users",
            vec![
                ("GET", "/", "users.listAll"),
                ("GET", "/users/:id", "users.getById"),
            ],
        );

        let caps = table.capabilities("users").unwrap();
        assert!(caps.contains("users.listAll"));
        assert!(caps.contains("users.getById"));

        table.update_service_capabilities("users", &["users.listAll".to_string()]);
        let caps = table.capabilities("users").unwrap();
        assert_eq!(caps.len(), 1);

        table.remove_service("users");
        assert!(table.capabilities("users").is_none());
        // Route declarations survive instance churn.
        assert!(table.has_routes("users"));
        assert!(table.find_route("users", "/", "GET").is_some());
    }
}
