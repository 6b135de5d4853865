//! Explicit route table for the extender surface.
//!
//! Every route is registered once, up front. Duplicate or malformed paths
//! are rejected at registration instead of surfacing per request.

use std::collections::BTreeMap;

use error_stack::Report;
use poem::endpoint::BoxEndpoint;
use poem::{Endpoint, EndpointExt, IntoEndpoint, IntoResponse, Response, Route, RouteMethod};

use super::handlers;
use crate::error::{Result, ScheduleError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum Method {
    #[display("GET")]
    Get,
    #[display("POST")]
    Post,
}

struct Registered {
    method: Method,
    endpoint: BoxEndpoint<'static, Response>,
}

#[derive(Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Registered>,
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_map()
            .entries(self.routes.iter().map(|(path, r)| (path, r.method)))
            .finish()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every extender route.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::RouteConflict`] if two routes collide
    pub fn standard() -> Result<Self> {
        let mut table = Self::new();
        table.register("/validate", Method::Post, handlers::validate)?;
        table.register("/prescheduler", Method::Post, handlers::prescheduler)?;
        table.register("/filter", Method::Post, handlers::filter)?;
        table.register("/score", Method::Post, handlers::score)?;
        table.register("/bind", Method::Post, handlers::bind)?;
        table.register("/unbind", Method::Post, handlers::unbind)?;
        table.register("/nodes", Method::Post, handlers::upsert_node)?;
        table.register("/jobs/start", Method::Post, handlers::start_job)?;
        table.register("/jobs/delete", Method::Post, handlers::delete_job)?;
        table.register("/evictions", Method::Get, handlers::evictions)?;
        table.register("/healthz", Method::Get, handlers::healthz)?;
        Ok(table)
    }

    /// Add `endpoint` under `path`.
    ///
    /// # Errors
    ///
    /// - [`ScheduleError::RouteConflict`] if `path` is already registered or
    ///   is not an absolute path without blanks or empty segments
    pub fn register<E>(&mut self, path: &str, method: Method, endpoint: E) -> Result<()>
    where
        E: IntoEndpoint,
        E::Endpoint: 'static,
        <E::Endpoint as Endpoint>::Output: IntoResponse,
    {
        let conflict = |reason: &str| {
            Report::new(ScheduleError::RouteConflict {
                route: path.to_string(),
            })
            .attach_printable(reason.to_string())
        };
        if !path.starts_with('/') {
            return Err(conflict("route must start with '/'"));
        }
        if path.len() > 1 && (path.ends_with('/') || path.contains("//")) {
            return Err(conflict("route has an empty segment"));
        }
        if path.chars().any(char::is_whitespace) {
            return Err(conflict("route contains whitespace"));
        }
        if let Some(existing) = self.routes.get(path) {
            return Err(conflict(&format!("already registered for {}", existing.method)));
        }

        self.routes.insert(
            path.to_string(),
            Registered {
                method,
                endpoint: endpoint.into_endpoint().map_to_response().boxed(),
            },
        );
        Ok(())
    }

    pub fn paths(&self) -> impl Iterator<Item = (&str, Method)> + '_ {
        self.routes
            .iter()
            .map(|(path, registered)| (path.as_str(), registered.method))
    }

    pub fn into_route(self) -> Route {
        self.routes
            .into_iter()
            .fold(Route::new(), |route, (path, registered)| {
                let method = match registered.method {
                    Method::Get => RouteMethod::new().get(registered.endpoint),
                    Method::Post => RouteMethod::new().post(registered.endpoint),
                };
                route.at(path, method)
            })
    }
}
