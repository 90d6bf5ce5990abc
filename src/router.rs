//! REST-style routing: URL pattern compilation and first-match dispatch.
//!
//! Patterns are `/`-separated fragments: literals match exactly, `:name`
//! captures one fragment, a trailing `?` on a named parameter makes it
//! optional, and `*` captures any single fragment positionally. Routes are
//! tried in insertion order per method; the first match wins. The compiled
//! tables freeze into a shared handler before the server starts, so every
//! worker reads them without locking.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::Error;
use crate::http::{self, Code, HttpHandler, ResponseWriter};
use crate::metrics;

const NOT_FOUND_BODY: &str = "Could not find a matching route";

/// A captured URL parameter: raw text plus the name it was captured under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedParam {
    name: String,
    value: String,
}

impl TypedParam {
    pub(crate) fn new(name: impl Into<String>, value: impl Into<String>) -> TypedParam {
        TypedParam {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Convert the raw text to `T`, failing with a parse error on malformed
    /// input.
    pub fn parse<T: FromStr>(&self) -> Result<T, Error> {
        self.value
            .parse()
            .map_err(|_| Error::ParamParse(self.value.clone()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FragmentKind {
    Fixed,
    Parameter,
    Splat,
}

/// One compiled `/`-delimited segment of a route pattern.
#[derive(Debug, Clone)]
struct Fragment {
    value: String,
    kind: FragmentKind,
    optional: bool,
}

impl Fragment {
    fn parse(raw: &str) -> Result<Fragment, Error> {
        if raw.is_empty() {
            return Err(Error::InvalidPattern("empty fragment".into()));
        }

        let (kind, optional, value) = if let Some(stripped) = raw.strip_suffix('?') {
            if !stripped.starts_with(':') || stripped.len() < 2 {
                return Err(Error::InvalidPattern(format!(
                    "'?' is only valid on a named parameter: {raw}"
                )));
            }
            (FragmentKind::Parameter, true, stripped.to_string())
        } else if raw.starts_with(':') {
            if raw.len() < 2 {
                return Err(Error::InvalidPattern("parameter without a name".into()));
            }
            (FragmentKind::Parameter, false, raw.to_string())
        } else if raw.contains('*') {
            if raw != "*" {
                return Err(Error::InvalidPattern(format!(
                    "'*' must be a whole fragment: {raw}"
                )));
            }
            (FragmentKind::Splat, false, "*".to_string())
        } else {
            (FragmentKind::Fixed, false, raw.to_string())
        };

        // '?' anywhere but the end of a parameter is an error.
        if value.contains('?') {
            return Err(Error::InvalidPattern(format!(
                "'?' must be the final character: {raw}"
            )));
        }

        Ok(Fragment {
            value,
            kind,
            optional,
        })
    }

    fn matches(&self, request_fragment: &str) -> bool {
        match self.kind {
            FragmentKind::Fixed => self.value == request_fragment,
            FragmentKind::Parameter | FragmentKind::Splat => true,
        }
    }

    fn is_parameter(&self) -> bool {
        self.kind == FragmentKind::Parameter
    }

    fn is_optional(&self) -> bool {
        self.is_parameter() && self.optional
    }

    fn is_splat(&self) -> bool {
        self.kind == FragmentKind::Splat
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.optional {
            write!(f, "{}?", self.value)
        } else {
            f.write_str(&self.value)
        }
    }
}

fn split_fragments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|segment| !segment.is_empty())
}

/// Boxed per-route callback.
pub type RouteHandler = Arc<dyn Fn(Request, ResponseWriter) + Send + Sync>;

/// One compiled route: a method, an ordered fragment sequence, a handler.
pub struct Route {
    method: http::Method,
    fragments: Vec<Fragment>,
    handler: RouteHandler,
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("fragments", &self.fragments)
            .finish_non_exhaustive()
    }
}

impl Route {
    fn new(method: http::Method, pattern: &str, handler: RouteHandler) -> Result<Route, Error> {
        let fragments = split_fragments(pattern)
            .map(Fragment::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Route {
            method,
            fragments,
            handler,
        })
    }

    /// Match a request path, capturing named parameters and splats.
    /// Deterministic and independent of any other route.
    pub(crate) fn match_path(&self, path: &str) -> Option<(Vec<TypedParam>, Vec<TypedParam>)> {
        let request_fragments: Vec<&str> = split_fragments(path).collect();
        if request_fragments.len() > self.fragments.len() {
            return None;
        }

        let mut params = Vec::new();
        let mut splats = Vec::new();

        for (i, fragment) in self.fragments.iter().enumerate() {
            match request_fragments.get(i) {
                None => {
                    // Missing tail fragments are fine only while optional.
                    if fragment.is_optional() {
                        continue;
                    }
                    return None;
                }
                Some(request_fragment) => {
                    if !fragment.matches(request_fragment) {
                        return None;
                    }
                    if fragment.is_parameter() {
                        params.push(TypedParam::new(fragment.value.clone(), *request_fragment));
                    } else if fragment.is_splat() {
                        splats.push(TypedParam::new(*request_fragment, *request_fragment));
                    }
                }
            }
        }

        Some((params, splats))
    }

    /// Canonical pattern text rebuilt from the compiled fragments.
    pub fn pattern(&self) -> String {
        if self.fragments.is_empty() {
            return "/".to_string();
        }
        let mut out = String::new();
        for fragment in &self.fragments {
            out.push('/');
            out.push_str(&fragment.to_string());
        }
        out
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.pattern())
    }
}

/// A request routed to a handler, extending the HTTP request with the
/// parameters and splats its route captured.
pub struct Request {
    inner: http::Request,
    params: Vec<TypedParam>,
    splats: Vec<TypedParam>,
}

impl Request {
    pub fn has_param(&self, name: &str) -> bool {
        self.params.iter().any(|p| p.name() == name)
    }

    /// Named parameter lookup; names keep their leading colon, e.g.
    /// `request.param(":name")`.
    pub fn param(&self, name: &str) -> Result<&TypedParam, Error> {
        self.params
            .iter()
            .find(|p| p.name() == name)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Positional splat captures, in path order.
    pub fn splats(&self) -> &[TypedParam] {
        &self.splats
    }

    pub fn splat_at(&self, index: usize) -> Result<&TypedParam, Error> {
        self.splats
            .get(index)
            .ok_or_else(|| Error::UnknownParameter(format!("splat #{index}")))
    }
}

impl std::ops::Deref for Request {
    type Target = http::Request;

    fn deref(&self) -> &http::Request {
        &self.inner
    }
}

/// Route table builder. Register routes, then freeze with
/// [`into_handler`](Router::into_handler); the resulting handler is
/// immutable and shared by every worker.
#[derive(Default)]
pub struct Router {
    routes: HashMap<http::Method, Vec<Route>>,
}

impl Router {
    pub fn new() -> Router {
        Router::default()
    }

    pub fn get<F>(&mut self, pattern: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
    {
        self.add_route(http::Method::Get, pattern, Arc::new(handler))
    }

    pub fn post<F>(&mut self, pattern: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
    {
        self.add_route(http::Method::Post, pattern, Arc::new(handler))
    }

    pub fn put<F>(&mut self, pattern: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
    {
        self.add_route(http::Method::Put, pattern, Arc::new(handler))
    }

    pub fn delete<F>(&mut self, pattern: &str, handler: F) -> Result<(), Error>
    where
        F: Fn(Request, ResponseWriter) + Send + Sync + 'static,
    {
        self.add_route(http::Method::Delete, pattern, Arc::new(handler))
    }

    pub fn add_route(
        &mut self,
        method: http::Method,
        pattern: &str,
        handler: RouteHandler,
    ) -> Result<(), Error> {
        let route = Route::new(method, pattern, handler)?;
        self.routes.entry(method).or_default().push(route);
        Ok(())
    }

    /// Freeze the table into the request handler installed on an endpoint.
    pub fn into_handler(self) -> Arc<RouterHandler> {
        Arc::new(RouterHandler {
            routes: self.routes,
        })
    }
}

/// Frozen route tables; read-only after construction.
pub struct RouterHandler {
    routes: HashMap<http::Method, Vec<Route>>,
}

impl HttpHandler for RouterHandler {
    fn on_request(&self, request: http::Request, response: ResponseWriter) {
        if let Some(routes) = self.routes.get(&request.method()) {
            for route in routes {
                if let Some((params, splats)) = route.match_path(request.resource()) {
                    metrics::REQUESTS_ROUTED.increment();
                    let routed = Request {
                        inner: request,
                        params,
                        splats,
                    };
                    (route.handler)(routed, response);
                    return;
                }
            }
        }

        metrics::REQUESTS_UNMATCHED.increment();
        let _ = response.send(Code::NotFound, NOT_FOUND_BODY);
    }
}
