//! Handler registry for dispatching relayed requests by method and path.
//!
//! Routes are registered with a method and a path pattern whose `:name`
//! segments capture parameters. Patterns are tried in registration order and
//! the query string is ignored when matching.
//!
//! # Example
//!
//! ```ignore
//! use relaywire::worker::{HandlerRegistry, ResponseKind};
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register("GET", "/api/projects/:encoded_project_name/histories", ResponseKind::Unary,
//!     |_: (), ctx| async move {
//!         let project = ctx.param("encoded_project_name").unwrap_or_default().to_string();
//!         ctx.respond(&serde_json::json!({ "project": project, "sessions": [] })).await
//!     });
//!
//! assert_eq!(registry.capabilities(), vec!["histories".to_string()]);
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::{Phase, RequestContext};
use crate::error::{RelaywireError, Result};
use crate::protocol::ApiRequest;

/// Result type for handler functions.
pub type HandlerResult = Result<()>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for handler functions.
pub trait Handler: Send + Sync + 'static {
    /// Handle a request with its raw JSON body.
    fn call(&self, body: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Wrapper that deserializes the request body before calling the handler.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    /// Create a new typed handler.
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, body: Value, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match serde_json::from_value(body) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(RelaywireError::Json(e)) }),
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

/// How a route answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    /// A single `api_response`.
    Unary,
    /// `streaming_start`, chunks, `streaming_end`.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

fn parse_pattern(pattern: &str) -> Vec<Segment> {
    split_path(pattern)
        .map(|s| match s.strip_prefix(':') {
            Some(name) => Segment::Param(name.to_string()),
            None => Segment::Literal(s.to_string()),
        })
        .collect()
}

fn split_path(path: &str) -> impl Iterator<Item = &str> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/').filter(|s| !s.is_empty())
}

struct Route {
    method: String,
    segments: Vec<Segment>,
    kind: ResponseKind,
    handler: Box<dyn Handler>,
}

impl Route {
    fn matches(&self, method: &str, path: &str) -> Option<HashMap<String, String>> {
        if !self.method.eq_ignore_ascii_case(method) {
            return None;
        }

        let mut params = HashMap::new();
        let mut parts = split_path(path);
        for segment in &self.segments {
            let part = parts.next()?;
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        if parts.next().is_some() {
            return None;
        }
        Some(params)
    }

    fn capability(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|s| match s {
            Segment::Literal(lit) => Some(lit.as_str()),
            Segment::Param(_) => None,
        })
    }
}

/// Registry mapping method + path patterns to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: Vec<Route>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler.
    ///
    /// # Arguments
    ///
    /// * `method` - HTTP method, matched case-insensitively
    /// * `pattern` - Path pattern, e.g. `/api/abort/:request_id`
    /// * `kind` - How the handler answers
    /// * `handler` - Handler function that takes (T, RequestContext) and returns Result<()>
    pub fn register<F, T, Fut>(&mut self, method: &str, pattern: &str, kind: ResponseKind, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.routes.push(Route {
            method: method.to_ascii_uppercase(),
            segments: parse_pattern(pattern),
            kind,
            handler: Box::new(TypedHandler::new(handler)),
        });
    }

    /// Capability names: the last literal segment of each route, deduplicated.
    pub fn capabilities(&self) -> Vec<String> {
        let mut capabilities: Vec<String> = Vec::new();
        for cap in self.routes.iter().filter_map(Route::capability) {
            if !capabilities.iter().any(|c| c == cap) {
                capabilities.push(cap.to_string());
            }
        }
        capabilities
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Check if no route is registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Dispatch a request to the matching handler and make sure it is answered.
    ///
    /// Unmatched requests are answered with 404. A failing handler is answered
    /// with 500, or with an error that force-closes its open stream. A stream
    /// handler that returns without ending its stream gets it ended.
    pub async fn dispatch(&self, request: ApiRequest, ctx: RequestContext) -> Result<()> {
        let Some((route, params)) = self
            .routes
            .iter()
            .find_map(|r| r.matches(&request.method, &request.path).map(|p| (r, p)))
        else {
            tracing::debug!(job = %ctx.request_id(), method = %request.method, path = %request.path, "No route");
            return ctx.error("Not found", 404).await;
        };

        let ctx = ctx.with_params(params);
        let result = route.handler.call(request.body, ctx.clone()).await;
        finish(route.kind, &ctx, result).await
    }
}

async fn finish(kind: ResponseKind, ctx: &RequestContext, result: HandlerResult) -> Result<()> {
    match (result, ctx.phase()) {
        (Ok(()), Phase::Done) => Ok(()),
        (Ok(()), Phase::Streaming) => ctx.end().await,
        (Ok(()), Phase::Idle) => match kind {
            ResponseKind::Stream => ctx.end().await,
            ResponseKind::Unary => {
                ctx.error("Handler returned without responding", 500).await?;
                Err(RelaywireError::Handler(format!(
                    "request {} returned without responding",
                    ctx.request_id()
                )))
            }
        },
        (Err(e), Phase::Done) => Err(e),
        (Err(e), _) => {
            ctx.error(e.to_string(), 500).await?;
            Err(e)
        }
    }
}
