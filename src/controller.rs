//! Controllers
//!
//! A controller handles one delivery: it unifies params from the query
//! string, the path id and the body, runs its before-action filters,
//! dispatches the named action and renders a structured response.
//!
//! Controllers are declared as typed lists: actions, filters and rescue
//! handlers are registered on a [`ControllerDef`] rather than discovered,
//! and collected in a [`Registry`] the consumer resolves by the first path
//! segment of the virtual URL.
//!
//! # Examples
//!
//! ```rust
//! use dumq_rpc::controller::{ActionFuture, Context, ControllerDef};
//! use serde_json::json;
//!
//! fn ping(ctx: &mut Context) -> ActionFuture<'_> {
//!     Box::pin(async move {
//!         ctx.render("ok", json!({"message": "Pong!"}));
//!         Ok(())
//!     })
//! }
//!
//! let controller = ControllerDef::new("test_user").action("ping", ping);
//! ```
//!
//! A fresh [`Context`] is constructed per message and never reused across
//! deliveries.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use thiserror::Error;

use crate::request::Method;
use crate::response::{Response, Status};

/// Error type actions and filters may fail with.
pub type ActionError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one action or filter invocation.
pub type ActionResult = std::result::Result<(), ActionError>;

/// Boxed future returned by action handlers.
pub type ActionFuture<'a> = Pin<Box<dyn Future<Output = ActionResult> + Send + 'a>>;

type ActionHandler = Arc<dyn for<'a> Fn(&'a mut Context) -> ActionFuture<'a> + Send + Sync>;

/// Metadata of the delivery a controller is handling.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub method: Method,
    /// The virtual URL from the AMQP `type` property.
    pub kind: String,
    pub controller: String,
    pub action: String,
    pub id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
}

/// Per-message controller state.
///
/// Lifetime is one delivery: the consumer builds a context, the controller
/// mutates it, and the rendered response goes out on the wire.
#[derive(Debug, Default)]
pub struct Context {
    pub headers: RequestHeaders,
    /// Unified params: query first, then path id, then body; later
    /// sources win on key collisions.
    pub params: Map<String, Value>,
    /// The body text when it was not a JSON mapping.
    pub raw_string: Option<String>,
    /// The typed value of a non-mapping JSON body (sequence or scalar),
    /// set only when the content type declares JSON.
    pub parsed_body: Option<Value>,
    rendered: Option<Response>,
}

impl Context {
    /// Build a context from delivery metadata, routed params and body.
    pub fn new(headers: RequestHeaders, params: Map<String, Value>, body: &[u8]) -> Self {
        let mut context = Context {
            headers,
            params,
            raw_string: None,
            parsed_body: None,
            rendered: None,
        };
        context.merge_body(body);
        context
    }

    /// Whether the declared content type is JSON. An absent content type
    /// counts as JSON, the wire default.
    fn body_is_json(&self) -> bool {
        match &self.headers.content_type {
            Some(content_type) => content_type.contains("json"),
            None => true,
        }
    }

    /// Fold the body into params. The parse attempt is gated on the
    /// declared content type: JSON mappings merge key-by-key and win over
    /// query and id params, non-mapping JSON keeps its typed value in
    /// `parsed_body`, and everything else lands in `raw_string` verbatim.
    fn merge_body(&mut self, body: &[u8]) {
        if body.is_empty() {
            return;
        }
        if !self.body_is_json() {
            self.raw_string = Some(String::from_utf8_lossy(body).into_owned());
            return;
        }
        match serde_json::from_slice::<Value>(body) {
            Ok(Value::Object(map)) => {
                for (key, value) in map {
                    self.params.insert(key, value);
                }
            }
            Ok(other) => {
                self.parsed_body = Some(other);
                self.raw_string = Some(String::from_utf8_lossy(body).into_owned());
            }
            Err(_) => {
                self.raw_string = Some(String::from_utf8_lossy(body).into_owned());
            }
        }
    }

    /// Look up a param.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Render a response, halting filter chains and ending the action.
    pub fn render(&mut self, status: impl Into<Status>, body: Value) {
        self.rendered = Some(Response::new(status, body));
    }

    /// Render with application response headers.
    pub fn render_with_headers(
        &mut self,
        status: impl Into<Status>,
        body: Value,
        headers: HashMap<String, String>,
    ) {
        self.rendered = Some(Response::new(status, body).with_headers(headers));
    }

    /// Whether a render happened.
    pub fn has_rendered(&self) -> bool {
        self.rendered.is_some()
    }

    fn take_rendered(&mut self) -> Option<Response> {
        self.rendered.take()
    }
}

/// Dispatch failures the consumer turns into a 500 reply and a reject.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unknown action {action:?} for controller {controller:?}")]
    UnknownAction { controller: String, action: String },

    #[error("action failed: {0}")]
    Execution(ActionError),
}

struct NamedFilter {
    name: String,
    handler: ActionHandler,
    /// Restricts the filter to these actions; `None` runs for all.
    only: Option<HashSet<String>>,
}

/// Object-safe wrapper over a typed rescue handler; the error is narrowed
/// to the handler's concrete type before invocation.
trait RescueRunner: Send + Sync {
    fn matches(&self, err: &ActionError) -> bool;
    fn run<'a>(&'a self, context: &'a mut Context, err: &'a ActionError) -> ActionFuture<'a>;
}

struct TypedRescue<E, F> {
    handler: F,
    _error: std::marker::PhantomData<fn(E)>,
}

impl<E, F> RescueRunner for TypedRescue<E, F>
where
    E: std::error::Error + Send + Sync + 'static,
    F: for<'a> Fn(&'a mut Context, &'a E) -> ActionFuture<'a> + Send + Sync,
{
    fn matches(&self, err: &ActionError) -> bool {
        err.downcast_ref::<E>().is_some()
    }

    fn run<'a>(&'a self, context: &'a mut Context, err: &'a ActionError) -> ActionFuture<'a> {
        let typed = err
            .downcast_ref::<E>()
            .expect("rescue handler invoked for non-matching error");
        (self.handler)(context, typed)
    }
}

/// A controller: its actions, filters and rescue handlers.
pub struct ControllerDef {
    name: String,
    actions: HashMap<String, ActionHandler>,
    before_actions: Vec<NamedFilter>,
    rescues: Vec<Box<dyn RescueRunner>>,
}

impl ControllerDef {
    /// Create a controller registered under the given path segment,
    /// e.g. `test_user`.
    pub fn new(name: impl Into<String>) -> Self {
        ControllerDef {
            name: name.into(),
            actions: HashMap::new(),
            before_actions: Vec::new(),
            rescues: Vec::new(),
        }
    }

    /// The path segment this controller answers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register an action.
    pub fn action<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        self.actions.insert(name.into(), Arc::new(handler));
        self
    }

    /// Register a filter that runs before every action.
    ///
    /// Filters are named so the chain can be de-duplicated when a filter is
    /// registered both for all actions and for a specific list.
    pub fn before_action<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        self.before_actions.push(NamedFilter {
            name: name.into(),
            handler: Arc::new(handler),
            only: None,
        });
        self
    }

    /// Register a filter that runs before the listed actions only.
    pub fn before_action_only<F>(
        mut self,
        name: impl Into<String>,
        actions: &[&str],
        handler: F,
    ) -> Self
    where
        F: for<'a> Fn(&'a mut Context) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        self.before_actions.push(NamedFilter {
            name: name.into(),
            handler: Arc::new(handler),
            only: Some(actions.iter().map(|a| a.to_string()).collect()),
        });
        self
    }

    /// Register a rescue handler for a concrete error type.
    ///
    /// Handlers are consulted in LIFO order; the first whose type matches
    /// the raised error wins.
    pub fn rescue_from<E, F>(mut self, handler: F) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
        F: for<'a> Fn(&'a mut Context, &'a E) -> ActionFuture<'a> + Send + Sync + 'static,
    {
        self.rescues.push(Box::new(TypedRescue {
            handler,
            _error: std::marker::PhantomData::<fn(E)>,
        }));
        self
    }

    /// One-shot entry per message: run filters, dispatch the action,
    /// return the rendered response (204 when nothing rendered).
    pub async fn call(
        &self,
        headers: RequestHeaders,
        params: Map<String, Value>,
        body: &[u8],
    ) -> std::result::Result<Response, DispatchError> {
        let action = headers.action.clone();
        let mut context = Context::new(headers, params, body);

        if let Err(err) = self.run_before_actions(&mut context, &action).await {
            return self.rescue(&mut context, err).await;
        }
        if let Some(response) = context.take_rendered() {
            return Ok(response);
        }

        let handler = self
            .actions
            .get(&action)
            .ok_or_else(|| DispatchError::UnknownAction {
                controller: self.name.clone(),
                action: action.clone(),
            })?;

        if let Err(err) = handler(&mut context).await {
            return self.rescue(&mut context, err).await;
        }

        Ok(context.take_rendered().unwrap_or_else(Response::no_content))
    }

    /// Run the all-actions filters, then the action-scoped ones,
    /// de-duplicated by name. A render halts the chain.
    async fn run_before_actions(&self, context: &mut Context, action: &str) -> ActionResult {
        let mut ran: HashSet<&str> = HashSet::new();

        for filter in self.before_actions.iter().filter(|f| f.only.is_none()) {
            if !ran.insert(&filter.name) {
                continue;
            }
            (filter.handler)(context).await?;
            if context.has_rendered() {
                return Ok(());
            }
        }

        for filter in self.before_actions.iter() {
            let applies = match &filter.only {
                Some(only) => only.contains(action),
                None => false,
            };
            if !applies || !ran.insert(&filter.name) {
                continue;
            }
            (filter.handler)(context).await?;
            if context.has_rendered() {
                return Ok(());
            }
        }

        Ok(())
    }

    /// Consult the rescue registry in LIFO order.
    async fn rescue(
        &self,
        context: &mut Context,
        err: ActionError,
    ) -> std::result::Result<Response, DispatchError> {
        for rescue in self.rescues.iter().rev() {
            if rescue.matches(&err) {
                if let Err(handler_err) = rescue.run(context, &err).await {
                    return Err(DispatchError::Execution(handler_err));
                }
                return Ok(context.take_rendered().unwrap_or_else(Response::no_content));
            }
        }
        Err(DispatchError::Execution(err))
    }
}

/// Controller registry keyed by the first path segment.
#[derive(Default)]
pub struct Registry {
    controllers: HashMap<String, Arc<ControllerDef>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Register a controller under its name.
    pub fn register(&mut self, controller: ControllerDef) -> &mut Self {
        self.controllers
            .insert(controller.name.clone(), Arc::new(controller));
        self
    }

    /// Resolve a controller by path segment.
    pub fn resolve(&self, name: &str) -> Option<Arc<ControllerDef>> {
        self.controllers.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Error)]
    #[error("record missing")]
    struct RecordMissing;

    #[derive(Debug, Error)]
    #[error("teapot")]
    struct Teapot;

    fn headers_for(action: &str) -> RequestHeaders {
        RequestHeaders {
            method: Method::Get,
            kind: format!("widgets/{}", action),
            controller: "widgets".to_string(),
            action: action.to_string(),
            ..RequestHeaders::default()
        }
    }

    fn headers_with_content_type(action: &str, content_type: &str) -> RequestHeaders {
        RequestHeaders {
            content_type: Some(content_type.to_string()),
            ..headers_for(action)
        }
    }

    fn ping(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.render(200, json!({"message": "Pong!"}));
            Ok(())
        })
    }

    fn touch(_ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async { Ok(()) })
    }

    fn echo_name(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            let name = ctx.param("name").cloned().unwrap_or(Value::Null);
            ctx.render(201, json!({"name": name}));
            Ok(())
        })
    }

    fn echo_raw(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            let raw = ctx.raw_string.clone().unwrap_or_default();
            ctx.render(200, json!({"raw": raw}));
            Ok(())
        })
    }

    fn render_ok(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.render(200, Value::Null);
            Ok(())
        })
    }

    fn render_created(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.render("created", json!({"id": 1}));
            Ok(())
        })
    }

    fn raise_missing(_ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async { Err(Box::new(RecordMissing) as ActionError) })
    }

    fn raise_teapot(_ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async { Err(Box::new(Teapot) as ActionError) })
    }

    #[tokio::test]
    async fn test_action_renders() {
        let def = ControllerDef::new("test_user").action("ping", ping);

        let response = def
            .call(headers_for("ping"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, json!({"message": "Pong!"}));
    }

    #[tokio::test]
    async fn test_no_render_defaults_to_204() {
        let def = ControllerDef::new("widgets").action("touch", touch);

        let response = def
            .call(headers_for("touch"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 204);
        assert_eq!(response.body, Value::Null);
    }

    #[tokio::test]
    async fn test_unknown_action_is_an_error() {
        let def = ControllerDef::new("widgets");
        let err = def
            .call(headers_for("nope"), Map::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownAction { .. }));
    }

    #[tokio::test]
    async fn test_body_mapping_wins_over_query_params() {
        let def = ControllerDef::new("widgets").action("create", echo_name);

        let mut params = Map::new();
        params.insert("name".to_string(), json!("from-query"));

        let response = def
            .call(headers_for("create"), params, br#"{"name": "from-body"}"#)
            .await
            .unwrap();
        assert_eq!(response.body, json!({"name": "from-body"}));
    }

    #[tokio::test]
    async fn test_non_mapping_body_lands_in_raw_string() {
        let def = ControllerDef::new("widgets").action("ingest", echo_raw);

        let response = def
            .call(headers_for("ingest"), Map::new(), b"plain text payload")
            .await
            .unwrap();
        assert_eq!(response.body, json!({"raw": "plain text payload"}));
    }

    fn echo_parsed(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            let parsed = ctx.parsed_body.clone().unwrap_or(Value::Null);
            ctx.render(200, json!({"parsed": parsed}));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_non_json_content_type_skips_the_parse() {
        let def = ControllerDef::new("widgets").action("create", echo_name);

        let mut params = Map::new();
        params.insert("name".to_string(), json!("from-query"));

        // The body is syntactically valid JSON, but the declared content
        // type says otherwise; it must stay out of params.
        let response = def
            .call(
                headers_with_content_type("create", "text/plain"),
                params,
                br#"{"name": "from-body"}"#,
            )
            .await
            .unwrap();
        assert_eq!(response.body, json!({"name": "from-query"}));
    }

    #[tokio::test]
    async fn test_plain_text_body_keeps_its_text() {
        let def = ControllerDef::new("widgets").action("ingest", echo_raw);

        let response = def
            .call(
                headers_with_content_type("ingest", "text/plain"),
                Map::new(),
                br#"{"name": "from-body"}"#,
            )
            .await
            .unwrap();
        assert_eq!(response.body, json!({"raw": r#"{"name": "from-body"}"#}));
    }

    #[tokio::test]
    async fn test_json_sequence_body_is_parsed() {
        let def = ControllerDef::new("widgets").action("ingest", echo_parsed);

        let response = def
            .call(
                headers_with_content_type("ingest", "application/json"),
                Map::new(),
                b"[1, 2, 3]",
            )
            .await
            .unwrap();
        assert_eq!(response.body, json!({"parsed": [1, 2, 3]}));
    }

    fn stamp_a(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.params.insert("trail".to_string(), json!(["a"]));
            Ok(())
        })
    }

    fn stamp_dup(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.params.insert("trail".to_string(), json!(["dup"]));
            Ok(())
        })
    }

    fn stamp_b(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            let mut trail = ctx
                .param("trail")
                .and_then(|v| v.as_array().cloned())
                .unwrap_or_default();
            trail.push(json!("b"));
            ctx.params.insert("trail".to_string(), Value::Array(trail));
            Ok(())
        })
    }

    fn show_trail(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            let trail = ctx.param("trail").cloned().unwrap_or(Value::Null);
            ctx.render(200, json!({"trail": trail}));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_before_actions_run_in_order_and_dedupe() {
        // `stamp_a` appears both globally and action-scoped; the name
        // de-duplicates it to a single run.
        let def = ControllerDef::new("widgets")
            .before_action("stamp_a", stamp_a)
            .before_action_only("stamp_a", &["show"], stamp_dup)
            .before_action_only("stamp_b", &["show"], stamp_b)
            .action("show", show_trail);

        let response = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.body, json!({"trail": ["a", "b"]}));
    }

    fn forbid(ctx: &mut Context) -> ActionFuture<'_> {
        Box::pin(async move {
            ctx.render(403, json!({"error": "forbidden"}));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_filter_render_halts_the_chain() {
        let def = ControllerDef::new("widgets")
            .before_action("gate", forbid)
            .action("show", ping);

        let response = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 403);
        assert_eq!(response.body["error"], "forbidden");
    }

    #[tokio::test]
    async fn test_scoped_filter_skipped_for_other_actions() {
        let def = ControllerDef::new("widgets")
            .before_action_only("gate", &["destroy"], forbid)
            .action("show", render_ok);

        let response = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    fn rescue_first<'a>(ctx: &'a mut Context, _err: &'a RecordMissing) -> ActionFuture<'a> {
        Box::pin(async move {
            ctx.render(404, json!({"error": "first"}));
            Ok(())
        })
    }

    fn rescue_last<'a>(ctx: &'a mut Context, _err: &'a RecordMissing) -> ActionFuture<'a> {
        Box::pin(async move {
            ctx.render(404, json!({"error": "last-registered-wins"}));
            Ok(())
        })
    }

    fn rescue_rendering<'a>(ctx: &'a mut Context, _err: &'a RecordMissing) -> ActionFuture<'a> {
        Box::pin(async move {
            ctx.render(404, json!({"rescued": true}));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_rescue_matches_by_type_in_lifo_order() {
        let def = ControllerDef::new("widgets")
            .rescue_from::<RecordMissing, _>(rescue_first)
            .rescue_from::<RecordMissing, _>(rescue_last)
            .action("show", raise_missing);

        let response = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "last-registered-wins");
    }

    #[tokio::test]
    async fn test_unmatched_error_propagates() {
        let def = ControllerDef::new("widgets")
            .rescue_from::<RecordMissing, _>(rescue_first)
            .action("show", raise_teapot);

        let err = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Execution(_)));
    }

    #[tokio::test]
    async fn test_filter_error_hits_rescue_chain() {
        let def = ControllerDef::new("widgets")
            .before_action("explode", raise_missing)
            .rescue_from::<RecordMissing, _>(rescue_rendering)
            .action("show", render_ok);

        let response = def
            .call(headers_for("show"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body["rescued"], true);
    }

    #[tokio::test]
    async fn test_render_accepts_status_names() {
        let def = ControllerDef::new("widgets").action("create", render_created);

        let response = def
            .call(headers_for("create"), Map::new(), b"")
            .await
            .unwrap();
        assert_eq!(response.status, 201);
    }

    #[test]
    fn test_registry_resolution() {
        let mut registry = Registry::new();
        registry.register(ControllerDef::new("users"));
        assert!(registry.resolve("users").is_some());
        assert!(registry.resolve("ghosts").is_none());
    }
}
