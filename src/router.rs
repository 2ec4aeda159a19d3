//! Router
//!
//! Parses the virtual URL carried in a delivery's `type` property and
//! resolves it to a controller, an action and a params mapping.
//!
//! # Virtual URL grammar
//!
//! ```text
//! path := segment ( "/" segment )* ( "?" query )?
//! ```
//!
//! Segment 1 selects the controller, segment 2 is the `id` parameter,
//! segment 3 is an explicit action override. When no action segment is
//! present the verb picks the default: `GET` routes to `show` with an id
//! and `index` without, `POST` to `create`, `PUT`/`PATCH` to `update`,
//! `DELETE` to `destroy`.
//!
//! The first `?` delimits the query string; segments must not contain `?`.

use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::query;
use crate::request::Method;

/// A parsed virtual URL, ready for controller dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    /// First path segment, e.g. `test_user`.
    pub controller: String,
    /// Second path segment, when present.
    pub id: Option<String>,
    /// Explicit third segment or the verb default.
    pub action: String,
    /// Query params with the `id` merged in.
    pub params: Map<String, Value>,
}

/// Parse `type_url` and resolve the action for `method`.
pub fn dispatch(method: Method, type_url: &str) -> Result<Route> {
    let (path, query_string) = match type_url.split_once('?') {
        Some((path, query_string)) => (path, Some(query_string)),
        None => (type_url, None),
    };

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let controller = segments
        .first()
        .ok_or_else(|| Error::invalid_argument(format!("virtual URL {:?} has no path", type_url)))?
        .to_string();
    let id = segments.get(1).map(|s| s.to_string());
    let explicit_action = segments.get(2).map(|s| s.to_string());

    let action = match explicit_action {
        Some(action) => action,
        None => default_action(method, id.is_some()).to_string(),
    };

    let mut params = match query_string {
        Some(query_string) => query::decode(query_string)?,
        None => Map::new(),
    };
    if let Some(id) = &id {
        params.insert("id".to_string(), Value::String(id.clone()));
    }

    Ok(Route {
        controller,
        id,
        action,
        params,
    })
}

/// The action a verb maps to when the URL names none.
fn default_action(method: Method, has_id: bool) -> &'static str {
    match method {
        Method::Get if has_id => "show",
        Method::Get => "index",
        Method::Post => "create",
        Method::Put | Method::Patch => "update",
        Method::Delete => "destroy",
    }
}

/// Camelize a snake_case controller segment, e.g. `test_user` →
/// `TestUser`. Used when reporting unresolved controllers.
pub fn camelize(segment: &str) -> String {
    segment
        .split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
