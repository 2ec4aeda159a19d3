//! Resources
//!
//! A resource is a client-side model whose CRUD calls become RPCs. The
//! [`Resource`] trait declares the wire configuration (resource name, param
//! key, exchange, routing key); [`Instance`] carries the remote attributes,
//! dirty tracking and validation errors of one record. The [`resource!`]
//! macro generates the per-resource wrapper type.
//!
//! # Examples
//!
//! ```rust
//! use dumq_rpc::resource;
//! use dumq_rpc::request::ExchangeType;
//!
//! resource! {
//!     pub struct User {
//!         name: "users",
//!         param_key: "user",
//!         exchange: "accounts",
//!         exchange_type: ExchangeType::Topic,
//!     }
//! }
//! ```
//!
//! With that in place, `User::find(42)` issues `GET users/42`,
//! `User::create(...)` issues `POST users` with the attributes nested under
//! `user`, and `instance.save()` issues a `PUT` carrying only the dirty
//! attributes.
//!
//! # Attribute semantics
//!
//! Remote attributes keep the spelling the remote service used
//! (PascalCase keys from a container API survive a round-trip unchanged)
//! while lookups are case-insensitive. `id` reads through any of `id`,
//! `ID`, `Id` or `_id`.
//!
//! # Scoped overrides
//!
//! `Resource::with` pushes exchange/routing-key overrides into a
//! task-local slot for the duration of a future. Instances capture their
//! binding at construction, so a record built inside a `with` scope keeps
//! publishing with the overridden routing key after the scope ends.

use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::marker::PhantomData;

use async_trait::async_trait;
use deadpool_lapin::Pool;
use serde_json::{json, Map, Value};

use crate::client::{Client, RequestOptions};
use crate::config::{self, ScopeOverrides};
use crate::error::{Error, Result};
use crate::request::{ExchangeType, Method};

/// Case-preserving, lookup-insensitive attribute map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    // folded key → (original spelling, value)
    entries: HashMap<String, (String, Value)>,
}

impl Attributes {
    pub fn new() -> Self {
        Attributes::default()
    }

    /// Build from a JSON mapping; non-mappings yield an empty map.
    pub fn from_value(value: &Value) -> Self {
        let mut attributes = Attributes::new();
        if let Value::Object(map) = value {
            for (key, value) in map {
                attributes.set(key, value.clone());
            }
        }
        attributes
    }

    fn fold(key: &str) -> String {
        key.to_lowercase()
    }

    /// Look up a value, ignoring key case.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(&Self::fold(key)).map(|(_, value)| value)
    }

    /// Set a value. The first spelling seen for a key is preserved.
    /// Returns `true` when the stored value changed.
    pub fn set(&mut self, key: &str, value: Value) -> bool {
        match self.entries.get_mut(&Self::fold(key)) {
            Some((_, existing)) => {
                if *existing == value {
                    false
                } else {
                    *existing = value;
                    true
                }
            }
            None => {
                self.entries
                    .insert(Self::fold(key), (key.to_string(), value));
                true
            }
        }
    }

    /// The preserved spelling for a key, if present.
    pub fn original_key(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&Self::fold(key))
            .map(|(original, _)| original.as_str())
    }

    /// Render the map as a JSON mapping with preserved spellings.
    pub fn to_value(&self) -> Value {
        let mut map = Map::new();
        for (original, value) in self.entries.values() {
            map.insert(original.clone(), value.clone());
        }
        Value::Object(map)
    }

    /// Render only the given (folded) keys as a JSON mapping.
    pub fn subset(&self, keys: &BTreeSet<String>) -> Value {
        let mut map = Map::new();
        for key in keys {
            if let Some((original, value)) = self.entries.get(key) {
                map.insert(original.clone(), value.clone());
            }
        }
        Value::Object(map)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Validation errors keyed by attribute name (or `base`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Errors {
    entries: HashMap<String, Vec<String>>,
}

impl Errors {
    pub fn new() -> Self {
        Errors::default()
    }

    /// Add a message under a key.
    pub fn add(&mut self, key: impl Into<String>, message: impl Into<String>) {
        self.entries.entry(key.into()).or_default().push(message.into());
    }

    /// Messages for a key.
    pub fn get(&self, key: &str) -> &[String] {
        self.entries.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// Absorb a remote errors map from a 422 response.
    pub fn load_remote(&mut self, remote: HashMap<String, Vec<String>>) {
        for (key, messages) in remote {
            self.entries.entry(key).or_default().extend(messages);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The publication target captured by an instance at construction.
#[derive(Debug, Clone)]
pub struct Binding {
    pub exchange: Option<String>,
    pub exchange_type: ExchangeType,
    pub routing_key: String,
}

impl Binding {
    fn require_exchange(&self) -> Result<String> {
        self.exchange.clone().ok_or_else(|| {
            Error::invalid_argument("no exchange configured at any level for this resource")
        })
    }

    fn request_options(&self) -> Result<RequestOptions> {
        Ok(RequestOptions::new()
            .exchange(self.require_exchange()?)
            .exchange_type(self.exchange_type)
            .routing_key(self.routing_key.clone()))
    }
}

/// A client-side model backed by a remote service.
///
/// Implementations declare the wire configuration; all operations are
/// provided. Per-call overrides come from [`Resource::with`] and resolve
/// ahead of the declared configuration; the routing key falls back to the
/// resource name.
#[async_trait]
pub trait Resource: Sized + Send + Sync + 'static {
    /// Pluralized, underscored resource name, e.g. `users`. Doubles as the
    /// default routing key and as the request path root.
    const NAME: &'static str;

    /// Key the attributes nest under in save bodies, e.g. `user`.
    const PARAM_KEY: &'static str;

    /// Declared exchange, if any.
    fn exchange() -> Option<String> {
        None
    }

    fn exchange_type() -> ExchangeType {
        ExchangeType::Direct
    }

    /// Declared routing key, if any.
    fn routing_key() -> Option<String> {
        None
    }

    /// Declared connection pool, if any. Resources pinned to a dedicated
    /// pool (per tenant, per priority class) declare it here; everything
    /// else rides the global pool.
    fn pool() -> Option<Pool> {
        None
    }

    /// Local validations, run before any wire traffic on save.
    fn validate(_attributes: &Attributes, _errors: &mut Errors) {}

    /// Hook invoked before a save request is issued.
    fn before_save(_instance: &mut Instance<Self>) {}

    /// Hook invoked after a successful save.
    fn after_save(_instance: &mut Instance<Self>) {}

    /// Hook invoked before a destroy request is issued.
    fn before_destroy(_instance: &mut Instance<Self>) {}

    /// Hook invoked after a successful destroy.
    fn after_destroy(_instance: &mut Instance<Self>) {}

    /// The client operations go through. Pool resolution walks the same
    /// chain as the rest of the configuration: the scoped override when
    /// one is in effect, then the declared [`Resource::pool`], then the
    /// global pool.
    fn client() -> Result<Client> {
        let scoped = config::scoped_overrides(TypeId::of::<Self>()).and_then(|o| o.pool);
        let pool = match scoped.or_else(Self::pool) {
            Some(pool) => pool,
            None => config::global_pool()?,
        };
        Ok(Client::new(pool))
    }

    /// Resolve the publication target: scoped overrides first, then the
    /// declared configuration, then the resource name as routing key.
    fn binding() -> Binding {
        let overrides = config::scoped_overrides(TypeId::of::<Self>()).unwrap_or_default();
        Binding {
            exchange: overrides.exchange.or_else(Self::exchange),
            exchange_type: overrides.exchange_type.unwrap_or_else(Self::exchange_type),
            routing_key: overrides
                .routing_key
                .or_else(Self::routing_key)
                .unwrap_or_else(|| Self::NAME.to_string()),
        }
    }

    /// Build an unsaved instance; all given attributes start dirty.
    fn build(attributes: Value) -> Instance<Self> {
        Instance::new(attributes)
    }

    /// `GET <resource>/<id>`. A 404 yields `None`; a success with a
    /// mapping body hydrates a persisted, clean instance.
    async fn find<I>(id: I) -> Result<Option<Instance<Self>>>
    where
        I: std::fmt::Display + Send,
    {
        let binding = Self::binding();
        let options = binding.request_options()?;
        let client = Self::client()?;

        match client.request(&format!("{}/{}", Self::NAME, id), options).await {
            Ok(response) => match response.body {
                Value::Object(_) => Ok(Some(Instance::hydrate(response.body, binding))),
                _ => Ok(None),
            },
            Err(Error::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// `GET <resource>?<nested-query>`. The body must be a sequence; each
    /// element hydrates a persisted, clean instance.
    async fn where_query(filters: Map<String, Value>) -> Result<Vec<Instance<Self>>> {
        let binding = Self::binding();
        let options = binding.request_options()?.query(filters);
        let client = Self::client()?;

        let response = client.request(Self::NAME, options).await?;
        match response.body {
            Value::Array(items) => Ok(items
                .into_iter()
                .map(|item| Instance::hydrate(item, binding.clone()))
                .collect()),
            other => Err(Error::invalid_argument(format!(
                "expected a sequence body for {}, got {}",
                Self::NAME,
                other
            ))),
        }
    }

    /// All records: `where_query` with no filters.
    async fn all() -> Result<Vec<Instance<Self>>> {
        Self::where_query(Map::new()).await
    }

    /// Build and save. Returns the instance regardless of save outcome;
    /// callers inspect `persisted()` and `errors()`.
    async fn create(attributes: Value) -> Result<Instance<Self>> {
        let mut instance = Self::build(attributes);
        instance.save().await?;
        Ok(instance)
    }

    /// Run `fut` with per-call overrides in scope for this resource.
    ///
    /// Overrides are restored on every exit path, including panics, and
    /// are invisible to concurrent tasks and other resource types.
    async fn with<F>(overrides: ScopeOverrides, fut: F) -> F::Output
    where
        F: std::future::Future + Send,
        F::Output: Send,
    {
        config::with_scoped_overrides(TypeId::of::<Self>(), overrides, fut).await
    }
}

/// One record of a resource: remote attributes, dirty tracking and
/// validation errors.
#[derive(Debug, Clone)]
pub struct Instance<R: Resource> {
    attributes: Attributes,
    dirty: BTreeSet<String>,
    persisted: bool,
    binding: Binding,
    errors: Errors,
    _resource: PhantomData<R>,
}

impl<R: Resource> Instance<R> {
    /// Build an unsaved instance. The binding is captured now, so scoped
    /// overrides in effect at construction stick for the instance's life.
    pub fn new(attributes: Value) -> Self {
        let mut instance = Instance {
            attributes: Attributes::new(),
            dirty: BTreeSet::new(),
            persisted: false,
            binding: R::binding(),
            errors: Errors::new(),
            _resource: PhantomData,
        };
        if let Value::Object(map) = attributes {
            for (key, value) in map {
                instance.set_attribute(&key, value);
            }
        }
        instance
    }

    /// Hydrate a persisted, clean instance from a response body.
    fn hydrate(attributes: Value, binding: Binding) -> Self {
        Instance {
            attributes: Attributes::from_value(&attributes),
            dirty: BTreeSet::new(),
            persisted: true,
            binding,
            errors: Errors::new(),
            _resource: PhantomData,
        }
    }

    /// Read an attribute, ignoring key case.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Write an attribute, marking it dirty when the value changed.
    pub fn set_attribute(&mut self, name: &str, value: Value) {
        if self.attributes.set(name, value) {
            self.dirty.insert(name.to_lowercase());
        }
    }

    /// The record id, read from `id` (any casing) or `_id`.
    pub fn id(&self) -> Option<&Value> {
        self.attributes.get("id").or_else(|| self.attributes.get("_id"))
    }

    /// Write the record id under `id`.
    pub fn set_id(&mut self, id: Value) {
        self.set_attribute("id", id);
    }

    pub fn persisted(&self) -> bool {
        self.persisted
    }

    /// Folded names of attributes changed since the last persist.
    pub fn dirty(&self) -> &BTreeSet<String> {
        &self.dirty
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn errors(&self) -> &Errors {
        &self.errors
    }

    /// The publication target captured at construction.
    pub fn binding(&self) -> &Binding {
        &self.binding
    }

    /// The dirty attributes as a JSON mapping with preserved spellings.
    pub fn dirty_attributes(&self) -> Value {
        self.attributes.subset(&self.dirty)
    }

    /// The save body: dirty attributes nested under the param key.
    pub fn save_payload(&self) -> Value {
        json!({ R::PARAM_KEY: self.dirty_attributes() })
    }

    /// Merge returned attributes without marking them dirty.
    fn assign(&mut self, attributes: Value) {
        if let Value::Object(map) = attributes {
            for (key, value) in map {
                self.attributes.set(&key, value);
            }
        }
    }

    /// Persist the record.
    ///
    /// Runs validations first; an invalid record returns `false` without
    /// touching the wire. New records `POST <resource>`, persisted ones
    /// `PUT <resource>/<id>`, both with the dirty attributes nested under
    /// the param key. A 422 loads the remote errors and returns `false`;
    /// other failure statuses raise. On success the returned attributes
    /// are assigned and the dirty set cleared.
    pub async fn save(&mut self) -> Result<bool> {
        self.errors.clear();
        let mut errors = Errors::new();
        R::validate(&self.attributes, &mut errors);
        if !errors.is_empty() {
            self.errors = errors;
            return Ok(false);
        }

        R::before_save(self);

        let options = self.binding.request_options()?;
        let (path, method) = if self.persisted {
            let id = self
                .id()
                .map(id_to_string)
                .ok_or_else(|| Error::invalid_argument("cannot update a record without an id"))?;
            (format!("{}/{}", R::NAME, id), Method::Put)
        } else {
            (R::NAME.to_string(), Method::Post)
        };

        let client = R::client()?;
        let result = client
            .request(&path, options.method(method).body(self.save_payload()))
            .await;

        match result {
            Ok(response) => {
                self.assign(response.body);
                self.persisted = true;
                self.dirty.clear();
                R::after_save(self);
                Ok(true)
            }
            Err(Error::UnprocessableEntity { errors, .. }) => {
                self.errors.load_remote(errors);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// `DELETE <resource>/<id>`. Marks the record not-persisted on
    /// success; failure statuses are swallowed into `false`. Producer
    /// timeouts and transport errors still raise.
    pub async fn destroy(&mut self) -> Result<bool> {
        let id = self
            .id()
            .map(id_to_string)
            .ok_or_else(|| Error::invalid_argument("cannot destroy a record without an id"))?;

        R::before_destroy(self);

        let options = self.binding.request_options()?.method(Method::Delete);
        let client = R::client()?;

        match client.request(&format!("{}/{}", R::NAME, id), options).await {
            Ok(_) => {
                self.persisted = false;
                R::after_destroy(self);
                Ok(true)
            }
            Err(e) if e.status().map_or(false, |status| status != 408) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Render an id value the way it appears in a path segment.
fn id_to_string(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Generate a resource wrapper type.
///
/// `name` and `param_key` are mandatory; `exchange`, `exchange_type`,
/// `routing_key` and `pool` are optional and fall back to the trait
/// defaults.
#[macro_export]
macro_rules! resource {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            name: $rname:literal,
            param_key: $pkey:literal
            $(, exchange: $exchange:literal)?
            $(, exchange_type: $extype:expr)?
            $(, routing_key: $rkey:literal)?
            $(, pool: $pool:expr)?
            $(,)?
        }
    ) => {
        $(#[$meta])*
        $vis struct $name;

        impl $crate::resource::Resource for $name {
            const NAME: &'static str = $rname;
            const PARAM_KEY: &'static str = $pkey;

            $(
                fn exchange() -> Option<String> {
                    Some($exchange.to_string())
                }
            )?

            $(
                fn exchange_type() -> $crate::request::ExchangeType {
                    $extype
                }
            )?

            $(
                fn routing_key() -> Option<String> {
                    Some($rkey.to_string())
                }
            )?

            $(
                fn pool() -> Option<$crate::config::Pool> {
                    Some($pool)
                }
            )?
        }
    };
}
