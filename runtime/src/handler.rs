//! Handler registration tables.
//!
//! A handler declares its methods once, at construction, by registering one
//! closure per event type on a [`HandlerRegistry`]. Each closure receives the
//! decoded event and, optionally, extra arguments extracted from the record
//! (see [`MethodArgs`]). The registry erases the closures into a table keyed
//! by event type tag, which the dispatcher looks records up in.
//!
//! # Example
//!
//! ```ignore
//! impl EventHandler for OrderProjection {
//!     fn stream_name(&self) -> &str { "$ce-Order" }
//!     fn group_name(&self) -> &str { "order-projection" }
//!
//!     fn register(registry: &mut HandlerRegistry<Self>) {
//!         registry
//!             .on(MethodConfig::new("on_placed"), |h: Arc<Self>, e: OrderPlaced| async move {
//!                 h.insert(e).await
//!             })
//!             .on_with(
//!                 MethodConfig::new("notify").skip_when_replaying(),
//!                 |h: Arc<Self>, e: OrderPlaced, ids: EventIds| async move {
//!                     h.notify(e, ids.effective()).await
//!                 },
//!             );
//!     }
//! }
//! ```

use crate::error::DispatchError;
use crate::extension::{MethodExtension, TracingExtension};
use crate::retry::RetryPolicy;
use eventstore_tools_core::BoxError;
use eventstore_tools_core::event::DomainEvent;
use eventstore_tools_core::event_log::ConsumerStrategy;
use eventstore_tools_core::position::InitialPosition;
use eventstore_tools_core::record::{EventIds, RecordMetadata, StreamRecord};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use smallvec::SmallVec;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Declarative settings of one handler method.
#[derive(Clone, Debug)]
pub struct MethodConfig {
    name: String,
    skip_when_replaying: bool,
    retry: Option<RetryPolicy>,
}

impl MethodConfig {
    /// Settings for the method called `name`: always invoked, no retry.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            skip_when_replaying: false,
            retry: None,
        }
    }

    /// Do not invoke the method for records below the replay boundary.
    #[must_use]
    pub const fn skip_when_replaying(mut self) -> Self {
        self.skip_when_replaying = true;
        self
    }

    /// Retry the method under `policy`.
    #[must_use]
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether replayed records bypass the method.
    #[must_use]
    pub const fn skips_when_replaying(&self) -> bool {
        self.skip_when_replaying
    }

    /// Retry policy, if any.
    #[must_use]
    pub const fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Why the method cannot be invoked, if it cannot.
    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("method name is empty".to_string());
        }
        if self.retry.as_ref().is_some_and(|policy| policy.max_attempts() == 0) {
            return Err("retry policy allows zero attempts".to_string());
        }
        Ok(())
    }
}

/// Extra method arguments taken from the record rather than the payload.
pub trait MethodArgs: Sized + Send + 'static {
    /// Extract the argument from `record`.
    ///
    /// # Errors
    ///
    /// Returns an error when the record does not carry a compatible value.
    fn extract(record: &StreamRecord) -> Result<Self, BoxError>;
}

impl MethodArgs for () {
    fn extract(_record: &StreamRecord) -> Result<Self, BoxError> {
        Ok(())
    }
}

impl MethodArgs for EventIds {
    fn extract(record: &StreamRecord) -> Result<Self, BoxError> {
        Ok(record.event_ids())
    }
}

/// Record metadata decoded into `M`. Use [`RecordMetadata`] for the raw map.
#[derive(Clone, Debug, PartialEq)]
pub struct Metadata<M>(pub M);

impl<M: DeserializeOwned + Send + 'static> MethodArgs for Metadata<M> {
    fn extract(record: &StreamRecord) -> Result<Self, BoxError> {
        if record.metadata.is_empty() {
            let empty = serde_json::Value::Object(RecordMetadata::new());
            return Ok(Self(serde_json::from_value(empty)?));
        }
        Ok(Self(serde_json::from_slice(&record.metadata)?))
    }
}

impl<A: MethodArgs, B: MethodArgs> MethodArgs for (A, B) {
    fn extract(record: &StreamRecord) -> Result<Self, BoxError> {
        Ok((A::extract(record)?, B::extract(record)?))
    }
}

type Invoke = Arc<dyn Fn(&StreamRecord) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// One registered method.
pub struct HandlerMethod {
    event_type: &'static str,
    config: MethodConfig,
    invoke: Invoke,
}

impl HandlerMethod {
    /// Event type tag the method handles.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        self.event_type
    }

    /// Method settings.
    #[must_use]
    pub const fn config(&self) -> &MethodConfig {
        &self.config
    }

    /// Method name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.config.name()
    }

    /// Decode `record` and call the method once.
    pub(crate) fn invoke(&self, record: &StreamRecord) -> BoxFuture<'static, Result<(), BoxError>> {
        (self.invoke)(record)
    }
}

impl fmt::Debug for HandlerMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerMethod")
            .field("event_type", &self.event_type)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Collects the methods of one handler instance.
pub struct HandlerRegistry<H> {
    handler: Arc<H>,
    methods: Vec<HandlerMethod>,
}

impl<H: Send + Sync + 'static> HandlerRegistry<H> {
    fn new(handler: Arc<H>) -> Self {
        Self {
            handler,
            methods: Vec::new(),
        }
    }

    /// Register `method` for records of type `E::EVENT_TYPE`.
    pub fn on<E, F, Fut>(&mut self, config: MethodConfig, method: F) -> &mut Self
    where
        E: DomainEvent,
        F: Fn(Arc<H>, E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_with::<E, (), _, _>(config, move |handler, event, ()| method(handler, event))
    }

    /// Register `method` for records of type `E::EVENT_TYPE`, passing extra
    /// arguments extracted from the record.
    pub fn on_with<E, A, F, Fut>(&mut self, config: MethodConfig, method: F) -> &mut Self
    where
        E: DomainEvent,
        A: MethodArgs,
        F: Fn(Arc<H>, E, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler = Arc::clone(&self.handler);
        let name = config.name().to_string();

        let invoke: Invoke = Arc::new(
            move |record: &StreamRecord| -> BoxFuture<'static, Result<(), BoxError>> {
                let decoded = E::from_json(&record.data)
                    .map_err(BoxError::from)
                    .and_then(|event| A::extract(record).map(|args| (event, args)));

                match decoded {
                    Ok((event, args)) => Box::pin(method(Arc::clone(&handler), event, args)),
                    Err(source) => {
                        let error = DispatchError::Decode {
                            method: name.clone(),
                            event_type: record.event_type.clone(),
                            source,
                        };
                        Box::pin(async move { Err(Box::new(error) as BoxError) })
                    }
                }
            },
        );

        self.methods.push(HandlerMethod {
            event_type: E::EVENT_TYPE,
            config,
            invoke,
        });
        self
    }
}

/// A consumer of one stream on behalf of one consumer group.
pub trait EventHandler: Send + Sync + Sized + 'static {
    /// Stream the handler subscribes to.
    fn stream_name(&self) -> &str;

    /// Consumer group; checkpoints and idempotency records are kept per group.
    fn group_name(&self) -> &str;

    /// Name used in logs, metrics and the management façade.
    fn name(&self) -> String {
        short_type_name::<Self>().to_string()
    }

    /// Where a brand new subscription starts.
    fn initial_position(&self) -> InitialPosition {
        InitialPosition::FromBeginning
    }

    /// Consumer strategy of persistent subscriptions.
    fn consumer_strategy(&self) -> ConsumerStrategy {
        ConsumerStrategy::default()
    }

    /// Extensions wrapped around every method, outermost first.
    fn extensions(&self) -> Vec<Arc<dyn MethodExtension>> {
        vec![Arc::new(TracingExtension)]
    }

    /// Declare the handler's methods.
    fn register(registry: &mut HandlerRegistry<Self>);
}

fn short_type_name<T>() -> &'static str {
    let full = std::any::type_name::<T>();
    let path = full.split('<').next().unwrap_or(full);
    path.rsplit("::").next().unwrap_or(path)
}

/// A handler with its method table built.
pub struct RegisteredHandler {
    name: String,
    stream_name: String,
    group_name: String,
    initial_position: InitialPosition,
    consumer_strategy: ConsumerStrategy,
    methods: Vec<HandlerMethod>,
    extensions: Vec<Arc<dyn MethodExtension>>,
}

impl RegisteredHandler {
    /// Build the method table of `handler`.
    #[must_use]
    pub fn new<H: EventHandler>(handler: H) -> Self {
        Self::from_arc(Arc::new(handler))
    }

    /// Build the method table of a shared handler.
    #[must_use]
    pub fn from_arc<H: EventHandler>(handler: Arc<H>) -> Self {
        let mut registry = HandlerRegistry::new(Arc::clone(&handler));
        H::register(&mut registry);

        Self {
            name: handler.name(),
            stream_name: handler.stream_name().to_string(),
            group_name: handler.group_name().to_string(),
            initial_position: handler.initial_position(),
            consumer_strategy: handler.consumer_strategy(),
            methods: registry.methods,
            extensions: handler.extensions(),
        }
    }

    /// Handler name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Subscribed stream.
    #[must_use]
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    /// Consumer group.
    #[must_use]
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Initial position policy.
    #[must_use]
    pub const fn initial_position(&self) -> &InitialPosition {
        &self.initial_position
    }

    /// Consumer strategy for persistent subscriptions.
    #[must_use]
    pub const fn consumer_strategy(&self) -> ConsumerStrategy {
        self.consumer_strategy
    }

    /// All registered methods, in registration order.
    #[must_use]
    pub fn methods(&self) -> &[HandlerMethod] {
        &self.methods
    }

    /// Methods registered for `event_type`, in registration order.
    #[must_use]
    pub fn methods_for(&self, event_type: &str) -> SmallVec<[&HandlerMethod; 4]> {
        self.methods
            .iter()
            .filter(|method| method.event_type == event_type)
            .collect()
    }

    /// Extensions, outermost first.
    #[must_use]
    pub fn extensions(&self) -> &[Arc<dyn MethodExtension>] {
        &self.extensions
    }
}

impl fmt::Debug for RegisteredHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandler")
            .field("name", &self.name)
            .field("stream_name", &self.stream_name)
            .field("group_name", &self.group_name)
            .field("initial_position", &self.initial_position)
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}
