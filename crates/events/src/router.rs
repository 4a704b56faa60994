//! Message router.
//!
//! The router binds handlers to subscriptions and owns the consume lifecycle:
//!
//! ```text
//! Idle -> Configured -> Running -> Stopping -> Stopped
//! ```
//!
//! - Registering a handler, middleware or plugin moves `Idle` to `Configured`.
//! - `run()` subscribes every binding, runs plugins, then consumes each
//!   subscription on its own task until a stop is requested or every
//!   subscription is closed by the transport.
//! - `stop()` (through a [`RouterHandle`]) is idempotent and safe at any time.
//!   In-flight invocations finish; nothing new is pulled once `Stopping` begins.
//!
//! ## Per-message dispatch
//!
//! 1. The handler (wrapped by middleware) runs inside a panic boundary.
//! 2. `Ok(outbound)`: outbound messages are published to the binding's output
//!    topic, then the input is acked. A failed publish nacks the input instead.
//! 3. `Err(_)` (including a recovered panic): logged, input nacked.
//!
//! Invocations on one subscription are sequential, so per-subscription bus
//! order is preserved. There is no ordering across subscriptions.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::message::EVENT_ID_METADATA;
use crate::middleware::{catch_panic, recover};
use crate::{
    BusError, Delivery, Handler, HandlerError, Message, Middleware, Publisher, RouterPlugin,
    Subscriber, Subscription,
};

const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RouterState {
    Idle,
    Configured,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RouterState::Idle => "idle",
            RouterState::Configured => "configured",
            RouterState::Running => "running",
            RouterState::Stopping => "stopping",
            RouterState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("invalid router config: {0}")]
    InvalidConfig(String),

    #[error("handler '{0}' is already registered")]
    DuplicateHandler(String),

    #[error("router has no handlers")]
    NoHandlers,

    #[error("handler '{handler}' could not subscribe to '{topic}': {source}")]
    Subscribe {
        handler: String,
        topic: String,
        #[source]
        source: BusError,
    },

    #[error("plugin '{plugin}' failed: {reason}")]
    Plugin { plugin: String, reason: String },

    #[error("consumer task failed: {0}")]
    ConsumerFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterConfig {
    /// Upper bound on how long `Stopping` waits for consumers to finish.
    pub close_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), RouterError> {
        if self.close_timeout.is_zero() {
            return Err(RouterError::InvalidConfig(
                "close_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Shared {
    state: watch::Sender<RouterState>,
    shutdown: CancellationToken,
}

impl Shared {
    fn state(&self) -> RouterState {
        *self.state.borrow()
    }

    fn set_state(&self, state: RouterState) {
        self.state.send_replace(state);
    }
}

/// Cloneable control handle for a [`Router`].
#[derive(Debug, Clone)]
pub struct RouterHandle {
    shared: Arc<Shared>,
}

impl RouterHandle {
    /// Request a graceful stop. Idempotent.
    ///
    /// Before `run()` this makes `run()` stop right after it starts.
    pub fn stop(&self) {
        if !self.shared.shutdown.is_cancelled() {
            info!(state = %self.shared.state(), "router stop requested");
            self.shared.shutdown.cancel();
        }
    }

    pub fn state(&self) -> RouterState {
        self.shared.state()
    }

    /// Resolves once the router has reached `Running` (or any later state).
    pub async fn running(&self) {
        self.wait_for(|s| s >= RouterState::Running).await;
    }

    /// Resolves once the router is `Stopped`.
    pub async fn stopped(&self) {
        self.wait_for(|s| s == RouterState::Stopped).await;
    }

    async fn wait_for(&self, reached: impl Fn(RouterState) -> bool) {
        let mut rx = self.shared.state.subscribe();
        // The sender lives in `shared`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|s| reached(*s)).await;
    }
}

struct Output {
    topic: String,
    publisher: Arc<dyn Publisher>,
}

struct Binding {
    name: String,
    topic: String,
    subscriber: Arc<dyn Subscriber>,
    output: Option<Output>,
    handler: Arc<dyn Handler>,
}

pub struct Router {
    config: RouterConfig,
    bindings: Vec<Binding>,
    middleware: Vec<Arc<dyn Middleware>>,
    plugins: Vec<Arc<dyn RouterPlugin>>,
    shared: Arc<Shared>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Result<Self, RouterError> {
        config.validate()?;
        let (state, _) = watch::channel(RouterState::Idle);
        Ok(Self {
            config,
            bindings: Vec::new(),
            middleware: Vec::new(),
            plugins: Vec::new(),
            shared: Arc::new(Shared {
                state,
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn handle(&self) -> RouterHandle {
        RouterHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn state(&self) -> RouterState {
        self.shared.state()
    }

    /// Add middleware applied to every handler. The first one added is outermost.
    pub fn add_middleware<M>(&mut self, middleware: M) -> &mut Self
    where
        M: Middleware + 'static,
    {
        self.configure();
        self.middleware.push(Arc::new(middleware));
        self
    }

    pub fn add_plugin<P>(&mut self, plugin: P) -> &mut Self
    where
        P: RouterPlugin + 'static,
    {
        self.configure();
        self.plugins.push(Arc::new(plugin));
        self
    }

    /// Bind `handler` to `in_topic`; its outbound messages go to `out_topic`.
    #[allow(clippy::too_many_arguments)]
    pub fn add_handler<S, P, H>(
        &mut self,
        name: impl Into<String>,
        in_topic: impl Into<String>,
        subscriber: S,
        out_topic: impl Into<String>,
        publisher: P,
        handler: H,
    ) -> Result<&mut Self, RouterError>
    where
        S: Subscriber + 'static,
        P: Publisher + 'static,
        H: Handler + 'static,
    {
        let output = Output {
            topic: out_topic.into(),
            publisher: Arc::new(publisher),
        };
        self.bind(name.into(), in_topic.into(), Arc::new(subscriber), Some(output), Arc::new(handler))
    }

    /// Bind a sink handler. Any messages it returns are dropped with a warning.
    pub fn add_no_publisher_handler<S, H>(
        &mut self,
        name: impl Into<String>,
        in_topic: impl Into<String>,
        subscriber: S,
        handler: H,
    ) -> Result<&mut Self, RouterError>
    where
        S: Subscriber + 'static,
        H: Handler + 'static,
    {
        self.bind(name.into(), in_topic.into(), Arc::new(subscriber), None, Arc::new(handler))
    }

    fn bind(
        &mut self,
        name: String,
        topic: String,
        subscriber: Arc<dyn Subscriber>,
        output: Option<Output>,
        handler: Arc<dyn Handler>,
    ) -> Result<&mut Self, RouterError> {
        if self.bindings.iter().any(|b| b.name == name) {
            return Err(RouterError::DuplicateHandler(name));
        }
        self.configure();
        debug!(handler = %name, topic = %topic, "handler registered");
        self.bindings.push(Binding {
            name,
            topic,
            subscriber,
            output,
            handler,
        });
        Ok(self)
    }

    // Registration needs `&mut Router`, and `run()` consumes the router, so
    // only Idle and Configured are reachable here.
    fn configure(&self) {
        if self.shared.state() == RouterState::Idle {
            self.shared.set_state(RouterState::Configured);
        }
    }

    /// Run until a stop is requested or every subscription is closed.
    ///
    /// Subscribe and plugin failures are fatal: the router goes straight to
    /// `Stopped` and the error is returned.
    pub async fn run(self) -> Result<(), RouterError> {
        let Router {
            config,
            bindings,
            middleware,
            plugins,
            shared,
        } = self;

        if bindings.is_empty() {
            return Err(RouterError::NoHandlers);
        }

        let mut consumers = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let subscription = match binding.subscriber.subscribe(&binding.topic).await {
                Ok(subscription) => subscription,
                Err(source) => {
                    error!(handler = %binding.name, topic = %binding.topic, error = %source, "subscribe failed");
                    shared.shutdown.cancel();
                    shared.set_state(RouterState::Stopped);
                    return Err(RouterError::Subscribe {
                        handler: binding.name,
                        topic: binding.topic,
                        source,
                    });
                }
            };

            let handler = middleware
                .iter()
                .rev()
                .fold(binding.handler, |inner, m| m.wrap(&binding.name, inner));

            consumers.push(Consumer {
                subscription,
                dispatcher: Dispatcher {
                    name: binding.name,
                    handler,
                    output: binding.output,
                },
            });
        }

        shared.set_state(RouterState::Running);
        info!(handlers = consumers.len(), "router running");

        let handle = RouterHandle {
            shared: shared.clone(),
        };
        for plugin in &plugins {
            if let Err(e) = plugin.on_start(handle.clone()).await {
                error!(plugin = plugin.name(), error = %e, "router plugin failed to start");
                shared.shutdown.cancel();
                shared.set_state(RouterState::Stopped);
                return Err(e);
            }
        }

        let mut tasks = JoinSet::new();
        for consumer in consumers {
            tasks.spawn(consumer.run(shared.shutdown.child_token()));
        }

        // A consumer that dies takes its subscription with it, so the whole
        // router stops and reports the failure.
        let mut failure: Option<RouterError> = None;
        loop {
            tokio::select! {
                _ = shared.shutdown.cancelled() => break,
                joined = tasks.join_next() => match joined {
                    None => {
                        info!("all subscriptions closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "consumer task failed; stopping router");
                        failure = Some(RouterError::ConsumerFailed(e.to_string()));
                        break;
                    }
                    Some(Ok(())) => {}
                },
            }
        }

        shared.set_state(RouterState::Stopping);
        info!("router stopping");
        shared.shutdown.cancel();

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "consumer task failed");
                    if failure.is_none() {
                        failure = Some(RouterError::ConsumerFailed(e.to_string()));
                    }
                }
            }
        };
        if tokio::time::timeout(config.close_timeout, drain).await.is_err() {
            warn!(
                close_timeout_ms = config.close_timeout.as_millis() as u64,
                "consumers did not finish in time; aborting"
            );
            tasks.abort_all();
        }

        shared.set_state(RouterState::Stopped);
        match failure {
            Some(e) => {
                error!(error = %e, "router stopped after a consumer failure");
                Err(e)
            }
            None => {
                info!("router stopped");
                Ok(())
            }
        }
    }
}

/// One binding's consume loop. Owns the subscription; dispatch state is
/// kept apart so it can be borrowed across awaits.
struct Consumer {
    subscription: Subscription,
    dispatcher: Dispatcher,
}

impl Consumer {
    async fn run(self, cancel: CancellationToken) {
        let Consumer {
            mut subscription,
            dispatcher,
        } = self;
        debug!(handler = %dispatcher.name, topic = subscription.topic(), "consumer started");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = subscription.recv() => match next {
                    Some(delivery) => delivery,
                    None => {
                        info!(handler = %dispatcher.name, topic = subscription.topic(), "subscription closed");
                        break;
                    }
                },
            };

            // Not raced against `cancel`: an in-flight invocation always completes.
            dispatcher.dispatch(delivery).await;
        }

        debug!(handler = %dispatcher.name, "consumer stopped");
    }
}

struct Dispatcher {
    name: String,
    handler: Arc<dyn Handler>,
    output: Option<Output>,
}

impl Dispatcher {
    async fn dispatch(&self, delivery: Delivery) {
        let message_uuid = delivery.message().uuid();
        let event_id = delivery
            .message()
            .metadata_value(EVENT_ID_METADATA)
            .unwrap_or_default()
            .to_string();

        let outcome = recover(self.handler.handle(delivery.message())).await;

        let ack = match outcome {
            Ok(outbound) => match catch_panic(self.forward(outbound)).await {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    error!(handler = %self.name, %message_uuid, %event_id, error = %e, "publishing handler output failed");
                    false
                }
                Err(panic) => {
                    error!(handler = %self.name, %message_uuid, %event_id, panic = %panic, "publishing handler output panicked");
                    false
                }
            },
            Err(e @ HandlerError::Panicked(_)) => {
                error!(handler = %self.name, %message_uuid, %event_id, attempt = delivery.attempt(), error = %e, "handler panicked");
                false
            }
            Err(e) => {
                warn!(handler = %self.name, %message_uuid, %event_id, attempt = delivery.attempt(), error = %e, "handler failed");
                false
            }
        };

        let settled = if ack {
            catch_panic(delivery.ack()).await
        } else {
            catch_panic(delivery.nack()).await
        };
        match settled {
            Ok(Ok(())) => debug!(handler = %self.name, %message_uuid, ack, "message settled"),
            Ok(Err(e)) => error!(handler = %self.name, %message_uuid, ack, error = %e, "settling message failed"),
            Err(panic) => error!(handler = %self.name, %message_uuid, ack, panic = %panic, "settling message panicked"),
        }
    }

    async fn forward(&self, outbound: Vec<Message>) -> Result<(), BusError> {
        match &self.output {
            Some(output) => {
                for message in outbound {
                    output.publisher.publish(&output.topic, message).await?;
                }
            }
            None if !outbound.is_empty() => {
                warn!(handler = %self.name, dropped = outbound.len(), "handler has no publisher; dropping outbound messages");
            }
            None => {}
        }
        Ok(())
    }
}
