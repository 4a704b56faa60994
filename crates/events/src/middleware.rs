//! Handler middleware.
//!
//! A [`Middleware`] wraps a handler in another handler. The router applies its
//! middleware to every binding at `run()`; the first middleware added is the
//! outermost one.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::FutureExt;
use tracing::{Instrument, debug, info_span};

use crate::{Handler, HandlerError, HandlerResult, Message};

pub trait Middleware: Send + Sync {
    fn wrap(&self, handler_name: &str, inner: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Turns a panic inside the wrapped handler into [`HandlerError::Panicked`].
///
/// The router already runs every invocation inside the same boundary; adding
/// `Recoverer` explicitly keeps panics from escaping middleware that sits
/// outside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Recoverer;

impl Middleware for Recoverer {
    fn wrap(&self, _handler_name: &str, inner: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(Recovering { inner })
    }
}

struct Recovering {
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Recovering {
    async fn handle(&self, message: &Message) -> HandlerResult {
        recover(self.inner.handle(message)).await
    }
}

/// Runs each invocation inside a `handle_message` span and logs its outcome.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentHandler;

impl Middleware for InstrumentHandler {
    fn wrap(&self, handler_name: &str, inner: Arc<dyn Handler>) -> Arc<dyn Handler> {
        Arc::new(Instrumented {
            name: handler_name.to_string(),
            inner,
        })
    }
}

struct Instrumented {
    name: String,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for Instrumented {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let span = info_span!("handle_message", handler = %self.name, message_uuid = %message.uuid());
        async {
            let started = Instant::now();
            let result = self.inner.handle(message).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(out) => debug!(outbound = out.len(), elapsed_ms, "handler succeeded"),
                Err(e) => debug!(error = %e, elapsed_ms, "handler failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Await a handler future, converting a panic into a typed error.
pub(crate) async fn recover<F>(fut: F) -> HandlerResult
where
    F: Future<Output = HandlerResult> + Send,
{
    catch_panic(fut).await.unwrap_or_else(|msg| Err(HandlerError::Panicked(msg)))
}

/// Await any future, returning the panic message if it panicked.
pub(crate) async fn catch_panic<F>(fut: F) -> Result<F::Output, String>
where
    F: Future + Send,
{
    AssertUnwindSafe(fut)
        .catch_unwind()
        .await
        .map_err(|panic| panic_message(panic.as_ref()))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eventrelay_core::MessageId;

    struct Panics;

    #[async_trait]
    impl Handler for Panics {
        async fn handle(&self, _message: &Message) -> HandlerResult {
            panic!("boom");
        }
    }

    fn message() -> Message {
        Message::new(MessageId::new(), b"{}".to_vec())
    }

    #[tokio::test]
    async fn recoverer_turns_panics_into_errors() {
        let wrapped = Recoverer.wrap("panics", Arc::new(Panics));
        let err = wrapped.handle(&message()).await.unwrap_err();
        match err {
            HandlerError::Panicked(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn recover_keeps_formatted_panic_messages() {
        async fn explode(n: u32) -> HandlerResult {
            panic!("bad message {n}")
        }

        let result = recover(explode(7)).await;
        assert!(matches!(result, Err(HandlerError::Panicked(m)) if m == "bad message 7"));
    }

    #[tokio::test]
    async fn wrappers_pass_results_through() {
        let echo: Arc<dyn Handler> =
            Arc::new(|m: &Message| -> HandlerResult { Ok(vec![m.clone()]) });
        let wrapped = InstrumentHandler.wrap("echo", Recoverer.wrap("echo", echo));

        let input = message();
        assert_eq!(wrapped.handle(&input).await.unwrap(), vec![input]);
    }
}
