use std::future::Future;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{RouterError, RouterHandle};

/// Hook run once when the router enters `Running`.
///
/// A plugin gets a [`RouterHandle`] and may keep it (for example to stop the
/// router later from a background task). An error from `on_start` aborts `run()`.
#[async_trait]
pub trait RouterPlugin: Send + Sync {
    fn name(&self) -> &str;

    async fn on_start(&self, router: RouterHandle) -> Result<(), RouterError>;
}

/// Stops the router on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalsHandler;

#[async_trait]
impl RouterPlugin for SignalsHandler {
    fn name(&self) -> &str {
        "signals"
    }

    async fn on_start(&self, router: RouterHandle) -> Result<(), RouterError> {
        #[cfg(unix)]
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).map_err(
                |e| RouterError::Plugin {
                    plugin: self.name().to_string(),
                    reason: format!("failed to install SIGTERM handler: {e}"),
                },
            )?;

        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async move {
            terminate.recv().await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        spawn_listener(router, ctrl_c, terminate);
        Ok(())
    }
}

/// Stop `router` when either signal future resolves.
///
/// The task also ends once the router stops for any other reason.
fn spawn_listener<C, T>(router: RouterHandle, ctrl_c: C, terminate: T) -> JoinHandle<()>
where
    C: Future<Output = ()> + Send + 'static,
    T: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::select! {
            () = ctrl_c => {
                info!("received SIGINT (Ctrl-C), stopping router");
                router.stop();
            }
            () = terminate => {
                info!("received SIGTERM, stopping router");
                router.stop();
            }
            () = router.stopped() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ForwardEventHandler, InMemoryBus, Router, RouterConfig, RouterState};
    use std::future::pending;
    use std::time::Duration;
    use tokio::sync::oneshot;

    async fn running_router() -> (RouterHandle, JoinHandle<Result<(), RouterError>>) {
        let bus = InMemoryBus::new();
        let mut router = Router::new(RouterConfig::default()).unwrap();
        router
            .add_no_publisher_handler("sink", "events", bus, ForwardEventHandler::new())
            .unwrap();
        let handle = router.handle();
        let task = tokio::spawn(router.run());
        handle.running().await;
        (handle, task)
    }

    #[tokio::test]
    async fn listener_exits_when_the_router_stops_on_its_own() {
        let (handle, task) = running_router().await;
        let listener = spawn_listener(handle.clone(), pending(), pending());

        handle.stop();
        task.await.unwrap().unwrap();

        tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .expect("listener outlived the router")
            .unwrap();
    }

    #[tokio::test]
    async fn terminate_signal_stops_the_router() {
        let (handle, task) = running_router().await;
        let (send_term, term) = oneshot::channel::<()>();
        let listener = spawn_listener(handle.clone(), pending(), async move {
            let _ = term.await;
        });

        send_term.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("router did not stop on SIGTERM")
            .unwrap()
            .unwrap();
        listener.await.unwrap();
        assert_eq!(handle.state(), RouterState::Stopped);
    }

    #[tokio::test]
    async fn signals_plugin_starts_with_the_router() {
        let bus = InMemoryBus::new();
        let mut router = Router::new(RouterConfig::default()).unwrap();
        router
            .add_plugin(SignalsHandler)
            .add_no_publisher_handler("sink", "events", bus, ForwardEventHandler::new())
            .unwrap();
        let handle = router.handle();
        let task = tokio::spawn(router.run());

        handle.running().await;
        handle.stop();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("router with signals plugin did not stop")
            .unwrap()
            .unwrap();
        assert_eq!(handle.state(), RouterState::Stopped);
    }
}
