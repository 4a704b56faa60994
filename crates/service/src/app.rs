use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use eventrelay_events::{
    ForwardEventHandler, InMemoryBus, InMemoryBusConfig, InstrumentHandler, Publisher, Recoverer, Router,
    RouterError, RouterHandle, SignalsHandler, Subscriber,
};
use eventrelay_infra::event_bus::{RedisStreamsBus, RedisStreamsConfig};
use eventrelay_infra::{
    BusBackend, EventProducer, EventStore, InMemoryEventStore, PostgresEventStore, ProducerError, ProducerStats,
    RelayConfig, StoreBackend,
};

/// Publisher and subscriber halves of the configured bus.
#[derive(Clone)]
struct Bus {
    publisher: Arc<dyn Publisher>,
    subscriber: Arc<dyn Subscriber>,
}

/// A fully wired relay: producer and router over the configured backends.
pub struct Relay {
    router: Router,
    producer: EventProducer<Arc<dyn EventStore>, Arc<dyn Publisher>>,
}

impl Relay {
    /// Connect the backends named in `config` and register the forwarding handler.
    pub async fn build(config: &RelayConfig) -> anyhow::Result<Self> {
        let store = build_store(config).await?;
        let bus = build_bus(config).await?;

        let mut router = Router::new(config.router())?;
        router
            .add_middleware(InstrumentHandler)
            .add_middleware(Recoverer)
            .add_plugin(SignalsHandler)
            .add_handler(
                config.handler_name.clone(),
                config.events_topic.clone(),
                bus.subscriber.clone(),
                config.forward_topic.clone(),
                bus.publisher.clone(),
                ForwardEventHandler::new(),
            )?;

        let producer = EventProducer::new(store, bus.publisher, config.producer());

        Ok(Self { router, producer })
    }

    /// Handle for stopping the relay from outside (tests, embedding processes).
    pub fn handle(&self) -> RouterHandle {
        self.router.handle()
    }

    /// Run until the router stops or the producer fails.
    ///
    /// - Router stops (signal, `RouterHandle::stop`, bus closed): the producer is
    ///   cancelled and `run` returns the router's result.
    /// - Producer fails to publish: the router is stopped, drained, and the
    ///   publish error is returned.
    pub async fn run(self) -> anyhow::Result<()> {
        let handle = self.router.handle();
        let mut router_task = tokio::spawn(self.router.run());

        // Subscriptions must exist before the first publish.
        tokio::select! {
            _ = handle.running() => {}
            result = &mut router_task => {
                return router_outcome(result).and_then(|()| Err(anyhow!("router exited before it started")));
            }
        }

        let cancel = CancellationToken::new();
        let mut producer_task = tokio::spawn(self.producer.run(cancel.clone()));

        tokio::select! {
            result = &mut producer_task => {
                handle.stop();
                if let Err(e) = router_outcome(router_task.await) {
                    error!(error = %format!("{e:#}"), "router failed while stopping");
                }
                producer_outcome(result).map(|stats| {
                    warn!(published = stats.published, "producer exited without being cancelled");
                })
            }
            result = &mut router_task => {
                cancel.cancel();
                match producer_outcome(producer_task.await) {
                    Ok(stats) => info!(
                        produced = stats.produced,
                        published = stats.published,
                        dropped = stats.dropped,
                        "relay stopped"
                    ),
                    Err(e) => error!(error = %format!("{e:#}"), "producer failed while stopping"),
                }
                router_outcome(result)
            }
        }
    }
}

/// Build and run the relay described by `config`.
pub async fn run(config: RelayConfig) -> anyhow::Result<()> {
    Relay::build(&config).await?.run().await
}

async fn build_store(config: &RelayConfig) -> anyhow::Result<Arc<dyn EventStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            let store = PostgresEventStore::connect(&config.database_url)
                .await
                .context("failed to connect to Postgres")?;
            store
                .ensure_schema()
                .await
                .context("failed to create the events table")?;
            info!("using Postgres event store");
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("using in-memory event store; events do not survive a restart");
            Ok(Arc::new(InMemoryEventStore::new()))
        }
    }
}

async fn build_bus(config: &RelayConfig) -> anyhow::Result<Bus> {
    match config.bus_backend {
        BusBackend::Redis => {
            let redis_config = RedisStreamsConfig {
                max_retries: config.max_retries,
                ..RedisStreamsConfig::default()
            };
            let bus = Arc::new(
                RedisStreamsBus::connect(&config.redis_url, redis_config)
                    .await
                    .context("failed to connect to Redis")?,
            );
            info!("using Redis Streams bus");
            Ok(Bus {
                publisher: bus.clone(),
                subscriber: bus,
            })
        }
        BusBackend::Memory => {
            warn!("using in-memory bus; messages stay inside this process");
            let bus = Arc::new(InMemoryBus::with_config(InMemoryBusConfig {
                max_redeliveries: config.max_retries,
                ..InMemoryBusConfig::default()
            }));
            Ok(Bus {
                publisher: bus.clone(),
                subscriber: bus,
            })
        }
    }
}

fn router_outcome(
    joined: Result<Result<(), RouterError>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    joined.context("router task panicked")??;
    Ok(())
}

fn producer_outcome(
    joined: Result<Result<ProducerStats, ProducerError>, tokio::task::JoinError>,
) -> anyhow::Result<ProducerStats> {
    Ok(joined.context("producer task panicked")??)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn in_memory_config() -> RelayConfig {
        RelayConfig::from_lookup(|var| match var {
            "STORE_BACKEND" | "BUS_BACKEND" => Some("memory".to_string()),
            "PRODUCE_INTERVAL_SECS" | "ROUTER_CLOSE_TIMEOUT_SECS" => Some("1".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn in_memory_relay_stops_cleanly() {
        let relay = Relay::build(&in_memory_config()).await.unwrap();
        let handle = relay.handle();
        let task = tokio::spawn(relay.run());

        handle.running().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("relay did not stop")
            .unwrap()
            .unwrap();
    }
}
