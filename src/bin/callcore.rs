//! callcore: switch event engine
//!
//! Consumes switch events from the broker, mirrors channel and bridge state,
//! and sends corrective commands to the switches over RPC.
//!
//! ## Architecture
//! ```text
//! [switch] -> [event queue] -> [callcore] -> [asterisk-request-<peer>] -> [switch]
//!                                  ^   |
//!                                  |   v
//!                     [request queue] <- [delay exchange]   (health checks)
//! ```
//!
//! ## Configuration
//! - `callcore.yaml`, or the file named by CALLCORE_CONFIG
//! - CALLCORE__<SECTION>__<KEY> environment overrides
//! - CALLCORE_LOG: tracing filter (default: info)
//! - CALLCORE_LOG_FORMAT: set to "json" for JSON logs

use std::sync::Arc;

use prometheus::Registry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use callcore::bus::{AmqpConnector, Publisher, Transport};
use callcore::call_control::{CallControlRouter, LoggingCallControl};
use callcore::config::Config;
use callcore::engine::{declare_topology, Engine, EngineContext, HealthScheduler};
use callcore::metrics::{self, Metrics};
use callcore::rpc::RpcClient;
use callcore::store::MemoryStore;
use callcore::switch::SwitchClient;
use callcore::utils::bootstrap::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = Config::load(None).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting callcore");

    // Not scraped here; an embedding process serves `metrics::encode(&registry)`.
    let registry = Registry::new();
    let metrics = Metrics::register(&registry)?;

    let transport = Transport::new(
        Arc::new(AmqpConnector::new(config.messaging.url.as_str())),
        config.messaging.backoff(),
    );
    transport.connect().await?;
    declare_topology(&transport, &config.engine, &config.messaging.delay_exchange).await?;

    let publisher = Publisher::new(
        Arc::clone(&transport),
        config.messaging.delay_exchange.as_str(),
    );
    let rpc = RpcClient::new(
        publisher,
        config.rpc.publisher.as_str(),
        config.rpc.request_timeout(),
    )
    .with_metrics(metrics.clone());
    let switch = SwitchClient::new(rpc.clone(), config.rpc.switch_target_prefix.as_str());
    let health = HealthScheduler::new(
        rpc,
        config.engine.request_queue.as_str(),
        config.engine.health_check_delay(),
        config.engine.health_check_max_retries,
    );

    let router = CallControlRouter::new(
        config.engine.stasis_routing_key.as_str(),
        Arc::new(LoggingCallControl),
    );
    let ctx = EngineContext::new(
        Arc::new(MemoryStore::new()),
        Arc::new(switch),
        router,
        config.engine.exist_timeout(),
    )
    .with_health(health)
    .with_metrics(metrics);

    let engine = Engine::new(ctx, config.engine.clone());
    let shutdown = CancellationToken::new();
    let handles = engine.spawn(
        &transport,
        config.messaging.prefetch,
        config.messaging.backoff(),
        shutdown.clone(),
    );

    info!("callcore running, press Ctrl+C to exit");
    shutdown_signal().await?;

    info!("Shutting down");
    shutdown.cancel();
    for handle in handles {
        let _ = handle.await;
    }
    transport.close().await?;
    debug!(metrics = %metrics::encode(&registry)?, "Final metrics");

    Ok(())
}
