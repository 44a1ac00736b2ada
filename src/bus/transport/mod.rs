//! Broker transport: one physical connection, reconnection, topology replay.
//!
//! `connect()` retries with capped exponential backoff until the broker
//! accepts the connection. Every queue, exchange and binding declared through
//! the transport is recorded; when the connection drops unexpectedly the
//! reconnector re-establishes it and replays the recorded topology before the
//! transport reports itself connected again.
//!
//! Connection failures are retried indefinitely. Callers never see a fatal
//! error for a lost connection: publishes fail fast with
//! `BusError::Unavailable` and consume loops stall in `wait_connected()`
//! until the broker is reachable again. Only declarations made while the
//! transport is unavailable (e.g. during startup) surface as errors.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    Binding, BrokerChannel, BusError, Connector, ExchangeSpec, Link, QueueSpec, Result,
};

/// Reconnect backoff bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub(crate) fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(usize::MAX)
            .with_jitter()
    }
}

/// Connection state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    /// Connected; `generation` increments on every (re)connection.
    Connected { generation: u64 },
    /// `close()` was called. Terminal.
    Closed,
}

/// Declarations recorded for replay, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    fn record_queue(&mut self, spec: QueueSpec) {
        match self.queues.iter_mut().find(|q| q.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.queues.push(spec),
        }
    }

    fn record_exchange(&mut self, spec: ExchangeSpec) {
        match self.exchanges.iter_mut().find(|e| e.name == spec.name) {
            Some(existing) => *existing = spec,
            None => self.exchanges.push(spec),
        }
    }

    fn record_binding(&mut self, binding: Binding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

/// Shared broker connection.
///
/// Every publish, RPC call and consumer opens its own logical channel over
/// the single physical connection owned here.
pub struct Transport {
    connector: Arc<dyn Connector>,
    backoff: BackoffConfig,
    link: RwLock<Option<Arc<dyn Link>>>,
    topology: Mutex<Topology>,
    state: watch::Sender<LinkState>,
    generation: AtomicU64,
    /// Serializes connection attempts so only one link is ever live.
    connecting: Mutex<()>,
    shutdown: CancellationToken,
    reconnector: std::sync::Once,
}

impl Transport {
    pub fn new(connector: Arc<dyn Connector>, backoff: BackoffConfig) -> Arc<Self> {
        let (state, _) = watch::channel(LinkState::Disconnected);
        Arc::new(Self {
            connector,
            backoff,
            link: RwLock::new(None),
            topology: Mutex::new(Topology::default()),
            state,
            generation: AtomicU64::new(0),
            connecting: Mutex::new(()),
            shutdown: CancellationToken::new(),
            reconnector: std::sync::Once::new(),
        })
    }

    /// Establish the connection, blocking until the broker accepts it.
    ///
    /// Starts the reconnector on first success. Returns `BusError::Closed`
    /// only if `close()` is called while connecting.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        if self.current_link().await.is_some() {
            return Ok(());
        }

        {
            let _connecting = self.connecting.lock().await;
            if self.current_link().await.is_none() {
                self.establish().await?;
            }
        }

        self.reconnector.call_once(|| {
            let weak = Arc::downgrade(self);
            tokio::spawn(reconnect_loop(weak, self.shutdown.clone()));
        });

        Ok(())
    }

    /// Connect, replay topology, publish the new link.
    async fn establish(&self) -> Result<()> {
        let mut backoff = self.backoff.builder().build();
        let endpoint = self.connector.endpoint();

        loop {
            if self.is_closed() {
                return Err(BusError::Closed);
            }

            let attempt = match self.connector.connect().await {
                Ok(link) => match self.replay(&link).await {
                    Ok(()) => Ok(link),
                    Err(e) => {
                        let _ = link.close().await;
                        Err(e)
                    }
                },
                Err(e) => Err(e),
            };

            match attempt {
                Ok(link) => {
                    *self.link.write().await = Some(Arc::clone(&link));
                    let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let published = self.state.send_if_modified(|state| match state {
                        LinkState::Closed => false,
                        _ => {
                            *state = LinkState::Connected { generation };
                            true
                        }
                    });
                    if !published {
                        self.link.write().await.take();
                        let _ = link.close().await;
                        return Err(BusError::Closed);
                    }
                    info!(endpoint = %endpoint, generation, "Connected to broker");
                    return Ok(());
                }
                Err(e) => {
                    let delay = backoff.next().unwrap_or(self.backoff.max_delay);
                    warn!(
                        endpoint = %endpoint,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Broker connection failed, retrying after backoff"
                    );
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(BusError::Closed),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Re-declare every recorded exchange, queue and binding on a fresh link.
    async fn replay(&self, link: &Arc<dyn Link>) -> Result<()> {
        let topology = self.topology.lock().await;
        if topology.is_empty() {
            return Ok(());
        }

        let channel = link.open_channel().await?;
        for exchange in &topology.exchanges {
            channel.declare_exchange(exchange).await?;
        }
        for queue in &topology.queues {
            channel.declare_queue(queue).await?;
        }
        for binding in &topology.bindings {
            channel.bind_queue(binding).await?;
        }
        let _ = channel.close().await;

        info!(
            exchanges = topology.exchanges.len(),
            queues = topology.queues.len(),
            bindings = topology.bindings.len(),
            "Replayed broker topology"
        );
        Ok(())
    }

    async fn current_link(&self) -> Option<Arc<dyn Link>> {
        self.link.read().await.clone()
    }

    async fn mark_disconnected(&self) {
        self.link.write().await.take();
        self.state.send_if_modified(|state| match state {
            LinkState::Connected { .. } => {
                *state = LinkState::Disconnected;
                true
            }
            _ => false,
        });
    }

    /// Open a logical channel on the current connection.
    ///
    /// Fails fast with `BusError::Unavailable` while reconnecting.
    pub async fn channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        match self.current_link().await {
            Some(link) => link.open_channel().await,
            None if self.is_closed() => Err(BusError::Closed),
            None => Err(BusError::Unavailable),
        }
    }

    /// Wait until the transport is connected.
    ///
    /// Returns `BusError::Closed` once the transport has been closed.
    pub async fn wait_connected(&self) -> Result<u64> {
        let mut rx = self.state.subscribe();
        loop {
            match *rx.borrow_and_update() {
                LinkState::Connected { generation } => return Ok(generation),
                LinkState::Closed => return Err(BusError::Closed),
                LinkState::Disconnected => {}
            }
            if rx.changed().await.is_err() {
                return Err(BusError::Closed);
            }
        }
    }

    /// Declare a queue now and record it for replay.
    ///
    /// Broker-named queues are returned but not recorded.
    pub async fn declare_queue(&self, spec: QueueSpec) -> Result<String> {
        let mut topology = self.topology.lock().await;
        let channel = self.channel().await?;
        let declared = channel.declare_queue(&spec).await;
        let _ = channel.close().await;
        let name = declared?;

        if !spec.is_server_named() {
            debug!(queue = %name, "Recorded queue declaration");
            topology.record_queue(spec);
        }
        Ok(name)
    }

    /// Declare an exchange now and record it for replay.
    pub async fn declare_exchange(&self, spec: ExchangeSpec) -> Result<()> {
        let mut topology = self.topology.lock().await;
        let channel = self.channel().await?;
        let declared = channel.declare_exchange(&spec).await;
        let _ = channel.close().await;
        declared?;

        debug!(exchange = %spec.name, kind = spec.kind.as_str(), "Recorded exchange declaration");
        topology.record_exchange(spec);
        Ok(())
    }

    /// Bind a queue to an exchange now and record the binding for replay.
    pub async fn bind_queue(
        &self,
        queue: impl Into<String>,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Result<()> {
        let binding = Binding {
            queue: queue.into(),
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        };

        let mut topology = self.topology.lock().await;
        let channel = self.channel().await?;
        let bound = channel.bind_queue(&binding).await;
        let _ = channel.close().await;
        bound?;

        topology.record_binding(binding);
        Ok(())
    }

    /// Snapshot of the recorded topology.
    pub async fn topology(&self) -> Topology {
        self.topology.lock().await.clone()
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state.borrow(), LinkState::Closed)
    }

    /// Token cancelled when the transport closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close the transport and stop reconnecting. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let already = matches!(self.state.send_replace(LinkState::Closed), LinkState::Closed);
        if already {
            return Ok(());
        }
        self.shutdown.cancel();

        if let Some(link) = self.link.write().await.take() {
            if let Err(e) = link.close().await {
                warn!(error = %e, "Error closing broker connection");
            }
        }
        info!("Transport closed");
        Ok(())
    }
}

/// Block until the link reports loss, then reconnect. Repeats until the
/// transport is closed or dropped.
async fn reconnect_loop(transport: Weak<Transport>, shutdown: CancellationToken) {
    loop {
        let mut closed = {
            let Some(t) = transport.upgrade() else { return };
            match t.current_link().await {
                Some(link) => link.closed(),
                None => {
                    drop(t);
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                    }
                }
            }
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = wait_lost(&mut closed) => {}
        }

        let Some(t) = transport.upgrade() else { return };
        if t.is_closed() {
            return;
        }

        warn!(endpoint = %t.connector.endpoint(), "Broker connection lost, reconnecting");
        t.mark_disconnected().await;

        let _connecting = t.connecting.lock().await;
        if t.current_link().await.is_some() {
            continue;
        }
        if let Err(e) = t.establish().await {
            match e {
                BusError::Closed => return,
                other => error!(error = %other, "Reconnect aborted"),
            }
        }
    }
}

async fn wait_lost(closed: &mut watch::Receiver<bool>) {
    while !*closed.borrow_and_update() {
        if closed.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests;
