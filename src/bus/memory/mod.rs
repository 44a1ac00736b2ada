//! In-process broker.
//!
//! Implements the broker seam with AMQP-like routing so the transport, RPC
//! and engine layers can be exercised without RabbitMQ:
//! - default exchange routes by queue name; unroutable messages are dropped
//! - direct, fanout and topic exchanges; delayed exchanges route like direct
//!   after the message delay elapses
//! - competing consumers on a shared queue
//! - exclusive queues die with their connection, auto-delete queues with
//!   their last consumer
//!
//! `sever()` simulates connection loss, `restart()` a broker restart that
//! also wipes all declared topology.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    Acker, Binding, BrokerChannel, BusError, Connector, Delivery, DeliveryStream, ExchangeKind,
    ExchangeSpec, Link, MessageProperties, OutboundMessage, QueueSpec, Result,
};

#[derive(Clone)]
struct Stored {
    data: Vec<u8>,
    properties: MessageProperties,
}

struct Queue {
    spec: QueueSpec,
    owner: Option<u64>,
    messages: VecDeque<Stored>,
    consumers: usize,
    notify: Arc<Notify>,
}

struct Exchange {
    spec: ExchangeSpec,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct LinkHandle {
    closed: Arc<watch::Sender<bool>>,
    shutdown: CancellationToken,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    exchanges: HashMap<String, Exchange>,
    links: HashMap<u64, LinkHandle>,
    declarations: Vec<String>,
    acked: u64,
    rejected: u64,
}

struct Inner {
    state: Mutex<State>,
    fail_connects: AtomicUsize,
    connect_attempts: AtomicUsize,
    next_link_id: AtomicU64,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, exchange: &str, routing_key: &str, message: Stored) -> Result<usize> {
        let mut state = self.lock();

        let targets: Vec<String> = if exchange.is_empty() {
            vec![routing_key.to_string()]
        } else {
            let ex = state.exchanges.get(exchange).ok_or_else(|| {
                BusError::Publish(format!("NOT_FOUND - no exchange '{}'", exchange))
            })?;
            ex.bindings
                .iter()
                .filter(|(_, key)| binding_matches(&ex.spec.kind, key, routing_key))
                .map(|(queue, _)| queue.clone())
                .collect()
        };

        let mut delivered = 0;
        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.messages.push_back(message.clone());
                queue.notify.notify_one();
                delivered += 1;
            }
        }
        if delivered == 0 {
            debug!(exchange, routing_key, "Unroutable message dropped");
        }
        Ok(delivered)
    }

    fn remove_queue(state: &mut State, name: &str) {
        if let Some(queue) = state.queues.remove(name) {
            queue.notify.notify_waiters();
        }
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|(q, _)| q != name);
        }
    }

    /// Tear down a connection: cancel its channels and drop its exclusive queues.
    fn drop_link(&self, id: u64, lost: bool) {
        let mut state = self.lock();
        let Some(handle) = state.links.remove(&id) else {
            return;
        };
        handle.shutdown.cancel();

        let owned: Vec<String> = state
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(id))
            .map(|(name, _)| name.clone())
            .collect();
        for name in owned {
            Self::remove_queue(&mut state, &name);
        }
        drop(state);

        if lost {
            handle.closed.send_replace(true);
        }
    }
}

fn binding_matches(kind: &ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct | ExchangeKind::Delayed => binding_key == routing_key,
        ExchangeKind::Fanout | ExchangeKind::Headers => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let key: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &key)
        }
    }
}

fn topic_matches(pattern: &[&str], key: &[&str]) -> bool {
    match (pattern.split_first(), key.split_first()) {
        (None, None) => true,
        (Some((&"#", rest)), _) => {
            topic_matches(rest, key) || (!key.is_empty() && topic_matches(pattern, &key[1..]))
        }
        (Some((&"*", rest)), Some((_, key_rest))) => topic_matches(rest, key_rest),
        (Some((word, rest)), Some((k, key_rest))) => word == k && topic_matches(rest, key_rest),
        _ => false,
    }
}

/// In-process broker shared by every connection made through its connector.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                fail_connects: AtomicUsize::new(0),
                connect_attempts: AtomicUsize::new(0),
                next_link_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MemoryConnector {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: usize) {
        self.inner.fail_connects.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Drop every open connection as if the network failed.
    pub fn sever(&self) {
        let ids: Vec<u64> = self.inner.lock().links.keys().copied().collect();
        for id in ids {
            self.inner.drop_link(id, true);
        }
    }

    /// Sever all connections and forget all queues, exchanges and bindings.
    pub fn restart(&self) {
        {
            let mut state = self.inner.lock();
            for queue in state.queues.values() {
                queue.notify.notify_waiters();
            }
            state.queues.clear();
            state.exchanges.clear();
        }
        self.sever();
    }

    /// Declaration log, e.g. `queue:events`, `exchange:callcore.delay`,
    /// `bind:events:ari:context`.
    pub fn declarations(&self) -> Vec<String> {
        self.inner.lock().declarations.clone()
    }

    pub fn declaration_count(&self, entry: &str) -> usize {
        self.inner
            .lock()
            .declarations
            .iter()
            .filter(|d| d.as_str() == entry)
            .count()
    }

    pub fn queue_exists(&self, name: &str) -> bool {
        self.inner.lock().queues.contains_key(name)
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_depth(&self, name: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(name)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub fn consumer_count(&self, name: &str) -> usize {
        self.inner
            .lock()
            .queues
            .get(name)
            .map(|q| q.consumers)
            .unwrap_or(0)
    }

    pub fn link_count(&self) -> usize {
        self.inner.lock().links.len()
    }

    pub fn acked(&self) -> u64 {
        self.inner.lock().acked
    }

    pub fn rejected(&self) -> u64 {
        self.inner.lock().rejected
    }

    /// Place a raw message straight onto a queue.
    pub fn enqueue(&self, queue: &str, data: Vec<u8>, properties: MessageProperties) -> Result<()> {
        self.inner.route("", queue, Stored { data, properties }).map(|_| ())
    }
}

struct MemoryConnector {
    inner: Arc<Inner>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn Link>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .inner
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BusError::Connection("connection refused".to_string()));
        }

        let id = self.inner.next_link_id.fetch_add(1, Ordering::SeqCst);
        let (closed, _) = watch::channel(false);
        let closed = Arc::new(closed);
        let shutdown = CancellationToken::new();

        self.inner.lock().links.insert(
            id,
            LinkHandle {
                closed: Arc::clone(&closed),
                shutdown: shutdown.clone(),
            },
        );

        Ok(Arc::new(MemoryLink {
            id,
            inner: Arc::clone(&self.inner),
            closed,
            shutdown,
        }))
    }

    fn endpoint(&self) -> String {
        "memory://".to_string()
    }
}

struct MemoryLink {
    id: u64,
    inner: Arc<Inner>,
    closed: Arc<watch::Sender<bool>>,
    shutdown: CancellationToken,
}

#[async_trait]
impl Link for MemoryLink {
    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Connection("connection closed".to_string()));
        }
        Ok(Arc::new(MemoryChannel {
            link_id: self.id,
            inner: Arc::clone(&self.inner),
            token: self.shutdown.child_token(),
        }))
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    async fn close(&self) -> Result<()> {
        self.inner.drop_link(self.id, false);
        Ok(())
    }
}

struct MemoryChannel {
    link_id: u64,
    inner: Arc<Inner>,
    token: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(BusError::Connection("channel closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        self.ensure_open()?;
        let name = if spec.is_server_named() {
            format!("amq.gen-{}", uuid::Uuid::new_v4().simple())
        } else {
            spec.name.clone()
        };

        let mut state = self.inner.lock();
        if let Some(existing) = state.queues.get(&name) {
            if let Some(owner) = existing.owner {
                if owner != self.link_id {
                    return Err(BusError::Declare(format!(
                        "RESOURCE_LOCKED - queue '{}' is exclusive to another connection",
                        name
                    )));
                }
            }
        } else {
            state.queues.insert(
                name.clone(),
                Queue {
                    spec: spec.clone(),
                    owner: spec.exclusive.then_some(self.link_id),
                    messages: VecDeque::new(),
                    consumers: 0,
                    notify: Arc::new(Notify::new()),
                },
            );
        }
        state.declarations.push(format!("queue:{}", name));
        Ok(name)
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.lock();
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing.spec.kind != spec.kind => {
                return Err(BusError::Declare(format!(
                    "PRECONDITION_FAILED - exchange '{}' redeclared as {} (was {})",
                    spec.name,
                    spec.kind.as_str(),
                    existing.spec.kind.as_str()
                )));
            }
            Some(_) => {}
            None => {
                state.exchanges.insert(
                    spec.name.clone(),
                    Exchange {
                        spec: spec.clone(),
                        bindings: Vec::new(),
                    },
                );
            }
        }
        state.declarations.push(format!("exchange:{}", spec.name));
        Ok(())
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.inner.lock();
        if !state.queues.contains_key(&binding.queue) {
            return Err(BusError::Declare(format!(
                "NOT_FOUND - no queue '{}'",
                binding.queue
            )));
        }
        let exchange = state.exchanges.get_mut(&binding.exchange).ok_or_else(|| {
            BusError::Declare(format!("NOT_FOUND - no exchange '{}'", binding.exchange))
        })?;
        let entry = (binding.queue.clone(), binding.routing_key.clone());
        if !exchange.bindings.contains(&entry) {
            exchange.bindings.push(entry);
        }
        state.declarations.push(format!(
            "bind:{}:{}:{}",
            binding.queue, binding.exchange, binding.routing_key
        ));
        Ok(())
    }

    async fn set_prefetch(&self, _count: u16) -> Result<()> {
        self.ensure_open()
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_open()?;
        let stored = Stored {
            data: message.payload,
            properties: message.properties,
        };

        let delayed = !exchange.is_empty()
            && self
                .inner
                .lock()
                .exchanges
                .get(exchange)
                .map(|e| e.spec.kind == ExchangeKind::Delayed)
                .unwrap_or(false);

        match message.delay {
            Some(delay) if delayed => {
                let inner = Arc::clone(&self.inner);
                let exchange = exchange.to_string();
                let routing_key = routing_key.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inner.route(&exchange, &routing_key, stored);
                });
                Ok(())
            }
            _ => self.inner.route(exchange, routing_key, stored).map(|_| ()),
        }
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream> {
        self.ensure_open()?;
        {
            let mut state = self.inner.lock();
            let q = state.queues.get_mut(queue).ok_or_else(|| {
                BusError::Consume(format!("NOT_FOUND - no queue '{}'", queue))
            })?;
            q.consumers += 1;
        }
        debug!(queue, consumer_tag, "Consumer registered");

        let consumer = Consumer {
            inner: Arc::clone(&self.inner),
            queue: queue.to_string(),
            token: self.token.child_token(),
            auto_ack,
        };
        let stream = futures::stream::unfold(consumer, |consumer| async move {
            let delivery = consumer.next().await?;
            Some((Ok(delivery), consumer))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.token.cancel();
        Ok(())
    }
}

struct Consumer {
    inner: Arc<Inner>,
    queue: String,
    token: CancellationToken,
    auto_ack: bool,
}

impl Consumer {
    async fn next(&self) -> Option<Delivery> {
        loop {
            let notify = {
                let mut state = self.inner.lock();
                if self.token.is_cancelled() {
                    return None;
                }
                let queue = state.queues.get_mut(&self.queue)?;
                if let Some(message) = queue.messages.pop_front() {
                    return Some(self.delivery(message));
                }
                Arc::clone(&queue.notify)
            };

            tokio::select! {
                _ = self.token.cancelled() => return None,
                _ = notify.notified() => {}
            }
        }
    }

    fn delivery(&self, message: Stored) -> Delivery {
        let acker = MemoryAcker {
            inner: Arc::clone(&self.inner),
            queue: self.queue.clone(),
            message: message.clone(),
            auto_ack: self.auto_ack,
            settled: AtomicBool::new(false),
        };
        Delivery::new(message.data, message.properties, Box::new(acker))
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        let mut state = self.inner.lock();
        let remove = match state.queues.get_mut(&self.queue) {
            Some(queue) => {
                queue.consumers = queue.consumers.saturating_sub(1);
                queue.spec.auto_delete && queue.consumers == 0
            }
            None => false,
        };
        if remove {
            Inner::remove_queue(&mut state, &self.queue);
        }
    }
}

struct MemoryAcker {
    inner: Arc<Inner>,
    queue: String,
    message: Stored,
    auto_ack: bool,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<()> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BusError::Ack("PRECONDITION_FAILED - delivery already settled".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle()?;
        self.inner.lock().acked += 1;
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        if self.auto_ack {
            return Ok(());
        }
        self.settle()?;
        let mut state = self.inner.lock();
        state.rejected += 1;
        if requeue {
            if let Some(queue) = state.queues.get_mut(&self.queue) {
                queue.messages.push_front(self.message.clone());
                queue.notify.notify_one();
            }
        }
        Ok(())
    }
}
