//! In-memory broker
//!
//! Implements the same contract as the AMQP transport on top of plain queues in
//! process memory: durable queue declaration, manual acknowledgement, prefetch
//! limits, reject with optional dead-lettering and redelivery of unacknowledged
//! messages when a connection drops. Connection loss and broker restarts can be
//! triggered explicitly, which makes it the transport of choice for tests and
//! local runs without a broker.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    Acknowledger, BrokerChannel, ChannelSetup, Connector, DeliveryStream, OutgoingMessage,
    QueueMessage,
};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    persistent: bool,
    redelivered: bool,
    timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct Unacked {
    message: StoredMessage,
    channel: u64,
    consumer: u64,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    durable: bool,
    dead_letter: Option<String>,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
}

impl MemoryQueue {
    fn outstanding(&self, consumer: u64) -> usize {
        self.unacked
            .values()
            .filter(|entry| entry.consumer == consumer)
            .count()
    }
}

/// Counters exposed for inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    pub published: u64,
    pub delivered: u64,
    pub acknowledged: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub redelivered: u64,
}

#[derive(Debug)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    reachable: bool,
    open: HashSet<u64>,
    next_channel: u64,
    next_tag: u64,
    next_consumer: u64,
    max_outstanding: usize,
    connect_attempts: Vec<Instant>,
    stats: MemoryBrokerStats,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            queues: HashMap::new(),
            reachable: true,
            open: HashSet::new(),
            next_channel: 0,
            next_tag: 0,
            next_consumer: 0,
            max_outstanding: 0,
            connect_attempts: Vec::new(),
            stats: MemoryBrokerStats::default(),
        }
    }
}

impl BrokerState {
    fn declare(&mut self, name: &str, dead_letter: Option<&str>) -> BrokerResult<()> {
        match self.queues.get(name) {
            Some(existing) if existing.dead_letter.as_deref() != dead_letter => {
                Err(BrokerError::Channel(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'x-dead-letter-routing-key' for queue '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    MemoryQueue {
                        durable: true,
                        dead_letter: dead_letter.map(str::to_string),
                        ..Default::default()
                    },
                );
                Ok(())
            }
        }
    }

    /// Move unacknowledged messages held by channels that are no longer open
    /// back to the front of their queue
    fn requeue_orphaned(&mut self) {
        let mut requeued = 0;
        for queue in self.queues.values_mut() {
            let orphaned: Vec<u64> = queue
                .unacked
                .iter()
                .filter(|(_, entry)| !self.open.contains(&entry.channel))
                .map(|(tag, _)| *tag)
                .collect();

            let mut entries: Vec<(u64, Unacked)> = orphaned
                .into_iter()
                .filter_map(|tag| queue.unacked.remove(&tag).map(|entry| (tag, entry)))
                .collect();
            entries.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (_, entry) in entries {
                let mut message = entry.message;
                message.redelivered = true;
                queue.ready.push_front(message);
                requeued += 1;
            }
        }
        self.stats.redelivered += requeued;
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<BrokerState>,
    notify: Notify,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handle to an in-memory broker; clones share the same queues
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make new connection attempts succeed or fail
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.state().reachable = reachable;
    }

    /// Drop every open connection, as on a network failure
    ///
    /// Unacknowledged messages go back to their queue and will be redelivered.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.state();
            state.open.clear();
            state.requeue_orphaned();
        }
        debug!("in-memory broker dropped all connections");
        self.shared.notify.notify_waiters();
    }

    /// Simulate a broker restart: connections drop and only persistent
    /// messages in durable queues survive
    pub fn restart(&self) {
        {
            let mut state = self.shared.state();
            state.open.clear();
            state.requeue_orphaned();
            state.queues.retain(|_, queue| queue.durable);
            for queue in state.queues.values_mut() {
                queue.ready.retain(|message| message.persistent);
            }
        }
        debug!("in-memory broker restarted");
        self.shared.notify.notify_waiters();
    }

    /// Push a raw payload straight onto a queue, bypassing any channel
    pub fn inject(&self, queue: &str, body: impl Into<Vec<u8>>) {
        {
            let mut state = self.shared.state();
            let queue = state.queues.entry(queue.to_string()).or_insert_with(|| MemoryQueue {
                durable: true,
                ..Default::default()
            });
            queue.ready.push_back(StoredMessage {
                body: body.into(),
                persistent: true,
                redelivered: false,
                timestamp: None,
            });
            state.stats.published += 1;
        }
        self.shared.notify.notify_waiters();
    }

    pub fn queue_is_durable(&self, queue: &str) -> Option<bool> {
        self.shared.state().queues.get(queue).map(|q| q.durable)
    }

    pub fn ready_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .state()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting in a queue, oldest first
    pub fn ready_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    /// Highest number of unacknowledged deliveries any single consumer held
    pub fn max_outstanding(&self) -> usize {
        self.shared.state().max_outstanding
    }

    pub fn open_channels(&self) -> usize {
        self.shared.state().open.len()
    }

    /// Instants of all connection attempts, successful or not
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.shared.state().connect_attempts.clone()
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        self.shared.state().stats
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, setup: &ChannelSetup) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let id = {
            let mut state = self.shared.state();
            state.connect_attempts.push(Instant::now());

            if !state.reachable {
                return Err(BrokerError::Connection("connection refused".to_string()));
            }

            if let Some(dead_letter) = &setup.dead_letter_queue {
                state.declare(dead_letter, None)?;
            }
            state.declare(&setup.queue, setup.dead_letter_queue.as_deref())?;
            state.next_channel += 1;
            let id = state.next_channel;
            state.open.insert(id);
            id
        };

        trace!(queue = %setup.queue, channel = id, "in-memory channel opened");

        Ok(Arc::new(MemoryChannel {
            shared: Arc::clone(&self.shared),
            id,
            prefetch: setup.prefetch(),
        }))
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: u64,
    prefetch: Option<u16>,
}

impl MemoryChannel {
    fn check_open(&self) -> BrokerResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::NoChannel)
        }
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn publish(&self, queue: &str, message: OutgoingMessage) -> BrokerResult<()> {
        self.check_open()?;

        {
            let mut state = self.shared.state();
            match state.queues.get_mut(queue) {
                Some(target) => {
                    target.ready.push_back(StoredMessage {
                        body: message.body,
                        persistent: message.persistent,
                        redelivered: false,
                        timestamp: Some(message.timestamp),
                    });
                    state.stats.published += 1;
                }
                None => trace!(queue, "message to undeclared queue dropped"),
            }
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str, _consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let consumer = {
            let mut state = self.shared.state();
            if !state.open.contains(&self.id) {
                return Err(BrokerError::NoChannel);
            }
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Channel(format!("NOT_FOUND - no queue '{queue}'")));
            }
            state.next_consumer += 1;
            state.next_consumer
        };

        let cursor = ConsumerCursor {
            shared: Arc::clone(&self.shared),
            queue: queue.to_string(),
            consumer,
            channel: self.id,
            prefetch: self.prefetch,
        };

        Ok(stream::unfold(cursor, |cursor| async move {
            let message = cursor.next_delivery().await?;
            Some((Ok(message), cursor))
        })
        .boxed())
    }

    fn is_open(&self) -> bool {
        self.shared.state().open.contains(&self.id)
    }

    async fn closed(&self) {
        loop {
            let notified = self.shared.notify.notified();
            if !self.is_open() {
                return;
            }
            notified.await;
        }
    }

    async fn close(&self) -> BrokerResult<()> {
        {
            let mut state = self.shared.state();
            if !state.open.remove(&self.id) {
                return Ok(());
            }
            state.requeue_orphaned();
        }
        self.shared.notify.notify_waiters();
        Ok(())
    }
}

struct ConsumerCursor {
    shared: Arc<Shared>,
    queue: String,
    consumer: u64,
    channel: u64,
    prefetch: Option<u16>,
}

impl ConsumerCursor {
    /// Wait for the next deliverable message, or `None` once the channel is gone
    async fn next_delivery(&self) -> Option<QueueMessage> {
        loop {
            let notified = self.shared.notify.notified();

            if let Some(message) = self.try_deliver()? {
                return Some(message);
            }

            notified.await;
        }
    }

    fn try_deliver(&self) -> Option<Option<QueueMessage>> {
        let mut guard = self.shared.state();
        let state = &mut *guard;
        if !state.open.contains(&self.channel) {
            return None;
        }

        let queue = state.queues.get_mut(&self.queue)?;
        let outstanding = queue.outstanding(self.consumer);
        if self
            .prefetch
            .is_some_and(|limit| outstanding >= usize::from(limit))
        {
            return Some(None);
        }

        let Some(stored) = queue.ready.pop_front() else {
            return Some(None);
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        queue.unacked.insert(
            tag,
            Unacked {
                message: stored.clone(),
                channel: self.channel,
                consumer: self.consumer,
            },
        );
        let outstanding = outstanding + 1;

        state.max_outstanding = state.max_outstanding.max(outstanding);
        state.stats.delivered += 1;

        let acker = MemoryAcker {
            shared: Arc::clone(&self.shared),
            queue: self.queue.clone(),
            tag,
            channel: self.channel,
        };

        Some(Some(QueueMessage::new(
            tag,
            stored.body,
            stored.persistent,
            stored.redelivered,
            stored.timestamp,
            Box::new(acker),
        )))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    queue: String,
    tag: u64,
    channel: u64,
}

impl MemoryAcker {
    fn settle(&self, settle: impl FnOnce(&mut BrokerState, StoredMessage)) -> BrokerResult<()> {
        {
            let mut state = self.shared.state();
            if !state.open.contains(&self.channel) {
                return Err(BrokerError::Acknowledge(format!(
                    "channel closed before delivery {} was settled",
                    self.tag
                )));
            }

            let entry = state
                .queues
                .get_mut(&self.queue)
                .and_then(|queue| queue.unacked.remove(&self.tag))
                .ok_or_else(|| {
                    BrokerError::Acknowledge(format!("unknown delivery tag {}", self.tag))
                })?;

            settle(&mut *state, entry.message);
        }

        self.shared.notify.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        self.settle(|state, _| state.stats.acknowledged += 1)
    }

    async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        let queue_name = self.queue.clone();
        self.settle(move |state, mut message| {
            state.stats.rejected += 1;

            if requeue {
                message.redelivered = true;
                if let Some(queue) = state.queues.get_mut(&queue_name) {
                    queue.ready.push_front(message);
                }
                return;
            }

            let dead_letter = state
                .queues
                .get(&queue_name)
                .and_then(|queue| queue.dead_letter.clone());

            if let Some(target) = dead_letter.and_then(|name| state.queues.get_mut(&name)) {
                message.redelivered = false;
                target.ready.push_back(message);
                state.stats.dead_lettered += 1;
            }
        })
    }
}
