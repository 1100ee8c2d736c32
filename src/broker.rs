//! Fan-out of [`ClusterEvent`]s to every open `/listen` stream.
//!
//! One coordinating task owns the subscriber set. Joins, leaves and events
//! reach it through a single FIFO queue, so a membership change and a
//! publish are applied in the order their callers completed them.
//! Delivery into a subscriber is a non-blocking enqueue into a bounded
//! buffer; a subscriber whose buffer is full is evicted on the spot, which
//! keeps the coordinator from ever waiting on a slow consumer.

use std::{collections::BTreeMap, fmt};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::notify::ClusterEvent;

pub const DEFAULT_INGRESS_CAPACITY: usize = 256;
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Outcome of handing one event to one subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// The subscriber cannot take more right now; the broker evicts it.
    Full,
    /// The consuming side is gone.
    Closed,
}

/// Anything the broker can push events into. Implementations must not
/// block: `enqueue` is called from the coordinator's fan-out loop.
pub trait Subscriber: Send + 'static {
    fn enqueue(&mut self, event: &ClusterEvent) -> Delivery;

    /// Called once when the broker drops the subscriber.
    fn close(&mut self) {}
}

/// Bounded channel subscriber backing [`SubscriberHandle`].
pub struct ChannelSubscriber {
    tx: mpsc::Sender<ClusterEvent>,
}

impl ChannelSubscriber {
    pub fn new(tx: mpsc::Sender<ClusterEvent>) -> Self {
        Self { tx }
    }
}

impl Subscriber for ChannelSubscriber {
    fn enqueue(&mut self, event: &ClusterEvent) -> Delivery {
        match self.tx.try_send(event.clone()) {
            Ok(()) => Delivery::Accepted,
            Err(mpsc::error::TrySendError::Full(_)) => Delivery::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerClosed;

impl fmt::Display for BrokerClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "event broker is not running")
    }
}

impl std::error::Error for BrokerClosed {}

#[derive(Debug, Clone)]
pub struct BrokerOptions {
    /// Commands waiting for the coordinator before `publish` has to wait.
    pub ingress_capacity: usize,
    /// Events buffered per subscriber before it is evicted.
    pub subscriber_capacity: usize,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            ingress_capacity: DEFAULT_INGRESS_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
        }
    }
}

enum Command {
    Join {
        subscriber: Box<dyn Subscriber>,
        ack: oneshot::Sender<SubscriberId>,
    },
    Leave {
        id: SubscriberId,
        ack: Option<oneshot::Sender<bool>>,
    },
    Count {
        reply: oneshot::Sender<usize>,
    },
    Publish(ClusterEvent),
}

#[derive(Clone)]
pub struct BrokerHandle {
    commands: mpsc::Sender<Command>,
    drops: mpsc::UnboundedSender<SubscriberId>,
    subscriber_capacity: usize,
}

pub fn spawn_broker(options: BrokerOptions) -> (BrokerHandle, JoinHandle<()>) {
    let (commands_tx, commands_rx) = mpsc::channel(options.ingress_capacity.max(1));
    let (drops_tx, drops_rx) = mpsc::unbounded_channel();
    let handle = BrokerHandle {
        commands: commands_tx,
        drops: drops_tx,
        subscriber_capacity: options.subscriber_capacity.max(1),
    };

    let task = tokio::spawn(coordinator_task(commands_rx, drops_rx));

    (handle, task)
}

impl BrokerHandle {
    /// Registers an in-process channel subscriber. Every event published
    /// after this returns reaches the handle until it is unsubscribed,
    /// evicted or dropped.
    pub async fn subscribe(&self) -> SubscriberHandle {
        let (tx, rx) = mpsc::channel(self.subscriber_capacity);
        let id = self
            .register(Box::new(ChannelSubscriber::new(tx)))
            .await
            .ok();
        SubscriberHandle {
            id,
            rx,
            commands: self.commands.clone(),
            drops: self.drops.clone(),
        }
    }

    pub async fn register(
        &self,
        subscriber: Box<dyn Subscriber>,
    ) -> Result<SubscriberId, BrokerClosed> {
        let (ack, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Join { subscriber, ack })
            .await
            .map_err(|_| BrokerClosed)?;
        ack_rx.await.map_err(|_| BrokerClosed)
    }

    /// Returns `false` if the subscriber was not registered (already gone,
    /// evicted, or never known).
    pub async fn unsubscribe(&self, id: SubscriberId) -> bool {
        let (ack, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Leave { id, ack: Some(ack) })
            .await
            .is_err()
        {
            return false;
        }
        ack_rx.await.unwrap_or(false)
    }

    /// Hands the event to the coordinator. Only waits when the command
    /// queue is full, never on subscribers. Subscribers registered when this
    /// returns receive the event; later ones do not.
    pub async fn publish(&self, event: ClusterEvent) {
        debug!(context = %event.context, status = %event.status, "publishing event");
        if self.commands.send(Command::Publish(event)).await.is_err() {
            warn!("event dropped: broker is not running");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        let (reply, reply_rx) = oneshot::channel();
        if self.commands.send(Command::Count { reply }).await.is_err() {
            return 0;
        }
        reply_rx.await.unwrap_or(0)
    }
}

/// Receiving end of one registration.
pub struct SubscriberHandle {
    id: Option<SubscriberId>,
    rx: mpsc::Receiver<ClusterEvent>,
    commands: mpsc::Sender<Command>,
    drops: mpsc::UnboundedSender<SubscriberId>,
}

impl SubscriberHandle {
    pub fn id(&self) -> Option<SubscriberId> {
        self.id
    }

    pub fn is_registered(&self) -> bool {
        self.id.is_some()
    }

    /// `None` once the handle is unsubscribed, evicted, or the broker
    /// stopped.
    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        self.id?;
        let event = self.rx.recv().await;
        if event.is_none() {
            // Sender dropped by the coordinator: eviction or shutdown.
            self.id = None;
        }
        event
    }

    /// Idempotent. Once this returns no further event is surfaced, not even
    /// one that was already buffered.
    pub async fn unsubscribe(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        let (ack, ack_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Leave { id, ack: Some(ack) })
            .await
            .is_ok()
        {
            let _ = ack_rx.await;
        }
        self.rx.close();
    }
}

impl Drop for SubscriberHandle {
    fn drop(&mut self) {
        // Nothing can observe deliveries to a dropped receiver, so this leave
        // may skip the command queue.
        if let Some(id) = self.id.take() {
            let _ = self.drops.send(id);
        }
    }
}

/// Why [`serve_stream`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The outbound side went away (client disconnect or write failure).
    Disconnected,
    /// The broker let go of the subscriber (eviction or shutdown).
    Detached,
}

/// Pumps events from `handle` into `sink`, one item per event, until either
/// side ends. Always deregisters before returning.
pub async fn serve_stream<T, F>(
    mut handle: SubscriberHandle,
    sink: mpsc::Sender<T>,
    mut encode: F,
) -> StreamEnd
where
    F: FnMut(&ClusterEvent) -> T,
{
    let end = loop {
        tokio::select! {
            _ = sink.closed() => break StreamEnd::Disconnected,
            next = handle.recv() => match next {
                Some(event) => {
                    if sink.send(encode(&event)).await.is_err() {
                        break StreamEnd::Disconnected;
                    }
                }
                None => break StreamEnd::Detached,
            },
        }
    };

    debug!(subscriber = ?handle.id(), ?end, "stream ended");
    handle.unsubscribe().await;
    end
}

async fn coordinator_task(
    mut commands: mpsc::Receiver<Command>,
    mut drops: mpsc::UnboundedReceiver<SubscriberId>,
) {
    let mut subscribers: BTreeMap<SubscriberId, Box<dyn Subscriber>> = BTreeMap::new();
    let mut next_id: u64 = 0;

    loop {
        tokio::select! {
            // Drained first so a count taken after a drop does not include it.
            biased;

            Some(id) = drops.recv() => {
                remove_subscriber(&mut subscribers, id);
            }
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Join { subscriber, ack } => {
                        next_id += 1;
                        let id = SubscriberId(next_id);
                        subscribers.insert(id, subscriber);
                        info!(subscriber = %id, subscribers = subscribers.len(), "client added");
                        if ack.send(id).is_err() {
                            // Registrant gave up before the ack; nobody owns it.
                            if let Some(mut sub) = subscribers.remove(&id) {
                                sub.close();
                            }
                        }
                    }
                    Command::Leave { id, ack } => {
                        let removed = remove_subscriber(&mut subscribers, id);
                        if let Some(ack) = ack {
                            let _ = ack.send(removed);
                        }
                    }
                    Command::Count { reply } => {
                        let _ = reply.send(subscribers.len());
                    }
                    Command::Publish(event) => fan_out(&mut subscribers, &event),
                }
            }
        }
    }

    for (_, mut sub) in subscribers {
        sub.close();
    }
    debug!("event broker stopped");
}

fn remove_subscriber(
    subscribers: &mut BTreeMap<SubscriberId, Box<dyn Subscriber>>,
    id: SubscriberId,
) -> bool {
    match subscribers.remove(&id) {
        Some(mut sub) => {
            sub.close();
            info!(subscriber = %id, subscribers = subscribers.len(), "client removed");
            true
        }
        None => false,
    }
}

fn fan_out(subscribers: &mut BTreeMap<SubscriberId, Box<dyn Subscriber>>, event: &ClusterEvent) {
    subscribers.retain(|id, sub| match sub.enqueue(event) {
        Delivery::Accepted => true,
        Delivery::Full => {
            warn!(subscriber = %id, "evicting slow subscriber");
            sub.close();
            false
        }
        Delivery::Closed => {
            debug!(subscriber = %id, "dropping closed subscriber");
            sub.close();
            false
        }
    });
    debug!(
        context = %event.context,
        status = %event.status,
        subscribers = subscribers.len(),
        "event fanned out"
    );
}
