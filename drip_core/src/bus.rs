//! Typed publish/subscribe between the safety path and its consumers.
//!
//! Every subscription is its own bounded queue. `publish` hands the event to
//! each queue with `try_send` in registration order; a full queue drops the
//! event for that subscriber only, so a slow display or a stuck network
//! client can never hold up the monitoring loop.
//!
//! The subscriber tables sit behind an `RwLock`: publishers take the read
//! side, registration takes the write side.
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel as xch;
use tracing::{debug, trace};

use crate::error::BusError;
use crate::flow::FlowData;
use crate::state::DeviceState;
use crate::types::{AlarmKind, PressKind};

/// Per-topic subscriber limit.
pub const MAX_SUBSCRIBERS_PER_TOPIC: usize = 8;
/// Default queue depth for each subscription.
pub const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Topic {
    WeightUpdate = 0,
    FlowUpdate = 1,
    Alarm = 2,
    StateChange = 3,
    WifiStatus = 4,
    ButtonPress = 5,
}

impl Topic {
    pub const COUNT: usize = 6;

    pub const ALL: [Topic; Self::COUNT] = [
        Topic::WeightUpdate,
        Topic::FlowUpdate,
        Topic::Alarm,
        Topic::StateChange,
        Topic::WifiStatus,
        Topic::ButtonPress,
    ];

    #[inline]
    const fn index(self) -> usize {
        self as usize
    }

    pub const fn name(self) -> &'static str {
        match self {
            Topic::WeightUpdate => "weight_update",
            Topic::FlowUpdate => "flow_update",
            Topic::Alarm => "alarm",
            Topic::StateChange => "state_change",
            Topic::WifiStatus => "wifi_status",
            Topic::ButtonPress => "button_press",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One value per topic.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Payload {
    Weight(f32),
    Flow(FlowData),
    Alarm(AlarmKind),
    State(DeviceState),
    Wifi(bool),
    Button(PressKind),
}

impl Payload {
    pub const fn topic(&self) -> Topic {
        match self {
            Payload::Weight(_) => Topic::WeightUpdate,
            Payload::Flow(_) => Topic::FlowUpdate,
            Payload::Alarm(_) => Topic::Alarm,
            Payload::State(_) => Topic::StateChange,
            Payload::Wifi(_) => Topic::WifiStatus,
            Payload::Button(_) => Topic::ButtonPress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event {
    pub topic: Topic,
    pub payload: Payload,
}

impl Event {
    pub const fn new(payload: Payload) -> Self {
        Self {
            topic: payload.topic(),
            payload,
        }
    }
}

struct Slot {
    id: u64,
    tx: xch::Sender<Event>,
    closed: AtomicBool,
}

/// Receiving end of one subscription.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    id: u64,
    rx: xch::Receiver<Event>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn try_recv(&self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Bounded wait; `None` on timeout or once the bus is gone.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Event> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Drain what is queued right now.
    pub fn drain(&self) -> impl Iterator<Item = Event> + '_ {
        self.rx.try_iter()
    }

    pub fn receiver(&self) -> &xch::Receiver<Event> {
        &self.rx
    }
}

/// Thread draining one subscription into a callback.
#[derive(Debug)]
pub struct Dispatcher {
    topic: Topic,
    id: u64,
    handle: JoinHandle<()>,
}

impl Dispatcher {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Wait for the dispatcher to finish. It finishes once the subscription is
    /// removed or every handle to the bus has been dropped.
    pub fn join(self) {
        if self.handle.join().is_err() {
            tracing::warn!(topic = %self.topic, id = self.id, "dispatcher callback panicked");
        }
    }
}

pub struct EventBus {
    topics: RwLock<[Vec<Slot>; Topic::COUNT]>,
    queue_depth: usize,
    next_id: AtomicU64,
    dropped: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_queue_depth(DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_queue_depth(queue_depth: usize) -> Self {
        Self {
            topics: RwLock::new(std::array::from_fn(|_| {
                Vec::with_capacity(MAX_SUBSCRIBERS_PER_TOPIC)
            })),
            queue_depth: queue_depth.max(1),
            next_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
        }
    }

    /// Register a queue-backed subscriber on `topic`.
    pub fn subscribe(&self, topic: Topic) -> Result<Subscription, BusError> {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let slots = &mut topics[topic.index()];
        slots.retain(|s| !s.closed.load(Ordering::Relaxed));
        if slots.len() >= MAX_SUBSCRIBERS_PER_TOPIC {
            return Err(BusError::TopicFull {
                topic,
                max: MAX_SUBSCRIBERS_PER_TOPIC,
            });
        }
        let (tx, rx) = xch::bounded(self.queue_depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        slots.push(Slot {
            id,
            tx,
            closed: AtomicBool::new(false),
        });
        debug!(%topic, id, subscribers = slots.len(), "subscribed");
        Ok(Subscription { topic, id, rx })
    }

    /// Register `callback` on `topic`, run on its own named thread.
    pub fn subscribe_fn<F>(&self, topic: Topic, name: &str, mut callback: F) -> Result<Dispatcher, BusError>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let sub = self.subscribe(topic)?;
        let id = sub.id;
        let handle = std::thread::Builder::new()
            .name(format!("bus-{name}"))
            .spawn(move || {
                for ev in sub.rx.iter() {
                    callback(ev);
                }
                trace!(topic = %sub.topic, id = sub.id, "dispatcher exiting");
            })
            .map_err(|e| {
                self.unsubscribe(topic, id);
                BusError::Spawn(e.to_string())
            })?;
        Ok(Dispatcher { topic, id, handle })
    }

    /// Remove a subscription; its queue closes once drained.
    pub fn unsubscribe(&self, topic: Topic, id: u64) -> bool {
        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        let slots = &mut topics[topic.index()];
        let before = slots.len();
        slots.retain(|s| s.id != id);
        before != slots.len()
    }

    /// Deliver to every subscriber of `topic` without blocking.
    ///
    /// Returns how many subscribers accepted the event.
    pub fn publish(&self, topic: Topic, payload: Payload) -> Result<usize, BusError> {
        if payload.topic() != topic {
            return Err(BusError::PayloadMismatch {
                topic,
                payload: payload.topic(),
            });
        }
        let ev = Event { topic, payload };
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        let mut delivered = 0;
        for slot in &topics[topic.index()] {
            match slot.tx.try_send(ev) {
                Ok(()) => delivered += 1,
                Err(xch::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    trace!(%topic, id = slot.id, "subscriber queue full; event dropped");
                }
                Err(xch::TrySendError::Disconnected(_)) => {
                    slot.closed.store(true, Ordering::Relaxed);
                }
            }
        }
        Ok(delivered)
    }

    /// `publish` with the topic taken from the payload.
    pub fn emit(&self, payload: Payload) -> usize {
        self.publish(payload.topic(), payload).unwrap_or(0)
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        let topics = self.topics.read().unwrap_or_else(PoisonError::into_inner);
        topics[topic.index()]
            .iter()
            .filter(|s| !s.closed.load(Ordering::Relaxed))
            .count()
    }

    /// Events dropped because a subscriber queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("queue_depth", &self.queue_depth)
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

/// Shared bus handle, as held by the loop and consumers.
pub type SharedBus = Arc<EventBus>;
