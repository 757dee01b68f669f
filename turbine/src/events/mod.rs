//! Per-build event multicaster with full-history replay.
//!
//! A single `tokio::sync::Mutex`-guarded state backs the whole hub: the ordering and atomicity
//! guarantees this type offers ("delivery to one subscriber must not block emission or other
//! subscribers", "a subscription first yields the entire existing log, then continues with live
//! events, with no gaps") need "append to log" and "register/snapshot for a new subscriber" to
//! happen as one indivisible step, which a single lock expresses directly.

#[cfg(test)]
mod tests;

use crate::model::Event;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Sent down a subscriber's channel; distinguishes a live event from the hub's close signal.
#[derive(Debug, Clone)]
pub enum Delivery {
    Event(Event),
    End,
}

struct HubState {
    log: Vec<Event>,
    closed: bool,
    subscribers: HashMap<u64, mpsc::Sender<Delivery>>,
    next_subscriber_id: u64,
}

/// A per-build multicaster: every emitted event is appended to an in-memory log and then fanned
/// out to current subscribers; a new subscriber always replays the full log before seeing live
/// events.
pub struct EventHub {
    build_id: String,
    buffer_size: usize,
    state: Mutex<HubState>,
}

impl EventHub {
    pub fn new(build_id: impl Into<String>, buffer_size: usize) -> Self {
        Self {
            build_id: build_id.into(),
            buffer_size,
            state: Mutex::new(HubState {
                log: Vec::new(),
                closed: false,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    /// Rebuilds a hub whose log is pre-populated by replaying a restored snapshot's events.
    /// The hub is not closed; further events may still be emitted.
    pub fn from_events(build_id: impl Into<String>, buffer_size: usize, events: Vec<Event>) -> Self {
        Self {
            build_id: build_id.into(),
            buffer_size,
            state: Mutex::new(HubState {
                log: events,
                closed: false,
                subscribers: HashMap::new(),
                next_subscriber_id: 0,
            }),
        }
    }

    /// Appends `event` to the log, then delivers it to every current subscriber. A subscriber
    /// whose channel is full (a slow consumer) is dropped rather than allowed to block emission
    /// or other subscribers.
    pub async fn emit_event(&self, event: Event) {
        let mut state = self.state.lock().await;

        if state.closed {
            warn!(build_id = %self.build_id, "dropped event emitted after hub close");
            return;
        }

        state.log.push(event.clone());

        let mut dead = Vec::new();
        for (id, sender) in state.subscribers.iter() {
            if sender.try_send(Delivery::Event(event.clone())).is_err() {
                dead.push(*id);
            }
        }

        for id in dead {
            state.subscribers.remove(&id);
            debug!(build_id = %self.build_id, subscriber = id, "disconnected slow subscriber");
        }
    }

    /// Returns a new subscription that first replays the entire log so far, then streams live
    /// events, then ends. Idempotent with respect to [`EventHub::close`]: subscribing after
    /// close still yields the full log followed by end-of-stream.
    pub async fn subscribe(&self) -> Subscription {
        let mut state = self.state.lock().await;

        let replay = state.log.clone();
        let (tx, rx) = mpsc::channel(self.buffer_size.max(1));

        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;

        if state.closed {
            // No further live events will ever come; tell this subscriber immediately. The
            // channel was just created so this send cannot fail on capacity.
            let _ = tx.try_send(Delivery::End);
        } else {
            state.subscribers.insert(id, tx);
        }

        Subscription {
            id,
            replay: replay.into(),
            receiver: rx,
            ended: false,
        }
    }

    /// Removes a subscriber from the fan-out set. Idempotent: unsubscribing twice, or
    /// unsubscribing an id that already disconnected itself as a slow consumer, is a no-op.
    pub async fn unsubscribe(&self, id: u64) {
        let mut state = self.state.lock().await;
        state.subscribers.remove(&id);
    }

    /// Closes the hub: every current subscriber receives an end-of-stream marker after any
    /// events already in flight, and no further events are admitted. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;

        if state.closed {
            return;
        }
        state.closed = true;

        for sender in state.subscribers.values() {
            let _ = sender.try_send(Delivery::End);
        }
    }

    /// A snapshot of the log as it stands right now, suitable for persisting in a
    /// [`crate::model::BuildSnapshot`].
    pub async fn events(&self) -> Vec<Event> {
        self.state.lock().await.log.clone()
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

/// A live view onto an [`EventHub`]: replays the log captured at subscribe time, then yields
/// live events, then ends.
pub struct Subscription {
    id: u64,
    replay: std::collections::VecDeque<Event>,
    receiver: mpsc::Receiver<Delivery>,
    ended: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns the next event, or `None` once end-of-stream has been observed.
    pub async fn next(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }

        if self.ended {
            return None;
        }

        match self.receiver.recv().await {
            Some(Delivery::Event(event)) => Some(event),
            Some(Delivery::End) | None => {
                self.ended = true;
                None
            }
        }
    }
}
