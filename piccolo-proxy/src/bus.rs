//! C1 — Event Bus. Topic/pub-sub dispatch of internal notifications, spec
//! §4.6. Each subscriber owns a bounded mpsc channel sized to its own
//! tolerance for loss; `publish` never blocks — a full subscriber buffer
//! simply drops that event for that subscriber (§9 "Subscriber
//! backpressure").

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;

/// The enumerated topic set (spec §3) — not open-ended strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
	LockStateChanged,
	LeadershipRoleChanged,
	RemoteConfigChanged,
	VolumeStateChanged,
	Audit,
}

#[derive(Debug, Clone)]
pub enum LeadershipRole {
	Leader,
	Follower,
}

#[derive(Debug, Clone)]
pub struct RemoteConfigPayload {
	pub enabled: bool,
	pub portal_hostname: String,
	pub tld: String,
	pub portal_port: u16,
}

/// Payload type per topic is fixed and part of the API (tagged variant).
#[derive(Debug, Clone)]
pub enum Payload {
	LockStateChanged { locked: bool },
	LeadershipRoleChanged { resource: String, role: LeadershipRole },
	RemoteConfigChanged(RemoteConfigPayload),
	VolumeStateChanged { mounted: bool },
	Audit { action: String, detail: String },
}

#[derive(Debug, Clone)]
pub struct Event {
	pub topic: Topic,
	pub payload: Payload,
}

impl Event {
	pub fn topic_of(payload: &Payload) -> Topic {
		match payload {
			Payload::LockStateChanged { .. } => Topic::LockStateChanged,
			Payload::LeadershipRoleChanged { .. } => Topic::LeadershipRoleChanged,
			Payload::RemoteConfigChanged(_) => Topic::RemoteConfigChanged,
			Payload::VolumeStateChanged { .. } => Topic::VolumeStateChanged,
			Payload::Audit { .. } => Topic::Audit,
		}
	}

	pub fn new(payload: Payload) -> Self {
		Self { topic: Self::topic_of(&payload), payload }
	}
}

pub type Subscription = mpsc::Receiver<Event>;

#[derive(Default)]
struct Subscribers {
	by_topic: HashMap<Topic, Vec<mpsc::Sender<Event>>>,
}

/// Read-lock for publish, write-lock for subscribe/close — publishes never
/// block on subscribers (spec §5).
pub struct EventBus {
	subscribers: RwLock<Subscribers>,
	closed: AtomicBool,
}

impl Default for EventBus {
	fn default() -> Self {
		Self::new()
	}
}

impl EventBus {
	pub fn new() -> Self {
		Self {
			subscribers: RwLock::new(Subscribers::default()),
			closed: AtomicBool::new(false),
		}
	}

	/// Returns a buffered sink for `topic`. If the bus is already closed the
	/// returned receiver observes an immediately-closed channel.
	pub fn subscribe(&self, topic: Topic, buffer_n: usize) -> Subscription {
		let (tx, rx) = mpsc::channel(buffer_n.max(1));
		if self.closed.load(Ordering::Acquire) {
			return rx; // tx dropped here: receiver sees a closed channel
		}
		let mut g = self.subscribers.write().expect("mutex acquired");
		g.by_topic.entry(topic).or_default().push(tx);
		rx
	}

	/// Enumerates subscribers for `event.topic` and does a non-blocking send
	/// to each. A full buffer drops the event for that subscriber only.
	/// No-op once the bus is closed.
	pub fn publish(&self, event: Event) {
		if self.closed.load(Ordering::Acquire) {
			return;
		}
		let g = self.subscribers.read().expect("mutex acquired");
		if let Some(subs) = g.by_topic.get(&event.topic) {
			for tx in subs {
				// try_send is non-blocking: Full is dropped silently, Closed
				// subscribers are likewise just skipped (pruned lazily, not
				// on the hot path).
				let _ = tx.try_send(event.clone());
			}
		}
	}

	/// Idempotent. Subsequent publishes are no-ops; subsequent subscribes
	/// return already-closed sinks.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::AcqRel) {
			return;
		}
		let mut g = self.subscribers.write().expect("mutex acquired");
		g.by_topic.clear();
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn publish_delivers_in_order_when_not_starved() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe(Topic::LockStateChanged, 8);
		for locked in [true, false, true] {
			bus.publish(Event::new(Payload::LockStateChanged { locked }));
		}
		let mut got = vec![];
		while let Ok(ev) = rx.try_recv() {
			match ev.payload {
				Payload::LockStateChanged { locked } => got.push(locked),
				_ => unreachable!(),
			}
		}
		assert_eq!(got, vec![true, false, true]);
	}

	#[tokio::test]
	async fn full_buffer_drops_event_for_that_subscriber_only() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe(Topic::Audit, 1);
		bus.publish(Event::new(Payload::Audit { action: "a".into(), detail: "1".into() }));
		bus.publish(Event::new(Payload::Audit { action: "b".into(), detail: "2".into() }));
		let first = rx.try_recv().unwrap();
		match first.payload {
			Payload::Audit { action, .. } => assert_eq!(action, "a"),
			_ => unreachable!(),
		}
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn close_is_idempotent_and_stops_delivery() {
		let bus = EventBus::new();
		let mut rx = bus.subscribe(Topic::VolumeStateChanged, 4);
		bus.close();
		bus.close();
		bus.publish(Event::new(Payload::VolumeStateChanged { mounted: true }));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn subscribe_after_close_returns_closed_sink() {
		let bus = EventBus::new();
		bus.close();
		let mut rx = bus.subscribe(Topic::Audit, 4);
		assert!(rx.recv().await.is_none());
	}
}
