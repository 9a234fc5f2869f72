use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::Strng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthLevel {
	Ok,
	Warn,
	Error,
}

impl HealthLevel {
	pub fn as_str(&self) -> &'static str {
		match self {
			HealthLevel::Ok => "ok",
			HealthLevel::Warn => "warn",
			HealthLevel::Error => "error",
		}
	}
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
	pub level: HealthLevel,
	pub message: String,
	pub details: Option<String>,
	pub updated_at: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HealthSnapshot {
	pub statuses: HashMap<Strng, HealthStatus>,
}

/// Thread-safe named status map with overall rollup (C2). A single mutex is
/// sufficient at this scale, matching §5's "rate-limiter entries are
/// written under a single mutex" philosophy for small, low-contention maps.
#[derive(Debug, Default)]
pub struct HealthTracker {
	inner: Mutex<HashMap<Strng, HealthStatus>>,
}

fn now_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

pub type Health = HealthTracker;

impl HealthTracker {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self, name: impl Into<Strng>, level: HealthLevel, message: impl Into<String>) {
		self.set_with_details(name, level, message, None);
	}

	pub fn set_with_details(
		&self,
		name: impl Into<Strng>,
		level: HealthLevel,
		message: impl Into<String>,
		details: Option<String>,
	) {
		let mut g = self.inner.lock().expect("mutex acquired");
		g.insert(
			name.into(),
			HealthStatus {
				level,
				message: message.into(),
				details,
				updated_at: now_secs(),
			},
		);
	}

	pub fn remove(&self, name: &str) {
		self.inner.lock().expect("mutex acquired").remove(name);
	}

	pub fn snapshot(&self) -> HealthSnapshot {
		let g = self.inner.lock().expect("mutex acquired");
		HealthSnapshot { statuses: g.clone() }
	}

	/// `ready` is true iff every required component exists with level `ok`.
	pub fn ready(&self, required_names: &[&str]) -> (bool, HealthSnapshot) {
		let snap = self.snapshot();
		let ready = required_names.iter().all(|name| {
			snap
				.statuses
				.get(*name)
				.is_some_and(|s| s.level == HealthLevel::Ok)
		});
		(ready, snap)
	}

	/// Worst level over all tracked components; `Ok` if nothing is tracked.
	pub fn overall(&self) -> HealthLevel {
		let g = self.inner.lock().expect("mutex acquired");
		g
			.values()
			.map(|s| s.level)
			.max()
			.unwrap_or(HealthLevel::Ok)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ready_requires_all_named_components_ok() {
		let h = HealthTracker::new();
		h.set("persistence", HealthLevel::Ok, "up");
		h.set("app-manager", HealthLevel::Warn, "degraded");
		let (ready, _) = h.ready(&["persistence", "app-manager"]);
		assert!(!ready);

		h.set("app-manager", HealthLevel::Ok, "up");
		let (ready, _) = h.ready(&["persistence", "app-manager"]);
		assert!(ready);
	}

	#[test]
	fn ready_false_when_component_missing() {
		let h = HealthTracker::new();
		h.set("persistence", HealthLevel::Ok, "up");
		let (ready, _) = h.ready(&["persistence", "app-manager"]);
		assert!(!ready);
	}

	#[test]
	fn overall_is_worst_level() {
		let h = HealthTracker::new();
		assert_eq!(h.overall(), HealthLevel::Ok);
		h.set("a", HealthLevel::Ok, "");
		h.set("b", HealthLevel::Warn, "");
		assert_eq!(h.overall(), HealthLevel::Warn);
		h.set("c", HealthLevel::Error, "");
		assert_eq!(h.overall(), HealthLevel::Error);
	}
}
