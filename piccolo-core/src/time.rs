//! Small helpers shared by components that need wall-clock timestamps
//! distinct from `Instant`-based monotonic scheduling (mDNS conflict
//! records, health status timestamps).

use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_secs() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs())
		.unwrap_or(0)
}

pub fn unix_millis() -> u128 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_millis())
		.unwrap_or(0)
}
