//! Per-client rate limiter (spec §4.5 "Rate limiter"). A single
//! mutex-guarded map is sufficient at LAN query rates (spec §9).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use piccolo_core::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct ClientState {
	pub query_count: u32,
	pub last_query: Instant,
	pub blocked: bool,
	pub blocked_until: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
	pub max_per_second: u32,
	pub max_per_minute: u32,
	pub client_block_duration: Duration,
	pub idle_eviction: Duration,
}

impl Default for RateLimiterConfig {
	fn default() -> Self {
		Self {
			max_per_second: 20,
			max_per_minute: 120,
			client_block_duration: Duration::from_secs(60),
			idle_eviction: Duration::from_secs(15 * 60),
		}
	}
}

#[derive(Default)]
pub struct RateLimiterMetrics {
	pub blocked_total: std::sync::atomic::AtomicU64,
}

pub struct RateLimiter {
	config: RateLimiterConfig,
	clients: Mutex<HashMap<IpAddr, ClientState>>,
	pub metrics: RateLimiterMetrics,
}

impl RateLimiter {
	pub fn new(config: RateLimiterConfig) -> Self {
		Self { config, clients: Mutex::new(HashMap::new()), metrics: RateLimiterMetrics::default() }
	}

	/// Returns `Ok(())` if `ip` may proceed, `Err(RateLimited)` if it is
	/// currently blocked or just tripped the threshold.
	pub fn check(&self, ip: IpAddr) -> Result<()> {
		let now = Instant::now();
		let mut clients = self.clients.lock().expect("mutex acquired");
		let state = clients.entry(ip).or_insert_with(|| ClientState {
			query_count: 0,
			last_query: now,
			blocked: false,
			blocked_until: None,
		});

		if state.blocked {
			if let Some(until) = state.blocked_until {
				if now < until {
					self.metrics.blocked_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
					return Err(Error::RateLimited(format!("{ip} is blocked")));
				}
			}
			state.blocked = false;
			state.blocked_until = None;
			state.query_count = 0;
		}

		let since_last = now.duration_since(state.last_query);
		if since_last > Duration::from_secs(60) {
			state.query_count = 0;
		}

		state.query_count += 1;
		let trips_per_second = since_last < Duration::from_secs(1) && state.query_count > self.config.max_per_second;
		let trips_per_minute = state.query_count > self.config.max_per_minute;

		state.last_query = now;

		if trips_per_second || trips_per_minute {
			state.blocked = true;
			state.blocked_until = Some(now + self.config.client_block_duration);
			self.metrics.blocked_total.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			return Err(Error::RateLimited(format!("{ip} exceeded query rate threshold")));
		}

		Ok(())
	}

	/// Drops unblocked clients idle longer than `idle_eviction`. Must not
	/// be called while holding a lock across network operations (spec §9).
	pub fn sweep(&self) {
		let now = Instant::now();
		let mut clients = self.clients.lock().expect("mutex acquired");
		clients.retain(|_, state| state.blocked || now.duration_since(state.last_query) <= self.config.idle_eviction);
	}

	#[cfg(test)]
	fn client_state(&self, ip: IpAddr) -> Option<ClientState> {
		self.clients.lock().expect("mutex acquired").get(&ip).cloned()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::net::Ipv4Addr;

	fn limiter(max_per_second: u32) -> RateLimiter {
		RateLimiter::new(RateLimiterConfig {
			max_per_second,
			max_per_minute: 1000,
			client_block_duration: Duration::from_secs(60),
			idle_eviction: Duration::from_secs(900),
		})
	}

	#[test]
	fn blocks_after_exceeding_per_second_threshold() {
		let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
		let rl = limiter(5);
		let mut blocked_at = None;
		for i in 0..50 {
			if rl.check(ip).is_err() {
				blocked_at = Some(i);
				break;
			}
		}
		assert!(blocked_at.is_some());
		assert!(rl.client_state(ip).unwrap().blocked);
	}

	#[test]
	fn first_contact_is_always_allowed() {
		let ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
		let rl = limiter(1);
		assert!(rl.check(ip).is_ok());
	}

	#[test]
	fn sweep_removes_idle_unblocked_clients_but_keeps_blocked_ones() {
		let ip_idle = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));
		let ip_blocked = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 4));
		let rl = RateLimiter::new(RateLimiterConfig {
			max_per_second: 1,
			max_per_minute: 1,
			client_block_duration: Duration::from_secs(60),
			idle_eviction: Duration::from_millis(1),
		});
		rl.check(ip_idle).unwrap();
		let _ = rl.check(ip_blocked);
		let _ = rl.check(ip_blocked);
		std::thread::sleep(Duration::from_millis(5));
		rl.sweep();
		assert!(rl.client_state(ip_idle).is_none());
		assert!(rl.client_state(ip_blocked).is_some());
	}
}
