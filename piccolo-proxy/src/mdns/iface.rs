//! Per-interface discovery and socket setup (spec §4.5 "Interface
//! discovery & change loop", "Per-family socket setup", "Resilience").
//! IPv6 link-local is retained (RFC 6762); IPv4 link-local and loopback
//! are rejected.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

pub const MDNS_PORT: u16 = 5353;
pub const MDNS_V4_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
pub const MDNS_V6_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0xfb);

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const BACKOFF_MULTIPLIER: u32 = 2;

#[derive(Debug, Clone, Default)]
pub struct DiscoveredInterface {
	pub name: String,
	pub up: bool,
	pub ipv4: Option<Ipv4Addr>,
	pub ipv6: Option<Ipv6Addr>,
}

/// Enumerates up, non-loopback interfaces with their first usable IPv4/IPv6
/// address. IPv4 link-local (169.254.0.0/16) is rejected; IPv6 link-local
/// is retained per RFC 6762.
pub fn discover_interfaces() -> std::io::Result<Vec<DiscoveredInterface>> {
	let mut by_name: HashMap<String, DiscoveredInterface> = HashMap::new();
	for ifaddr in getifaddrs().map_err(|e| std::io::Error::other(e.to_string()))? {
		if ifaddr.interface_name == "lo" {
			continue;
		}
		let up = ifaddr.flags.contains(InterfaceFlags::IFF_UP);
		let entry = by_name.entry(ifaddr.interface_name.clone()).or_insert_with(|| DiscoveredInterface {
			name: ifaddr.interface_name.clone(),
			up,
			ipv4: None,
			ipv6: None,
		});
		entry.up = entry.up || up;

		let Some(address) = ifaddr.address else { continue };
		if let Some(v4) = address.as_sockaddr_in() {
			let ip = v4.ip();
			if !ip.is_loopback() && !is_ipv4_link_local(ip) {
				entry.ipv4 = Some(ip);
			}
		} else if let Some(v6) = address.as_sockaddr_in6() {
			let ip = v6.ip();
			if !ip.is_loopback() {
				entry.ipv6 = Some(ip);
			}
		}
	}
	Ok(by_name.into_values().filter(|i| i.up).collect())
}

fn is_ipv4_link_local(ip: Ipv4Addr) -> bool {
	ip.octets()[0] == 169 && ip.octets()[1] == 254
}

/// Binds and joins the mDNS multicast group for one address family on one
/// interface. Failure to join multicast is fatal for that family on that
/// interface (returned as `Err`); socket-option failures are best-effort
/// and only logged.
pub fn setup_ipv4_socket(iface_name: &str, iface_addr: Ipv4Addr) -> std::io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	if let Err(e) = socket.bind_device(Some(iface_name.as_bytes())) {
		warn!(iface = iface_name, error = %e, "SO_BINDTODEVICE failed (ipv4)");
	}
	socket.bind(&SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), MDNS_PORT).into())?;
	socket.join_multicast_v4(&MDNS_V4_GROUP, &Ipv4Addr::UNSPECIFIED)?;
	socket.set_multicast_if_v4(&iface_addr)?;
	socket.set_nonblocking(true)?;
	UdpSocket::from_std(socket.into())
}

pub fn setup_ipv6_socket(iface_name: &str, iface_index: u32) -> std::io::Result<UdpSocket> {
	let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
	socket.set_reuse_address(true)?;
	if let Err(e) = socket.bind_device(Some(iface_name.as_bytes())) {
		warn!(iface = iface_name, error = %e, "SO_BINDTODEVICE failed (ipv6)");
	}
	if let Err(e) = socket.set_only_v6(false) {
		warn!(iface = iface_name, error = %e, "disabling IPV6_V6ONLY failed");
	}
	socket.bind(&SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), MDNS_PORT).into())?;
	socket.join_multicast_v6(&MDNS_V6_GROUP, iface_index)?;
	socket.set_multicast_if_v6(iface_index)?;
	socket.set_nonblocking(true)?;
	UdpSocket::from_std(socket.into())
}

/// Per-interface bookkeeping (spec §3 "Interface State"). The outer map
/// lock (held by the responder) and this struct's own fields divide
/// responsibility: counters/backoff here are mutated without touching the
/// outer map lock (spec §5).
pub struct InterfaceState {
	pub name: String,
	pub ipv4: Option<Ipv4Addr>,
	pub ipv6: Option<Ipv6Addr>,
	pub ipv4_conn: Option<Arc<UdpSocket>>,
	pub ipv6_conn: Option<Arc<UdpSocket>>,
	pub active: bool,
	pub last_seen: Instant,
	pub health: f64,
	pub failure_count: u32,
	pub recovery_attempts: u32,
	pub backoff_until: Option<Instant>,
	pub query_count: u64,
	pub error_count: u64,
	last_failure_at: Option<Instant>,
}

impl InterfaceState {
	pub fn new(name: String) -> Self {
		Self {
			name,
			ipv4: None,
			ipv6: None,
			ipv4_conn: None,
			ipv6_conn: None,
			active: false,
			last_seen: Instant::now(),
			health: 1.0,
			failure_count: 0,
			recovery_attempts: 0,
			backoff_until: None,
			query_count: 0,
			error_count: 0,
			last_failure_at: None,
		}
	}

	pub fn is_past_backoff(&self) -> bool {
		self.backoff_until.map(|until| Instant::now() >= until).unwrap_or(true)
	}

	/// Increments failure bookkeeping and sets an exponential backoff,
	/// capped at `MAX_BACKOFF` (spec §4.5 "Resilience").
	pub fn mark_failure(&mut self) {
		self.error_count += 1;
		self.failure_count += 1;
		self.last_failure_at = Some(Instant::now());
		let exponent = self.failure_count.min(20);
		let backoff = INITIAL_BACKOFF.saturating_mul(BACKOFF_MULTIPLIER.saturating_pow(exponent)).min(MAX_BACKOFF);
		self.backoff_until = Some(Instant::now() + backoff);
		self.recompute_health();
	}

	pub fn mark_success(&mut self) {
		self.last_seen = Instant::now();
		self.recompute_health();
	}

	/// `1 - clamp(error_rate * 0.5) - (failure_count * 0.1) * (1 -
	/// clamp(age_since_failure / 10min))`, clamped to `[0, 1]`.
	fn recompute_health(&mut self) {
		let error_rate = if self.query_count > 0 { self.error_count as f64 / self.query_count as f64 } else { 0.0 };
		let age_since_failure = self
			.last_failure_at
			.map(|t| Instant::now().duration_since(t).as_secs_f64())
			.unwrap_or(f64::MAX);
		let age_fraction = (age_since_failure / Duration::from_secs(600).as_secs_f64()).clamp(0.0, 1.0);
		let penalty = (self.failure_count as f64 * 0.1) * (1.0 - age_fraction);
		let error_penalty = (error_rate * 0.5).clamp(0.0, 1.0);
		self.health = (1.0 - error_penalty - penalty).clamp(0.0, 1.0);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ipv4_link_local_is_rejected() {
		assert!(is_ipv4_link_local(Ipv4Addr::new(169, 254, 1, 1)));
		assert!(!is_ipv4_link_local(Ipv4Addr::new(192, 168, 1, 1)));
	}

	#[test]
	fn mark_failure_sets_backoff_in_the_future() {
		let mut state = InterfaceState::new("eth0".into());
		state.mark_failure();
		assert!(!state.is_past_backoff());
		assert_eq!(state.failure_count, 1);
	}

	#[test]
	fn repeated_failures_reduce_health_toward_zero() {
		let mut state = InterfaceState::new("eth0".into());
		let before = state.health;
		for _ in 0..5 {
			state.mark_failure();
		}
		assert!(state.health < before);
		assert!(state.health >= 0.0);
	}
}
