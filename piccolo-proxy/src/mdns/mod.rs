//! C7 — mDNS Responder (spec §4.5). Per-interface IPv4+IPv6 sockets, rate
//! limiting, conflict detection, and health-based recovery. The largest
//! subsystem in the core; isolated from the proxy/registry by only
//! touching UDP multicast.

pub mod conflict;
pub mod iface;
pub mod ratelimit;
pub mod wire;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hickory_proto::op::MessageType;
use tokio::net::UdpSocket;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, instrument, warn};

use conflict::ConflictDetector;
use iface::InterfaceState;
use ratelimit::{RateLimiter, RateLimiterConfig};

/// What the caller of [`MdnsResponder::handle_packet`] should do with the
/// socket it was read from.
pub enum PacketAction {
	None,
	Reply(Vec<u8>),
	ConflictRenamed,
}

const INTERFACE_DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
const HEALTH_LOOP_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(1);
const UNHEALTHY_THRESHOLD: f64 = 0.3;
const RECOVERED_THRESHOLD: f64 = 0.8;
const MIN_HEALTH_SCORE: f64 = 0.5;

#[derive(Debug, Clone)]
pub struct MdnsConfig {
	pub base_service_name: String,
	pub machine_id: String,
	pub max_concurrent_queries: usize,
	pub rate_limit: RateLimiterConfig,
}

impl Default for MdnsConfig {
	fn default() -> Self {
		Self {
			base_service_name: "piccolo".to_string(),
			machine_id: crate::machine_id::derive(),
			max_concurrent_queries: 64,
			rate_limit: RateLimiterConfig::default(),
		}
	}
}

/// Security/operational counters (§5's "atomic counters for security
/// metrics"; SPEC_FULL.md "Metrics counters").
#[derive(Default)]
pub struct Metrics {
	pub queries_total: AtomicU64,
	pub rate_limit_hits: AtomicU64,
	pub malformed_packets: AtomicU64,
	pub oversized_packets: AtomicU64,
	pub dropped_over_capacity: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
	pub queries_total: u64,
	pub rate_limit_hits: u64,
	pub malformed_packets: u64,
	pub oversized_packets: u64,
	pub dropped_over_capacity: u64,
}

impl Metrics {
	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			queries_total: self.queries_total.load(Ordering::Relaxed),
			rate_limit_hits: self.rate_limit_hits.load(Ordering::Relaxed),
			malformed_packets: self.malformed_packets.load(Ordering::Relaxed),
			oversized_packets: self.oversized_packets.load(Ordering::Relaxed),
			dropped_over_capacity: self.dropped_over_capacity.load(Ordering::Relaxed),
		}
	}
}

pub struct MdnsResponder {
	config: MdnsConfig,
	interfaces: Mutex<HashMap<String, InterfaceState>>,
	rate_limiter: Arc<RateLimiter>,
	conflict: Arc<ConflictDetector>,
	query_semaphore: Arc<Semaphore>,
	pub metrics: Arc<Metrics>,
	recovery_mode: std::sync::atomic::AtomicBool,
	shutdown: Mutex<Option<watch::Receiver<bool>>>,
}

impl MdnsResponder {
	pub fn new(config: MdnsConfig) -> Self {
		let conflict = Arc::new(ConflictDetector::new(config.base_service_name.clone(), config.machine_id.clone()));
		let rate_limiter = Arc::new(RateLimiter::new(RateLimiterConfig {
			max_per_second: config.rate_limit.max_per_second,
			max_per_minute: config.rate_limit.max_per_minute,
			client_block_duration: config.rate_limit.client_block_duration,
			idle_eviction: config.rate_limit.idle_eviction,
		}));
		let query_semaphore = Arc::new(Semaphore::new(config.max_concurrent_queries));
		Self {
			interfaces: Mutex::new(HashMap::new()),
			rate_limiter,
			conflict,
			query_semaphore,
			metrics: Arc::new(Metrics::default()),
			recovery_mode: std::sync::atomic::AtomicBool::new(false),
			shutdown: Mutex::new(None),
			config,
		}
	}

	pub fn current_service_name(&self) -> String {
		self.conflict.current_name()
	}

	/// Snapshot of every address currently bound by this responder, used to
	/// recognize announcements reflected back by switches/routers.
	fn local_addresses(&self) -> Vec<IpAddr> {
		let interfaces = self.interfaces.lock().expect("mutex acquired");
		interfaces.values().flat_map(|s| [s.ipv4.map(IpAddr::V4), s.ipv6.map(IpAddr::V6)]).flatten().collect()
	}

	/// Spawns the discovery, health, rate-limiter sweep, and (per-interface,
	/// dynamically as interfaces come and go) read/announce loops. Returns
	/// once `shutdown` observes `true`.
	#[instrument(level = "info", name = "mdns_run", skip(self, shutdown))]
	pub async fn run(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
		*self.shutdown.lock().expect("mutex acquired") = Some(shutdown.clone());

		self.discover_and_reconcile_interfaces().await;
		self.spawn_announcements_for_active_interfaces();
		self.spawn_probe_loop();

		let mut discovery_tick = tokio::time::interval(INTERFACE_DISCOVERY_INTERVAL);
		let mut health_tick = tokio::time::interval(HEALTH_LOOP_INTERVAL);
		let mut sweep_tick = tokio::time::interval(Duration::from_secs(60));

		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				_ = discovery_tick.tick() => {
					self.discover_and_reconcile_interfaces().await;
				}
				_ = health_tick.tick() => {
					self.run_health_loop().await;
				}
				_ = sweep_tick.tick() => {
					self.rate_limiter.sweep();
				}
			}
		}
	}

	#[instrument(level = "debug", name = "mdns_discover", skip(self))]
	async fn discover_and_reconcile_interfaces(self: &Arc<Self>) {
		let discovered = match iface::discover_interfaces() {
			Ok(d) => d,
			Err(e) => {
				warn!(error = %e, "interface discovery failed");
				return;
			},
		};

		let shutdown = self.shutdown.lock().expect("mutex acquired").clone();
		let mut new_sockets = Vec::new();

		{
			let mut interfaces = self.interfaces.lock().expect("mutex acquired");
			let seen: std::collections::HashSet<String> = discovered.iter().map(|i| i.name.clone()).collect();
			interfaces.retain(|name, _| seen.contains(name));

			for disc in discovered {
				let changed_ip = interfaces.get(&disc.name).map(|s| s.ipv4 != disc.ipv4 || s.ipv6 != disc.ipv6).unwrap_or(true);
				if !changed_ip {
					continue;
				}
				let mut state = InterfaceState::new(disc.name.clone());
				state.ipv4 = disc.ipv4;
				state.ipv6 = disc.ipv6;

				if let Some(ipv4) = disc.ipv4 {
					match iface::setup_ipv4_socket(&disc.name, ipv4) {
						Ok(sock) => {
							let sock = Arc::new(sock);
							state.ipv4_conn = Some(sock.clone());
							new_sockets.push((disc.name.clone(), sock));
						},
						Err(e) => {
							warn!(iface = %disc.name, error = %e, "ipv4 mdns socket setup failed");
							state.mark_failure();
						},
					}
				}
				if disc.ipv6.is_some() {
					match nix::net::if_::if_nametoindex(disc.name.as_str()) {
						Ok(index) => match iface::setup_ipv6_socket(&disc.name, index) {
							Ok(sock) => {
								let sock = Arc::new(sock);
								state.ipv6_conn = Some(sock.clone());
								new_sockets.push((disc.name.clone(), sock));
							},
							Err(e) => {
								warn!(iface = %disc.name, error = %e, "ipv6 mdns socket setup failed");
								state.mark_failure();
							},
						},
						Err(e) => {
							warn!(iface = %disc.name, error = %e, "interface index lookup failed");
							state.mark_failure();
						},
					}
				}

				state.active = state.ipv4_conn.is_some() || state.ipv6_conn.is_some();
				if state.active {
					info!(iface = %disc.name, "interface ready for mdns");
				}
				interfaces.insert(disc.name.clone(), state);
			}
		}

		if let Some(shutdown) = shutdown {
			for (name, sock) in new_sockets {
				self.spawn_socket_reader(name, sock, shutdown.clone());
			}
		}
	}

	fn mark_iface_success(&self, name: &str) {
		let mut interfaces = self.interfaces.lock().expect("mutex acquired");
		if let Some(state) = interfaces.get_mut(name) {
			state.mark_success();
		}
	}

	fn mark_iface_failure(&self, name: &str) {
		let mut interfaces = self.interfaces.lock().expect("mutex acquired");
		if let Some(state) = interfaces.get_mut(name) {
			state.mark_failure();
		}
	}

	/// One task per bound socket: waits up to [`READ_DEADLINE`] for a
	/// datagram, hands it to [`handle_packet`](Self::handle_packet), and
	/// acts on the result. Exits once `shutdown` observes `true`.
	fn spawn_socket_reader(self: &Arc<Self>, iface_name: String, socket: Arc<UdpSocket>, mut shutdown: watch::Receiver<bool>) {
		let responder = self.clone();
		tokio::spawn(async move {
			let mut buf = vec![0u8; wire::MAX_PACKET_SIZE];
			loop {
				tokio::select! {
					_ = shutdown.changed() => {
						if *shutdown.borrow() {
							return;
						}
					}
					result = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buf)) => {
						let Ok(read) = result else { continue };
						match read {
							Ok((n, source)) => {
								responder.mark_iface_success(&iface_name);
								let local_addrs = responder.local_addresses();
								match responder.handle_packet(&buf[..n], source, &local_addrs) {
									PacketAction::Reply(bytes) => {
										if let Err(e) = socket.send_to(&bytes, source).await {
											warn!(error = %e, "mdns reply send failed");
										}
									}
									PacketAction::ConflictRenamed => {
										responder.clone().spawn_conflict_reannounce();
									}
									PacketAction::None => {}
								}
							}
							Err(e) => {
								warn!(iface = %iface_name, error = %e, "mdns socket read failed");
								responder.mark_iface_failure(&iface_name);
							},
						}
					}
				}
			}
		});
	}

	fn spawn_announcements_for_active_interfaces(self: &Arc<Self>) {
		let responder = self.clone();
		tokio::spawn(async move {
			for delay in [Duration::from_secs(0), Duration::from_secs(1), Duration::from_secs(2)] {
				tokio::time::sleep(delay).await;
				responder.announce_all().await;
			}
			let mut tick = tokio::time::interval(Duration::from_secs(60));
			loop {
				tick.tick().await;
				responder.announce_all().await;
			}
		});
	}

	/// Outbound ANY probes for the current name, at start and every 5
	/// minutes thereafter (spec §4.5 "Conflict detection").
	fn spawn_probe_loop(self: &Arc<Self>) {
		let responder = self.clone();
		tokio::spawn(async move {
			let mut tick = tokio::time::interval(ConflictDetector::probe_interval());
			loop {
				tick.tick().await;
				responder.send_probe().await;
			}
		});
	}

	async fn send_probe(&self) {
		let probe = wire::build_probe(&self.current_service_name());
		let Ok(bytes) = wire::encode(&probe) else { return };
		self.send_to_all_active(&bytes).await;
	}

	/// Three re-announcements one second apart after a resolved name
	/// conflict (spec §4.5 "Conflict detection", scenario S4).
	fn spawn_conflict_reannounce(self: Arc<Self>) {
		tokio::spawn(async move {
			for delay in [Duration::ZERO, Duration::from_secs(1), Duration::from_secs(2)] {
				tokio::time::sleep(delay).await;
				self.announce_all().await;
			}
		});
	}

	async fn announce_all(&self) {
		let name = self.current_service_name();
		debug!(name, "sending mdns announcement");

		let sockets: Vec<(Arc<UdpSocket>, bool, Option<std::net::Ipv4Addr>, Option<std::net::Ipv6Addr>)> = {
			let interfaces = self.interfaces.lock().expect("mutex acquired");
			interfaces
				.values()
				.filter(|s| s.active)
				.flat_map(|s| {
					[
						s.ipv4_conn.clone().zip(s.ipv4).map(|(sock, ip)| (sock, true, Some(ip), None)),
						s.ipv6_conn.clone().zip(s.ipv6).map(|(sock, ip)| (sock, false, None, Some(ip))),
					]
				})
				.flatten()
				.collect()
		};

		for (sock, is_v4, ipv4, ipv6) in sockets {
			let msg = if is_v4 { wire::build_announcement_v4(&name, ipv4.unwrap()) } else { wire::build_announcement_v6(&name, ipv6.unwrap()) };
			let Ok(bytes) = wire::encode(&msg) else { continue };
			let dest = if is_v4 {
				SocketAddr::new(IpAddr::V4(iface::MDNS_V4_GROUP), iface::MDNS_PORT)
			} else {
				SocketAddr::new(IpAddr::V6(iface::MDNS_V6_GROUP), iface::MDNS_PORT)
			};
			if let Err(e) = sock.send_to(&bytes, dest).await {
				debug!(error = %e, "mdns announcement send failed");
			}
		}
	}

	async fn send_to_all_active(&self, bytes: &[u8]) {
		let sockets: Vec<(Arc<UdpSocket>, SocketAddr)> = {
			let interfaces = self.interfaces.lock().expect("mutex acquired");
			interfaces
				.values()
				.filter(|s| s.active)
				.flat_map(|s| {
					[
						s.ipv4_conn.clone().map(|sock| (sock, SocketAddr::new(IpAddr::V4(iface::MDNS_V4_GROUP), iface::MDNS_PORT))),
						s.ipv6_conn.clone().map(|sock| (sock, SocketAddr::new(IpAddr::V6(iface::MDNS_V6_GROUP), iface::MDNS_PORT))),
					]
				})
				.flatten()
				.collect()
		};
		for (sock, dest) in sockets {
			let _ = sock.send_to(bytes, dest).await;
		}
	}

	/// Closes and re-creates sockets for interfaces past their backoff that
	/// are either inactive or below `MIN_HEALTH_SCORE` (spec §4.5
	/// "Resilience"). New sockets get a reader task spawned once the
	/// interfaces lock is released.
	#[instrument(level = "debug", name = "mdns_health", skip(self))]
	async fn run_health_loop(self: &Arc<Self>) {
		let shutdown = self.shutdown.lock().expect("mutex acquired").clone();
		let mut new_sockets = Vec::new();

		let overall = {
			let mut interfaces = self.interfaces.lock().expect("mutex acquired");
			for state in interfaces.values_mut() {
				if !state.is_past_backoff() {
					continue;
				}
				if !state.active || state.health < MIN_HEALTH_SCORE {
					state.recovery_attempts += 1;
					state.ipv4_conn = None;
					state.ipv6_conn = None;

					if let Some(ipv4) = state.ipv4 {
						match iface::setup_ipv4_socket(&state.name, ipv4) {
							Ok(sock) => {
								let sock = Arc::new(sock);
								state.ipv4_conn = Some(sock.clone());
								new_sockets.push((state.name.clone(), sock));
							},
							Err(e) => {
								warn!(iface = %state.name, error = %e, "ipv4 mdns socket re-create failed during recovery");
								state.mark_failure();
							},
						}
					}
					if let Some(ipv6) = state.ipv6 {
						match nix::net::if_::if_nametoindex(state.name.as_str()) {
							Ok(index) => match iface::setup_ipv6_socket(&state.name, index) {
								Ok(sock) => {
									let sock = Arc::new(sock);
									state.ipv6_conn = Some(sock.clone());
									new_sockets.push((state.name.clone(), sock));
								},
								Err(e) => {
									warn!(iface = %state.name, error = %e, "ipv6 mdns socket re-create failed during recovery");
									state.mark_failure();
								},
							},
							Err(e) => {
								warn!(iface = %state.name, error = %e, "interface index lookup failed during recovery");
								state.mark_failure();
							},
						}
					}

					state.active = state.ipv4_conn.is_some() || state.ipv6_conn.is_some();
					if state.active {
						info!(iface = %state.name, "interface recovered for mdns");
						state.mark_success();
					}
				}
			}
			if interfaces.is_empty() {
				1.0
			} else {
				interfaces.values().map(|s| s.health).sum::<f64>() / interfaces.len() as f64
			}
		};

		if let Some(shutdown) = shutdown {
			for (name, sock) in new_sockets {
				self.spawn_socket_reader(name, sock, shutdown.clone());
			}
		}

		let was_recovering = self.recovery_mode.load(Ordering::Acquire);
		if overall < UNHEALTHY_THRESHOLD && !was_recovering {
			warn!(overall, "mdns overall health below threshold, entering recovery mode");
			self.recovery_mode.store(true, Ordering::Release);
			self.discover_and_reconcile_interfaces().await;
		} else if overall > RECOVERED_THRESHOLD && was_recovering {
			info!(overall, "mdns health recovered, exiting recovery mode");
			self.recovery_mode.store(false, Ordering::Release);
		}
	}

	/// Handles one inbound datagram (spec §4.5 steps 2-7). `source` is the
	/// sender's address; `local_addrs` lets the conflict detector recognize
	/// its own announcements reflected by some routers/switches.
	#[instrument(level = "trace", name = "mdns_packet", skip(self, buf, local_addrs))]
	pub fn handle_packet(&self, buf: &[u8], source: SocketAddr, local_addrs: &[IpAddr]) -> PacketAction {
		let Ok(_permit) = self.query_semaphore.clone().try_acquire_owned() else {
			self.metrics.dropped_over_capacity.fetch_add(1, Ordering::Relaxed);
			return PacketAction::None;
		};

		self.metrics.queries_total.fetch_add(1, Ordering::Relaxed);

		let message = match wire::parse_message(buf) {
			Ok(m) => m,
			Err(e) => {
				match e {
					piccolo_core::error::Error::OversizedPacket(_) => {
						self.metrics.oversized_packets.fetch_add(1, Ordering::Relaxed);
					},
					_ => {
						self.metrics.malformed_packets.fetch_add(1, Ordering::Relaxed);
					},
				}
				debug!(error = %e, "dropping malformed mdns packet");
				return PacketAction::None;
			},
		};

		if self.rate_limiter.check(source.ip()).is_err() {
			self.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
			return PacketAction::None;
		}

		if let Err(e) = wire::validate_message(&message) {
			self.metrics.malformed_packets.fetch_add(1, Ordering::Relaxed);
			debug!(error = %e, "dropping invalid mdns message");
			return PacketAction::None;
		}

		if message.message_type() == MessageType::Response {
			if buf.len() > wire::MAX_RESPONSE_SIZE {
				self.metrics.oversized_packets.fetch_add(1, Ordering::Relaxed);
				debug!(len = buf.len(), "dropping oversized mdns response");
				return PacketAction::None;
			}
			let is_local = local_addrs.contains(&source.ip());
			if self.conflict.observe_response(&message, source.ip(), is_local) {
				warn!(from = %source.ip(), "mdns name conflict detected, resolving");
				let _new_name = self.conflict.resolve_name_conflict();
				return PacketAction::ConflictRenamed;
			}
			return PacketAction::None;
		}

		let name = self.current_service_name();
		let matched = message.queries().iter().any(|q| wire::question_matches(q, &name));
		if !matched {
			return PacketAction::None;
		}

		let (ipv4, ipv6) = self.any_active_addresses();
		let reply = wire::build_reply(&message, &name, ipv4, ipv6);
		if reply.answers().is_empty() {
			return PacketAction::None;
		}
		match wire::encode(&reply) {
			Ok(bytes) => PacketAction::Reply(bytes),
			Err(e) => {
				warn!(error = %e, "failed to encode mdns reply");
				PacketAction::None
			},
		}
	}

	fn any_active_addresses(&self) -> (Option<std::net::Ipv4Addr>, Option<std::net::Ipv6Addr>) {
		let interfaces = self.interfaces.lock().expect("mutex acquired");
		let ipv4 = interfaces.values().find(|s| s.active).and_then(|s| s.ipv4);
		let ipv6 = interfaces.values().find(|s| s.active).and_then(|s| s.ipv6);
		(ipv4, ipv6)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::op::{Message, OpCode, Query};
	use hickory_proto::rr::{Name, RData, Record, RecordType};
	use hickory_proto::serialize::binary::BinEncodable;
	use std::net::Ipv4Addr;

	fn config() -> MdnsConfig {
		MdnsConfig {
			base_service_name: "piccolo".to_string(),
			machine_id: "abcdef".to_string(),
			max_concurrent_queries: 4,
			rate_limit: RateLimiterConfig::default(),
		}
	}

	#[test]
	fn malformed_packet_is_dropped_and_counted() {
		let responder = MdnsResponder::new(config());
		responder.handle_packet(&[0u8; 4], "10.0.0.1:5353".parse().unwrap(), &[]);
		assert_eq!(responder.metrics.snapshot().malformed_packets, 1);
	}

	#[test]
	fn oversized_packet_is_dropped_and_counted() {
		let responder = MdnsResponder::new(config());
		let buf = vec![0u8; wire::MAX_PACKET_SIZE + 10];
		responder.handle_packet(&buf, "10.0.0.1:5353".parse().unwrap(), &[]);
		assert_eq!(responder.metrics.snapshot().oversized_packets, 1);
	}

	#[test]
	fn valid_query_for_current_name_is_counted_without_error() {
		let responder = MdnsResponder::new(config());
		let mut msg = Message::new();
		msg.set_op_code(OpCode::Query);
		msg.add_query(Query::query(Name::from_ascii("piccolo.local.").unwrap(), RecordType::A));
		let buf = msg.to_bytes().unwrap();
		responder.handle_packet(&buf, "10.0.0.1:5353".parse().unwrap(), &[]);
		let snap = responder.metrics.snapshot();
		assert_eq!(snap.queries_total, 1);
		assert_eq!(snap.malformed_packets, 0);
	}

	#[test]
	fn oversized_response_is_dropped_and_counted() {
		let responder = MdnsResponder::new(config());
		let mut msg = Message::new();
		msg.set_message_type(MessageType::Response);
		msg.set_op_code(OpCode::Query);
		let owner = Name::from_ascii("piccolo.local.").unwrap();
		msg.add_query(Query::query(owner.clone(), RecordType::A));
		for i in 0..40u8 {
			msg.add_answer(Record::from_rdata(owner.clone(), 120, RData::A(Ipv4Addr::new(10, 0, 0, i).into())));
		}
		let buf = msg.to_bytes().unwrap();
		assert!(buf.len() > wire::MAX_RESPONSE_SIZE);
		assert!(buf.len() <= wire::MAX_PACKET_SIZE);
		responder.handle_packet(&buf, "10.0.0.1:5353".parse().unwrap(), &[]);
		assert_eq!(responder.metrics.snapshot().oversized_packets, 1);
	}

	#[test]
	fn over_capacity_queries_are_dropped() {
		let mut cfg = config();
		cfg.max_concurrent_queries = 0;
		let responder = MdnsResponder::new(cfg);
		responder.handle_packet(&[0u8; 20], "10.0.0.1:5353".parse().unwrap(), &[]);
		assert_eq!(responder.metrics.snapshot().dropped_over_capacity, 1);
	}
}
