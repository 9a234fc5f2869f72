//! C6 — Service Registry & Reconciler. Single mutex guarding the
//! `{app -> {name -> endpoint}}` map (spec §4.4). The registry mutex is the
//! only lock that may be held while starting/stopping a proxy listener
//! (spec §5); it never hands out the lock to connection handlers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use piccolo_core::Strng;
use piccolo_core::error::Result;
use tracing::{info, instrument, warn};

use crate::ports::PortAllocator;
use crate::types::{Listener, ServiceEndpoint};

/// Starts/stops the public-port proxy for an endpoint. Implemented by the
/// Proxy Manager; kept as a trait here so the registry doesn't depend on
/// the proxy module's concrete listener bookkeeping.
pub trait ProxyController: Send + Sync {
	fn start(&self, endpoint: &ServiceEndpoint) -> Result<()>;
	fn stop(&self, public_port: u16);
}

/// Notified on every public-port lifecycle transition; used by the remote
/// tunnel to refresh its published ports.
pub trait PublishHook: Send + Sync {
	fn publish(&self, port: u16);
	fn unpublish(&self, port: u16);
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileResult {
	pub unchanged: Vec<Strng>,
	pub restarted: Vec<Strng>,
	pub guest_port_changed: Vec<Strng>,
	pub added: Vec<Strng>,
	pub removed: Vec<Strng>,
	pub container_change: bool,
}

type AppMap = HashMap<Strng, HashMap<Strng, ServiceEndpoint>>;

pub struct ServiceRegistry {
	apps: Mutex<AppMap>,
	allocator: Arc<PortAllocator>,
	proxies: Arc<dyn ProxyController>,
	publish_hook: Mutex<Option<Arc<dyn PublishHook>>>,
}

impl ServiceRegistry {
	pub fn new(allocator: Arc<PortAllocator>, proxies: Arc<dyn ProxyController>) -> Self {
		Self {
			apps: Mutex::new(HashMap::new()),
			allocator,
			proxies,
			publish_hook: Mutex::new(None),
		}
	}

	pub fn set_publish_hook(&self, hook: Arc<dyn PublishHook>) {
		*self.publish_hook.lock().expect("mutex acquired") = Some(hook);
	}

	fn notify_publish(&self, port: u16) {
		if let Some(hook) = self.publish_hook.lock().expect("mutex acquired").as_ref() {
			hook.publish(port);
		}
	}

	fn notify_unpublish(&self, port: u16) {
		if let Some(hook) = self.publish_hook.lock().expect("mutex acquired").as_ref() {
			hook.unpublish(port);
		}
	}

	#[instrument(level = "info", name = "allocate_for_app", skip(self, listeners), fields(app = %app))]
	pub fn allocate_for_app(&self, app: impl Into<Strng>, listeners: &[Listener]) -> Result<Vec<ServiceEndpoint>> {
		let app = app.into();
		let mut created = Vec::with_capacity(listeners.len());
		let mut apps = self.apps.lock().expect("mutex acquired");
		let entry = apps.entry(app.clone()).or_default();
		for listener in listeners {
			let (host_bind, public_port) = self.allocator.allocate_pair()?;
			let endpoint = ServiceEndpoint::from_listener(app.clone(), listener, host_bind, public_port);
			self.proxies.start(&endpoint)?;
			self.notify_publish(public_port);
			entry.insert(endpoint.name.clone(), endpoint.clone());
			created.push(endpoint);
		}
		Ok(created)
	}

	/// Diff by listener name against the app's current endpoints. See spec
	/// §4.4 for the five cases handled here.
	#[instrument(level = "info", name = "reconcile", skip(self, listeners), fields(app = %app))]
	pub fn reconcile(&self, app: impl Into<Strng>, listeners: &[Listener]) -> Result<ReconcileResult> {
		let app = app.into();
		let mut result = ReconcileResult::default();
		let mut apps = self.apps.lock().expect("mutex acquired");
		let current = apps.entry(app.clone()).or_default();

		let desired_names: std::collections::HashSet<&Strng> = listeners.iter().map(|l| &l.name).collect();

		// Removed: present in current, absent from desired.
		let removed_names: Vec<Strng> = current
			.keys()
			.filter(|name| !desired_names.contains(name))
			.cloned()
			.collect();
		for name in removed_names {
			if let Some(ep) = current.remove(&name) {
				self.proxies.stop(ep.public_port);
				self.allocator.release(ep.host_bind, ep.public_port);
				self.notify_unpublish(ep.public_port);
				result.removed.push(name);
				result.container_change = true;
			}
		}

		for listener in listeners {
			match current.get(&listener.name).cloned() {
				None => {
					let (host_bind, public_port) = self.allocator.allocate_pair()?;
					let endpoint = ServiceEndpoint::from_listener(app.clone(), listener, host_bind, public_port);
					self.proxies.start(&endpoint)?;
					self.notify_publish(public_port);
					current.insert(endpoint.name.clone(), endpoint);
					result.added.push(listener.name.clone());
					result.container_change = true;
				},
				Some(existing) => {
					if existing.guest_port != listener.guest_port {
						// Ports are preserved; container runtime must be
						// re-pulled/restarted by the external app manager.
						let mut updated = existing.clone();
						updated.guest_port = listener.guest_port;
						updated.flow = listener.flow;
						updated.protocol = listener.protocol;
						updated.middleware = listener.middleware.clone();
						updated.remote_ports = listener.effective_remote_ports();
						if !existing.proxy_affecting_matches(&updated) {
							self.proxies.stop(existing.public_port);
							self.proxies.start(&updated)?;
						}
						current.insert(listener.name.clone(), updated);
						result.guest_port_changed.push(listener.name.clone());
						result.container_change = true;
					} else if !existing.listener_proxy_affecting_eq(listener) {
						let mut updated = existing.clone();
						updated.flow = listener.flow;
						updated.protocol = listener.protocol;
						updated.middleware = listener.middleware.clone();
						updated.remote_ports = listener.effective_remote_ports();
						self.proxies.stop(existing.public_port);
						self.proxies.start(&updated)?;
						current.insert(listener.name.clone(), updated);
						result.restarted.push(listener.name.clone());
					} else {
						result.unchanged.push(listener.name.clone());
					}
				},
			}
		}

		Ok(result)
	}

	/// Rebuilds proxies from pre-existing container port maps (post-restart
	/// hydration). Reserves host-bind ports with the allocator before
	/// starting proxies. Missing guest->host entries are dropped silently.
	#[instrument(level = "info", name = "restore_from_runtime", skip(self, listeners, guest_to_host), fields(app = %app))]
	pub fn restore_from_runtime(
		&self,
		app: impl Into<Strng>,
		listeners: &[Listener],
		guest_to_host: &HashMap<u16, u16>,
	) -> Result<Vec<ServiceEndpoint>> {
		let app = app.into();
		let mut restored = vec![];
		let mut apps = self.apps.lock().expect("mutex acquired");
		let entry = apps.entry(app.clone()).or_default();
		for listener in listeners {
			let Some(host_bind) = guest_to_host.get(&listener.guest_port).copied() else {
				warn!(listener = %listener.name, "no host-bind mapping for guest port, dropping");
				continue;
			};
			if let Err(e) = self.allocator.reserve_host(host_bind) {
				warn!(listener = %listener.name, error = %e, "failed to reserve host-bind port during restore");
				continue;
			}
			let public_port = match self.allocator.allocate_public() {
				Ok(p) => p,
				Err(e) => {
					warn!(listener = %listener.name, error = %e, "failed to allocate public port during restore");
					self.allocator.release_host(host_bind);
					continue;
				},
			};
			let endpoint = ServiceEndpoint::from_listener(app.clone(), listener, host_bind, public_port);
			self.proxies.start(&endpoint)?;
			self.notify_publish(public_port);
			entry.insert(endpoint.name.clone(), endpoint.clone());
			restored.push(endpoint);
		}
		Ok(restored)
	}

	#[instrument(level = "info", name = "remove_app", skip(self), fields(app = %app))]
	pub fn remove_app(&self, app: impl Into<Strng>) {
		let app = app.into();
		let mut apps = self.apps.lock().expect("mutex acquired");
		if let Some(endpoints) = apps.remove(&app) {
			for (_, ep) in endpoints {
				self.proxies.stop(ep.public_port);
				self.allocator.release(ep.host_bind, ep.public_port);
				self.notify_unpublish(ep.public_port);
			}
			info!(app = %app, "removed app");
		}
	}

	pub fn get(&self, app: &str, name: &str) -> Option<ServiceEndpoint> {
		self.apps.lock().expect("mutex acquired").get(app)?.get(name).cloned()
	}

	pub fn all(&self) -> Vec<ServiceEndpoint> {
		self
			.apps
			.lock()
			.expect("mutex acquired")
			.values()
			.flat_map(|m| m.values().cloned())
			.collect()
	}

	/// Looks up a listener by name across all apps, optionally constrained to
	/// endpoints that declare `remote_port` among their remote ports — used
	/// by the TLS Mux to route `<label>.<tld>` SNI matches (spec §4.3).
	pub fn find_listener_by_name(&self, name: &str, remote_port: u16) -> Option<ServiceEndpoint> {
		self
			.apps
			.lock()
			.expect("mutex acquired")
			.values()
			.flat_map(|m| m.values())
			.find(|ep| ep.name.as_str() == name && ep.remote_ports.contains(&remote_port))
			.cloned()
	}
}

impl ServiceEndpoint {
	fn proxy_affecting_matches(&self, other: &ServiceEndpoint) -> bool {
		self.flow == other.flow
			&& self.protocol == other.protocol
			&& self.middleware.len() == other.middleware.len()
			&& self
				.middleware
				.iter()
				.zip(other.middleware.iter())
				.all(|(a, b)| a.name == b.name)
	}

	fn listener_proxy_affecting_eq(&self, listener: &Listener) -> bool {
		self.flow == listener.flow
			&& self.protocol == listener.protocol
			&& self.middleware.len() == listener.middleware.len()
			&& self
				.middleware
				.iter()
				.zip(listener.middleware.iter())
				.all(|(a, b)| a.name == b.name)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Flow, PortRange, Protocol};
	use std::sync::Mutex as StdMutex;

	struct NoopProxies {
		started: StdMutex<Vec<u16>>,
		stopped: StdMutex<Vec<u16>>,
	}

	impl NoopProxies {
		fn new() -> Arc<Self> {
			Arc::new(Self { started: StdMutex::new(vec![]), stopped: StdMutex::new(vec![]) })
		}
	}

	impl ProxyController for NoopProxies {
		fn start(&self, endpoint: &ServiceEndpoint) -> Result<()> {
			self.started.lock().unwrap().push(endpoint.public_port);
			Ok(())
		}
		fn stop(&self, public_port: u16) {
			self.stopped.lock().unwrap().push(public_port);
		}
	}

	fn listener(name: &str, guest_port: u16, flow: Flow, protocol: Protocol) -> Listener {
		Listener {
			name: name.into(),
			guest_port,
			flow,
			protocol,
			middleware: vec![],
			remote_ports: vec![],
		}
	}

	fn registry() -> (ServiceRegistry, Arc<NoopProxies>) {
		let alloc = Arc::new(PortAllocator::new(PortRange::new(30000, 30010), PortRange::new(40000, 40010)));
		let proxies = NoopProxies::new();
		(ServiceRegistry::new(alloc, proxies.clone()), proxies)
	}

	#[test]
	fn reconcile_add_remove_and_guest_port_change() {
		let (reg, _proxies) = registry();
		reg
			.allocate_for_app("blog", &[listener("a", 80, Flow::Tcp, Protocol::Raw)])
			.unwrap();
		let before = reg.get("blog", "a").unwrap();

		let result = reg
			.reconcile(
				"blog",
				&[
					listener("a", 8080, Flow::Tcp, Protocol::Raw),
					listener("b", 22, Flow::Tcp, Protocol::Raw),
				],
			)
			.unwrap();

		let after = reg.get("blog", "a").unwrap();
		assert_eq!(before.host_bind, after.host_bind);
		assert_eq!(before.public_port, after.public_port);
		assert_eq!(result.guest_port_changed, vec![Strng::from("a")]);
		assert_eq!(result.added, vec![Strng::from("b")]);
		assert!(result.removed.is_empty());
		assert!(result.container_change);
	}

	#[test]
	fn reconcile_removes_listener_and_releases_ports() {
		let (reg, proxies) = registry();
		reg
			.allocate_for_app("blog", &[listener("a", 80, Flow::Tcp, Protocol::Raw)])
			.unwrap();
		let ep = reg.get("blog", "a").unwrap();
		let result = reg.reconcile("blog", &[]).unwrap();
		assert_eq!(result.removed, vec![Strng::from("a")]);
		assert!(proxies.stopped.lock().unwrap().contains(&ep.public_port));
		// port should be reusable again
		let (_, public) = reg.allocate_for_app("blog2", &[listener("c", 1, Flow::Tcp, Protocol::Raw)]).map(|v| (v[0].host_bind, v[0].public_port)).unwrap();
		assert!(public > 0);
	}

	#[test]
	fn reconcile_restarts_proxy_on_proxy_affecting_change_only() {
		let (reg, proxies) = registry();
		reg
			.allocate_for_app("blog", &[listener("a", 80, Flow::Tcp, Protocol::Raw)])
			.unwrap();
		let before = reg.get("blog", "a").unwrap();
		let result = reg
			.reconcile("blog", &[listener("a", 80, Flow::Tcp, Protocol::Http)])
			.unwrap();
		let after = reg.get("blog", "a").unwrap();
		assert_eq!(before.host_bind, after.host_bind);
		assert_eq!(before.public_port, after.public_port);
		assert_eq!(result.restarted, vec![Strng::from("a")]);
		assert!(proxies.stopped.lock().unwrap().contains(&before.public_port));
	}

	#[test]
	fn restore_from_runtime_drops_missing_mappings_silently() {
		let (reg, _proxies) = registry();
		let mut map = HashMap::new();
		map.insert(80u16, 30000u16);
		let restored = reg
			.restore_from_runtime(
				"blog",
				&[listener("a", 80, Flow::Tcp, Protocol::Raw), listener("b", 81, Flow::Tcp, Protocol::Raw)],
				&map,
			)
			.unwrap();
		assert_eq!(restored.len(), 1);
		assert_eq!(restored[0].name.as_str(), "a");
		assert_eq!(restored[0].host_bind, 30000);
	}
}
