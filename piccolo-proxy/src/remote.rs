//! C11 — Remote Runtime Controller (spec §4.10). Subscribes to
//! `remote_config_changed` and drives the TLS Mux and host-resolver
//! lifecycle. Remote-config events flow one-way in (§9): this component
//! never reads `<control>/remote/config.json` itself.

use std::sync::Arc;

use piccolo_core::Strng;
use piccolo_core::error::Result;
use tokio::sync::watch;
use tracing::{instrument, warn};

use crate::bus::{EventBus, Payload, RemoteConfigPayload, Topic};

/// Updated so the (out-of-scope) HTTP collaborator can classify hostnames
/// as "remote" for its HTTPS-redirect policy.
pub trait HostResolver: Send + Sync {
	fn set_remote(&self, portal_hostname: Strng, tld: Strng, portal_port: u16);
	fn set_mux_port(&self, port: u16);
}

pub trait TlsMuxController: Send + Sync {
	fn configure(&self, portal_hostname: Strng, tld: Strng, portal_port: u16);
	fn start(&self) -> Result<()>;
	fn stop(&self);
	/// `0` while stopped.
	fn port(&self) -> u16;
}

pub struct RemoteController {
	bus: Arc<EventBus>,
	resolver: Arc<dyn HostResolver>,
	mux: Arc<dyn TlsMuxController>,
}

impl RemoteController {
	pub fn new(bus: Arc<EventBus>, resolver: Arc<dyn HostResolver>, mux: Arc<dyn TlsMuxController>) -> Self {
		Self { bus, resolver, mux }
	}

	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		let mut rx = self.bus.subscribe(Topic::RemoteConfigChanged, 8);
		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				event = rx.recv() => {
					match event {
						Some(ev) => {
							if let Payload::RemoteConfigChanged(payload) = ev.payload {
								self.handle(payload);
							}
						},
						None => return,
					}
				}
			}
		}
	}

	#[instrument(level = "info", name = "remote_config_changed", skip(self, payload))]
	fn handle(&self, payload: RemoteConfigPayload) {
		let portal_hostname: Strng = payload.portal_hostname.clone().into();
		let tld: Strng = payload.tld.clone().into();

		self.resolver.set_remote(portal_hostname.clone(), tld.clone(), payload.portal_port);
		self.mux.configure(portal_hostname, tld, payload.portal_port);

		if payload.enabled && !payload.portal_hostname.is_empty() {
			if let Err(e) = self.mux.start() {
				warn!(error = %e, "failed to start tls mux, remaining idle until next event");
			}
		} else {
			self.mux.stop();
		}

		self.resolver.set_mux_port(self.mux.port());
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	#[derive(Default)]
	struct FakeResolver {
		remote: Mutex<Option<(Strng, Strng, u16)>>,
		mux_port: Mutex<u16>,
	}

	impl HostResolver for FakeResolver {
		fn set_remote(&self, portal_hostname: Strng, tld: Strng, portal_port: u16) {
			*self.remote.lock().unwrap() = Some((portal_hostname, tld, portal_port));
		}
		fn set_mux_port(&self, port: u16) {
			*self.mux_port.lock().unwrap() = port;
		}
	}

	struct FakeMux {
		configured: Mutex<bool>,
		running: Mutex<bool>,
		fail_start: bool,
	}

	impl TlsMuxController for FakeMux {
		fn configure(&self, _portal_hostname: Strng, _tld: Strng, _portal_port: u16) {
			*self.configured.lock().unwrap() = true;
		}
		fn start(&self) -> Result<()> {
			if self.fail_start {
				return Err(piccolo_core::error::Error::UpstreamUnavailable("bind failed".into()));
			}
			*self.running.lock().unwrap() = true;
			Ok(())
		}
		fn stop(&self) {
			*self.running.lock().unwrap() = false;
		}
		fn port(&self) -> u16 {
			if *self.running.lock().unwrap() { 40443 } else { 0 }
		}
	}

	#[tokio::test]
	async fn enabled_with_portal_starts_mux_and_records_port_on_resolver() {
		let bus = Arc::new(EventBus::new());
		let resolver = Arc::new(FakeResolver::default());
		let mux = Arc::new(FakeMux { configured: Mutex::new(false), running: Mutex::new(false), fail_start: false });
		let controller = RemoteController::new(bus.clone(), resolver.clone(), mux.clone());

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(async move { controller.run(shutdown_rx).await });
		tokio::task::yield_now().await;

		bus.publish(crate::bus::Event::new(Payload::RemoteConfigChanged(RemoteConfigPayload {
			enabled: true,
			portal_hostname: "portal.example.com".to_string(),
			tld: "example.com".to_string(),
			portal_port: 8081,
		})));
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert!(*mux.configured.lock().unwrap());
		assert!(*mux.running.lock().unwrap());
		assert_eq!(*resolver.mux_port.lock().unwrap(), 40443);

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn disabled_stops_mux_and_resolver_sees_port_zero() {
		let bus = Arc::new(EventBus::new());
		let resolver = Arc::new(FakeResolver::default());
		let mux = Arc::new(FakeMux { configured: Mutex::new(false), running: Mutex::new(true), fail_start: false });
		let controller = RemoteController::new(bus.clone(), resolver.clone(), mux.clone());

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(async move { controller.run(shutdown_rx).await });
		tokio::task::yield_now().await;

		bus.publish(crate::bus::Event::new(Payload::RemoteConfigChanged(RemoteConfigPayload {
			enabled: false,
			portal_hostname: "portal.example.com".to_string(),
			tld: "example.com".to_string(),
			portal_port: 8081,
		})));
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert!(!*mux.running.lock().unwrap());
		assert_eq!(*resolver.mux_port.lock().unwrap(), 0);

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}
}
