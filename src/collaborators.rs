//! Stub collaborators (SPEC_FULL.md "Stub external collaborators"): the
//! out-of-scope Storage/CertProvider/AcmeHandler/HostResolver/
//! RouterController implementations needed to run the core standalone,
//! without the real control-plane HTTP/API, ACME client, or app manager.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU16, Ordering};

use async_trait::async_trait;
use piccolo_core::Strng;
use piccolo_core::error::Result;
use piccolo_proxy::collaborators::{AcmeHandler, CertProvider, CertifiedKey, Storage};
use piccolo_proxy::lock::{RouterController, RouterMode};
use piccolo_proxy::registry::PublishHook;
use piccolo_proxy::remote::HostResolver;
use rcgen::{CertifiedKey as RcgenCertifiedKey, generate_simple_self_signed};
use tracing::{info, warn};

/// Holds the remote-config blob in memory only; a real deployment backs
/// this with the encrypted control volume (out of scope here).
#[derive(Default)]
pub struct InMemoryStorage {
	blob: Mutex<Option<Vec<u8>>>,
}

impl InMemoryStorage {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl Storage for InMemoryStorage {
	async fn load(&self) -> Result<Option<Vec<u8>>> {
		Ok(self.blob.lock().expect("mutex acquired").clone())
	}

	async fn save(&self, blob: &[u8]) -> Result<()> {
		*self.blob.lock().expect("mutex acquired") = Some(blob.to_vec());
		Ok(())
	}
}

/// Generates and caches a self-signed certificate per requested host. A
/// real deployment would request these from an ACME CA; this is enough to
/// exercise the TLS Mux's SNI routing end to end.
#[derive(Default)]
pub struct SelfSignedCertProvider {
	cache: Mutex<HashMap<String, CertifiedKey>>,
	portal_hostname: Mutex<Option<Strng>>,
}

impl SelfSignedCertProvider {
	pub fn new() -> Self {
		Self::default()
	}
}

#[async_trait]
impl CertProvider for SelfSignedCertProvider {
	async fn get_certificate(&self, host: &str) -> Result<Option<CertifiedKey>> {
		if let Some(existing) = self.cache.lock().expect("mutex acquired").get(host) {
			return Ok(Some(existing.clone()));
		}
		let RcgenCertifiedKey { cert, key_pair } = match generate_simple_self_signed(vec![host.to_string()]) {
			Ok(ck) => ck,
			Err(e) => {
				warn!(host, error = %e, "self-signed certificate generation failed");
				return Ok(None);
			},
		};
		let certified = CertifiedKey { chain_der: vec![cert.der().to_vec()], key_der: key_pair.serialize_der() };
		self.cache.lock().expect("mutex acquired").insert(host.to_string(), certified.clone());
		Ok(Some(certified))
	}

	async fn set_portal_hostname(&self, host: Strng) {
		*self.portal_hostname.lock().expect("mutex acquired") = Some(host);
	}
}

/// Answers every ACME HTTP-01 challenge with `None` (404): no real ACME
/// client is wired up in this exercise.
pub struct NullAcmeHandler;

#[async_trait]
impl AcmeHandler for NullAcmeHandler {
	async fn handle(&self, _path: &str) -> Option<Vec<u8>> {
		None
	}
}

/// Tracks the most recently published remote config and mux port for
/// whatever (out-of-scope) HTTP collaborator needs to classify hostnames.
#[derive(Default)]
pub struct SimpleHostResolver {
	remote: Mutex<Option<(Strng, Strng, u16)>>,
	mux_port: AtomicU16,
}

impl SimpleHostResolver {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn mux_port(&self) -> u16 {
		self.mux_port.load(Ordering::Relaxed)
	}
}

impl HostResolver for SimpleHostResolver {
	fn set_remote(&self, portal_hostname: Strng, tld: Strng, portal_port: u16) {
		*self.remote.lock().expect("mutex acquired") = Some((portal_hostname, tld, portal_port));
	}

	fn set_mux_port(&self, port: u16) {
		self.mux_port.store(port, Ordering::Relaxed);
	}
}

/// Records the router mode a real network-stack collaborator would act on
/// (switching the default route between local bridge and remote tunnel).
pub struct LocalRouter {
	mode: Mutex<RouterMode>,
}

impl LocalRouter {
	pub fn new() -> Self {
		Self { mode: Mutex::new(RouterMode::Local) }
	}

	pub fn mode(&self) -> RouterMode {
		*self.mode.lock().expect("mutex acquired")
	}
}

impl Default for LocalRouter {
	fn default() -> Self {
		Self::new()
	}
}

impl RouterController for LocalRouter {
	fn set_mode(&self, mode: RouterMode) {
		info!(?mode, "router mode changed");
		*self.mode.lock().expect("mutex acquired") = mode;
	}
}

pub struct LoggingPublishHook;

impl PublishHook for LoggingPublishHook {
	fn publish(&self, port: u16) {
		info!(port, "public port published");
	}

	fn unpublish(&self, port: u16) {
		info!(port, "public port unpublished");
	}
}
