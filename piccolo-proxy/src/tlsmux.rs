//! C5 — TLS Mux (spec §4.3). A loopback-only SNI-terminating TLS listener,
//! started only when remote is enabled and a portal hostname is set.
//! Routes by SNI: the portal host forwards to the portal port; any
//! `<label>.<tld>` forwards to the registry listener named `label` (with
//! remote-port 443); anything else is closed.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use piccolo_core::Strng;
use piccolo_core::error::{Error, Result};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey as RustlsCertifiedKey;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::collaborators::CertProvider;
use crate::proxy::headers::{ConnectionHint, HintTable};
use crate::registry::ServiceRegistry;
use crate::remote::TlsMuxController;

#[derive(Debug, Clone, Default)]
pub struct TlsMuxConfig {
	pub portal_hostname: Strng,
	pub tld: Strng,
	pub portal_port: u16,
}

struct SniCertResolver {
	provider: Arc<dyn CertProvider>,
	portal_hostname: Strng,
}

impl ResolvesServerCert for SniCertResolver {
	/// `get_certificate` is async; rustls's resolver is not. Bridged via
	/// `block_in_place`, which requires the multi-threaded runtime this
	/// crate already depends on (`tokio`'s `rt-multi-thread` feature).
	///
	/// Absent SNI falls back to the portal hostname (spec §6) so the
	/// handshake still completes when the client presents no server name.
	fn resolve(&self, client_hello: ClientHello) -> Option<Arc<RustlsCertifiedKey>> {
		let host = match client_hello.server_name() {
			Some(name) => name.to_string(),
			None if !self.portal_hostname.is_empty() => self.portal_hostname.to_string(),
			None => return None,
		};
		let provider = self.provider.clone();
		let fetched = tokio::task::block_in_place(|| {
			tokio::runtime::Handle::current().block_on(provider.get_certificate(&host))
		});
		let certified = fetched.ok().flatten()?;
		let chain: Vec<CertificateDer<'static>> =
			certified.chain_der.into_iter().map(CertificateDer::from).collect();
		let key_der = PrivateKeyDer::try_from(certified.key_der).ok()?;
		let signing_key = rustls::crypto::ring::sign::any_supported_type(&key_der).ok()?;
		Some(Arc::new(RustlsCertifiedKey::new(chain, signing_key)))
	}
}

struct Running {
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
	port: u16,
}

pub struct TlsMux {
	registry: Arc<ServiceRegistry>,
	cert_provider: Arc<dyn CertProvider>,
	hints: Arc<HintTable>,
	config: Mutex<TlsMuxConfig>,
	running: Mutex<Option<Running>>,
}

impl TlsMux {
	pub fn new(registry: Arc<ServiceRegistry>, cert_provider: Arc<dyn CertProvider>, hints: Arc<HintTable>) -> Self {
		Self {
			registry,
			cert_provider,
			hints,
			config: Mutex::new(TlsMuxConfig::default()),
			running: Mutex::new(None),
		}
	}

	fn build_server_config(&self, portal_hostname: Strng) -> Result<Arc<ServerConfig>> {
		let mut provider = rustls::crypto::ring::default_provider();
		provider.cipher_suites.retain(|cs| {
			matches!(
				cs.suite(),
				rustls::CipherSuite::TLS13_AES_256_GCM_SHA384
					| rustls::CipherSuite::TLS13_AES_128_GCM_SHA256
					| rustls::CipherSuite::TLS13_CHACHA20_POLY1305_SHA256
					| rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384
					| rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256
					| rustls::CipherSuite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
			)
		});
		provider.kx_groups = vec![
			rustls::crypto::ring::kx_group::X25519,
			rustls::crypto::ring::kx_group::SECP256R1,
			rustls::crypto::ring::kx_group::SECP384R1,
		];
		let resolver = Arc::new(SniCertResolver { provider: self.cert_provider.clone(), portal_hostname });
		let mut server_config = ServerConfig::builder_with_provider(Arc::new(provider))
			.with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
			.map_err(|e| Error::InvalidInput(format!("unsupported tls protocol versions: {e}")))?
			.with_no_client_auth()
			.with_cert_resolver(resolver);
		server_config.ignore_client_order = true;
		Ok(Arc::new(server_config))
	}
}

impl TlsMuxController for TlsMux {
	fn configure(&self, portal_hostname: Strng, tld: Strng, portal_port: u16) {
		*self.config.lock().expect("mutex acquired") = TlsMuxConfig { portal_hostname, tld, portal_port };
	}

	#[instrument(level = "info", name = "tls_mux_start", skip(self))]
	fn start(&self) -> Result<()> {
		let mut running = self.running.lock().expect("mutex acquired");
		if running.is_some() {
			return Ok(());
		}

		let config = self.config.lock().expect("mutex acquired").clone();
		let server_config = self.build_server_config(config.portal_hostname.clone())?;
		let std_listener = std::net::TcpListener::bind("127.0.0.1:0")?;
		std_listener.set_nonblocking(true)?;
		let listener = TcpListener::from_std(std_listener)?;
		let port = listener.local_addr()?.port();

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let acceptor = TlsAcceptor::from(server_config);
		let registry = self.registry.clone();
		let hints = self.hints.clone();

		let task = tokio::spawn(accept_loop(listener, acceptor, registry, hints, config, shutdown_rx));
		info!(port, "tls mux started");
		*running = Some(Running { shutdown: shutdown_tx, task, port });
		Ok(())
	}

	fn stop(&self) {
		if let Some(running) = self.running.lock().expect("mutex acquired").take() {
			let _ = running.shutdown.send(true);
			running.task.abort();
			info!(port = running.port, "tls mux stopped");
		}
	}

	fn port(&self) -> u16 {
		self.running.lock().expect("mutex acquired").as_ref().map(|r| r.port).unwrap_or(0)
	}
}

async fn accept_loop(
	listener: TcpListener,
	acceptor: TlsAcceptor,
	registry: Arc<ServiceRegistry>,
	hints: Arc<HintTable>,
	config: TlsMuxConfig,
	mut shutdown: watch::Receiver<bool>,
) {
	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					return;
				}
			}
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let acceptor = acceptor.clone();
						let registry = registry.clone();
						let hints = hints.clone();
						let config = config.clone();
						tokio::spawn(async move {
							handle_conn(stream, peer, acceptor, registry, hints, config).await;
						});
					},
					Err(e) => {
						warn!(error = %e, "tls mux accept error");
						tokio::time::sleep(std::time::Duration::from_millis(50)).await;
					},
				}
			}
		}
	}
}

fn resolve_target_port(host: &str, config: &TlsMuxConfig, registry: &ServiceRegistry) -> Option<u16> {
	let host = host.trim_end_matches('.').to_lowercase();
	if !config.portal_hostname.is_empty() && host == config.portal_hostname.as_str() {
		return Some(config.portal_port);
	}
	if !config.tld.is_empty() {
		let suffix = format!(".{}", config.tld);
		if let Some(label) = host.strip_suffix(&suffix) {
			return registry.find_listener_by_name(label, 443).map(|ep| ep.public_port);
		}
	}
	None
}

async fn handle_conn(
	stream: TcpStream,
	peer: SocketAddr,
	acceptor: TlsAcceptor,
	registry: Arc<ServiceRegistry>,
	hints: Arc<HintTable>,
	config: TlsMuxConfig,
) {
	let tls_stream = match acceptor.accept(stream).await {
		Ok(s) => s,
		Err(e) => {
			debug!(%peer, error = %e, "tls handshake failed");
			return;
		},
	};

	// Absent SNI falls back to the portal hostname (spec §6).
	let sni = tls_stream.get_ref().1.server_name().map(str::to_string);
	let target_port = match &sni {
		Some(sni) => match resolve_target_port(sni, &config, &registry) {
			Some(port) => port,
			None => {
				debug!(%peer, sni, "no route for sni, closing");
				return;
			},
		},
		None if config.portal_hostname.is_empty() => {
			debug!(%peer, "no sni presented and no portal configured, closing");
			return;
		},
		None => {
			debug!(%peer, "no sni presented, falling back to portal");
			config.portal_port
		},
	};

	let mut upstream = match TcpStream::connect(("127.0.0.1", target_port)).await {
		Ok(s) => s,
		Err(e) => {
			warn!(%peer, target_port, error = %e, "failed to dial upstream");
			return;
		},
	};

	let source_port = upstream.local_addr().map(|a| a.port()).unwrap_or(0);
	hints.register(target_port, source_port, ConnectionHint { is_tls: true, remote_port: 0 });

	let mut tls_stream = tls_stream;
	if let Err(e) = relay_half_close(&mut tls_stream, &mut upstream).await {
		debug!(%peer, error = %e, "tls mux relay ended with error");
	}
}

async fn relay_half_close<A, B>(a: &mut A, b: &mut B) -> std::io::Result<()>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut ar, mut aw) = tokio::io::split(a);
	let (mut br, mut bw) = tokio::io::split(b);
	let a_to_b = async {
		tokio::io::copy(&mut ar, &mut bw).await?;
		bw.shutdown().await
	};
	let b_to_a = async {
		tokio::io::copy(&mut br, &mut aw).await?;
		aw.shutdown().await
	};
	tokio::try_join!(a_to_b, b_to_a)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ports::PortAllocator;
	use crate::registry::ProxyController as _;
	use crate::types::PortRange;

	struct NoopProxies;
	impl crate::registry::ProxyController for NoopProxies {
		fn start(&self, _endpoint: &crate::types::ServiceEndpoint) -> Result<()> {
			Ok(())
		}
		fn stop(&self, _public_port: u16) {}
	}

	fn registry() -> Arc<ServiceRegistry> {
		let alloc = Arc::new(PortAllocator::new(PortRange::new(30000, 30010), PortRange::new(40000, 40010)));
		Arc::new(ServiceRegistry::new(alloc, Arc::new(NoopProxies)))
	}

	#[test]
	fn resolve_target_port_matches_portal_host() {
		let config = TlsMuxConfig {
			portal_hostname: "portal.example.com".into(),
			tld: "example.com".into(),
			portal_port: 8081,
		};
		assert_eq!(resolve_target_port("portal.example.com.", &config, &registry()), Some(8081));
	}

	#[test]
	fn resolve_target_port_returns_none_for_unrelated_host() {
		let config = TlsMuxConfig { portal_hostname: "portal.example.com".into(), tld: "example.com".into(), portal_port: 8081 };
		assert_eq!(resolve_target_port("evil.other.com", &config, &registry()), None);
	}

	#[test]
	fn port_is_zero_before_start() {
		let reg = registry();
		struct FakeCerts;
		#[async_trait::async_trait]
		impl CertProvider for FakeCerts {
			async fn get_certificate(&self, _host: &str) -> Result<Option<crate::collaborators::CertifiedKey>> {
				Ok(None)
			}
			async fn set_portal_hostname(&self, _host: Strng) {}
		}
		let mux = TlsMux::new(reg, Arc::new(FakeCerts), Arc::new(HintTable::new()));
		assert_eq!(mux.port(), 0);
	}
}
