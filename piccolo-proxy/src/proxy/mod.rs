//! C4 — Proxy Manager. Binds `0.0.0.0:public_port` per endpoint the
//! Registry asks to start; selects TCP passthrough vs HTTP reverse proxy
//! per spec §4.2; owns live listener objects and the connection-hint side
//! table exclusively.

pub mod headers;
pub mod http;
pub mod tcp;

use std::collections::HashMap;
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::{Arc, Mutex};

use piccolo_core::error::{Error, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::collaborators::AcmeHandler;
use crate::registry::ProxyController;
use crate::types::{Flow, Protocol, ServiceEndpoint};
use headers::{ConnectionHint, HintTable};
use http::HttpProxyConfig;

struct ListenerHandle {
	shutdown: watch::Sender<bool>,
	task: JoinHandle<()>,
}

/// Serialized start/stop: `start`/`stop` on the same public-port are
/// mutually exclusive (spec §5), enforced by holding `listeners` for the
/// duration of the bind-and-spawn sequence.
pub struct ProxyManager {
	listeners: Mutex<HashMap<u16, ListenerHandle>>,
	hints: Arc<HintTable>,
	acme: Mutex<Option<Arc<dyn AcmeHandler>>>,
}

impl Default for ProxyManager {
	fn default() -> Self {
		Self::new()
	}
}

impl ProxyManager {
	pub fn new() -> Self {
		Self {
			listeners: Mutex::new(HashMap::new()),
			hints: Arc::new(HintTable::new()),
			acme: Mutex::new(None),
		}
	}

	pub fn set_acme_handler(&self, handler: Arc<dyn AcmeHandler>) {
		*self.acme.lock().expect("mutex acquired") = Some(handler);
	}

	/// Consumed by the TLS Mux and external tunnels immediately after
	/// dialing the loopback upstream.
	pub fn register_hint(&self, public_port: u16, source_port: u16, hint: ConnectionHint) {
		self.hints.register(public_port, source_port, hint);
	}

	/// Shares the connection-hint side table with collaborators (the TLS
	/// Mux) that dial into this manager's HTTP listeners on its behalf.
	pub fn hints(&self) -> Arc<HintTable> {
		self.hints.clone()
	}

	fn bind(public_port: u16) -> Result<TcpListener> {
		let addr: SocketAddr = format!("0.0.0.0:{public_port}").parse().expect("valid address");
		let std_listener = StdTcpListener::bind(addr)?;
		std_listener.set_nonblocking(true)?;
		Ok(TcpListener::from_std(std_listener)?)
	}

	fn select_mode(endpoint: &ServiceEndpoint) -> Mode {
		match (endpoint.flow, endpoint.protocol) {
			(Flow::Tls, _) => Mode::TcpPassthrough,
			(Flow::Tcp, Protocol::Http | Protocol::Websocket) => Mode::Http,
			_ => Mode::TcpPassthrough,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
	TcpPassthrough,
	Http,
}

impl ProxyController for ProxyManager {
	fn start(&self, endpoint: &ServiceEndpoint) -> Result<()> {
		let mut listeners = self.listeners.lock().expect("mutex acquired");
		if listeners.contains_key(&endpoint.public_port) {
			return Err(Error::AlreadyExists(format!(
				"proxy already started for public port {}",
				endpoint.public_port
			)));
		}

		let listener = Self::bind(endpoint.public_port)?;
		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let mode = Self::select_mode(endpoint);
		let public_port = endpoint.public_port;
		let host_bind = endpoint.host_bind;

		let task = match mode {
			Mode::TcpPassthrough => {
				info!(public_port, host_bind, "starting tcp passthrough proxy");
				tokio::spawn(tcp::accept_loop(listener, public_port, shutdown_rx, move || {
					Box::pin(async move { tokio::net::TcpStream::connect(("127.0.0.1", host_bind)).await })
				}))
			},
			Mode::Http => {
				info!(public_port, host_bind, "starting http reverse proxy");
				let cfg = HttpProxyConfig {
					host_bind,
					public_port,
					acme: self.acme.lock().expect("mutex acquired").clone(),
				};
				let hints = self.hints.clone();
				tokio::spawn(http::serve(listener, cfg, hints, shutdown_rx))
			},
		};

		listeners.insert(public_port, ListenerHandle { shutdown: shutdown_tx, task });
		Ok(())
	}

	fn stop(&self, public_port: u16) {
		let mut listeners = self.listeners.lock().expect("mutex acquired");
		if let Some(handle) = listeners.remove(&public_port) {
			let _ = handle.shutdown.send(true);
			handle.task.abort();
			info!(public_port, "stopped proxy");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{Flow, Protocol};
	use std::time::Duration;
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	fn endpoint(public_port: u16, host_bind: u16, flow: Flow, protocol: Protocol) -> ServiceEndpoint {
		ServiceEndpoint {
			app: "app".into(),
			name: "web".into(),
			guest_port: 80,
			host_bind,
			public_port,
			flow,
			protocol,
			middleware: vec![],
			remote_ports: vec![80, 443],
		}
	}

	#[tokio::test]
	async fn tcp_passthrough_relays_bytes_end_to_end() {
		let backend = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
		let host_bind = backend.local_addr().unwrap().port();
		tokio::spawn(async move {
			let (mut sock, _) = backend.accept().await.unwrap();
			let mut buf = [0u8; 5];
			sock.read_exact(&mut buf).await.unwrap();
			sock.write_all(&buf).await.unwrap();
		});

		let public_port = {
			let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
			l.local_addr().unwrap().port()
		};

		let mgr = ProxyManager::new();
		let ep = endpoint(public_port, host_bind, Flow::Tcp, Protocol::Raw);
		mgr.start(&ep).unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;

		let mut client = tokio::net::TcpStream::connect(("127.0.0.1", public_port)).await.unwrap();
		client.write_all(b"hello").await.unwrap();
		let mut resp = [0u8; 5];
		client.read_exact(&mut resp).await.unwrap();
		assert_eq!(&resp, b"hello");

		mgr.stop(public_port);
	}

	#[test]
	fn double_start_on_same_public_port_fails() {
		let rt = tokio::runtime::Runtime::new().unwrap();
		rt.block_on(async {
			let public_port = {
				let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
				l.local_addr().unwrap().port()
			};
			let mgr = ProxyManager::new();
			let ep = endpoint(public_port, 9, Flow::Tcp, Protocol::Raw);
			mgr.start(&ep).unwrap();
			let err = mgr.start(&ep).unwrap_err();
			assert!(matches!(err, Error::AlreadyExists(_)));
			mgr.stop(public_port);
		});
	}

	#[test]
	fn select_mode_chooses_http_only_for_tcp_flow_http_protocols() {
		assert_eq!(
			ProxyManager::select_mode(&endpoint(1, 2, Flow::Tcp, Protocol::Http)),
			Mode::Http
		);
		assert_eq!(
			ProxyManager::select_mode(&endpoint(1, 2, Flow::Tcp, Protocol::Websocket)),
			Mode::Http
		);
		assert_eq!(
			ProxyManager::select_mode(&endpoint(1, 2, Flow::Tls, Protocol::Http)),
			Mode::TcpPassthrough
		);
		assert_eq!(
			ProxyManager::select_mode(&endpoint(1, 2, Flow::Tcp, Protocol::Raw)),
			Mode::TcpPassthrough
		);
	}
}
