//! Narrow trait seams for the external systems this crate coordinates with
//! but does not implement: persistent config storage, TLS certificate
//! issuance, ACME challenge responses, and the caller's session type. Kept
//! here rather than inlined in the modules that use them so tests can swap
//! in fakes without touching production wiring.

use std::net::IpAddr;

use async_trait::async_trait;
use piccolo_core::error::Result;

use crate::Strng;

/// Durable storage for the remote-config blob (spec §5's `remote_config_changed`
/// payload). A single writer at a time; concurrent writers observe `Locked`.
#[async_trait]
pub trait Storage: Send + Sync {
	async fn load(&self) -> Result<Option<Vec<u8>>>;
	async fn save(&self, blob: &[u8]) -> Result<()>;
}

/// Certificate lookup for the TLS Mux (C5). `get_certificate` resolves a
/// SNI host to a served certificate chain + key; `set_portal_hostname`
/// informs the provider which host is the loopback management portal so it
/// can provision a certificate for it ahead of first use.
#[async_trait]
pub trait CertProvider: Send + Sync {
	async fn get_certificate(&self, host: &str) -> Result<Option<CertifiedKey>>;
	async fn set_portal_hostname(&self, host: Strng);
}

#[derive(Debug, Clone)]
pub struct CertifiedKey {
	pub chain_der: Vec<Vec<u8>>,
	pub key_der: Vec<u8>,
}

/// HTTP-01 ACME challenge responder, consulted by the HTTP reverse proxy
/// for requests under `/.well-known/acme-challenge/`. Returns the challenge
/// response body for a known token, `None` otherwise (proxy answers 404).
#[async_trait]
pub trait AcmeHandler: Send + Sync {
	async fn handle(&self, path: &str) -> Option<Vec<u8>>;
}

/// Opaque handle to the caller's notion of an authenticated session, passed
/// through command dispatch (C9) without this crate inspecting its
/// contents.
#[derive(Debug, Clone)]
pub struct Session {
	pub id: Strng,
	pub peer: Option<IpAddr>,
}

impl Session {
	pub fn new(id: impl Into<Strng>) -> Self {
		Self { id: id.into(), peer: None }
	}

	pub fn with_peer(mut self, peer: IpAddr) -> Self {
		self.peer = Some(peer);
		self
	}
}
