//! Domain types (spec §3): ports, endpoints, listeners, middleware. Tagged
//! variants over inheritance, following the teacher's `types::agent` module
//! (`Bind`/`Listener`/`Route` as plain structs + enums) rather than trait
//! objects.

use piccolo_core::Strng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
	pub start: u16,
	pub end: u16,
}

impl PortRange {
	pub fn new(start: u16, end: u16) -> Self {
		Self { start, end }
	}

	pub fn contains(&self, port: u16) -> bool {
		port >= self.start && port <= self.end
	}

	pub fn len(&self) -> usize {
		(self.end as usize) - (self.start as usize) + 1
	}

	pub fn is_empty(&self) -> bool {
		false
	}
}

/// Whether traffic is transported opaquely (`Tls`, passthrough) or
/// interpreted (`Tcp` with a protocol handler).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
	Tcp,
	Tls,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
	Raw,
	Http,
	Websocket,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Middleware {
	pub name: Strng,
	pub params: serde_json::Value,
}

/// A declared listener on a workload, before allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listener {
	pub name: Strng,
	pub guest_port: u16,
	pub flow: Flow,
	pub protocol: Protocol,
	#[serde(default)]
	pub middleware: Vec<Middleware>,
	#[serde(default)]
	pub remote_ports: Vec<u16>,
}

impl Listener {
	/// Non-empty remote ports, defaulting to `[80, 443]`, with the legacy
	/// ACME-fallback alias `5002 -> 80` applied (spec §3, Open Question 2 —
	/// preserved as documented undocumented behavior, not generalized).
	pub fn effective_remote_ports(&self) -> Vec<u16> {
		let base = if self.remote_ports.is_empty() {
			vec![80, 443]
		} else {
			self.remote_ports.clone()
		};
		base
			.into_iter()
			.map(|p| if p == 5002 { 80 } else { p })
			.collect()
	}

	/// Fields that the reconciler treats as "unchanged" when only these
	/// differ does *not* require a ports reallocation, but *does* require a
	/// proxy restart (flow/protocol/middleware are proxy-affecting).
	pub fn proxy_affecting_eq(&self, other: &Listener) -> bool {
		self.flow == other.flow
			&& self.protocol == other.protocol
			&& middleware_set_eq(&self.middleware, &other.middleware)
	}
}

/// Set equality by name, in order — per spec §4.4: "`middleware` — set
/// equality by name in order".
fn middleware_set_eq(a: &[Middleware], b: &[Middleware]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	a.iter().zip(b.iter()).all(|(x, y)| x.name == y.name)
}

/// A listener plus its allocated host/public ports and proxy policy.
/// Immutable per cycle outside the fields the reconciler is explicitly
/// permitted to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEndpoint {
	pub app: Strng,
	pub name: Strng,
	pub guest_port: u16,
	pub host_bind: u16,
	pub public_port: u16,
	pub flow: Flow,
	pub protocol: Protocol,
	pub middleware: Vec<Middleware>,
	pub remote_ports: Vec<u16>,
}

impl ServiceEndpoint {
	pub fn from_listener(app: impl Into<Strng>, listener: &Listener, host_bind: u16, public_port: u16) -> Self {
		Self {
			app: app.into(),
			name: listener.name.clone(),
			guest_port: listener.guest_port,
			host_bind,
			public_port,
			flow: listener.flow,
			protocol: listener.protocol,
			middleware: listener.middleware.clone(),
			remote_ports: listener.effective_remote_ports(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn remote_port_5002_aliases_to_80() {
		let l = Listener {
			name: "web".into(),
			guest_port: 80,
			flow: Flow::Tcp,
			protocol: Protocol::Http,
			middleware: vec![],
			remote_ports: vec![5002, 443],
		};
		assert_eq!(l.effective_remote_ports(), vec![80, 443]);
	}

	#[test]
	fn remote_ports_default_when_empty() {
		let l = Listener {
			name: "web".into(),
			guest_port: 80,
			flow: Flow::Tcp,
			protocol: Protocol::Http,
			middleware: vec![],
			remote_ports: vec![],
		};
		assert_eq!(l.effective_remote_ports(), vec![80, 443]);
	}

	#[test]
	fn middleware_set_equality_ignores_order_of_params_but_not_names() {
		let a = vec![Middleware { name: "auth".into(), params: serde_json::json!({}) }];
		let b = vec![Middleware { name: "auth".into(), params: serde_json::json!({"x": 1}) }];
		assert!(middleware_set_eq(&a, &b));
		let c = vec![Middleware { name: "other".into(), params: serde_json::json!({}) }];
		assert!(!middleware_set_eq(&a, &c));
	}
}
