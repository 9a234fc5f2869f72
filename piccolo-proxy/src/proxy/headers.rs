//! Forward-header policy (spec §4.2) and the connection-hint side channel.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use http::{HeaderValue, Request};

/// `{is_tls, remote_port}` recorded by the TLS Mux or an external tunnel
/// immediately after dialing the loopback upstream, consumed exactly once
/// by the HTTP server when it accepts the matching client connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionHint {
	pub is_tls: bool,
	pub remote_port: u16,
}

/// `{public_port -> {source_tcp_port -> hint}}`. Hints are single-use and
/// removed on consumption; the per-public-port map is GC'd when empty.
#[derive(Default)]
pub struct HintTable {
	inner: Mutex<HashMap<u16, HashMap<u16, ConnectionHint>>>,
}

impl HintTable {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(&self, public_port: u16, source_port: u16, hint: ConnectionHint) {
		let mut g = self.inner.lock().expect("mutex acquired");
		g.entry(public_port).or_default().insert(source_port, hint);
	}

	pub fn consume(&self, public_port: u16, source_port: u16) -> Option<ConnectionHint> {
		let mut g = self.inner.lock().expect("mutex acquired");
		let Some(by_port) = g.get_mut(&public_port) else {
			return None;
		};
		let hint = by_port.remove(&source_port);
		if by_port.is_empty() {
			g.remove(&public_port);
		}
		hint
	}
}

/// Per-connection context the forward-header rewriter consults: the hint
/// (if any) consumed at accept time, and the client's source IP.
#[derive(Debug, Clone, Copy)]
pub struct ConnContext {
	pub hint: Option<ConnectionHint>,
	pub source_ip: IpAddr,
}

/// Applies the forward-header policy once per request, without overwriting
/// caller-set values. Mutates `req` in place and returns the resolved
/// scheme (`http`/`https`) so the caller can rewrite the request URL.
pub fn apply_forward_headers<B>(req: &mut Request<B>, ctx: &ConnContext) -> &'static str {
	let headers = req.headers().clone();

	// 1. X-Forwarded-Proto
	let proto = headers
		.get("x-forwarded-proto")
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(|| {
			if ctx.hint.map(|h| h.is_tls).unwrap_or(false) {
				"https".to_string()
			} else {
				"http".to_string()
			}
		});
	set_if_absent(req, "x-forwarded-proto", &proto);

	// 2. X-Forwarded-Host
	let host = req
		.headers()
		.get(http::header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.or_else(|| req.uri().host().map(|h| match req.uri().port_u16() {
			Some(p) => format!("{h}:{p}"),
			None => h.to_string(),
		}));
	if let Some(host) = host {
		set_if_absent(req, "x-forwarded-host", &host);
	}

	// 3. X-Forwarded-Port
	let port = headers
		.get("x-forwarded-port")
		.and_then(|v| v.to_str().ok())
		.map(|s| s.to_string())
		.unwrap_or_else(|| {
			let hint_port = ctx.hint.map(|h| h.remote_port).unwrap_or(0);
			if hint_port > 0 {
				hint_port.to_string()
			} else if proto == "https" {
				"443".to_string()
			} else {
				"80".to_string()
			}
		});
	set_if_absent(req, "x-forwarded-port", &port);

	// 4. X-Forwarded-For: append source IP to prior chain.
	let xff = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
		Some(prior) if !prior.is_empty() => format!("{prior}, {}", ctx.source_ip),
		_ => ctx.source_ip.to_string(),
	};
	req.headers_mut().insert(
		"x-forwarded-for",
		HeaderValue::from_str(&xff).unwrap_or_else(|_| HeaderValue::from_static("")),
	);

	// 5. X-Real-Ip: first write wins.
	set_if_absent(req, "x-real-ip", &ctx.source_ip.to_string());

	// 6. Forwarded: append proto=...;host=...;for=...
	let host_for_forwarded = req
		.headers()
		.get("x-forwarded-host")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("")
		.to_string();
	let forwarded_entry = format!("proto={proto};host={host_for_forwarded};for={}", ctx.source_ip);
	let forwarded = match req.headers().get(http::header::FORWARDED).and_then(|v| v.to_str().ok()) {
		Some(prior) if !prior.is_empty() => format!("{prior}, {forwarded_entry}"),
		_ => forwarded_entry,
	};
	req.headers_mut().insert(
		http::header::FORWARDED,
		HeaderValue::from_str(&forwarded).unwrap_or_else(|_| HeaderValue::from_static("")),
	);

	if proto == "https" { "https" } else { "http" }
}

fn set_if_absent<B>(req: &mut Request<B>, name: &'static str, value: &str) {
	if req.headers().contains_key(name) {
		return;
	}
	if let Ok(v) = HeaderValue::from_str(value) {
		req.headers_mut().insert(name, v);
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use http::Request;
	use std::net::{IpAddr, Ipv4Addr};

	fn ctx(is_tls: bool, remote_port: u16) -> ConnContext {
		ConnContext {
			hint: Some(ConnectionHint { is_tls, remote_port }),
			source_ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
		}
	}

	#[test]
	fn tls_hint_drives_proto_port_and_forwarded_header() {
		let mut req = Request::builder()
			.uri("http://127.0.0.1:40000/")
			.body(())
			.unwrap();
		let scheme = apply_forward_headers(&mut req, &ctx(true, 8443));
		assert_eq!(scheme, "https");
		assert_eq!(req.headers().get("x-forwarded-proto").unwrap(), "https");
		assert_eq!(req.headers().get("x-forwarded-port").unwrap(), "8443");
		let forwarded = req.headers().get(http::header::FORWARDED).unwrap().to_str().unwrap();
		assert!(forwarded.starts_with("proto=https;host="));
		assert!(forwarded.ends_with(";for=127.0.0.1"));
	}

	#[test]
	fn caller_set_values_are_not_overwritten() {
		let mut req = Request::builder()
			.uri("http://127.0.0.1:40000/")
			.header("x-forwarded-proto", "https")
			.header("x-forwarded-port", "9999")
			.body(())
			.unwrap();
		apply_forward_headers(&mut req, &ctx(false, 80));
		assert_eq!(req.headers().get("x-forwarded-proto").unwrap(), "https");
		assert_eq!(req.headers().get("x-forwarded-port").unwrap(), "9999");
	}

	#[test]
	fn xff_appends_to_prior_chain() {
		let mut req = Request::builder()
			.uri("http://127.0.0.1:40000/")
			.header("x-forwarded-for", "1.2.3.4")
			.body(())
			.unwrap();
		apply_forward_headers(&mut req, &ctx(false, 80));
		assert_eq!(req.headers().get("x-forwarded-for").unwrap(), "1.2.3.4, 127.0.0.1");
	}

	#[test]
	fn no_hint_defaults_to_plain_http() {
		let mut req = Request::builder().uri("http://127.0.0.1:40000/").body(()).unwrap();
		let ctx = ConnContext { hint: None, source_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)) };
		let scheme = apply_forward_headers(&mut req, &ctx);
		assert_eq!(scheme, "http");
		assert_eq!(req.headers().get("x-forwarded-port").unwrap(), "80");
	}
}
