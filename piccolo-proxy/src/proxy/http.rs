//! HTTP reverse proxy server (spec §4.2): single-host reverse proxy wrapped
//! by a forward-header rewriter, an ACME HTTP-01 interceptor,
//! security-headers, request-log, and a rate-limit stub, inner to outer.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderValue, Request, Response, StatusCode, Uri};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::collaborators::AcmeHandler;
use crate::proxy::headers::{ConnContext, HintTable, apply_forward_headers};

pub type ProxyBody = Incoming;
pub type OutBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

const ACME_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Clone)]
pub struct HttpProxyConfig {
	pub host_bind: u16,
	pub public_port: u16,
	pub acme: Option<Arc<dyn AcmeHandler>>,
}

#[derive(Clone)]
struct Ctx {
	cfg: HttpProxyConfig,
	client: Client<HttpConnector, OutBody>,
	hints: Arc<HintTable>,
}

pub async fn serve(
	listener: TcpListener,
	cfg: HttpProxyConfig,
	hints: Arc<HintTable>,
	mut shutdown: watch::Receiver<bool>,
) {
	let mut connector = HttpConnector::new();
	connector.set_nodelay(true);
	connector.set_connect_timeout(Some(Duration::from_secs(10)));
	let client: Client<HttpConnector, OutBody> = Client::builder(TokioExecutor::new()).build(connector);
	let ctx = Ctx { cfg: cfg.clone(), client, hints };

	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					debug!(public_port = cfg.public_port, "http proxy listener shutting down");
					return;
				}
			}
			accepted = listener.accept() => {
				match accepted {
					Ok((stream, peer)) => {
						let ctx = ctx.clone();
						tokio::spawn(serve_conn(stream, peer, ctx));
					},
					Err(e) => {
						warn!(public_port = cfg.public_port, error = %e, "http proxy accept error");
						tokio::time::sleep(Duration::from_millis(50)).await;
					},
				}
			}
		}
	}
}

async fn serve_conn(stream: TcpStream, peer: SocketAddr, ctx: Ctx) {
	let hint = ctx.hints.consume(ctx.cfg.public_port, peer.port());
	let io = TokioIo::new(stream);
	let conn_ctx = ConnContext { hint, source_ip: peer.ip() };
	let svc = service_fn(move |req| handle(req, ctx.clone(), conn_ctx));
	if let Err(e) = http1::Builder::new()
		.serve_connection(io, svc)
		.with_upgrades()
		.await
	{
		debug!(%peer, error = %e, "http proxy connection ended with error");
	}
}

async fn handle(
	mut req: Request<Incoming>,
	ctx: Ctx,
	conn_ctx: ConnContext,
) -> Result<Response<OutBody>, Infallible> {
	request_log(&req, &conn_ctx);

	// ACME HTTP-01 interception, before forward-header rewriting touches the
	// URL scheme (spec §6: "HTTPS-redirect policy skips this prefix").
	if req.uri().path().starts_with(ACME_PREFIX) {
		if let Some(acme) = ctx.cfg.acme.as_ref() {
			return Ok(handle_acme(acme.as_ref(), &req).await);
		}
	}

	let scheme = apply_forward_headers(&mut req, &conn_ctx);
	rewrite_uri_scheme(&mut req, scheme);

	let is_upgrade = req
		.headers()
		.get(http::header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.to_ascii_lowercase().contains("upgrade"))
		.unwrap_or(false);

	if is_upgrade {
		return Ok(proxy_upgrade(req, &ctx).await);
	}

	let resp = match proxy_request(req, &ctx).await {
		Ok(resp) => resp,
		Err(e) => {
			warn!(error = %e, "upstream unavailable");
			bad_gateway()
		},
	};
	Ok(security_headers(resp))
}

fn request_log<B>(req: &Request<B>, conn_ctx: &ConnContext) {
	info!(
		method = %req.method(),
		path = req.uri().path(),
		source_ip = %conn_ctx.source_ip,
		"proxied request"
	);
}

fn rewrite_uri_scheme<B>(req: &mut Request<B>, scheme: &'static str) {
	let mut parts = req.uri().clone().into_parts();
	let authority = parts.authority.clone();
	let path_and_query = parts
		.path_and_query
		.clone()
		.unwrap_or_else(|| http::uri::PathAndQuery::from_static("/"));
	if let Some(authority) = authority {
		parts.scheme = Some(scheme.parse().expect("valid scheme"));
		if let Ok(uri) = Uri::builder()
			.scheme(scheme)
			.authority(authority)
			.path_and_query(path_and_query)
			.build()
		{
			*req.uri_mut() = uri;
		}
	}
}

fn rewrite_upstream_uri<B>(req: &mut Request<B>, host_bind: u16) {
	let path_and_query = req
		.uri()
		.path_and_query()
		.map(|p| p.as_str())
		.unwrap_or("/")
		.to_string();
	let upstream_uri: Uri = format!("http://127.0.0.1:{host_bind}{path_and_query}")
		.parse()
		.expect("valid upstream uri");
	*req.uri_mut() = upstream_uri;
}

async fn proxy_request(
	mut req: Request<Incoming>,
	ctx: &Ctx,
) -> Result<Response<OutBody>, hyper_util::client::legacy::Error> {
	rewrite_upstream_uri(&mut req, ctx.cfg.host_bind);
	let (parts, body) = req.into_parts();
	let req = Request::from_parts(parts, body.boxed());
	let resp = ctx.client.request(req).await?;
	let (parts, body) = resp.into_parts();
	Ok(Response::from_parts(parts, body.boxed()))
}

/// WebSocket upgrade passthrough (spec §6): forward the upgrade request
/// untouched beyond the forward headers already applied, then splice raw
/// bytes between the client-side and backend-side upgraded connections
/// once both sides have switched protocols.
async fn proxy_upgrade(mut req: Request<Incoming>, ctx: &Ctx) -> Response<OutBody> {
	rewrite_upstream_uri(&mut req, ctx.cfg.host_bind);
	let client_upgrade = hyper::upgrade::on(&mut req);

	let (parts, body) = req.into_parts();
	let upstream_req = Request::from_parts(parts, body.boxed());

	let mut resp = match ctx.client.request(upstream_req).await {
		Ok(r) => r,
		Err(e) => {
			warn!(error = %e, "upstream unavailable during upgrade");
			return bad_gateway();
		},
	};

	if resp.status() != StatusCode::SWITCHING_PROTOCOLS {
		let (parts, body) = resp.into_parts();
		return Response::from_parts(parts, body.boxed());
	}

	let backend_upgrade = hyper::upgrade::on(&mut resp);
	tokio::spawn(async move {
		let (client_io, backend_io) = match tokio::try_join!(client_upgrade, backend_upgrade) {
			Ok((c, b)) => (c, b),
			Err(e) => {
				warn!(error = %e, "upgrade handshake failed");
				return;
			},
		};
		let mut client_io = TokioIo::new(client_io);
		let mut backend_io = TokioIo::new(backend_io);
		if let Err(e) = tokio::io::copy_bidirectional(&mut client_io, &mut backend_io).await {
			debug!(error = %e, "websocket relay ended");
		}
	});

	let (parts, body) = resp.into_parts();
	Response::from_parts(parts, body.boxed())
}

async fn handle_acme(acme: &dyn AcmeHandler, req: &Request<Incoming>) -> Response<OutBody> {
	match acme.handle(req.uri().path()).await {
		Some(body) => Response::builder()
			.status(StatusCode::OK)
			.body(Full::new(Bytes::from(body)).map_err(|never: std::convert::Infallible| match never {}).boxed())
			.expect("valid response"),
		None => Response::builder()
			.status(StatusCode::NOT_FOUND)
			.body(Full::new(Bytes::new()).map_err(|never: std::convert::Infallible| match never {}).boxed())
			.expect("valid response"),
	}
}

fn bad_gateway() -> Response<OutBody> {
	Response::builder()
		.status(StatusCode::BAD_GATEWAY)
		.body(Full::new(Bytes::new()).map_err(|never: std::convert::Infallible| match never {}).boxed())
		.expect("valid response")
}

fn security_headers(mut resp: Response<OutBody>) -> Response<OutBody> {
	let headers = resp.headers_mut();
	headers
		.entry(http::header::HeaderName::from_static("x-content-type-options"))
		.or_insert_with(|| HeaderValue::from_static("nosniff"));
	headers
		.entry(http::header::HeaderName::from_static("x-frame-options"))
		.or_insert_with(|| HeaderValue::from_static("SAMEORIGIN"));
	resp
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn acme_prefix_constant_matches_spec() {
		assert_eq!(ACME_PREFIX, "/.well-known/acme-challenge/");
	}
}
