//! TCP passthrough (spec §4.2): two-way byte copy, half-close on EOF,
//! retry transient accept errors, terminate the listener on fatal ones.

use std::future::Future;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

pub async fn accept_loop(
	listener: TcpListener,
	public_port: u16,
	mut shutdown: watch::Receiver<bool>,
	dial: impl Fn() -> std::pin::Pin<Box<dyn Future<Output = std::io::Result<TcpStream>> + Send>> + Send + Sync + 'static,
) {
	let dial = std::sync::Arc::new(dial);
	loop {
		tokio::select! {
			_ = shutdown.changed() => {
				if *shutdown.borrow() {
					debug!(public_port, "tcp passthrough listener shutting down");
					return;
				}
			}
			accepted = listener.accept() => {
				match accepted {
					Ok((inbound, peer)) => {
						let dial = dial.clone();
						tokio::spawn(async move {
							match dial().await {
								Ok(outbound) => {
									if let Err(e) = relay(inbound, outbound).await {
										debug!(%peer, error = %e, "tcp passthrough relay ended with error");
									}
								},
								Err(e) => {
									warn!(%peer, public_port, error = %e, "failed to dial upstream for passthrough");
								},
							}
						});
					},
					Err(e) if is_temporary(&e) => {
						warn!(public_port, error = %e, "temporary accept error, retrying");
						tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
					},
					Err(e) => {
						warn!(public_port, error = %e, "fatal accept error, terminating listener");
						return;
					},
				}
			}
		}
	}
}

fn is_temporary(e: &std::io::Error) -> bool {
	matches!(
		e.kind(),
		std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted | std::io::ErrorKind::ConnectionAborted
	)
}

/// Two-way byte copy. On EOF in either direction, half-close the
/// corresponding write side and wait for the other direction to drain.
pub async fn relay(mut a: TcpStream, mut b: TcpStream) -> std::io::Result<()> {
	let (mut ar, mut aw) = a.split();
	let (mut br, mut bw) = b.split();

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
	use tokio::io::{AsyncReadExt, AsyncWriteExt};
	use tokio::net::TcpListener as TokioListener;

	#[tokio::test]
	async fn relay_copies_bytes_both_directions_and_half_closes_on_eof() {
		let srv_a = TokioListener::bind("127.0.0.1:0").await.unwrap();
		let addr_a = srv_a.local_addr().unwrap();
		let srv_b = TokioListener::bind("127.0.0.1:0").await.unwrap();
		let addr_b = srv_b.local_addr().unwrap();

		let client_a = tokio::spawn(async move { TcpStream::connect(addr_a).await.unwrap() });
		let client_b = tokio::spawn(async move { TcpStream::connect(addr_b).await.unwrap() });
		let (a, _) = srv_a.accept().await.unwrap();
		let (b, _) = srv_b.accept().await.unwrap();
		let mut ca = client_a.await.unwrap();
		let mut cb = client_b.await.unwrap();

		let relay_handle = tokio::spawn(relay(a, b));

		ca.write_all(b"hello").await.unwrap();
		ca.shutdown().await.unwrap();
		let mut buf = vec![];
		cb.read_to_end(&mut buf).await.unwrap();
		assert_eq!(buf, b"hello");

		cb.shutdown().await.unwrap();
		let mut buf2 = vec![];
		ca.read_to_end(&mut buf2).await.unwrap();

		relay_handle.await.unwrap().unwrap();
	}
}
