//! Adapts the async, bus-subscribing long-running loops (mDNS responder,
//! lock coordinator, remote controller) to the synchronous
//! [`piccolo_proxy::supervisor::Component`] trait the Supervisor expects.
//! Mirrors the `block_in_place` bridge the TLS Mux's SNI resolver already
//! uses to cross the same sync/async seam.

use std::sync::Mutex;

use piccolo_core::error::{Error, Result};
use piccolo_proxy::supervisor::Component;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct AsyncComponent {
	name: &'static str,
	spawn: Box<dyn Fn(watch::Receiver<bool>) -> JoinHandle<()> + Send + Sync>,
	shutdown: Mutex<Option<watch::Sender<bool>>>,
	handle: Mutex<Option<JoinHandle<()>>>,
}

impl AsyncComponent {
	pub fn new(name: &'static str, spawn: impl Fn(watch::Receiver<bool>) -> JoinHandle<()> + Send + Sync + 'static) -> Self {
		Self { name, spawn: Box::new(spawn), shutdown: Mutex::new(None), handle: Mutex::new(None) }
	}
}

impl Component for AsyncComponent {
	fn name(&self) -> &str {
		self.name
	}

	fn start(&self) -> Result<()> {
		let (tx, rx) = watch::channel(false);
		let handle = (self.spawn)(rx);
		*self.shutdown.lock().expect("mutex acquired") = Some(tx);
		*self.handle.lock().expect("mutex acquired") = Some(handle);
		Ok(())
	}

	fn stop(&self) -> Result<()> {
		if let Some(tx) = self.shutdown.lock().expect("mutex acquired").take() {
			let _ = tx.send(true);
		}
		if let Some(handle) = self.handle.lock().expect("mutex acquired").take() {
			tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(handle)).map_err(|e| Error::Io(e.to_string()))?;
		}
		Ok(())
	}
}
