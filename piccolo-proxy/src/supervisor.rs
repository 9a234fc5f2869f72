//! C8 — Supervisor. Ordered start, reverse-order stop, illegal to register
//! after the first start (spec §4.7).

use piccolo_core::error::{Error, Result};
use tracing::{error, info, instrument};

pub trait Component: Send + Sync {
	fn name(&self) -> &str;
	fn start(&self) -> Result<()>;
	fn stop(&self) -> Result<()>;
}

#[derive(Default)]
pub struct Supervisor {
	components: Vec<Box<dyn Component>>,
	started: bool,
}

impl Supervisor {
	pub fn new() -> Self {
		Self::default()
	}

	/// Panics if called after `start` — a programming error, not a runtime
	/// one, since the set of long-lived components is fixed at wiring time.
	pub fn register(&mut self, component: Box<dyn Component>) {
		assert!(!self.started, "cannot register a component after the supervisor has started");
		self.components.push(component);
	}

	/// Starts components in registration order. On the first failure,
	/// already-started components are stopped in reverse order and the
	/// triggering error is returned.
	#[instrument(level = "info", name = "supervisor_start", skip(self))]
	pub fn start(&mut self) -> Result<()> {
		self.started = true;
		for (idx, component) in self.components.iter().enumerate() {
			info!(component = component.name(), "starting component");
			if let Err(e) = component.start() {
				error!(component = component.name(), error = %e, "component failed to start, rolling back");
				for started in self.components[..idx].iter().rev() {
					if let Err(stop_err) = started.stop() {
						error!(component = started.name(), error = %stop_err, "error stopping component during rollback");
					}
				}
				return Err(e);
			}
		}
		Ok(())
	}

	/// Stops all components in reverse order. Collects the first error but
	/// continues stopping the rest so a single stuck component never leaks
	/// the others.
	#[instrument(level = "info", name = "supervisor_stop", skip(self))]
	pub fn stop(&self) -> Result<()> {
		let mut first_err = None;
		for component in self.components.iter().rev() {
			info!(component = component.name(), "stopping component");
			if let Err(e) = component.stop() {
				error!(component = component.name(), error = %e, "component failed to stop");
				if first_err.is_none() {
					first_err = Some(e);
				}
			}
		}
		match first_err {
			Some(e) => Err(e),
			None => Ok(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::Mutex;

	struct Recorder {
		name: &'static str,
		fail_start: bool,
		log: std::sync::Arc<Mutex<Vec<String>>>,
	}

	impl Component for Recorder {
		fn name(&self) -> &str {
			self.name
		}
		fn start(&self) -> Result<()> {
			self.log.lock().unwrap().push(format!("start:{}", self.name));
			if self.fail_start {
				return Err(Error::InvalidInput("boom".into()));
			}
			Ok(())
		}
		fn stop(&self) -> Result<()> {
			self.log.lock().unwrap().push(format!("stop:{}", self.name));
			Ok(())
		}
	}

	#[test]
	fn start_failure_rolls_back_already_started_in_reverse_order() {
		let log = std::sync::Arc::new(Mutex::new(vec![]));
		let mut sup = Supervisor::new();
		sup.register(Box::new(Recorder { name: "a", fail_start: false, log: log.clone() }));
		sup.register(Box::new(Recorder { name: "b", fail_start: true, log: log.clone() }));
		sup.register(Box::new(Recorder { name: "c", fail_start: false, log: log.clone() }));

		let err = sup.start().unwrap_err();
		assert!(matches!(err, Error::InvalidInput(_)));
		assert_eq!(*log.lock().unwrap(), vec!["start:a", "start:b", "stop:a"]);
	}

	#[test]
	fn stop_runs_in_reverse_registration_order() {
		let log = std::sync::Arc::new(Mutex::new(vec![]));
		let mut sup = Supervisor::new();
		sup.register(Box::new(Recorder { name: "a", fail_start: false, log: log.clone() }));
		sup.register(Box::new(Recorder { name: "b", fail_start: false, log: log.clone() }));
		sup.start().unwrap();
		log.lock().unwrap().clear();
		sup.stop().unwrap();
		assert_eq!(*log.lock().unwrap(), vec!["stop:b", "stop:a"]);
	}

	#[test]
	#[should_panic(expected = "cannot register a component after the supervisor has started")]
	fn register_after_start_panics() {
		let mut sup = Supervisor::new();
		sup.start().unwrap();
		sup.register(Box::new(Recorder {
			name: "late",
			fail_start: false,
			log: std::sync::Arc::new(Mutex::new(vec![])),
		}));
	}
}
