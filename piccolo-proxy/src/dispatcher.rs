//! C9 — Command Dispatcher. Typed commands are dynamically named for
//! registration purposes (spec §4.8); handlers are boxed closures so the
//! dispatcher stays agnostic to the concrete request/response types each
//! command carries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::RwLock;

use piccolo_core::Strng;
use piccolo_core::error::{Error, Result};
use tracing::{instrument, warn};

/// Whether the control volume is currently locked — threaded into dispatch
/// so handlers that mutate remote/persistence state can be gated without
/// each one re-checking a shared global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
	Locked,
	Unlocked,
}

/// Per-dispatch context: lock state plus whatever the caller needs threaded
/// through (the opaque `Session`, in `piccolod`'s wiring).
pub struct DispatchContext {
	pub lock_state: LockState,
}

pub type BoxedRequest = Box<dyn Any + Send>;
pub type BoxedResponse = Box<dyn Any + Send>;

type Handler = Box<dyn Fn(&DispatchContext, BoxedRequest) -> Result<BoxedResponse> + Send + Sync>;

#[derive(Default)]
pub struct Dispatcher {
	handlers: RwLock<HashMap<Strng, Entry>>,
}

struct Entry {
	handler: Handler,
	/// Commands that mutate remote or persistence state must short-circuit
	/// with `Locked` while the control volume is locked (spec §4.8).
	gate_on_lock: bool,
}

impl Dispatcher {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register(
		&self,
		name: impl Into<Strng>,
		gate_on_lock: bool,
		handler: impl Fn(&DispatchContext, BoxedRequest) -> Result<BoxedResponse> + Send + Sync + 'static,
	) {
		let mut g = self.handlers.write().expect("mutex acquired");
		g.insert(name.into(), Entry { handler: Box::new(handler), gate_on_lock });
	}

	#[instrument(level = "debug", name = "dispatch", skip(self, ctx, request), fields(command = %name))]
	pub fn dispatch(&self, name: &str, ctx: &DispatchContext, request: BoxedRequest) -> Result<BoxedResponse> {
		let g = self.handlers.read().expect("mutex acquired");
		let Some(entry) = g.get(name) else {
			warn!(command = name, "no handler registered");
			return Err(Error::NotImplemented(format!("no handler registered for command {name}")));
		};
		if entry.gate_on_lock && ctx.lock_state == LockState::Locked {
			return Err(Error::Locked(format!("command {name} requires the control volume to be unlocked")));
		}
		(entry.handler)(ctx, request)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ctx(locked: bool) -> DispatchContext {
		DispatchContext { lock_state: if locked { LockState::Locked } else { LockState::Unlocked } }
	}

	#[test]
	fn unknown_command_returns_not_implemented() {
		let d = Dispatcher::new();
		let err = d.dispatch("nope", &ctx(false), Box::new(())).unwrap_err();
		assert!(matches!(err, Error::NotImplemented(_)));
	}

	#[test]
	fn gated_command_short_circuits_when_locked() {
		let d = Dispatcher::new();
		d.register("set-remote", true, |_ctx, _req| Ok(Box::new(())));
		let err = d.dispatch("set-remote", &ctx(true), Box::new(())).unwrap_err();
		assert!(matches!(err, Error::Locked(_)));
		assert!(d.dispatch("set-remote", &ctx(false), Box::new(())).is_ok());
	}

	#[test]
	fn ungated_command_runs_regardless_of_lock_state() {
		let d = Dispatcher::new();
		d.register("health", false, |_ctx, _req| Ok(Box::new(42i32)));
		let resp = d.dispatch("health", &ctx(true), Box::new(())).unwrap();
		assert_eq!(*resp.downcast::<i32>().unwrap(), 42);
	}
}
