//! C10 — Lock / Leadership Coordinator (spec §4.9). Subscribes to
//! `lock_state_changed` and `leadership_role_changed`; on unlock marks
//! persistence/app-manager healthy and runs reload hooks; on leadership
//! change for the kernel resource it switches router mode, and for any
//! other resource it republishes a per-app stop request rather than
//! calling the app manager directly (components talk through the bus, not
//! to each other).

use std::sync::{Arc, Mutex};

use piccolo_core::health::{Health, HealthLevel};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::bus::{Event, EventBus, LeadershipRole, Payload, Topic};

pub trait ReloadHook: Send + Sync {
	fn reload_from_storage(&self) -> piccolo_core::error::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterMode {
	Local,
	Tunnel,
}

/// The resource name the kernel's own leadership flips route on; any other
/// resource name is treated as a per-app followership signal.
const KERNEL_RESOURCE: &str = "kernel";

pub trait RouterController: Send + Sync {
	fn set_mode(&self, mode: RouterMode);
}

pub struct LockCoordinator {
	bus: Arc<EventBus>,
	health: Arc<Health>,
	router: Arc<dyn RouterController>,
	reload_hooks: Mutex<Vec<Arc<dyn ReloadHook>>>,
}

impl LockCoordinator {
	pub fn new(bus: Arc<EventBus>, health: Arc<Health>, router: Arc<dyn RouterController>) -> Self {
		Self { bus, health, router, reload_hooks: Mutex::new(Vec::new()) }
	}

	pub fn register_reload_hook(&self, hook: Arc<dyn ReloadHook>) {
		self.reload_hooks.lock().expect("mutex acquired").push(hook);
	}

	/// Runs until `shutdown` observes `true`. Intended to be spawned as one
	/// of the Supervisor's long-lived components.
	pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
		let mut lock_rx = self.bus.subscribe(Topic::LockStateChanged, 8);
		let mut role_rx = self.bus.subscribe(Topic::LeadershipRoleChanged, 8);
		loop {
			tokio::select! {
				_ = shutdown.changed() => {
					if *shutdown.borrow() {
						return;
					}
				}
				event = lock_rx.recv() => {
					match event {
						Some(ev) => self.handle_lock_event(ev),
						None => return,
					}
				}
				event = role_rx.recv() => {
					match event {
						Some(ev) => self.handle_role_event(ev),
						None => return,
					}
				}
			}
		}
	}

	#[instrument(level = "info", name = "lock_event", skip(self, event))]
	fn handle_lock_event(&self, event: Event) {
		let Payload::LockStateChanged { locked } = event.payload else { return };
		if locked {
			return;
		}
		info!("control volume unlocked, running reload hooks");
		self.health.set("persistence", HealthLevel::Ok, "unlocked");
		self.health.set("app-manager", HealthLevel::Ok, "unlocked");
		for hook in self.reload_hooks.lock().expect("mutex acquired").iter() {
			if let Err(e) = hook.reload_from_storage() {
				warn!(error = %e, "reload hook failed, continuing");
			}
		}
	}

	#[instrument(level = "info", name = "role_event", skip(self, event))]
	fn handle_role_event(&self, event: Event) {
		let Payload::LeadershipRoleChanged { resource, role } = event.payload else { return };
		if resource == KERNEL_RESOURCE {
			match role {
				LeadershipRole::Follower => self.router.set_mode(RouterMode::Tunnel),
				LeadershipRole::Leader => self.router.set_mode(RouterMode::Local),
			}
			return;
		}
		if matches!(role, LeadershipRole::Follower) {
			self.bus.publish(Event::new(Payload::Audit {
				action: "app_stop_requested".to_string(),
				detail: resource,
			}));
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};

	struct RecordingRouter {
		mode: Mutex<Option<RouterMode>>,
	}

	impl RouterController for RecordingRouter {
		fn set_mode(&self, mode: RouterMode) {
			*self.mode.lock().unwrap() = Some(mode);
		}
	}

	struct FlagHook(Arc<AtomicBool>);
	impl ReloadHook for FlagHook {
		fn reload_from_storage(&self) -> piccolo_core::error::Result<()> {
			self.0.store(true, Ordering::SeqCst);
			Ok(())
		}
	}

	#[tokio::test]
	async fn unlock_marks_health_ok_and_runs_reload_hooks() {
		let bus = Arc::new(EventBus::new());
		let health = Arc::new(Health::new());
		let router = Arc::new(RecordingRouter { mode: Mutex::new(None) });
		let coordinator = LockCoordinator::new(bus.clone(), health.clone(), router);
		let ran = Arc::new(AtomicBool::new(false));
		coordinator.register_reload_hook(Arc::new(FlagHook(ran.clone())));

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(async move { coordinator.run(shutdown_rx).await });

		tokio::task::yield_now().await;
		bus.publish(Event::new(Payload::LockStateChanged { locked: false }));
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert!(ran.load(Ordering::SeqCst));
		assert_eq!(health.overall(), HealthLevel::Ok);

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}

	#[tokio::test]
	async fn kernel_followership_switches_router_to_tunnel_mode() {
		let bus = Arc::new(EventBus::new());
		let health = Arc::new(Health::new());
		let router = Arc::new(RecordingRouter { mode: Mutex::new(None) });
		let router_check = router.clone();
		let coordinator = LockCoordinator::new(bus.clone(), health, router);

		let (shutdown_tx, shutdown_rx) = watch::channel(false);
		let handle = tokio::spawn(async move { coordinator.run(shutdown_rx).await });

		tokio::task::yield_now().await;
		bus.publish(Event::new(Payload::LeadershipRoleChanged {
			resource: KERNEL_RESOURCE.to_string(),
			role: LeadershipRole::Follower,
		}));
		tokio::time::sleep(std::time::Duration::from_millis(20)).await;

		assert_eq!(*router_check.mode.lock().unwrap(), Some(RouterMode::Tunnel));

		shutdown_tx.send(true).unwrap();
		handle.await.unwrap();
	}
}
