use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use piccolo_core::health::Health;
use piccolo_proxy::bus::{Event, EventBus, Payload, RemoteConfigPayload};
use piccolo_proxy::dispatcher::Dispatcher;
use piccolo_proxy::lock::LockCoordinator;
use piccolo_proxy::mdns::{MdnsConfig, MdnsResponder};
use piccolo_proxy::ports::PortAllocator;
use piccolo_proxy::proxy::ProxyManager;
use piccolo_proxy::registry::ServiceRegistry;
use piccolo_proxy::remote::RemoteController;
use piccolo_proxy::supervisor::Supervisor;
use piccolo_proxy::tlsmux::TlsMux;
use piccolod::collaborators::{InMemoryStorage, LocalRouter, LoggingPublishHook, NullAcmeHandler, SelfSignedCertProvider, SimpleHostResolver};
use piccolod::config::{DaemonConfig, RemoteConfig};
use piccolod::supervisor_bridge::AsyncComponent;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "Single-node edge appliance daemon: LAN discovery, service routing, runtime coordination")]
struct Args {
	/// Skip publishing the initial remote config derived from the
	/// environment; useful when a real control-plane collaborator will
	/// publish it on the bus itself once wired up.
	#[arg(long)]
	no_initial_remote_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let cfg = DaemonConfig::from_env();

	let bus = Arc::new(EventBus::new());
	let health = Arc::new(Health::new());
	let allocator = Arc::new(PortAllocator::new(cfg.host_bind_range, cfg.public_range));
	let proxies = Arc::new(ProxyManager::new());
	proxies.set_acme_handler(Arc::new(NullAcmeHandler));

	let registry = Arc::new(ServiceRegistry::new(allocator.clone(), proxies.clone()));
	registry.set_publish_hook(Arc::new(LoggingPublishHook));

	let cert_provider = Arc::new(SelfSignedCertProvider::new());
	let tls_mux = Arc::new(TlsMux::new(registry.clone(), cert_provider.clone(), proxies.hints()));
	let host_resolver = Arc::new(SimpleHostResolver::new());
	let router = Arc::new(LocalRouter::new());

	let remote_controller = Arc::new(RemoteController::new(bus.clone(), host_resolver.clone(), tls_mux.clone()));
	let lock_coordinator = Arc::new(LockCoordinator::new(bus.clone(), health.clone(), router.clone()));

	let storage = Arc::new(InMemoryStorage::new());
	let dispatcher = Arc::new(Dispatcher::new());
	register_commands(&dispatcher, &registry, &storage, &bus);

	let mdns_responder = if cfg.disable_mdns {
		None
	} else {
		Some(Arc::new(MdnsResponder::new(MdnsConfig {
			base_service_name: cfg.mdns_base_service_name.clone(),
			machine_id: piccolo_proxy::machine_id::derive(),
			max_concurrent_queries: cfg.mdns_max_concurrent_queries,
			rate_limit: cfg.mdns_rate_limit.clone(),
		})))
	};

	let mut supervisor = Supervisor::new();
	supervisor.register(Box::new(AsyncComponent::new("lock-coordinator", {
		let lock_coordinator = lock_coordinator.clone();
		move |shutdown| {
			let lock_coordinator = lock_coordinator.clone();
			tokio::spawn(async move { lock_coordinator.run(shutdown).await })
		}
	})));
	supervisor.register(Box::new(AsyncComponent::new("remote-controller", {
		let remote_controller = remote_controller.clone();
		move |shutdown| {
			let remote_controller = remote_controller.clone();
			tokio::spawn(async move { remote_controller.run(shutdown).await })
		}
	})));
	if let Some(responder) = mdns_responder.clone() {
		supervisor.register(Box::new(AsyncComponent::new("mdns-responder", move |shutdown| {
			let responder = responder.clone();
			tokio::spawn(async move { responder.run(shutdown).await })
		})));
	}

	supervisor.start()?;
	tracing::info!(
		portal_port = cfg.portal_port,
		mdns_disabled = cfg.disable_mdns,
		nexus_stub = cfg.nexus_use_stub,
		"piccolod started"
	);

	if !args.no_initial_remote_config {
		let remote: RemoteConfig = (&cfg).into();
		bus.publish(Event::new(Payload::RemoteConfigChanged(RemoteConfigPayload {
			enabled: remote.enabled,
			portal_hostname: remote.portal_hostname,
			tld: remote.tld,
			portal_port: remote.portal_port,
		})));
	}

	tokio::signal::ctrl_c().await?;
	tracing::info!("shutdown signal received");

	bus.close();
	supervisor.stop()?;
	Ok(())
}

/// A minimal command surface exercising the dispatcher against the
/// registry/storage this process actually owns (spec §4.8). The
/// (out-of-scope) HTTP/API collaborator would expose these over the wire.
fn register_commands(dispatcher: &Dispatcher, registry: &Arc<ServiceRegistry>, storage: &Arc<InMemoryStorage>, bus: &Arc<EventBus>) {
	{
		let registry = registry.clone();
		dispatcher.register("list-endpoints", false, move |_ctx, _req| {
			let endpoints = registry.all();
			Ok(Box::new(endpoints) as piccolo_proxy::dispatcher::BoxedResponse)
		});
	}
	{
		let storage = storage.clone();
		dispatcher.register("load-remote-config", false, move |_ctx, _req| {
			let blob = tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(storage.load()))?;
			Ok(Box::new(blob) as piccolo_proxy::dispatcher::BoxedResponse)
		});
	}
	{
		let bus = bus.clone();
		dispatcher.register("publish-audit", false, move |_ctx, req| {
			let detail = *req.downcast::<String>().map_err(|_| piccolo_core::error::Error::InvalidInput("expected String audit detail".into()))?;
			bus.publish(Event::new(Payload::Audit { action: "manual".to_string(), detail }));
			Ok(Box::new(()) as piccolo_proxy::dispatcher::BoxedResponse)
		});
	}
}
