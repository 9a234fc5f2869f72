//! Environment-derived daemon configuration (SPEC_FULL.md "Configuration").
//! Mirrors the teacher's `Args`/env-var loading pattern: defaults baked in,
//! overridden by environment variables read once at startup.

use std::time::Duration;

use piccolo_proxy::mdns::ratelimit::RateLimiterConfig;
use piccolo_proxy::types::PortRange;

fn env_u16(name: &str, default: u16) -> u16 {
	std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
	std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(name: &str) -> bool {
	std::env::var(name).map(|v| v == "1").unwrap_or(false)
}

fn env_string(name: &str, default: &str) -> String {
	std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
	/// `PORT` — portal HTTP port; also feeds the host resolver (spec §6).
	pub portal_port: u16,
	pub disable_mdns: bool,
	pub nexus_use_stub: bool,

	pub host_bind_range: PortRange,
	pub public_range: PortRange,

	pub portal_hostname: String,
	pub tld: String,
	pub remote_enabled: bool,

	pub mdns_base_service_name: String,
	pub mdns_max_concurrent_queries: usize,
	pub mdns_rate_limit: RateLimiterConfig,
}

impl DaemonConfig {
	/// Reads every env var this core consumes (spec §6). Defaults match the
	/// ranges/knobs assumed throughout the test scenarios in spec §8.
	pub fn from_env() -> Self {
		Self {
			portal_port: env_u16("PORT", 80),
			disable_mdns: env_bool("PICCOLO_DISABLE_MDNS"),
			nexus_use_stub: env_bool("PICCOLO_NEXUS_USE_STUB"),

			host_bind_range: PortRange::new(env_u16("PICCOLO_HOST_BIND_START", 30000), env_u16("PICCOLO_HOST_BIND_END", 39999)),
			public_range: PortRange::new(env_u16("PICCOLO_PUBLIC_START", 40000), env_u16("PICCOLO_PUBLIC_END", 49999)),

			portal_hostname: env_string("PICCOLO_PORTAL_HOSTNAME", ""),
			tld: env_string("PICCOLO_TLD", ""),
			remote_enabled: env_bool("PICCOLO_REMOTE_ENABLED"),

			mdns_base_service_name: env_string("PICCOLO_MDNS_BASE_NAME", "piccolo"),
			mdns_max_concurrent_queries: env_u32("PICCOLO_MDNS_MAX_CONCURRENT_QUERIES", 64) as usize,
			mdns_rate_limit: RateLimiterConfig {
				max_per_second: env_u32("PICCOLO_MDNS_MAX_PER_SECOND", 20),
				max_per_minute: env_u32("PICCOLO_MDNS_MAX_PER_MINUTE", 120),
				client_block_duration: Duration::from_secs(env_u32("PICCOLO_MDNS_BLOCK_SECS", 60) as u64),
				idle_eviction: Duration::from_secs(15 * 60),
			},
		}
	}
}

/// The `remote_config_changed` event payload, built from env at startup.
/// A real deployment re-publishes this whenever the control-plane
/// collaborator's `<control>/remote/config.json` changes; this crate never
/// parses that file itself (spec §4.10).
#[derive(Debug, Clone)]
pub struct RemoteConfig {
	pub enabled: bool,
	pub portal_hostname: String,
	pub tld: String,
	pub portal_port: u16,
}

impl From<&DaemonConfig> for RemoteConfig {
	fn from(cfg: &DaemonConfig) -> Self {
		Self {
			enabled: cfg.remote_enabled,
			portal_hostname: cfg.portal_hostname.clone(),
			tld: cfg.tld.clone(),
			portal_port: cfg.portal_port,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_match_spec_assumptions_when_env_unset() {
		// SAFETY-equivalent: single-threaded test process, no concurrent env mutation.
		unsafe {
			std::env::remove_var("PORT");
			std::env::remove_var("PICCOLO_DISABLE_MDNS");
		}
		let cfg = DaemonConfig::from_env();
		assert_eq!(cfg.portal_port, 80);
		assert!(!cfg.disable_mdns);
		assert_eq!(cfg.mdns_base_service_name, "piccolo");
	}
}
