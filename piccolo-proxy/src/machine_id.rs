//! Machine ID derivation (spec §4.5, GLOSSARY "Machine ID"): a stable
//! 6-hex-char digest used as the mDNS rename suffix. Derived once at
//! startup by the caller and passed down — not re-derived per conflict.
//!
//! Fallback chain: `/etc/machine-id` -> non-loopback MAC -> hostname ->
//! boot-time timestamp fold. Each source is hashed down to 6 hex chars so
//! the digest length is uniform regardless of which source produced it.

use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(target_os = "linux")]
use nix::ifaddrs::getifaddrs;

const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Derives the 6-hex-char machine ID, trying each fallback in order and
/// never failing — the boot-timestamp fold always succeeds.
pub fn derive() -> String {
	if let Some(id) = from_machine_id_file() {
		return digest(&id);
	}
	if let Some(mac) = from_first_non_loopback_mac() {
		return digest(&mac);
	}
	if let Some(hostname) = from_hostname() {
		return digest(&hostname);
	}
	digest(&from_boot_timestamp())
}

fn from_machine_id_file() -> Option<String> {
	let contents = std::fs::read_to_string(MACHINE_ID_PATH).ok()?;
	let trimmed = contents.trim();
	if trimmed.is_empty() { None } else { Some(trimmed.to_string()) }
}

#[cfg(target_os = "linux")]
fn from_first_non_loopback_mac() -> Option<String> {
	let addrs = getifaddrs().ok()?;
	for ifaddr in addrs {
		if ifaddr.interface_name == "lo" {
			continue;
		}
		let Some(address) = ifaddr.address else { continue };
		let Some(link) = address.as_link_addr() else { continue };
		let Some(mac) = link.addr() else { continue };
		if mac.iter().all(|b| *b == 0) {
			continue;
		}
		return Some(mac.iter().map(|b| format!("{b:02x}")).collect::<String>());
	}
	None
}

#[cfg(not(target_os = "linux"))]
fn from_first_non_loopback_mac() -> Option<String> {
	None
}

fn from_hostname() -> Option<String> {
	std::fs::read_to_string("/etc/hostname").ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn from_boot_timestamp() -> String {
	let secs = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
	secs.to_string()
}

/// Folds an arbitrary-length source string down to 6 hex characters via a
/// simple FNV-1a hash — no cryptographic property is required, only
/// stability and a low collision rate among a handful of LAN peers.
fn digest(source: &str) -> String {
	let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
	for byte in source.as_bytes() {
		hash ^= *byte as u64;
		hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
	}
	format!("{:06x}", hash & 0xff_ffff)
}
