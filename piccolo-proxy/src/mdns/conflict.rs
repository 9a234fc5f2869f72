//! Conflict detection & deterministic rename (spec §4.5 "Conflict
//! detection"). Reacts only to confirmed inbound traffic from a non-local
//! address naming the current service — the source never asynchronously
//! collects probe responses (spec §9 Open Question).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use hickory_proto::op::Message;

use crate::mdns::wire;

#[derive(Debug, Clone)]
pub struct ConflictRecord {
	pub ip: IpAddr,
	pub first_seen: Instant,
	pub last_seen: Instant,
	pub query_count: u32,
	pub machine_id: Option<String>,
}

pub struct ConflictDetector {
	base_name: String,
	machine_id: String,
	current_name: Mutex<String>,
	records: Mutex<HashMap<IpAddr, ConflictRecord>>,
}

impl ConflictDetector {
	pub fn new(base_name: impl Into<String>, machine_id: impl Into<String>) -> Self {
		let base_name = base_name.into();
		Self {
			current_name: Mutex::new(base_name.clone()),
			base_name,
			machine_id: machine_id.into(),
			records: Mutex::new(HashMap::new()),
		}
	}

	pub fn current_name(&self) -> String {
		self.current_name.lock().expect("mutex acquired").clone()
	}

	/// Inspects an inbound response naming the current service from
	/// `source_ip`. Returns `true` exactly once — on the transition into a
	/// confirmed conflict — so the caller knows to run
	/// [`resolve_name_conflict`](Self::resolve_name_conflict).
	pub fn observe_response(&self, message: &Message, source_ip: IpAddr, is_local_source: bool) -> bool {
		if is_local_source {
			return false;
		}
		let current = self.current_name();
		let names_current_service = message
			.answers()
			.iter()
			.any(|r| r.name().to_ascii().trim_end_matches('.').eq_ignore_ascii_case(&format!("{current}.local")));
		if !names_current_service {
			return false;
		}

		let now = Instant::now();
		let mut records = self.records.lock().expect("mutex acquired");
		let first_occurrence = !records.contains_key(&source_ip);
		let record = records.entry(source_ip).or_insert_with(|| ConflictRecord {
			ip: source_ip,
			first_seen: now,
			last_seen: now,
			query_count: 0,
			machine_id: None,
		});
		record.last_seen = now;
		record.query_count += 1;
		let _ = wire::response_addresses(message);
		first_occurrence
	}

	/// Deterministically renames to `<base>-<machine_id>` (spec §4.5). The
	/// caller is responsible for sending the three immediate re-announcements
	/// a second apart and clearing its own conflict bookkeeping.
	pub fn resolve_name_conflict(&self) -> String {
		let new_name = format!("{}-{}", self.base_name, self.machine_id);
		*self.current_name.lock().expect("mutex acquired") = new_name.clone();
		new_name
	}

	pub fn probe_interval() -> Duration {
		Duration::from_secs(5 * 60)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use hickory_proto::rr::{Name, RData, Record};

	fn response_naming(name: &str) -> Message {
		let mut msg = Message::new();
		msg.add_answer(Record::from_rdata(
			Name::from_ascii(format!("{name}.local.")).unwrap(),
			120,
			RData::A("10.0.0.99".parse::<std::net::Ipv4Addr>().unwrap().into()),
		));
		msg
	}

	#[test]
	fn first_non_local_response_naming_current_service_triggers_conflict() {
		let detector = ConflictDetector::new("piccolo", "abcdef");
		let msg = response_naming("piccolo");
		let triggered = detector.observe_response(&msg, "10.0.0.50".parse().unwrap(), false);
		assert!(triggered);
	}

	#[test]
	fn local_source_never_triggers_conflict() {
		let detector = ConflictDetector::new("piccolo", "abcdef");
		let msg = response_naming("piccolo");
		let triggered = detector.observe_response(&msg, "127.0.0.1".parse().unwrap(), true);
		assert!(!triggered);
	}

	#[test]
	fn resolve_name_conflict_is_deterministic() {
		let detector = ConflictDetector::new("piccolo", "abcdef");
		assert_eq!(detector.resolve_name_conflict(), "piccolo-abcdef");
		assert_eq!(detector.current_name(), "piccolo-abcdef");
	}

	#[test]
	fn response_naming_a_different_service_does_not_trigger() {
		let detector = ConflictDetector::new("piccolo", "abcdef");
		let msg = response_naming("someone-else");
		let triggered = detector.observe_response(&msg, "10.0.0.50".parse().unwrap(), false);
		assert!(!triggered);
	}
}
