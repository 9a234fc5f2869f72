//! DNS wire parsing/building for mDNS (spec §4.5, §6). Builds on
//! `hickory-proto`'s `Message` rather than hand-rolling the wire format.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use piccolo_core::error::{Error, Result};

pub const MAX_PACKET_SIZE: usize = 1500;
pub const MAX_RESPONSE_SIZE: usize = 512;
pub const MIN_PACKET_SIZE: usize = 12;
pub const ANNOUNCE_TTL: u32 = 120;
const MAX_QUESTIONS: usize = 10;
const MAX_EXTRAS: usize = 100;
const MAX_NAME_LEN: usize = 253;

pub fn parse_message(buf: &[u8]) -> Result<Message> {
	if buf.len() < MIN_PACKET_SIZE {
		return Err(Error::MalformedPacket(format!("packet too small: {} bytes", buf.len())));
	}
	if buf.len() > MAX_PACKET_SIZE {
		return Err(Error::OversizedPacket(format!("packet too large: {} bytes", buf.len())));
	}
	Message::from_bytes(buf).map_err(|e| Error::MalformedPacket(format!("dns parse error: {e}")))
}

/// Validation per spec §4.5 step 5: questions ≤ 10, answers allowed only
/// alongside questions (RFC 6762 §8.1 probing), extras ≤ 100, class INET
/// only, qtypes in {A, AAAA, ANY}, name ends in `.local.` and is ≤ 253
/// chars.
pub fn validate_message(msg: &Message) -> Result<()> {
	if msg.queries().len() > MAX_QUESTIONS {
		return Err(Error::MalformedPacket(format!("too many questions: {}", msg.queries().len())));
	}
	if !msg.answers().is_empty() && msg.queries().is_empty() {
		return Err(Error::MalformedPacket("answers present without questions".to_string()));
	}
	let extras = msg.additionals().len() + msg.name_servers().len();
	if extras > MAX_EXTRAS {
		return Err(Error::MalformedPacket(format!("too many extra records: {extras}")));
	}
	for q in msg.queries() {
		if q.query_class() != DNSClass::IN {
			return Err(Error::MalformedPacket("query class is not IN".to_string()));
		}
		if !matches!(q.query_type(), RecordType::A | RecordType::AAAA | RecordType::ANY) {
			return Err(Error::MalformedPacket(format!("unsupported qtype {:?}", q.query_type())));
		}
		validate_name(q.name())?;
	}
	Ok(())
}

fn validate_name(name: &Name) -> Result<()> {
	let s = name.to_ascii();
	if s.len() > MAX_NAME_LEN {
		return Err(Error::MalformedPacket(format!("name too long: {} chars", s.len())));
	}
	if !s.to_ascii_lowercase().ends_with("local.") {
		return Err(Error::MalformedPacket(format!("name not in .local.: {s}")));
	}
	Ok(())
}

/// Whether `question` matches `service_name` (the current final name,
/// already suffixed with `.local.` if necessary).
pub fn question_matches(question: &Query, service_name: &str) -> bool {
	let owner = owner_name(service_name);
	question.name().to_ascii().eq_ignore_ascii_case(&owner.to_ascii())
}

fn owner_name(service_name: &str) -> Name {
	let fqdn = if service_name.ends_with(".local.") {
		service_name.to_string()
	} else if service_name.ends_with(".local") {
		format!("{service_name}.")
	} else {
		format!("{service_name}.local.")
	};
	Name::from_ascii(&fqdn).expect("valid mdns owner name")
}

/// An authoritative reply (`qr=1, aa=1, ra=0`) with one A/AAAA answer per
/// matching question, in response to `request`.
pub fn build_reply(request: &Message, service_name: &str, ipv4: Option<Ipv4Addr>, ipv6: Option<Ipv6Addr>) -> Message {
	let mut reply = Message::new();
	reply.set_id(request.id());
	reply.set_message_type(MessageType::Response);
	reply.set_op_code(OpCode::Query);
	reply.set_authoritative(true);
	reply.set_recursion_available(false);

	let owner = owner_name(service_name);
	for q in request.queries() {
		if !question_matches(q, service_name) {
			continue;
		}
		match q.query_type() {
			RecordType::A => {
				if let Some(ip) = ipv4 {
					reply.add_answer(a_record(owner.clone(), ip));
				}
			},
			RecordType::AAAA => {
				if let Some(ip) = ipv6 {
					reply.add_answer(aaaa_record(owner.clone(), ip));
				}
			},
			RecordType::ANY => {
				if let Some(ip) = ipv4 {
					reply.add_answer(a_record(owner.clone(), ip));
				}
				if let Some(ip) = ipv6 {
					reply.add_answer(aaaa_record(owner.clone(), ip));
				}
			},
			_ => {},
		}
	}
	reply
}

/// A single-answer announcement (spec §4.5 "Announcement schedule"):
/// one A or AAAA record, owner `<service>.local.`, TTL 120.
pub fn build_announcement_v4(service_name: &str, ip: Ipv4Addr) -> Message {
	let mut msg = Message::new();
	msg.set_message_type(MessageType::Response);
	msg.set_op_code(OpCode::Query);
	msg.set_authoritative(true);
	msg.set_recursion_available(false);
	msg.add_answer(a_record(owner_name(service_name), ip));
	msg
}

pub fn build_announcement_v6(service_name: &str, ip: Ipv6Addr) -> Message {
	let mut msg = Message::new();
	msg.set_message_type(MessageType::Response);
	msg.set_op_code(OpCode::Query);
	msg.set_authoritative(true);
	msg.set_recursion_available(false);
	msg.add_answer(aaaa_record(owner_name(service_name), ip));
	msg
}

/// An outbound ANY probe for the current service name (spec §4.5
/// "Conflict detection").
pub fn build_probe(service_name: &str) -> Message {
	let mut msg = Message::new();
	msg.set_message_type(MessageType::Query);
	msg.set_op_code(OpCode::Query);
	msg.set_recursion_desired(false);
	msg.add_query(Query::query(owner_name(service_name), RecordType::ANY));
	msg
}

fn a_record(owner: Name, ip: Ipv4Addr) -> Record {
	Record::from_rdata(owner, ANNOUNCE_TTL, RData::A(ip.into()))
}

fn aaaa_record(owner: Name, ip: Ipv6Addr) -> Record {
	Record::from_rdata(owner, ANNOUNCE_TTL, RData::AAAA(ip.into()))
}

pub fn encode(msg: &Message) -> Result<Vec<u8>> {
	msg.to_bytes().map_err(|e| Error::MalformedPacket(format!("dns encode error: {e}")))
}

/// Extracts the responding host's claimed address(es) from a response
/// message, used by the conflict detector.
pub fn response_addresses(msg: &Message) -> Vec<IpAddr> {
	msg
		.answers()
		.iter()
		.filter_map(|r| match r.data() {
			RData::A(a) => Some(IpAddr::V4((*a).into())),
			RData::AAAA(a) => Some(IpAddr::V6((*a).into())),
			_ => None,
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trip_announcement_preserves_header_owner_ttl_and_type() {
		let ip: Ipv4Addr = "192.168.1.100".parse().unwrap();
		let msg = build_announcement_v4("service", ip);
		let bytes = encode(&msg).unwrap();
		let decoded = parse_message(&bytes).unwrap();

		assert_eq!(decoded.message_type(), MessageType::Response);
		assert!(decoded.authoritative());
		assert!(!decoded.recursion_available());
		assert_eq!(decoded.answers().len(), 1);
		let answer = &decoded.answers()[0];
		assert_eq!(answer.name().to_ascii(), "service.local.");
		assert_eq!(answer.ttl(), ANNOUNCE_TTL);
		assert_eq!(answer.record_type(), RecordType::A);
	}

	#[test]
	fn validate_rejects_oversized_and_undersized_packets() {
		assert!(matches!(parse_message(&[0u8; 4]), Err(Error::MalformedPacket(_))));
		assert!(matches!(parse_message(&vec![0u8; MAX_PACKET_SIZE + 1]), Err(Error::OversizedPacket(_))));
	}

	#[test]
	fn validate_rejects_non_local_names() {
		let mut msg = Message::new();
		msg.add_query(Query::query(Name::from_ascii("example.com.").unwrap(), RecordType::A));
		assert!(validate_message(&msg).is_err());
	}

	#[test]
	fn validate_rejects_answers_without_questions() {
		let mut msg = Message::new();
		msg.add_answer(a_record(Name::from_ascii("service.local.").unwrap(), "10.0.0.1".parse().unwrap()));
		assert!(validate_message(&msg).is_err());
	}

	#[test]
	fn build_reply_only_answers_matching_question_type() {
		let mut request = Message::new();
		request.add_query(Query::query(Name::from_ascii("service.local.").unwrap(), RecordType::A));
		let reply = build_reply(&request, "service", Some("10.0.0.1".parse().unwrap()), Some("::1".parse().unwrap()));
		assert_eq!(reply.answers().len(), 1);
		assert_eq!(reply.answers()[0].record_type(), RecordType::A);
	}
}
