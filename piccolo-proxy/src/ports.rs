//! C3 — Port Allocator. Two cursor-based sub-allocators, one per range
//! (host-bind, public). See spec §4.1.

use std::collections::HashSet;
use std::sync::Mutex;

use piccolo_core::error::{Error, Result};

use crate::types::PortRange;

/// A single cursor-based ring allocator over an inclusive port range.
#[derive(Debug)]
struct RangeAllocator {
	range: PortRange,
	used: HashSet<u16>,
	cursor: usize,
}

impl RangeAllocator {
	fn new(range: PortRange) -> Self {
		Self {
			range,
			used: HashSet::new(),
			cursor: 0,
		}
	}

	fn index_to_port(&self, idx: usize) -> u16 {
		self.range.start + idx as u16
	}

	/// Linear scan from the cursor, wrapping once, claiming the first free
	/// slot. On success the cursor is set to claimed+1 (mod len).
	fn allocate(&mut self) -> Result<u16> {
		let len = self.range.len();
		for step in 0..len {
			let idx = (self.cursor + step) % len;
			let port = self.index_to_port(idx);
			if !self.used.contains(&port) {
				self.used.insert(port);
				self.cursor = (idx + 1) % len;
				return Ok(port);
			}
		}
		Err(Error::NoPortsAvailable(format!(
			"no free port in range {}-{}",
			self.range.start, self.range.end
		)))
	}

	/// Marks an externally-known port used. Fails `OutOfRange` if outside
	/// the range, `AlreadyReserved` if already taken.
	fn reserve(&mut self, port: u16) -> Result<()> {
		if !self.range.contains(port) {
			return Err(Error::OutOfRange(format!(
				"port {port} outside range {}-{}",
				self.range.start, self.range.end
			)));
		}
		if !self.used.insert(port) {
			return Err(Error::AlreadyReserved(format!("port {port} already reserved")));
		}
		Ok(())
	}

	/// Releases a held port. If it precedes the cursor, rewinds the cursor
	/// to the freed index so subsequent allocations stay dense.
	fn release(&mut self, port: u16) {
		if !self.used.remove(&port) {
			return;
		}
		if !self.range.contains(port) {
			return;
		}
		let idx = (port - self.range.start) as usize;
		if idx < self.cursor {
			self.cursor = idx;
		}
	}
}

/// Thread-safe facade over the two range allocators (host-bind, public).
/// A single mutex per range is sufficient at appliance scale; concurrent
/// `allocate_pair`/`release` are linearizable.
#[derive(Debug)]
pub struct PortAllocator {
	host: Mutex<RangeAllocator>,
	public: Mutex<RangeAllocator>,
}

impl PortAllocator {
	pub fn new(host_range: PortRange, public_range: PortRange) -> Self {
		Self {
			host: Mutex::new(RangeAllocator::new(host_range)),
			public: Mutex::new(RangeAllocator::new(public_range)),
		}
	}

	/// Allocates one port from each range. If the public allocation fails
	/// after the host one succeeds, the host port is released so a partial
	/// failure never leaks a held port.
	pub fn allocate_pair(&self) -> Result<(u16, u16)> {
		let host = {
			let mut g = self.host.lock().expect("mutex acquired");
			g.allocate()?
		};
		match self.allocate_public() {
			Ok(public) => Ok((host, public)),
			Err(e) => {
				self.release_host(host);
				Err(e)
			},
		}
	}

	pub fn allocate_public(&self) -> Result<u16> {
		self.public.lock().expect("mutex acquired").allocate()
	}

	pub fn reserve_host(&self, port: u16) -> Result<()> {
		self.host.lock().expect("mutex acquired").reserve(port)
	}

	pub fn release(&self, host: u16, public: u16) {
		self.release_host(host);
		self.release_public(public);
	}

	pub fn release_host(&self, host: u16) {
		self.host.lock().expect("mutex acquired").release(host);
	}

	pub fn release_public(&self, public: u16) {
		self.public.lock().expect("mutex acquired").release(public);
	}
}
