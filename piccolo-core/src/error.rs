use thiserror::Error;

/// The taxonomy from spec §7. Names are taxonomy labels, not wire codes —
/// the (out-of-scope) HTTP collaborator maps these to status codes.
#[derive(Debug, Error, Clone)]
pub enum Error {
	#[error("control store is locked: {0}")]
	Locked(String),

	#[error("not initialized: {0}")]
	NotInitialized(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("already exists: {0}")]
	AlreadyExists(String),

	#[error("already reserved: {0}")]
	AlreadyReserved(String),

	#[error("no ports available: {0}")]
	NoPortsAvailable(String),

	#[error("invalid input: {0}")]
	InvalidInput(String),

	#[error("malformed packet: {0}")]
	MalformedPacket(String),

	#[error("oversized packet: {0}")]
	OversizedPacket(String),

	#[error("rate limited: {0}")]
	RateLimited(String),

	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),

	#[error("not implemented: {0}")]
	NotImplemented(String),

	#[error("out of range: {0}")]
	OutOfRange(String),

	#[error("I/O error: {0}")]
	Io(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Self {
		Error::Io(e.to_string())
	}
}

impl Error {
	/// Taxonomy label, stable across variants' message contents — useful for
	/// tests and for the (out-of-scope) HTTP collaborator's status mapping.
	pub fn label(&self) -> &'static str {
		match self {
			Error::Locked(_) => "Locked",
			Error::NotInitialized(_) => "NotInitialized",
			Error::NotFound(_) => "NotFound",
			Error::AlreadyExists(_) => "AlreadyExists",
			Error::AlreadyReserved(_) => "AlreadyReserved",
			Error::NoPortsAvailable(_) => "NoPortsAvailable",
			Error::InvalidInput(_) => "InvalidInput",
			Error::MalformedPacket(_) => "MalformedPacket",
			Error::OversizedPacket(_) => "OversizedPacket",
			Error::RateLimited(_) => "RateLimited",
			Error::UpstreamUnavailable(_) => "UpstreamUnavailable",
			Error::NotImplemented(_) => "NotImplemented",
			Error::OutOfRange(_) => "OutOfRange",
			Error::Io(_) => "Io",
		}
	}
}
