//! The three hard-core subsystems run out of this crate: service-routing
//! fabric (C1/C3/C4/C6), LAN mDNS discovery responder (mdns), and the
//! pieces of the runtime coordination plane that live closest to the wire
//! (lock/remote/dispatcher/supervisor). `piccolod` wires these together
//! with the collaborators it owns (storage, cert issuance, sessions).

pub mod bus;
pub mod collaborators;
pub mod dispatcher;
pub mod lock;
pub mod machine_id;
pub mod mdns;
pub mod ports;
pub mod proxy;
pub mod registry;
pub mod remote;
pub mod supervisor;
pub mod tlsmux;
pub mod types;

pub use piccolo_core::Strng;
