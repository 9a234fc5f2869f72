pub mod error;
pub mod health;
pub mod prelude;
pub mod time;

pub use error::Error;
pub use health::{Health, HealthLevel, HealthSnapshot, HealthTracker};

/// Interned, cheaply-cloneable string used throughout the core for names
/// (app, listener, interface, component) the way the teacher crate's
/// `Strng` is used for route/listener/bind names.
pub type Strng = arcstr::ArcStr;

/// Shorthand matching the `strng!` helper the teacher's prelude re-exports.
#[macro_export]
macro_rules! strng {
	($s:expr) => {
		$crate::Strng::from($s)
	};
}
