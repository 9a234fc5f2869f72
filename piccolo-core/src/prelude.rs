//! Common imports for piccolo crates, mirroring the teacher's
//! `agent_core::prelude` grab-bag of small, frequently used items.

pub use crate::Strng;
pub use crate::error::{Error, Result};
pub use std::sync::{Arc, Mutex};
pub use std::time::{Duration, Instant};
pub use tokio::sync::Mutex as AsyncMutex;
pub use tracing::{debug, error, info, trace, warn};
