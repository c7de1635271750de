// src/core/mod.rs

//! The central module containing the coordination actors and their shared
//! building blocks.

pub mod callback;
pub mod errors;
pub mod keepalive;
pub mod keys;
pub mod leader;
pub mod lru;
pub mod process;
pub mod record;
pub mod script;
pub mod sequence;
pub mod store;

pub use errors::KontrolError;
pub use record::PodRecord;

use std::time::Duration;

/// The minimum scheduling resolution for every actor. Timers, subprocess
/// polling and cancellation checks all happen on this grain.
pub const TICK: Duration = Duration::from_millis(250);
