//! Session registry and command executor for remote shells.
//!
//! Provides:
//! - `SessionRegistry` - Session lifecycle, active session, last error
//! - `CommandExecutor` - Command lifecycle with per-session dispatch order
//!
//! Both share one in-memory ledger; nothing survives a restart.

mod ledger;
#[cfg(test)]
mod testing;

pub mod executor;
pub mod registry;

pub use executor::{CommandExecutor, CommandHandle};
pub use registry::{SessionHandle, SessionRegistry};
