//! Transport implementations for remote shell sessions.
//!
//! Provides:
//! - `LocalShellTransport` - Runs sessions on this machine (feature: local)
//! - `ScriptedTransport` - Programmable in-memory transport (feature: scripted)

#[cfg(feature = "local")]
pub mod local;

#[cfg(any(test, feature = "scripted"))]
pub mod scripted;

#[cfg(feature = "local")]
pub use local::LocalShellTransport;

#[cfg(any(test, feature = "scripted"))]
pub use scripted::{Gate, HeldCommand, ScriptedTransport};
