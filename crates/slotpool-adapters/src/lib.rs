//! Built-in automation backends.
//!
//! Provides:
//! - `EchoAdapter` - Answers every prompt with a text artifact
//! - `ScriptedAdapter` - Replays scripted outcomes, for tests and drills
//! - Readiness probing shared by `init_session` implementations

pub mod echo;
pub mod readiness;
pub mod scripted;

pub use echo::{EchoAdapter, EchoSession};
pub use readiness::wait_until_ready;
pub use scripted::{ScriptedAdapter, ScriptedSession, Step};
