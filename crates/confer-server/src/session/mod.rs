//! Room-scoped session state
//!
//! `SessionRegistry` maps room names to `Room`s; a `Room` owns the engine
//! handles of every participant in it.

mod registry;
mod room;

pub use registry::SessionRegistry;
pub use room::{ConsumerSet, ParticipantTeardown, Room, DEFAULT_DESCRIPTION};
