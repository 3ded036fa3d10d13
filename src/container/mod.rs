//! Container lifecycle: state machine, snapshot persistence, and the
//! actor that owns both.

mod actor;
mod snapshot;
mod state;

pub use actor::{spawn_actor, spawn_from_snapshot, ActorContext, ContainerHandle};
pub use snapshot::Snapshot;
pub use state::ContainerState;
