mod phase;
mod plan;
mod server;
mod state_machine;

pub use phase::*;
pub use plan::*;
pub use server::*;
pub use state_machine::PhaseStateMachine;
