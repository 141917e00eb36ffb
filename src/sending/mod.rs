//! Beacon sending: the shared context, the state machine and the worker
//! that drives it.

pub mod context;
pub mod sender;
pub mod state;

pub use context::SendingContext;
pub use sender::BeaconSender;
pub use state::{SendingState, StateKind};
