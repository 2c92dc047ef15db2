//! Value objects for one outgoing and one incoming call.

pub mod incoming;
pub mod outgoing;

pub use incoming::{DispatchState, IncomingMessage, ReverseClientSource};
pub use outgoing::OutgoingMessage;
