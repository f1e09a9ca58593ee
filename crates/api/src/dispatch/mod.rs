//! Per-connection protocol handling.
//!
//! A socket owns one [`Session`]. Every inbound text frame goes through
//! [`Dispatcher::handle_text`], which decodes it into a
//! [`ClientMessage`](dispatch_core::protocol::ClientMessage), enforces the
//! `unregistered -> registered` state machine and returns an [`Outcome`]:
//! the direct replies plus whether the transport must be closed. Fan-out to
//! other connections happens through the channel hub as a side effect.

mod dispatcher;
pub mod offers;
mod session;

pub use dispatcher::{Dispatcher, Outcome};
pub use offers::offer_ready;
pub use session::Session;
