mod error;
mod handlers;
mod helpers;
mod router;
mod types;

pub use router::{handle_inline, handle_request};
pub use types::{AppState, CancelRegistry, Outbox, Request};
