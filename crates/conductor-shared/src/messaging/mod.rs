//! # Messaging
//!
//! Envelope model, naming scheme, and the transport provider seam.

pub mod envelope;
pub mod naming;
pub mod transport;

pub use envelope::{headers, Envelope, MessageCategory};
pub use naming::{step_name_for_command, QueueNaming};
pub use transport::{InMemoryTransport, MessageTransport, TransportError, TransportSubscription};
