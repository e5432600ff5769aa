//! NATS JetStream-backed Prefetch Bridge and completion fan-out.
//!
//! Optional tier: a `Queue` configured without a `bus_url` never constructs
//! anything from this crate, and the Dispatcher's own CTE path is correct
//! on its own.

pub mod bridge;
pub mod session;

pub use bridge::NatsBridge;
pub use session::{channel_subject, NatsListenerSession};
