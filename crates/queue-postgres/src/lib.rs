//! PostgreSQL-backed implementation of the scrape job queue.
//!
//! Ties the Durable Store, Concurrency Accountant, Dispatcher, Worker API,
//! Waiter API, Group Manager, and Listener session together behind a single
//! [`Queue`] handle.

pub mod accountant;
pub mod dispatcher;
pub mod groups;
pub mod health;
pub mod metrics;
pub mod queue;
pub mod reaper;
pub mod session;
pub mod store;
pub mod submitter;
pub mod waiter;
pub mod worker;

pub use queue::Queue;

/// Lifts a driver-level failure into the crate-wide error taxonomy. Every
/// `sqlx::Error` the Store surfaces is a [`queue_core::SafeErrorCategory::Transport`]
/// failure; there is no code path that should interpret a driver error as,
/// say, a decode error.
pub(crate) fn qe(err: sqlx::Error) -> queue_core::QueueError {
    queue_core::QueueError::Transport(anyhow::Error::new(err))
}
