//! # queue-core
//!
//! Domain types, error taxonomy, and trait surface for the scrape platform's
//! job-queue subsystem. This crate performs no I/O; it exists so that
//! `queue-postgres` (the durable backend), `queue-nats` (the optional
//! prefetch/completion bridge), and test doubles can all agree on one set
//! of shapes.
//!
//! ## Components
//!
//! | Component | Where it lives |
//! |---|---|
//! | Durable Store | `queue-postgres::store` |
//! | Concurrency Accountant | `queue-postgres::accountant` |
//! | Dispatcher | [`traits::Dispatcher`], implemented by `queue-postgres::dispatcher` |
//! | Prefetch Bridge | [`traits::PrefetchBridge`], implemented by `queue-nats` |
//! | Worker API | [`traits::WorkerApi`], implemented by `queue-postgres::worker` |
//! | Waiter API | [`traits::WaiterApi`], implemented by `queue-postgres::waiter` |
//! | Group Manager | [`traits::GroupManager`], implemented by `queue-postgres::groups` |
//! | Listener/Sender sessions | `queue-postgres::session`, `queue-nats::session` |

pub mod config;
pub mod error;
pub mod model;
pub mod owner;
pub mod traits;

pub use config::{ConcurrencyLimit, QueueConfig, WaitMode};
pub use error::{Categorizable, QueueError, QueueResult, SafeErrorCategory};
pub use model::{
    CompletionNotice, Group, GroupConcurrency, GroupConcurrencySetting, GroupStatus, Job,
    JobOutcome, NewJob, OwnerConcurrency, Status, CANCELLED_REASON, TIMED_OUT_REASON,
};
pub use owner::{normalize_owner_id, OWNER_NAMESPACE};
pub use traits::{Dispatcher, GroupManager, JobSubmitter, PrefetchBridge, WaiterApi, WorkerApi};
