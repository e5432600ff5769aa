//! Error taxonomy for the scrape job queue.
//!
//! Kinds, not type names: transport failures, id conflicts, lost locks,
//! wait timeouts, and group cancellation all need to be distinguishable by
//! callers without string-matching.

use crate::model::CANCELLED_REASON;
use uuid::Uuid;

/// A coarse, loggable classification of a [`QueueError`], small enough to
/// put in a metric label, detailed enough to drive retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafeErrorCategory {
    Transport,
    Conflict,
    Timeout,
    Failed,
    Cancelled,
    Decode,
}

/// Implemented by error types that can report a [`SafeErrorCategory`].
pub trait Categorizable {
    fn category(&self) -> SafeErrorCategory;
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The database or bus was unreachable. Surfaced verbatim; the Queue
    /// never retries internally.
    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    /// `AddJob` attempted to insert a job id that already exists.
    #[error("job {0} already exists")]
    Conflict(Uuid),

    /// `WaitForJob` exceeded its caller-supplied deadline.
    #[error("wait for job {0} timed out")]
    Timeout(Uuid),

    /// The job reached `failed` by the time a waiter observed it. Carries
    /// the stored `failed_reason`, which is `"CANCELLED"` iff a
    /// `CancelGroup` call produced this failure (see [`Categorizable`]).
    #[error("job {0} failed: {1}")]
    Failed(Uuid, String),

    /// A stored value could not be decoded into a domain type (unexpected
    /// enum string, malformed JSON). Indicates schema drift, not caller error.
    #[error("decode error: {0}")]
    Decode(String),
}

impl Categorizable for QueueError {
    fn category(&self) -> SafeErrorCategory {
        match self {
            QueueError::Transport(_) => SafeErrorCategory::Transport,
            QueueError::Conflict(_) => SafeErrorCategory::Conflict,
            QueueError::Timeout(_) => SafeErrorCategory::Timeout,
            QueueError::Failed(_, reason) if reason == CANCELLED_REASON => {
                SafeErrorCategory::Cancelled
            }
            QueueError::Failed(..) => SafeErrorCategory::Failed,
            QueueError::Decode(_) => SafeErrorCategory::Decode,
        }
    }
}

pub type QueueResult<T> = Result<T, QueueError>;
