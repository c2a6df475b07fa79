use futures::future::BoxFuture;

/// Failure reported by [`SinkStore::bulk_write`].
///
/// A sink must report `Transient` only when nothing from the batch was persisted; the
/// worker retries the whole batch. Sinks that cannot guarantee all-or-nothing writes
/// should key records naturally so a retried batch overwrites instead of duplicating.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Timeouts, throttling, temporarily unavailable store.
    #[error("transient sink error: {0}")]
    Transient(String),
    /// Schema violations, constraint breaches, poison records.
    #[error("permanent sink error: {0}")]
    Permanent(String),
}

impl SinkError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

pub trait SinkStore: Send + Sync + 'static {
    type Record: Send + Sync + 'static;

    /// Writes the whole batch as one indivisible operation.
    fn bulk_write<'a>(&'a self, records: &'a [Self::Record]) -> BoxFuture<'a, Result<(), SinkError>>;
}
