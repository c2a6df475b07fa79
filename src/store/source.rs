//! Source-side contract: a store that can open a forward-only cursor, hand out
//! pages of records in order, and release the cursor afterwards.

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

/// Records flowing out of a source must survive a round trip through quarantine storage.
pub trait SourceRecord: Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> SourceRecord for T where T: Serialize + DeserializeOwned + Send + Sync + 'static {}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    /// The store could not be reached or the scope could not be established. Retried by the reader.
    #[error("source unavailable: {0}")]
    Unavailable(String),
    /// The store returned data the reader cannot make sense of. Never retried.
    #[error("source returned corrupt data: {0}")]
    Corrupt(String),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// One page returned by [`SourceStore::fetch_batch`].
#[derive(Debug, Clone, PartialEq)]
pub struct Page<R, P> {
    pub records: Vec<R>,
    /// Cursor position immediately after the last record of this page.
    pub position: P,
    /// `true` once the source has nothing left past `position`.
    pub exhausted: bool,
}

pub trait SourceStore: Send + Sync + 'static {
    type Record: SourceRecord;
    type Position: Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static;
    type Handle: Send + 'static;

    /// Declares the iteration scope once. `resume_from` is the last checkpointed position.
    fn open_cursor<'a>(
        &'a self,
        query: &'a str,
        resume_from: Option<Self::Position>,
    ) -> BoxFuture<'a, Result<Self::Handle, SourceError>>;

    /// Returns up to `desired` records following the handle's current position.
    fn fetch_batch<'a>(
        &'a self,
        handle: &'a mut Self::Handle,
        desired: usize,
    ) -> BoxFuture<'a, Result<Page<Self::Record, Self::Position>, SourceError>>;

    /// Current position of an open handle, before any page has been fetched.
    fn position(&self, handle: &Self::Handle) -> Self::Position;

    fn close_cursor(&self, handle: Self::Handle) -> BoxFuture<'_, Result<(), SourceError>>;
}
