use crate::store::SourceRecord;
use futures::future::BoxFuture;
use std::marker::PhantomData;

/// The transform refused a batch. The batch is quarantined, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transform rejected batch: {message}")]
pub struct TransformError {
    pub message: String,
}

impl TransformError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Business logic applied to every batch between the source and the sink.
pub trait Transform: Send + Sync + 'static {
    type Input: SourceRecord;
    type Output: Send + Sync + 'static;

    fn transform<'a>(
        &'a self,
        records: &'a [Self::Input],
    ) -> BoxFuture<'a, Result<Vec<Self::Output>, TransformError>>;
}

/// Forwards records unchanged.
#[derive(Debug)]
pub struct PassThrough<R> {
    _records: PhantomData<fn() -> R>,
}

impl<R> PassThrough<R> {
    pub fn new() -> Self {
        Self {
            _records: PhantomData,
        }
    }
}

impl<R> Default for PassThrough<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: SourceRecord + Clone> Transform for PassThrough<R> {
    type Input = R;
    type Output = R;

    fn transform<'a>(&'a self, records: &'a [R]) -> BoxFuture<'a, Result<Vec<R>, TransformError>> {
        Box::pin(async move { Ok(records.to_vec()) })
    }
}

/// Adapts a synchronous closure into a [`Transform`].
pub struct FnTransform<I, O, F> {
    func: F,
    _types: PhantomData<fn(I) -> O>,
}

pub fn transform_fn<I, O, F>(func: F) -> FnTransform<I, O, F>
where
    F: Fn(&[I]) -> Result<Vec<O>, TransformError> + Send + Sync + 'static,
{
    FnTransform {
        func,
        _types: PhantomData,
    }
}

impl<I, O, F> Transform for FnTransform<I, O, F>
where
    I: SourceRecord,
    O: Send + Sync + 'static,
    F: Fn(&[I]) -> Result<Vec<O>, TransformError> + Send + Sync + 'static,
{
    type Input = I;
    type Output = O;

    fn transform<'a>(&'a self, records: &'a [I]) -> BoxFuture<'a, Result<Vec<O>, TransformError>> {
        let result = (self.func)(records);
        Box::pin(async move { result })
    }
}
