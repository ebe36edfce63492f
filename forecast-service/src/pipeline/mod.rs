use std::{pin::Pin, sync::Arc, time::SystemTime};

use futures::{Stream, StreamExt};

#[derive(Debug, Clone)]
pub struct Envelope<T> {
    pub payload: T,
    pub received_at: SystemTime,
}

impl<T> Envelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            received_at: SystemTime::now(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum PipelineError {
    #[error("source error: {0}")]
    Source(String),
    #[error("transform error: {0}")]
    Transform(String),
    #[error("sink error: {0}")]
    Sink(String),
}

pub type EnvelopeStream<T> = Pin<Box<dyn Stream<Item = Result<Envelope<T>, PipelineError>> + Send>>;

#[async_trait::async_trait]
pub trait Source<T>: Send + Sync {
    async fn stream(&self) -> EnvelopeStream<T>;
}

#[async_trait::async_trait]
pub trait Transform<I, O>: Send + Sync {
    async fn apply(&self, input: Envelope<I>) -> Result<Envelope<O>, PipelineError>;
}

/// Consumes a stream until it ends.
///
/// Sinks receive upstream errors as items as well: a failed fetch cycle is
/// information (sensors go unavailable), not a reason to stop the pipeline.
#[async_trait::async_trait]
pub trait Sink<T>: Send + Sync {
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static;
}

/// Lets one sink instance serve several pipelines.
#[async_trait::async_trait]
impl<T, K> Sink<T> for Arc<K>
where
    T: Send + 'static,
    K: Sink<T>,
{
    async fn run<S>(&self, input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static,
    {
        (**self).run(input).await
    }
}

/// An absent sink drains its input, so optional outputs compose with fan-out.
#[async_trait::async_trait]
impl<T, K> Sink<T> for Option<K>
where
    T: Send + 'static,
    K: Sink<T>,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static,
    {
        match self {
            Some(sink) => sink.run(input).await,
            None => {
                while input.next().await.is_some() {}
                Ok(())
            }
        }
    }
}

pub struct Pipeline<S, T, K> {
    pub name: &'static str,
    pub source: S,
    pub transforms: Vec<Arc<dyn Transform<T, T> + Send + Sync>>,
    pub sink: K,
}

impl<T, S, K> Pipeline<S, T, K>
where
    T: Send + 'static,
    S: Source<T> + Send + Sync + 'static,
    K: Sink<T> + Send + Sync + 'static,
{
    pub async fn run(self) -> Result<(), PipelineError> {
        tracing::info!(pipeline = self.name, transforms = self.transforms.len(), "pipeline starting");

        let mut stream = self.source.stream().await;

        for t in self.transforms {
            stream = Box::pin(stream.then(move |item| {
                let t = t.clone();
                async move {
                    match item {
                        Ok(env) => t.apply(env).await,
                        Err(e) => Err(e),
                    }
                }
            }));
        }

        let res = self.sink.run(stream).await;
        match &res {
            Ok(()) => tracing::info!(pipeline = self.name, "pipeline finished"),
            Err(e) => tracing::error!(pipeline = self.name, error = %e, "pipeline failed"),
        }
        res
    }
}
