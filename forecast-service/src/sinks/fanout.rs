use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::pipeline::{Envelope, PipelineError, Sink};

/// Feeds every item, errors included, to two sinks.
///
/// A sink that stops early is skipped for the remaining items; the other one
/// keeps receiving.
pub struct FanoutSink<A, B> {
    first: A,
    second: B,
    capacity: usize,
}

impl<A, B> FanoutSink<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self {
            first,
            second,
            capacity: 64,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[async_trait::async_trait]
impl<T, A, B> Sink<T> for FanoutSink<A, B>
where
    T: Clone + Send + Sync + 'static,
    A: Sink<T>,
    B: Sink<T>,
{
    async fn run<S>(&self, mut input: S) -> Result<(), PipelineError>
    where
        S: futures::Stream<Item = Result<Envelope<T>, PipelineError>> + Send + Unpin + 'static,
    {
        let (tx_a, rx_a) = mpsc::channel(self.capacity);
        let (tx_b, rx_b) = mpsc::channel(self.capacity);

        let forward = async move {
            let mut a = Some(tx_a);
            let mut b = Some(tx_b);

            while let Some(item) = input.next().await {
                if let Some(tx) = &a {
                    if tx.send(item.clone()).await.is_err() {
                        tracing::warn!("first fan-out sink stopped");
                        a = None;
                    }
                }
                if let Some(tx) = &b {
                    if tx.send(item).await.is_err() {
                        tracing::warn!("second fan-out sink stopped");
                        b = None;
                    }
                }
                if a.is_none() && b.is_none() {
                    break;
                }
            }
        };

        let (_, ra, rb) = tokio::join!(
            forward,
            self.first.run(ReceiverStream::new(rx_a)),
            self.second.run(ReceiverStream::new(rx_b)),
        );
        ra.and(rb)
    }
}
