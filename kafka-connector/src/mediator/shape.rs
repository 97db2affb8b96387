use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream, StreamExt};
use futures::FutureExt;

use crate::message::Envelope;

/// When a message is acknowledged relative to the invocation of its method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckStrategy {
    /// Acked before the method runs. Failures cannot be nacked anymore.
    PreProcessing,
    /// Acked once the method succeeded, nacked with its failure otherwise.
    PostProcessing,
    /// The method acks or nacks the message itself.
    Manual,
    None,
}

impl FromStr for AckStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pre_processing" => Ok(AckStrategy::PreProcessing),
            "post_processing" => Ok(AckStrategy::PostProcessing),
            "manual" => Ok(AckStrategy::Manual),
            "none" => Ok(AckStrategy::None),
            other => Err(format!("unknown acknowledgment strategy {other}")),
        }
    }
}

type AsyncFn<A> = Arc<dyn Fn(A) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;
type SyncFn<A> = Arc<dyn Fn(A) -> anyhow::Result<()> + Send + Sync>;
type PublisherFn<M> =
    Arc<dyn Fn() -> anyhow::Result<BoxStream<'static, anyhow::Result<M>>> + Send + Sync>;

/// The user processing method, tagged with what it consumes and returns.
pub enum ProcessingMethod<M: Envelope> {
    MessageAsync(AsyncFn<M>),
    PayloadAsync(AsyncFn<M::Payload>),
    MessageFireAndForget(SyncFn<M>),
    PayloadFireAndForget(SyncFn<M::Payload>),
    /// Produces messages without consuming any.
    Publisher(PublisherFn<M>),
}

impl<M: Envelope> Clone for ProcessingMethod<M> {
    fn clone(&self) -> Self {
        match self {
            Self::MessageAsync(f) => Self::MessageAsync(f.clone()),
            Self::PayloadAsync(f) => Self::PayloadAsync(f.clone()),
            Self::MessageFireAndForget(f) => Self::MessageFireAndForget(f.clone()),
            Self::PayloadFireAndForget(f) => Self::PayloadFireAndForget(f.clone()),
            Self::Publisher(f) => Self::Publisher(f.clone()),
        }
    }
}

impl<M: Envelope> fmt::Debug for ProcessingMethod<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.shape())
    }
}

/// One prepared call of a consuming method.
pub enum Invocation {
    Sync(Box<dyn FnOnce() -> anyhow::Result<()> + Send>),
    Async(BoxFuture<'static, anyhow::Result<()>>),
}

impl Invocation {
    /// Runs the call on the current task.
    pub async fn run(self) -> anyhow::Result<()> {
        match self {
            Invocation::Sync(call) => call(),
            Invocation::Async(future) => future.await,
        }
    }
}

impl<M: Envelope> ProcessingMethod<M> {
    pub fn message_async<F, Fut>(f: F) -> Self
    where
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::MessageAsync(Arc::new(move |m| f(m).boxed()))
    }

    pub fn payload_async<F, Fut>(f: F) -> Self
    where
        F: Fn(M::Payload) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self::PayloadAsync(Arc::new(move |p| f(p).boxed()))
    }

    pub fn message_fire_and_forget<F>(f: F) -> Self
    where
        F: Fn(M) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::MessageFireAndForget(Arc::new(f))
    }

    pub fn payload_fire_and_forget<F>(f: F) -> Self
    where
        F: Fn(M::Payload) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self::PayloadFireAndForget(Arc::new(f))
    }

    pub fn publisher<F, S>(f: F) -> Self
    where
        F: Fn() -> anyhow::Result<S> + Send + Sync + 'static,
        S: Stream<Item = anyhow::Result<M>> + Send + 'static,
    {
        Self::Publisher(Arc::new(move || f().map(|stream| stream.boxed())))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::MessageAsync(_) => "message -> async result",
            Self::PayloadAsync(_) => "payload -> async result",
            Self::MessageFireAndForget(_) => "message -> nothing",
            Self::PayloadFireAndForget(_) => "payload -> nothing",
            Self::Publisher(_) => "publisher",
        }
    }

    pub fn consumes_payload(&self) -> bool {
        matches!(self, Self::PayloadAsync(_) | Self::PayloadFireAndForget(_))
    }

    pub fn is_publisher(&self) -> bool {
        matches!(self, Self::Publisher(_))
    }

    /// Acknowledgment used when the integrator does not pick one. Methods
    /// given the message settle it themselves.
    pub fn default_ack(&self) -> AckStrategy {
        match self {
            Self::MessageAsync(_) | Self::MessageFireAndForget(_) => AckStrategy::Manual,
            Self::PayloadAsync(_) | Self::PayloadFireAndForget(_) => AckStrategy::PostProcessing,
            Self::Publisher(_) => AckStrategy::None,
        }
    }

    /// Prepares the call for one message. `None` for publishers.
    pub fn invocation(&self, message: &M) -> Option<Invocation> {
        let invocation = match self {
            Self::MessageAsync(f) => Invocation::Async(f(message.clone())),
            Self::PayloadAsync(f) => Invocation::Async(f(message.payload())),
            Self::MessageFireAndForget(f) => {
                let (f, message) = (f.clone(), message.clone());
                Invocation::Sync(Box::new(move || f(message)))
            }
            Self::PayloadFireAndForget(f) => {
                let (f, payload) = (f.clone(), message.payload());
                Invocation::Sync(Box::new(move || f(payload)))
            }
            Self::Publisher(_) => return None,
        };
        Some(invocation)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::message::Message;

    type Msg = Message<String, i32>;

    #[rstest]
    #[case("PRE_PROCESSING", AckStrategy::PreProcessing)]
    #[case("post-processing", AckStrategy::PostProcessing)]
    #[case("manual", AckStrategy::Manual)]
    #[case("NONE", AckStrategy::None)]
    fn parses_ack_strategies(#[case] raw: &str, #[case] expected: AckStrategy) {
        assert_eq!(raw.parse::<AckStrategy>(), Ok(expected));
    }

    #[test]
    fn default_ack_depends_on_what_the_method_consumes() {
        let message = ProcessingMethod::<Msg>::message_fire_and_forget(|_| Ok(()));
        let payload =
            ProcessingMethod::<Msg>::payload_async(|_| async { Ok::<_, anyhow::Error>(()) });
        let publisher = ProcessingMethod::<Msg>::publisher(|| {
            Ok(futures::stream::empty::<anyhow::Result<Msg>>())
        });

        assert_eq!(message.default_ack(), AckStrategy::Manual);
        assert_eq!(payload.default_ack(), AckStrategy::PostProcessing);
        assert_eq!(publisher.default_ack(), AckStrategy::None);
        assert!(publisher.invocation(&Message::of(1)).is_none());
    }

    #[tokio::test]
    async fn fire_and_forget_failures_surface_from_the_invocation() {
        let method = ProcessingMethod::<Msg>::payload_fire_and_forget(|v| {
            anyhow::ensure!(v != 3, "three is not allowed");
            Ok(())
        });

        let ok = method.invocation(&Message::of(1)).unwrap().run().await;
        let failed = method.invocation(&Message::of(3)).unwrap().run().await;

        assert!(ok.is_ok());
        assert_eq!(failed.unwrap_err().to_string(), "three is not allowed");
    }
}
