//! Dispatch of one processing method: turns the upstream message stream into
//! invocations, and invocation outcomes into acks, nacks or stream failures.

use std::sync::Arc;

use anyhow::anyhow;
use futures::stream::{BoxStream, Stream, StreamExt};
use health::HealthRegistry;
use metrics::counter;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ConnectorError, WiringError};
use crate::message::Envelope;
use crate::metrics_consts::{INVOCATIONS, UNSETTLED_MESSAGES};
use crate::sink::MessageSink;

mod shape;
mod worker;

pub use shape::{AckStrategy, Invocation, ProcessingMethod};
pub use worker::WorkerPool;

/// Where invocations run.
#[derive(Clone, Debug)]
pub enum Dispatch {
    /// On the mediator task, one message at a time.
    Direct,
    /// On a worker pool. Ordered dispatch waits for each invocation before
    /// submitting the next; otherwise up to the pool size run at once and
    /// complete in any order.
    Blocking { ordered: bool, pool: WorkerPool },
}

pub struct MediatorConfiguration<M: Envelope> {
    identity: String,
    method: ProcessingMethod<M>,
    ack: Option<AckStrategy>,
    dispatch: Dispatch,
}

impl<M: Envelope> MediatorConfiguration<M> {
    pub fn new(identity: impl Into<String>, method: ProcessingMethod<M>) -> Self {
        Self {
            identity: identity.into(),
            method,
            ack: None,
            dispatch: Dispatch::Direct,
        }
    }

    pub fn with_ack(mut self, ack: AckStrategy) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn blocking(mut self, pool: WorkerPool, ordered: bool) -> Self {
        self.dispatch = Dispatch::Blocking { ordered, pool };
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn ack_strategy(&self) -> AckStrategy {
        self.ack.unwrap_or_else(|| self.method.default_ack())
    }

    fn validate(&self) -> Result<(), WiringError> {
        let invalid = |reason: &str| {
            Err(WiringError::InvalidShape {
                method: self.identity.clone(),
                reason: reason.to_string(),
            })
        };
        let ack = self.ack_strategy();

        if self.method.consumes_payload() && ack == AckStrategy::Manual {
            return invalid("a method consuming payloads cannot acknowledge manually");
        }
        if self.method.is_publisher() {
            if matches!(self.dispatch, Dispatch::Blocking { .. }) {
                return invalid("publisher methods cannot be blocking");
            }
            if matches!(ack, AckStrategy::PreProcessing | AckStrategy::PostProcessing) {
                return invalid("publisher methods do not consume messages to acknowledge");
            }
        }
        Ok(())
    }
}

/// Everything one invocation needs, shared by the in-flight invocations.
struct Dispatcher<M: Envelope> {
    identity: String,
    method: ProcessingMethod<M>,
    ack: AckStrategy,
    dispatch: Dispatch,
}

impl<M: Envelope> Dispatcher<M> {
    async fn invoke(&self, message: &M) -> anyhow::Result<()> {
        let invocation = self
            .method
            .invocation(message)
            .ok_or_else(|| anyhow!("{} does not consume messages", self.identity))?;
        match &self.dispatch {
            Dispatch::Direct => invocation.run().await,
            Dispatch::Blocking { pool, .. } => pool.run(invocation).await,
        }
    }

    /// Processes one message and echoes it, or fails the stream when the
    /// failure can no longer be nacked.
    async fn process(&self, message: M) -> Result<M, ConnectorError> {
        if self.ack == AckStrategy::PreProcessing {
            message.ack().await?;
        }

        let outcome = self.invoke(&message).await;
        let status = if outcome.is_ok() { "ok" } else { "error" };
        counter!(INVOCATIONS, "method" => self.identity.clone(), "status" => status).increment(1);

        match outcome {
            Ok(()) => {
                if self.ack == AckStrategy::PostProcessing {
                    message.ack().await?;
                }
                Ok(message)
            }
            Err(cause) if self.ack == AckStrategy::PostProcessing => {
                debug!(method = %self.identity, "invocation failed, nacking: {cause:#}");
                match message.nack(cause).await {
                    Ok(()) => Ok(message),
                    Err(e) if e.is_message_scoped() => {
                        self.unsettled(&e);
                        Ok(message)
                    }
                    Err(e) => Err(e),
                }
            }
            Err(cause) => {
                // Manual methods see the nack outcome through their own result
                match cause.downcast_ref::<ConnectorError>() {
                    Some(e) if e.is_message_scoped() => {
                        self.unsettled(e);
                        Ok(message)
                    }
                    _ => Err(ConnectorError::Processing(cause)),
                }
            }
        }
    }

    fn unsettled(&self, failure: &ConnectorError) {
        warn!(method = %self.identity, "message left unsettled: {failure}");
        counter!(UNSETTLED_MESSAGES, "method" => self.identity.clone()).increment(1);
    }
}

type Upstream<M> = BoxStream<'static, Result<M, ConnectorError>>;

/// Owns one processing method and the streams around it.
pub struct Mediator<M: Envelope> {
    dispatcher: Arc<Dispatcher<M>>,
    cancel: CancellationToken,
    health: Option<HealthRegistry>,
    upstream: Option<Upstream<M>>,
    downstream: Option<Arc<dyn MessageSink<M>>>,
    started: bool,
}

impl<M: Envelope> Mediator<M> {
    /// Fails when the method shape does not fit its acknowledgment or
    /// dispatch settings.
    pub fn new(
        configuration: MediatorConfiguration<M>,
        cancel: CancellationToken,
    ) -> Result<Self, WiringError> {
        configuration.validate()?;
        let ack = configuration.ack_strategy();
        Ok(Self {
            dispatcher: Arc::new(Dispatcher {
                identity: configuration.identity,
                method: configuration.method,
                ack,
                dispatch: configuration.dispatch,
            }),
            cancel,
            health: None,
            upstream: None,
            downstream: None,
            started: false,
        })
    }

    pub fn with_health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    pub fn identity(&self) -> &str {
        &self.dispatcher.identity
    }

    pub fn ack_strategy(&self) -> AckStrategy {
        self.dispatcher.ack
    }

    pub fn connect_to_upstream<S>(&mut self, upstream: S) -> Result<(), WiringError>
    where
        S: Stream<Item = Result<M, ConnectorError>> + Send + 'static,
    {
        if self.dispatcher.method.is_publisher() {
            return Err(WiringError::InvalidShape {
                method: self.identity().to_string(),
                reason: "publisher methods have no upstream".to_string(),
            });
        }
        self.upstream = Some(upstream.boxed());
        Ok(())
    }

    /// Without a downstream, processed messages are dropped once echoed.
    pub fn connect_to_downstream(&mut self, sink: Arc<dyn MessageSink<M>>) {
        self.downstream = Some(sink);
    }

    /// Builds the processed stream. Takes the upstream, so it can only be
    /// done once. Once the cancellation token fires no new message is pulled,
    /// and the stream ends after the in-flight invocations completed.
    pub fn transform(&mut self) -> Result<Upstream<M>, WiringError> {
        if self.started {
            return Err(WiringError::AlreadyRunning(self.identity().to_string()));
        }
        let stop = self.cancel.clone().cancelled_owned();

        if let ProcessingMethod::Publisher(publisher) = &self.dispatcher.method {
            let produced = publisher().map_err(|source| WiringError::Subscription {
                method: self.identity().to_string(),
                source,
            })?;
            self.started = true;
            return Ok(produced
                .take_until(stop)
                .map(|item| item.map_err(ConnectorError::Processing))
                .boxed());
        }

        let upstream = self
            .upstream
            .take()
            .ok_or_else(|| WiringError::NotConnected(self.identity().to_string()))?
            .take_until(stop);
        self.started = true;

        let dispatcher = self.dispatcher.clone();
        let process = move |item: Result<M, ConnectorError>| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.process(item?).await }
        };

        let processed = match &self.dispatcher.dispatch {
            Dispatch::Blocking {
                ordered: false,
                pool,
            } => upstream.map(process).buffer_unordered(pool.size()).boxed(),
            _ => upstream.then(process).boxed(),
        };
        Ok(processed)
    }

    /// Subscribes the processed stream and forwards it downstream on a new
    /// task until the stream ends or a failure reaches it.
    pub fn run(&mut self) -> Result<MediatorHandle, WiringError> {
        let mut processed = self.transform()?;
        let identity = self.identity().to_string();
        let health = self.health.clone();
        let downstream = self.downstream.clone();

        info!(
            method = %identity,
            ack = ?self.dispatcher.ack,
            dispatch = ?self.dispatcher.dispatch,
            "mediator started"
        );

        let task_identity = identity.clone();
        let task = tokio::spawn(async move {
            let identity = task_identity;
            while let Some(next) = processed.next().await {
                let failure = match next {
                    Ok(message) => match &downstream {
                        Some(sink) => match sink.send(message).await {
                            Ok(()) => continue,
                            Err(e) => ConnectorError::Downstream(anyhow::Error::new(e)),
                        },
                        None => continue,
                    },
                    Err(e) => e,
                };

                error!(method = %identity, "processing stream failed: {failure}");
                if let Some(health) = &health {
                    health.report_application_failure(&identity, &failure);
                }
                return Err(failure);
            }
            info!(method = %identity, "mediator stopped");
            Ok(())
        });

        Ok(MediatorHandle {
            identity,
            cancel: self.cancel.clone(),
            task,
        })
    }
}

/// A running mediator.
pub struct MediatorHandle {
    identity: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ConnectorError>>,
}

impl MediatorHandle {
    /// Stops pulling from the upstream. In-flight invocations finish and
    /// their outcome is still acknowledged or reported.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the mediator to stop, returning the failure that stopped it.
    pub async fn join(self) -> Result<(), ConnectorError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ConnectorError::Processing(anyhow!(
                "mediator {} panicked: {e}",
                self.identity
            ))),
        }
    }
}
