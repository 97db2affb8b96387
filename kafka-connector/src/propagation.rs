//! W3C trace-context propagation across the consume and produce boundaries.
//!
//! Every consumed record gets one consumer span, parented by the context
//! found in its headers. The span context and the extracted one travel with
//! the message as a `TraceLink`, so that a record produced while handling it
//! gets a producer span parented by the consumer span.

use opentelemetry::propagation::{Extractor, Injector, TextMapPropagator};
use opentelemetry::trace::{
    Span, SpanContext, SpanKind, TraceContextExt, Tracer, TracerProvider as _,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::{self as sdktrace, TracerProvider};

use crate::broker::ConsumedRecord;
use crate::types::RecordHeaders;

const TRACER_NAME: &str = "kafka-connector";

/// Trace contexts attached to a consumed message.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceLink {
    /// Context extracted from the record headers, if there was a valid one
    pub previous: Option<SpanContext>,
    /// Context of the consumer span created for the record
    pub current: SpanContext,
}

impl TraceLink {
    pub fn current_context(&self) -> Context {
        Context::new().with_remote_span_context(self.current.clone())
    }
}

impl Extractor for RecordHeaders {
    fn get(&self, key: &str) -> Option<&str> {
        self.last_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        RecordHeaders::keys(self).collect()
    }
}

impl Injector for RecordHeaders {
    fn set(&mut self, key: &str, value: String) {
        RecordHeaders::set(self, key, value);
    }
}

#[derive(Clone)]
pub struct TracePropagator {
    // Held so the tracer keeps a live provider
    provider: TracerProvider,
    tracer: sdktrace::Tracer,
    propagator: TraceContextPropagator,
}

impl Default for TracePropagator {
    fn default() -> Self {
        Self::new(TracerProvider::builder().build())
    }
}

impl TracePropagator {
    pub fn new(provider: TracerProvider) -> Self {
        let tracer = provider.tracer(TRACER_NAME);
        Self {
            provider,
            tracer,
            propagator: TraceContextPropagator::new(),
        }
    }

    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    pub fn on_consume(&self, record: &ConsumedRecord, group_id: Option<&str>) -> TraceLink {
        let extracted = self.propagator.extract(&record.headers);
        let previous = {
            let span = extracted.span();
            let context = span.span_context();
            context.is_valid().then(|| context.clone())
        };

        let mut attributes = vec![
            KeyValue::new("messaging.system", "kafka"),
            KeyValue::new("messaging.destination.name", record.topic.clone()),
            KeyValue::new(
                "messaging.kafka.destination.partition",
                i64::from(record.partition),
            ),
            KeyValue::new("messaging.kafka.message.offset", record.offset),
            KeyValue::new("messaging.operation", "receive"),
        ];
        if let Some(group) = group_id {
            attributes.push(KeyValue::new(
                "messaging.kafka.consumer.group",
                group.to_string(),
            ));
        }

        let mut span = self
            .tracer
            .span_builder(format!("{} receive", record.topic))
            .with_kind(SpanKind::Consumer)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &extracted);
        let current = span.span_context().clone();
        span.end();

        TraceLink { previous, current }
    }

    /// Starts the producer span of an outgoing record, parented by the
    /// message's current context when it has one, and writes its context
    /// into `headers`.
    pub fn on_produce(
        &self,
        topic: &str,
        partition: Option<i32>,
        link: Option<&TraceLink>,
        headers: &mut RecordHeaders,
    ) -> SpanContext {
        let parent = link.map(TraceLink::current_context).unwrap_or_default();

        let mut attributes = vec![
            KeyValue::new("messaging.system", "kafka"),
            KeyValue::new("messaging.destination.name", topic.to_string()),
            KeyValue::new("messaging.operation", "publish"),
        ];
        if let Some(partition) = partition {
            attributes.push(KeyValue::new(
                "messaging.kafka.destination.partition",
                i64::from(partition),
            ));
        }

        let mut span = self
            .tracer
            .span_builder(format!("{topic} publish"))
            .with_kind(SpanKind::Producer)
            .with_attributes(attributes)
            .start_with_context(&self.tracer, &parent);
        let context = span.span_context().clone();
        span.end();

        let injected = Context::new().with_remote_span_context(context.clone());
        self.propagator.inject_context(&injected, headers);
        context
    }
}
