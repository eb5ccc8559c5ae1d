//! # Stage Processor Skeleton
//!
//! Reusable host every pipeline stage is built on: declare input streams, a
//! consumer group, output streams and a transform; the skeleton wires
//! consumers into the bus and hands the transform a context whose `emit`
//! goes through a producer restricted to the declared outputs. A write to an
//! undeclared stream is rejected before it reaches the log.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{Consumer, ConsumerConfig, EventHandler, HandlerOutcome, Producer};
use crate::envelope::Envelope;
use crate::idempotency::IdempotencyStore;
use crate::log::{Offset, StreamLog};
use crate::registry::SchemaRegistry;
use crate::{BusError, BusResult};

/// Declared wiring of one stage processor.
#[derive(Debug, Clone)]
pub struct ProcessorBinding {
    /// Processor name; becomes `source_service` on emitted events.
    pub name: String,
    pub input_streams: Vec<String>,
    pub consumer_group: String,
    pub output_streams: Vec<String>,
}

/// What a stage transform sees for each delivered event.
pub struct StageContext {
    pub event: Envelope,
    pub trace_id: String,
    producer: Producer,
    source_service: String,
}

impl StageContext {
    /// Build and publish a derived event on a declared output stream.
    ///
    /// The envelope gets a fresh `event_id`; `trace_id` is propagated
    /// unchanged from the input event.
    pub async fn emit(&self, schema: &str, payload: Value) -> BusResult<Offset> {
        let envelope = Envelope::new(schema, self.trace_id.clone(), payload)
            .with_source_service(self.source_service.clone());
        self.producer.publish(schema, &envelope).await
    }
}

/// A stage transform: consume one event, emit zero or more derived events.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn process(&self, ctx: &StageContext) -> HandlerOutcome;
}

struct StageAdapter {
    name: String,
    handler: Arc<dyn StageHandler>,
    producer: Producer,
}

#[async_trait]
impl EventHandler for StageAdapter {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let ctx = StageContext {
            trace_id: envelope.trace_id.clone(),
            event: envelope.clone(),
            producer: self.producer.clone(),
            source_service: self.name.clone(),
        };
        self.handler.process(&ctx).await
    }
}

/// Host that runs one stage: one consumer task per declared input stream,
/// all sharing the stage's consumer group and output whitelist.
pub struct StageProcessor {
    binding: ProcessorBinding,
    log: Arc<dyn StreamLog>,
    registry: Arc<SchemaRegistry>,
    idempotency: Arc<dyn IdempotencyStore>,
    handler: Arc<dyn StageHandler>,
    template: ConsumerConfig,
}

impl StageProcessor {
    /// Wire a stage. Fails fast when an output stream is not registered:
    /// an undeclared or unknown stream is a configuration bug, not a
    /// runtime condition.
    pub fn new(
        binding: ProcessorBinding,
        log: Arc<dyn StreamLog>,
        registry: Arc<SchemaRegistry>,
        idempotency: Arc<dyn IdempotencyStore>,
        handler: Arc<dyn StageHandler>,
    ) -> BusResult<Self> {
        for stream in &binding.output_streams {
            if !registry.is_registered(stream) {
                return Err(BusError::InvalidStream(format!(
                    "output stream {stream} has no registered schema"
                )));
            }
        }
        let template = ConsumerConfig::new("", binding.consumer_group.clone(), binding.name.clone());
        Ok(Self {
            binding,
            log,
            registry,
            idempotency,
            handler,
            template,
        })
    }

    /// Override the consumer tuning applied to every input stream.
    pub fn with_consumer_template(mut self, template: ConsumerConfig) -> Self {
        self.template = template;
        self
    }

    pub fn binding(&self) -> &ProcessorBinding {
        &self.binding
    }

    /// Spawn one consumer task per input stream. Tasks end when `shutdown`
    /// flips.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<BusResult<()>>> {
        let producer = Producer::new(
            self.log.clone(),
            self.registry.clone(),
            self.binding.output_streams.clone(),
        );
        let adapter = Arc::new(StageAdapter {
            name: self.binding.name.clone(),
            handler: self.handler,
            producer,
        });

        let mut handles = Vec::new();
        for (i, stream) in self.binding.input_streams.iter().enumerate() {
            let mut cfg = self.template.clone();
            cfg.stream = stream.clone();
            cfg.group = self.binding.consumer_group.clone();
            cfg.consumer = format!("{}-{}", self.binding.name, i);

            let consumer = Consumer::new(
                self.log.clone(),
                self.registry.clone(),
                self.idempotency.clone(),
                adapter.clone(),
                cfg,
                shutdown.clone(),
            );
            handles.push(tokio::spawn(consumer.run()));
        }
        tracing::info!(
            processor = %self.binding.name,
            inputs = ?self.binding.input_streams,
            outputs = ?self.binding.output_streams,
            "stage processor started"
        );
        handles
    }
}
