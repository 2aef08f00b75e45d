//! Generation telemetry.
//!
//! Each proxied request becomes one trace and one generation in a Langfuse
//! ingestion batch. Recording never blocks a request: events go through a
//! bounded queue to a single worker, and are dropped when the queue is full.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::TelemetryConfig;
use crate::translate::canonical::{ChatCompletionRequest, UsageCounters};

const QUEUE_CAPACITY: usize = 1000;
const EXPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Enqueue a finished generation. Never blocks.
    fn record(&self, record: GenerationRecord);

    /// Stop accepting records and wait until queued ones are exported.
    async fn shutdown(&self);
}

/// Build the sink selected by `[telemetry]`.
pub fn from_config(config: &TelemetryConfig, client: reqwest::Client) -> Arc<dyn TelemetrySink> {
    match config.credentials() {
        Some(_) => Arc::new(LangfuseSink::spawn(config, client)),
        None => {
            if config.enabled {
                tracing::warn!("Telemetry enabled but public/secret keys are missing; disabling");
            }
            Arc::new(NoopSink)
        }
    }
}

pub struct NoopSink;

#[async_trait]
impl TelemetrySink for NoopSink {
    fn record(&self, _record: GenerationRecord) {}

    async fn shutdown(&self) {}
}

/// An in-flight generation, started when a request arrives.
#[derive(Debug, Clone)]
pub struct Generation {
    trace_id: String,
    generation_id: String,
    endpoint: &'static str,
    model: String,
    input: Value,
    model_parameters: Value,
    stream: bool,
    start_time: DateTime<Utc>,
}

impl Generation {
    pub fn start(endpoint: &'static str, request: &ChatCompletionRequest) -> Self {
        let mut params = Map::new();
        params.insert("temperature".into(), json!(request.temperature));
        params.insert("max_tokens".into(), json!(request.max_tokens));
        if let Some(top_p) = request.top_p {
            params.insert("top_p".into(), json!(top_p));
        }

        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            generation_id: uuid::Uuid::new_v4().to_string(),
            endpoint,
            model: request.model.clone(),
            input: serde_json::to_value(&request.messages).unwrap_or(Value::Null),
            model_parameters: Value::Object(params),
            stream: request.stream,
            start_time: Utc::now(),
        }
    }

    pub fn finish(self, output: Value, usage: UsageCounters) -> GenerationRecord {
        self.into_record(Some(output), usage, None)
    }

    /// `output` is whatever was produced before the failure, if anything.
    pub fn fail(
        self,
        error: impl std::fmt::Display,
        output: Option<Value>,
        usage: UsageCounters,
    ) -> GenerationRecord {
        self.into_record(output, usage, Some(error.to_string()))
    }

    fn into_record(
        self,
        output: Option<Value>,
        usage: UsageCounters,
        error: Option<String>,
    ) -> GenerationRecord {
        GenerationRecord {
            trace_id: self.trace_id,
            generation_id: self.generation_id,
            name: self.endpoint.to_string(),
            model: self.model,
            input: self.input,
            output,
            model_parameters: self.model_parameters,
            usage,
            stream: self.stream,
            start_time: self.start_time,
            end_time: Utc::now(),
            status_message: error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerationRecord {
    pub trace_id: String,
    pub generation_id: String,
    /// Endpoint that served the request, e.g. `messages`.
    pub name: String,
    pub model: String,
    pub input: Value,
    pub output: Option<Value>,
    pub model_parameters: Value,
    pub usage: UsageCounters,
    pub stream: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Set when the request failed.
    pub status_message: Option<String>,
}

impl GenerationRecord {
    pub fn is_error(&self) -> bool {
        self.status_message.is_some()
    }

    /// The `trace-create` and `generation-create` ingestion events.
    fn into_events(self) -> [IngestionEvent; 2] {
        let metadata = json!({"endpoint": self.name, "stream": self.stream});

        let mut trace = json!({
            "id": self.trace_id,
            "name": self.name,
            "input": self.input,
            "metadata": metadata,
            "timestamp": rfc3339(self.start_time),
        });
        let mut generation = json!({
            "id": self.generation_id,
            "traceId": self.trace_id,
            "name": self.name,
            "model": self.model,
            "modelParameters": self.model_parameters,
            "input": self.input,
            "usage": {
                "promptTokens": self.usage.prompt_tokens,
                "completionTokens": self.usage.completion_tokens,
                "totalTokens": self.usage.total_tokens,
            },
            "metadata": metadata,
            "startTime": rfc3339(self.start_time),
            "endTime": rfc3339(self.end_time),
        });

        if let Some(output) = self.output {
            trace["output"] = output.clone();
            generation["output"] = output;
        }
        if let Some(message) = self.status_message {
            generation["level"] = json!("ERROR");
            generation["statusMessage"] = json!(message);
        }

        [
            IngestionEvent::new(self.trace_id, "trace-create", self.start_time, trace),
            IngestionEvent::new(self.generation_id, "generation-create", self.start_time, generation),
        ]
    }
}

fn rfc3339(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, Serialize)]
struct IngestionEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: &'static str,
    timestamp: String,
    body: Value,
}

impl IngestionEvent {
    fn new(id: String, event_type: &'static str, at: DateTime<Utc>, body: Value) -> Self {
        Self {
            id,
            event_type,
            timestamp: rfc3339(at),
            body,
        }
    }
}

pub struct LangfuseSink {
    tx: Mutex<Option<mpsc::Sender<IngestionEvent>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LangfuseSink {
    /// Start the export worker. Must be called inside a Tokio runtime.
    pub fn spawn(config: &TelemetryConfig, client: reqwest::Client) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (public_key, secret_key) = config.credentials().unwrap_or_default();
        let exporter = Exporter {
            client,
            url: format!("{}/api/public/ingestion", config.host.trim_end_matches('/')),
            public_key: public_key.to_string(),
            secret_key: secret_key.to_string(),
        };

        tracing::info!(host = %config.host, "Telemetry export enabled");
        let worker = tokio::spawn(run_worker(
            rx,
            exporter,
            config.batch_size.max(1),
            config.flush_interval(),
        ));

        Self {
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
        }
    }
}

#[async_trait]
impl TelemetrySink for LangfuseSink {
    fn record(&self, record: GenerationRecord) {
        let Ok(guard) = self.tx.lock() else {
            return;
        };
        let Some(tx) = guard.as_ref() else {
            return;
        };

        for event in record.into_events() {
            if let Err(e) = tx.try_send(event) {
                tracing::debug!(error = %e, "Dropping telemetry event");
            }
        }
    }

    async fn shutdown(&self) {
        if let Ok(mut guard) = self.tx.lock() {
            guard.take();
        }

        if let Some(worker) = self.worker.lock().await.take() {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Telemetry worker failed");
            }
        }
    }
}

struct Exporter {
    client: reqwest::Client,
    url: String,
    public_key: String,
    secret_key: String,
}

impl Exporter {
    async fn export(&self, batch: Vec<IngestionEvent>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        let body = json!({
            "batch": batch,
            "metadata": {
                "sdk_name": env!("CARGO_PKG_NAME"),
                "sdk_version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .client
            .post(&self.url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .timeout(EXPORT_TIMEOUT)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(count, "Telemetry batch exported");
            }
            Ok(resp) => {
                tracing::debug!(count, status = resp.status().as_u16(), "Telemetry export rejected");
            }
            Err(e) => tracing::debug!(count, error = %e, "Telemetry export failed"),
        }
    }
}

/// Batch queued events until `batch_size` is reached or `interval` passes.
/// Runs until every sender is dropped, then exports what is left.
async fn run_worker(
    mut rx: mpsc::Receiver<IngestionEvent>,
    exporter: Exporter,
    batch_size: usize,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    let mut batch = Vec::with_capacity(batch_size);
    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(event) => {
                    batch.push(event);
                    if batch.len() >= batch_size {
                        exporter.export(std::mem::take(&mut batch)).await;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                exporter.export(std::mem::take(&mut batch)).await;
            }
        }
    }

    exporter.export(batch).await;
    tracing::debug!("Telemetry worker stopped");
}
