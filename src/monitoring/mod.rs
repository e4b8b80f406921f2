//! Observability: outbound payloads, the monitoring facade, internal
//! metric events and the folder-reconciliation monitor.

pub mod events;
pub mod folders;
pub mod server;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::discovery::ShreddingComplete;
use crate::storage::StorageFolder;

/// Emit an internal metrics event.
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::monitoring::events::InternalEvent::emit($event)
    };
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Out-of-band notification about a batch or the process.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlertPayload {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<StorageFolder>,
    pub tags: HashMap<String, String>,
}

impl AlertPayload {
    pub fn info(message: impl Into<String>, folder: StorageFolder) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
            folder: Some(folder),
            tags: HashMap::new(),
        }
    }

    pub fn warning(message: impl Into<String>, folder: StorageFolder) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            folder: Some(folder),
            tags: HashMap::new(),
        }
    }

    pub fn error(message: impl Into<String>, folder: Option<StorageFolder>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            folder,
            tags: HashMap::new(),
        }
    }
}

/// Per-load key-value metrics, shipped inside the success payload and
/// optionally printed to stdout.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KVMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count_good: Option<i64>,
    /// Seconds between the oldest collected event and its ingestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collector_latency_max_secs: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collector_latency_min_secs: Option<i64>,
}

impl KVMetrics {
    pub fn from_load(message: &ShreddingComplete, ingestion: Option<DateTime<Utc>>) -> Self {
        let latency = |collector: Option<DateTime<Utc>>| {
            match (collector, ingestion) {
                (Some(collected), Some(ingested)) => {
                    Some((ingested - collected).num_seconds())
                }
                _ => None,
            }
        };
        Self {
            count_good: message.count,
            collector_latency_max_secs: latency(message.timestamps.min_collector),
            collector_latency_min_secs: latency(message.timestamps.max_collector),
        }
    }
}

/// Reported after every successful load.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessPayload {
    /// Application name and version.
    pub app: String,
    pub base: StorageFolder,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingestion: Option<DateTime<Utc>>,
    pub started: DateTime<Utc>,
    /// Retries the load needed (0 when it went through first time).
    pub attempts: usize,
    pub shredding_started: DateTime<Utc>,
    pub shredding_completed: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<KVMetrics>,
}

/// Outbound monitoring sink consumed by the load path. Delivery failures
/// are logged, never surfaced: monitoring must not fail a load.
#[async_trait]
pub trait Monitoring: Send + Sync {
    async fn success(&self, payload: SuccessPayload);
    async fn alert(&self, payload: AlertPayload);
}

/// Production sink: structured logs always, webhook and stdout metrics
/// when configured.
pub struct MonitoringHub {
    app: String,
    webhook: Option<WebhookSink>,
    stdout_metrics: bool,
    tags: HashMap<String, String>,
}

struct WebhookSink {
    client: reqwest::Client,
    endpoint: String,
}

impl MonitoringHub {
    pub fn new(config: &crate::config::MonitoringConfig) -> Self {
        let webhook = config.webhook.as_ref().map(|webhook| WebhookSink {
            client: reqwest::Client::new(),
            endpoint: webhook.endpoint.clone(),
        });
        Self {
            app: format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
            webhook,
            stdout_metrics: config.metrics.stdout,
            tags: config
                .webhook
                .as_ref()
                .map(|webhook| webhook.tags.clone())
                .unwrap_or_default(),
        }
    }

    /// Application identifier stamped into success payloads.
    pub fn app(&self) -> &str {
        &self.app
    }

    async fn deliver<P: Serialize + Sync>(&self, payload: &P) {
        let Some(webhook) = &self.webhook else {
            return;
        };
        let result = webhook
            .client
            .post(&webhook.endpoint)
            .json(payload)
            .send()
            .await
            .and_then(|response| response.error_for_status());
        if let Err(e) = result {
            error!("Failed to deliver monitoring payload: {e}");
        }
    }
}

#[async_trait]
impl Monitoring for MonitoringHub {
    async fn success(&self, payload: SuccessPayload) {
        info!(base = %payload.base, attempts = payload.attempts, "Folder loaded");
        if self.stdout_metrics
            && let Some(metrics) = &payload.metrics
            && let Ok(json) = serde_json::to_string(metrics)
        {
            println!("{json}");
        }
        self.deliver(&payload).await;
    }

    async fn alert(&self, mut payload: AlertPayload) {
        payload.tags.extend(self.tags.clone());
        match payload.severity {
            Severity::Info => info!(folder = ?payload.folder, "{}", payload.message),
            Severity::Warning => warn!(folder = ?payload.folder, "{}", payload.message),
            Severity::Error => error!(folder = ?payload.folder, "{}", payload.message),
        }
        emit!(events::AlertSent {
            severity: payload.severity
        });
        self.deliver(&payload).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{Compression, Processor, Timestamps};

    fn message(count: Option<i64>) -> ShreddingComplete {
        ShreddingComplete {
            base: StorageFolder::parse("s3://bucket/run=1/").unwrap(),
            types: vec![],
            timestamps: Timestamps {
                job_started: "2022-01-01T01:00:00Z".parse().unwrap(),
                job_completed: "2022-01-01T01:10:00Z".parse().unwrap(),
                min_collector: Some("2022-01-01T00:00:00Z".parse().unwrap()),
                max_collector: Some("2022-01-01T00:50:00Z".parse().unwrap()),
            },
            compression: Compression::Gzip,
            processor: Processor {
                artifact: "shredder".into(),
                version: "4.2.1".into(),
            },
            count,
        }
    }

    #[test]
    fn test_kv_metrics_latencies() {
        let ingestion: DateTime<Utc> = "2022-01-01T01:20:00Z".parse().unwrap();
        let metrics = KVMetrics::from_load(&message(Some(10)), Some(ingestion));
        assert_eq!(metrics.count_good, Some(10));
        assert_eq!(metrics.collector_latency_max_secs, Some(80 * 60));
        assert_eq!(metrics.collector_latency_min_secs, Some(30 * 60));
    }

    #[test]
    fn test_kv_metrics_without_ingestion() {
        let metrics = KVMetrics::from_load(&message(None), None);
        assert_eq!(metrics.count_good, None);
        assert_eq!(metrics.collector_latency_max_secs, None);
    }

    #[test]
    fn test_alert_payload_json_shape() {
        let payload = AlertPayload::warning(
            "Unloaded folder found",
            StorageFolder::parse("s3://bucket/run=1/").unwrap(),
        );
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["severity"], "Warning");
        assert_eq!(json["message"], "Unloaded folder found");
        assert_eq!(json["folder"], "s3://bucket/run=1/");
    }
}
