use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::metrics::MetricsRegistry;
use crate::config::DecodeErrorPolicy;
use crate::core::aggregator::Report;
use crate::core::fetcher::{FetchError, SnapshotSource};
use crate::core::snapshot::{ConnectionsSnapshot, DecodeError};

/// Why a collection cycle did not publish.
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to build metrics: {0}")]
    Publish(#[from] prometheus::Error),
}

impl CollectError {
    /// Label value for `clash_exporter_collection_errors_total`.
    pub fn stage(&self) -> &'static str {
        match self {
            CollectError::Fetch(_) => "fetch",
            CollectError::Decode(_) => "decode",
            CollectError::Publish(_) => "publish",
        }
    }
}

/// Summary of a published cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleSummary {
    pub connections: usize,
    pub chains: usize,
}

/// Polls a snapshot source and publishes each snapshot into the registry.
pub struct Collector {
    source: Arc<dyn SnapshotSource>,
    registry: Arc<MetricsRegistry>,
    interval: Duration,
    on_decode_error: DecodeErrorPolicy,
}

impl Collector {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        registry: Arc<MetricsRegistry>,
        interval: Duration,
    ) -> Self {
        Self {
            source,
            registry,
            interval,
            on_decode_error: DecodeErrorPolicy::default(),
        }
    }

    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.on_decode_error = policy;
        self
    }

    /// Fetch, decode, aggregate and publish one snapshot.
    ///
    /// On any error the previously published metrics are left in place.
    /// Self-metrics are only touched once the cycle has finished, so a cycle
    /// dropped by cancellation leaves no trace.
    pub async fn collect_once(&self) -> Result<CycleSummary, CollectError> {
        let started = Instant::now();
        let result = self.cycle().await;

        let exporter = self.registry.exporter();
        exporter.collections.inc();
        exporter
            .collection_duration
            .observe(started.elapsed().as_secs_f64());
        match &result {
            Ok(_) => exporter.last_collection_success.set(1),
            Err(e) => {
                exporter.last_collection_success.set(0);
                exporter
                    .collection_errors
                    .with_label_values(&[e.stage()])
                    .inc();
            }
        }
        result
    }

    async fn cycle(&self) -> Result<CycleSummary, CollectError> {
        let body = self.source.fetch().await?;
        let snapshot = ConnectionsSnapshot::decode(&body)?;
        let report = Report::aggregate(snapshot);
        self.registry.publish(&report)?;

        Ok(CycleSummary {
            connections: report.connection_count(),
            chains: report.chains.len(),
        })
    }

    /// Collect immediately, then every `interval`, until `cancel` fires.
    ///
    /// Returns an error only for a decode failure under
    /// [`DecodeErrorPolicy::Exit`]; everything else is logged and retried.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), CollectError> {
        info!(
            "Collecting from {} every {:?}",
            self.source.endpoint(),
            self.interval
        );

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = self.collect_once() => outcome,
            };

            match outcome {
                Ok(summary) => debug!(
                    connections = summary.connections,
                    chains = summary.chains,
                    "Published connection snapshot"
                ),
                Err(e @ CollectError::Decode(_))
                    if self.on_decode_error == DecodeErrorPolicy::Exit =>
                {
                    error!("Error decoding connections from clash: {}", e);
                    return Err(e);
                }
                Err(e) => warn!("Error collecting connections from clash: {}", e),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        info!("Collector stopped");
        Ok(())
    }
}
