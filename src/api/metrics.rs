use prometheus::{
    Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::{PoisonError, RwLock};

use crate::core::aggregator::Report;

/// Prefix shared by every exported metric.
pub const NAMESPACE: &str = "clash";

/// Metrics about the exporter itself. These live for the whole process
/// and are never reset between collection cycles.
pub struct ExporterMetrics {
    registry: Registry,
    pub collections: IntCounter,
    pub collection_errors: IntCounterVec,
    pub last_collection_success: IntGauge,
    pub collection_duration: Histogram,
}

impl ExporterMetrics {
    /// Create and register all exporter metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let collections = IntCounter::with_opts(
            Opts::new("collections_total", "Collection cycles attempted.")
                .namespace(NAMESPACE)
                .subsystem("exporter"),
        )?;
        let collection_errors = IntCounterVec::new(
            Opts::new(
                "collection_errors_total",
                "Collection cycles that failed, by stage.",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
            &["stage"],
        )?;
        let last_collection_success = IntGauge::with_opts(
            Opts::new(
                "last_collection_success",
                "Whether the last collection cycle published new metrics.",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
        )?;
        let collection_duration = Histogram::with_opts(
            HistogramOpts::new(
                "collection_duration_seconds",
                "Time spent fetching and publishing one snapshot.",
            )
            .namespace(NAMESPACE)
            .subsystem("exporter"),
        )?;

        registry.register(Box::new(collections.clone()))?;
        registry.register(Box::new(collection_errors.clone()))?;
        registry.register(Box::new(last_collection_success.clone()))?;
        registry.register(Box::new(collection_duration.clone()))?;

        Ok(Self {
            registry,
            collections,
            collection_errors,
            last_collection_success,
            collection_duration,
        })
    }
}

/// Gauges derived from a single Clash snapshot.
struct ClashGauges {
    connections: Gauge,
    download: Gauge,
    upload: Gauge,
    chain_connections: GaugeVec,
    chain_download: GaugeVec,
    chain_upload: GaugeVec,
    connection_download: GaugeVec,
    connection_upload: GaugeVec,
}

impl ClashGauges {
    fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let gauges = Self {
            connections: Gauge::with_opts(
                Opts::new("connections", "Number of current connections.").namespace(NAMESPACE),
            )?,
            download: Gauge::with_opts(
                Opts::new("download_bytes", "Total data downloaded in bytes.")
                    .namespace(NAMESPACE),
            )?,
            upload: Gauge::with_opts(
                Opts::new("upload_bytes", "Total data uploaded in bytes.").namespace(NAMESPACE),
            )?,
            chain_connections: GaugeVec::new(
                Opts::new(
                    "connections",
                    "Number of current connections per proxy chain.",
                )
                .namespace(NAMESPACE)
                .subsystem("chain"),
                &["chain"],
            )?,
            chain_download: GaugeVec::new(
                Opts::new(
                    "download_bytes",
                    "Total data downloaded in bytes per proxy chain.",
                )
                .namespace(NAMESPACE)
                .subsystem("chain"),
                &["chain"],
            )?,
            chain_upload: GaugeVec::new(
                Opts::new(
                    "upload_bytes",
                    "Total data uploaded in bytes per proxy chain.",
                )
                .namespace(NAMESPACE)
                .subsystem("chain"),
                &["chain"],
            )?,
            connection_download: GaugeVec::new(
                Opts::new(
                    "download_bytes",
                    "Total data downloaded in bytes per connection.",
                )
                .namespace(NAMESPACE)
                .subsystem("connection"),
                &["id"],
            )?,
            connection_upload: GaugeVec::new(
                Opts::new(
                    "upload_bytes",
                    "Total data uploaded in bytes per connection.",
                )
                .namespace(NAMESPACE)
                .subsystem("connection"),
                &["id"],
            )?,
        };

        registry.register(Box::new(gauges.connections.clone()))?;
        registry.register(Box::new(gauges.download.clone()))?;
        registry.register(Box::new(gauges.upload.clone()))?;
        registry.register(Box::new(gauges.chain_connections.clone()))?;
        registry.register(Box::new(gauges.chain_download.clone()))?;
        registry.register(Box::new(gauges.chain_upload.clone()))?;
        registry.register(Box::new(gauges.connection_download.clone()))?;
        registry.register(Box::new(gauges.connection_upload.clone()))?;

        Ok(gauges)
    }

    fn record(&self, report: &Report) {
        self.connections.set(report.connection_count() as f64);
        self.download.set(report.totals.download_total as f64);
        self.upload.set(report.totals.upload_total as f64);

        for conn in &report.connections {
            self.connection_download
                .with_label_values(&[conn.id.as_str()])
                .set(conn.download as f64);
            self.connection_upload
                .with_label_values(&[conn.id.as_str()])
                .set(conn.upload as f64);
        }

        for (chain, aggregate) in &report.chains {
            self.chain_connections
                .with_label_values(&[chain.as_str()])
                .set(aggregate.connections as f64);
            self.chain_download
                .with_label_values(&[chain.as_str()])
                .set(aggregate.download as f64);
            self.chain_upload
                .with_label_values(&[chain.as_str()])
                .set(aggregate.upload as f64);
        }
    }
}

/// Owner of everything the scrape endpoint exposes.
///
/// Snapshot-derived gauges are rebuilt from scratch in a private registry on
/// every publish and then swapped in under a single lock, so a scrape sees
/// either the previous cycle or the new one and never a half-cleared mix.
/// Labels that vanish between snapshots disappear with the old registry.
pub struct MetricsRegistry {
    exporter: ExporterMetrics,
    current: RwLock<Registry>,
}

impl MetricsRegistry {
    /// Start with zero-valued global gauges and no labeled series.
    pub fn new() -> Result<Self, prometheus::Error> {
        let initial = Registry::new();
        ClashGauges::register(&initial)?;

        Ok(Self {
            exporter: ExporterMetrics::new()?,
            current: RwLock::new(initial),
        })
    }

    pub fn exporter(&self) -> &ExporterMetrics {
        &self.exporter
    }

    /// Replace the published snapshot metrics with those built from `report`.
    pub fn publish(&self, report: &Report) -> Result<(), prometheus::Error> {
        let next = Registry::new();
        ClashGauges::register(&next)?.record(report);

        *self.current.write().unwrap_or_else(PoisonError::into_inner) = next;
        Ok(())
    }

    /// Render snapshot metrics followed by exporter metrics in the text
    /// exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let current = self
            .current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut families = current.gather();
        families.extend(self.exporter.registry.gather());
        TextEncoder::new().encode_to_string(&families)
    }
}
