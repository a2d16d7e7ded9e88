//! Prometheus exposition of streaming statistics.
//!
//! Gauges are refreshed from a [`CollectionStats`] snapshot on every scrape,
//! so nothing on the loader or render path touches the registry.

use prometheus::{Encoder, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};
use thiserror::Error;

use crate::streaming::CollectionStats;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Metrics output is not UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

pub struct StreamerMetrics {
    registry: Registry,
    tier_occupants: IntGaugeVec,
    tier_capacity: IntGaugeVec,
    tier_evictions: IntGaugeVec,
    block_status: IntGaugeVec,
    loader_events: IntGaugeVec,
    queue_depth: IntGauge,
    ready_depth: IntGauge,
    shown_blocks: IntGauge,
}

impl StreamerMetrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("block_streamer".to_string()), None)?;

        let tier_occupants = IntGaugeVec::new(
            Opts::new("tier_occupants", "Blocks currently holding a tier resource"),
            &["tier"],
        )?;
        let tier_capacity = IntGaugeVec::new(
            Opts::new("tier_capacity", "Resources owned by each tier"),
            &["tier"],
        )?;
        let tier_evictions = IntGaugeVec::new(
            Opts::new("tier_evictions", "Evictions performed by each tier"),
            &["tier"],
        )?;
        let block_status = IntGaugeVec::new(
            Opts::new("blocks", "Blocks by residency status"),
            &["status"],
        )?;
        let loader_events = IntGaugeVec::new(
            Opts::new("loader_events", "Loader event counts since startup"),
            &["event"],
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Entries in the loader work queue")?;
        let ready_depth = IntGauge::new("ready_depth", "Blocks waiting for upload")?;
        let shown_blocks = IntGauge::new("shown_blocks", "Blocks inside the classification range")?;

        registry.register(Box::new(tier_occupants.clone()))?;
        registry.register(Box::new(tier_capacity.clone()))?;
        registry.register(Box::new(tier_evictions.clone()))?;
        registry.register(Box::new(block_status.clone()))?;
        registry.register(Box::new(loader_events.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(ready_depth.clone()))?;
        registry.register(Box::new(shown_blocks.clone()))?;

        Ok(Self {
            registry,
            tier_occupants,
            tier_capacity,
            tier_evictions,
            block_status,
            loader_events,
            queue_depth,
            ready_depth,
            shown_blocks,
        })
    }

    /// Copy a stats snapshot into the gauges.
    pub fn update(&self, stats: &CollectionStats) {
        let loader = &stats.loader;
        for (tier, tier_stats) in [("ram", &loader.main), ("gpu", &loader.gpu)] {
            self.tier_occupants
                .with_label_values(&[tier])
                .set(tier_stats.occupants as i64);
            self.tier_capacity
                .with_label_values(&[tier])
                .set(tier_stats.capacity as i64);
            self.tier_evictions
                .with_label_values(&[tier])
                .set(tier_stats.evictions as i64);
        }

        let status = &stats.status;
        for (name, count) in [
            ("unloaded", status.unloaded),
            ("loading", status.loading),
            ("cpu_resident", status.cpu_resident),
            ("gpu_ready", status.gpu_ready),
            ("gpu_resident", status.gpu_resident),
        ] {
            self.block_status.with_label_values(&[name]).set(count as i64);
        }

        let c = &loader.counters;
        for (event, count) in [
            ("disk_reads", c.disk_reads),
            ("read_failures", c.read_failures),
            ("loads", c.loads),
            ("promotions", c.promotions),
            ("deferrals", c.deferrals),
            ("uploads", c.uploads),
            ("upload_failures", c.upload_failures),
        ] {
            self.loader_events.with_label_values(&[event]).set(count as i64);
        }

        self.queue_depth.set(loader.queue_depth as i64);
        self.ready_depth.set(loader.ready_depth as i64);
        self.shown_blocks.set(stats.classification.shown as i64);
    }

    /// Render the registry in the text exposition format.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
