//! Transfer counters exported in Prometheus text format.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::transfer::Direction;

pub struct TransferMetrics {
    registry: Registry,
    bytes: IntCounterVec,
    slices: IntCounterVec,
    slice_failures: IntCounterVec,
    fallbacks: IntCounterVec,
}

impl TransferMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let bytes = counter_vec(
            &registry,
            "gds_io_bytes_total",
            "Bytes moved between storage and device memory",
        )?;
        let slices = counter_vec(
            &registry,
            "gds_io_slices_total",
            "Backend calls issued by the chunked engines",
        )?;
        let slice_failures = counter_vec(
            &registry,
            "gds_io_slice_failures_total",
            "Backend calls that failed or moved fewer bytes than requested",
        )?;
        let fallbacks = counter_vec(
            &registry,
            "gds_io_fallbacks_total",
            "Files served by the host path after accelerated setup failed",
        )?;

        Ok(Self {
            registry,
            bytes,
            slices,
            slice_failures,
            fallbacks,
        })
    }

    pub fn record_bytes(&self, direction: Direction, bytes: u64) {
        self.bytes.with_label_values(&[direction.as_str()]).inc_by(bytes);
    }

    pub fn record_slices(&self, direction: Direction, count: usize) {
        self.slices
            .with_label_values(&[direction.as_str()])
            .inc_by(count as u64);
    }

    pub fn record_slice_failure(&self, direction: Direction) {
        self.slice_failures
            .with_label_values(&[direction.as_str()])
            .inc();
    }

    pub fn record_fallback(&self, direction: Direction) {
        self.fallbacks.with_label_values(&[direction.as_str()]).inc();
    }

    pub fn bytes(&self, direction: Direction) -> u64 {
        self.bytes.with_label_values(&[direction.as_str()]).get()
    }

    pub fn slices(&self, direction: Direction) -> u64 {
        self.slices.with_label_values(&[direction.as_str()]).get()
    }

    pub fn slice_failures(&self, direction: Direction) -> u64 {
        self.slice_failures
            .with_label_values(&[direction.as_str()])
            .get()
    }

    pub fn fallbacks(&self, direction: Direction) -> u64 {
        self.fallbacks.with_label_values(&[direction.as_str()]).get()
    }

    /// Text exposition of every counter.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
) -> Result<IntCounterVec, prometheus::Error> {
    let counter = IntCounterVec::new(Opts::new(name, help), &["direction"])?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_by_direction() {
        let metrics = TransferMetrics::new().unwrap();
        metrics.record_bytes(Direction::Read, 4096);
        metrics.record_bytes(Direction::Read, 4096);
        metrics.record_slices(Direction::Write, 3);
        metrics.record_fallback(Direction::Write);

        assert_eq!(metrics.bytes(Direction::Read), 8192);
        assert_eq!(metrics.bytes(Direction::Write), 0);
        assert_eq!(metrics.slices(Direction::Write), 3);
        assert_eq!(metrics.fallbacks(Direction::Write), 1);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = TransferMetrics::new().unwrap();
        metrics.record_slice_failure(Direction::Read);

        let text = metrics.render().unwrap();
        assert!(text.contains("gds_io_slice_failures_total{direction=\"read\"} 1"));
    }
}
