use opentelemetry::{
    global,
    metrics::{Counter, Gauge, Histogram, MeterProvider},
    KeyValue,
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::collections::HashSet;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to build prometheus exporter: {0}")]
    Exporter(String),
}

pub struct Metrics {
    ticks: Counter<u64>,
    coalesced_ticks: Counter<u64>,
    failed_ticks: Counter<u64>,
    faces_detected: Counter<u64>,
    inference_duration: Histogram<u64>,
    tick_rate: Gauge<f64>,
    provider: SdkMeterProvider,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Self, TelemetryError> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| TelemetryError::Exporter(e.to_string()))?;

        let provider = SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("face_annotator");

        let ticks = meter
            .u64_counter("ticks_total")
            .with_description("Polling ticks that ran an inference cycle")
            .build();

        let coalesced_ticks = meter
            .u64_counter("coalesced_ticks_total")
            .with_description("Ticks skipped because the previous cycle was still running")
            .build();

        let failed_ticks = meter
            .u64_counter("failed_ticks_total")
            .with_description("Ticks that failed and were skipped")
            .build();

        let faces_detected = meter
            .u64_counter("faces_detected_total")
            .with_description("Faces drawn on the overlay")
            .build();

        let boundaries = generate_boundaries((15, 30, 60, 500, 1000));

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(boundaries)
            .with_description("Duration of one inference cycle in milliseconds")
            .build();

        let tick_rate = meter
            .f64_gauge("tick_rate")
            .with_description("Completed inference cycles per second")
            .build();

        Ok(Metrics {
            ticks,
            coalesced_ticks,
            failed_ticks,
            faces_detected,
            inference_duration,
            tick_rate,
            provider,
            registry,
        })
    }

    /// Routes instruments created through the global meter (the HTTP layer)
    /// into this registry.
    pub fn install_global(&self) {
        global::set_meter_provider(self.provider.clone());
    }

    pub fn record_tick(&self, duration_ms: u64, faces: usize) {
        self.ticks.add(1, &[]);
        self.faces_detected.add(faces as u64, &[]);
        self.inference_duration.record(duration_ms, &[]);
    }

    pub fn record_coalesced(&self, skipped: u64) {
        self.coalesced_ticks.add(skipped, &[]);
    }

    pub fn record_failure(&self, kind: &'static str) {
        let attributes = vec![KeyValue::new("kind", kind)];
        self.failed_ticks.add(1, &attributes);
    }

    pub fn record_tick_rate(&self, rate: f64) {
        self.tick_rate.record(rate, &[]);
    }
}

fn generate_boundaries(parts: (i32, i32, i32, i32, i32)) -> Vec<f64> {
    let first_step: usize = 10;
    let middle_step: usize = 2;
    let end_step: usize = 20;
    let tail_step: usize = 100;
    let first_part = (parts.0..=parts.1).step_by(first_step);
    let middle_part = (parts.1..=parts.2).step_by(middle_step);
    let end_part = (parts.2..=parts.3).step_by(end_step);
    let tail_part = (parts.3..=parts.4).step_by(tail_step);

    let mut seen = HashSet::new();
    first_part
        .chain(middle_part)
        .chain(end_part)
        .chain(tail_part)
        .filter(|&x| seen.insert(x))
        .map(|x| x as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::{Encoder, TextEncoder};

    #[test]
    fn test_generate_boundaries() {
        let parts = (2, 22, 26, 46, 146);
        let get = generate_boundaries(parts);
        let expected = vec![2.0, 12.0, 22.0, 24.0, 26.0, 46.0, 146.0];

        assert_eq!(get, expected);
    }

    #[test]
    fn test_recorded_ticks_are_exported() {
        let metrics = Metrics::new().unwrap();
        metrics.record_tick(42, 2);
        metrics.record_failure("inference");

        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&metrics.registry.gather(), &mut buffer)
            .unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("ticks_total"));
        assert!(text.contains("faces_detected_total"));
        assert!(text.contains("inference_duration_ms"));
    }
}
