use metrics::PhaseMetrics;
use tracing::{info, warn};

use crate::pipeline::{PhaseEvent, PhaseObserver};

/// Emits one structured event per phase.
pub struct TracingObserver;

impl PhaseObserver for TracingObserver {
    fn on_phase(&self, event: &PhaseEvent) {
        let context = &event.context;
        let record = context.record.as_ref().map(|key| key.to_string());
        match event.output_count {
            Some(output_count) => info!(
                phase = %event.phase,
                input_count = event.input_count,
                output_count,
                duration_ms = event.duration.as_millis() as u64,
                storage = context.storage.as_deref(),
                record = record.as_deref(),
                slot = context.slot.as_deref(),
                label = context.phase_label.as_deref(),
                "attachment phase finished"
            ),
            None => warn!(
                phase = %event.phase,
                input_count = event.input_count,
                duration_ms = event.duration.as_millis() as u64,
                storage = context.storage.as_deref(),
                record = record.as_deref(),
                slot = context.slot.as_deref(),
                label = context.phase_label.as_deref(),
                "attachment phase failed"
            ),
        }
    }
}

/// Feeds phase events into OpenTelemetry instruments.
#[derive(Default)]
pub struct MetricsObserver {
    metrics: PhaseMetrics,
}

impl MetricsObserver {
    pub fn new(metrics: PhaseMetrics) -> Self {
        Self { metrics }
    }
}

impl PhaseObserver for MetricsObserver {
    fn on_phase(&self, event: &PhaseEvent) {
        self.metrics.record(
            &event.phase.to_string(),
            event.context.storage.as_deref(),
            event.duration,
            event.input_count as u64,
            event.output_count.map(|count| count as u64),
        );
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use data_model::RecordKey;
    use opentelemetry::metrics::MeterProvider;
    use opentelemetry_sdk::metrics::{InMemoryMetricExporter, PeriodicReader, SdkMeterProvider};

    use super::*;
    use crate::pipeline::{PhaseContext, PhaseName};

    /// Log output collected in memory.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn event(output_count: Option<usize>) -> PhaseEvent {
        PhaseEvent {
            phase: PhaseName::Store,
            input_count: 2,
            output_count,
            duration: Duration::from_millis(4),
            context: PhaseContext {
                storage: Some("store".to_string()),
                record: Some(RecordKey::new("User", "1")),
                slot: Some("avatar".to_string()),
                phase_label: Some("update".to_string()),
            },
        }
    }

    #[test]
    fn test_tracing_observer() {
        let captured = Captured::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            TracingObserver.on_phase(&event(Some(2)));
            TracingObserver.on_phase(&event(None));
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("INFO"));
        assert!(lines[0].contains("attachment phase finished"));
        assert!(lines[0].contains("phase=store"));
        assert!(lines[0].contains("output_count=2"));
        assert!(lines[1].contains("WARN"));
        assert!(lines[1].contains("attachment phase failed"));
        assert!(!lines[1].contains("output_count"));
    }

    fn exported_names(exporter: &InMemoryMetricExporter) -> Vec<String> {
        exporter
            .get_finished_metrics()
            .unwrap()
            .iter()
            .flat_map(|resource| resource.scope_metrics())
            .flat_map(|scope| scope.metrics())
            .map(|metric| metric.name().to_string())
            .collect()
    }

    #[test]
    fn test_metrics_observer() {
        let exporter = InMemoryMetricExporter::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(PeriodicReader::builder(exporter.clone()).build())
            .build();
        let observer = MetricsObserver::new(PhaseMetrics::new(&provider.meter("stowage")));

        observer.on_phase(&event(Some(2)));
        provider.force_flush().unwrap();
        let names = exported_names(&exporter);
        assert!(names.iter().any(|name| name == "stowage.phase.duration_seconds"));
        assert!(names.iter().any(|name| name == "stowage.phase.input_files"));
        assert!(names.iter().any(|name| name == "stowage.phase.output_files"));
        assert!(!names.iter().any(|name| name == "stowage.phase.failures"));

        observer.on_phase(&event(None));
        provider.force_flush().unwrap();
        let names = exported_names(&exporter);
        assert!(names.iter().any(|name| name == "stowage.phase.failures"));
    }
}
