use std::{
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use opentelemetry::{
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use pin_project_lite::pin_project;

pin_project! {
    /// Runs `callback` with the elapsed time once `inner` resolves.
    #[must_use = "futures do nothing unless you `.await` or poll them"]
    pub struct TimedFuture<F, C>
    where
        F: Future,
        C: FnOnce(Duration),
    {
        #[pin]
        inner: F,
        start: Instant,
        // Taken on completion; the future may be polled again afterwards.
        callback: Option<C>,
    }
}

impl<F, C> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    pub fn new(inner: F, callback: C) -> Self {
        Self {
            inner,
            callback: Some(callback),
            start: Instant::now(),
        }
    }
}

impl<F, C> Future for TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let poll_result = this.inner.poll(cx);

        if poll_result.is_ready() {
            let elapsed = this.start.elapsed();
            if let Some(callback) = this.callback.take() {
                callback(elapsed);
            }
        }

        poll_result
    }
}

pub fn create_timed_future<F, C>(future: F, callback: C) -> TimedFuture<F, C>
where
    F: Future,
    C: FnOnce(Duration),
{
    TimedFuture::new(future, callback)
}

/// Instruments for attachment phases (`process`, `store`, `delete`).
#[derive(Debug, Clone)]
pub struct PhaseMetrics {
    pub duration: Histogram<f64>,
    pub input_files: Counter<u64>,
    pub output_files: Counter<u64>,
    pub failures: Counter<u64>,
}

impl Default for PhaseMetrics {
    fn default() -> Self {
        Self::new(&opentelemetry::global::meter("stowage"))
    }
}

impl PhaseMetrics {
    pub fn new(meter: &Meter) -> PhaseMetrics {
        let duration = meter
            .f64_histogram("stowage.phase.duration_seconds")
            .with_description("attachment phase latencies in seconds")
            .build();
        let input_files = meter
            .u64_counter("stowage.phase.input_files")
            .with_description("number of files handed to a phase")
            .build();
        let output_files = meter
            .u64_counter("stowage.phase.output_files")
            .with_description("number of files produced by a phase")
            .build();
        let failures = meter
            .u64_counter("stowage.phase.failures")
            .with_description("number of phases that returned an error")
            .build();
        PhaseMetrics {
            duration,
            input_files,
            output_files,
            failures,
        }
    }

    pub fn record(
        &self,
        phase: &str,
        storage: Option<&str>,
        duration: Duration,
        input_files: u64,
        output_files: Option<u64>,
    ) {
        let mut labels = vec![KeyValue::new("phase", phase.to_string())];
        if let Some(storage) = storage {
            labels.push(KeyValue::new("storage", storage.to_string()));
        }

        self.duration.record(duration.as_secs_f64(), &labels);
        self.input_files.add(input_files, &labels);
        match output_files {
            Some(count) => self.output_files.add(count, &labels),
            None => self.failures.add(1, &labels),
        }
    }
}
