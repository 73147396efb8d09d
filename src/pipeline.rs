//! Phase instrumentation.
//!
//! Every `process`, `store` and `delete` step of the attacher runs through
//! [`PhasePipeline::run`]: before-hooks in registration order, the timed
//! operation, one [`PhaseEvent`] to each observer, then after-hooks in
//! reverse order. Observers only see the event; they cannot alter the
//! operation's result.

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_model::RecordKey;
use metrics::create_timed_future;
use strum::{Display, EnumString};
use tracing::{info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum PhaseName {
    Process,
    Store,
    Delete,
}

/// Where a phase ran.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseContext {
    pub storage: Option<String>,
    pub record: Option<RecordKey>,
    pub slot: Option<String>,
    /// Free-form label chosen by the caller, e.g. `create` or `update`.
    pub phase_label: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhaseEvent {
    pub phase: PhaseName,
    pub input_count: usize,
    /// `None` when the operation failed.
    pub output_count: Option<usize>,
    pub duration: Duration,
    pub context: PhaseContext,
}

impl PhaseEvent {
    pub fn succeeded(&self) -> bool {
        self.output_count.is_some()
    }
}

pub trait PhaseObserver: Send + Sync {
    fn on_phase(&self, event: &PhaseEvent);
}

/// User code wrapped around a phase.
#[async_trait]
pub trait PhaseHook: Send + Sync {
    async fn before(&self, _phase: PhaseName, _context: &PhaseContext) {}

    async fn after(&self, _phase: PhaseName, _context: &PhaseContext) {}
}

#[derive(Clone, Default)]
pub struct PhasePipeline {
    hooks: Vec<Arc<dyn PhaseHook>>,
    observers: Vec<Arc<dyn PhaseObserver>>,
}

impl PhasePipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hook(mut self, hook: Arc<dyn PhaseHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn PhaseObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub async fn run<T, E, F>(
        &self,
        phase: PhaseName,
        input_count: usize,
        context: &PhaseContext,
        operation: F,
        output_count: impl Fn(&T) -> usize,
    ) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        for hook in &self.hooks {
            hook.before(phase, context).await;
        }

        let span = info_span!(
            "attachment_phase",
            phase = %phase,
            storage = context.storage.as_deref(),
            slot = context.slot.as_deref(),
        );
        let mut duration = Duration::ZERO;
        let result = create_timed_future(operation, |elapsed| duration = elapsed)
            .instrument(span)
            .await;

        let event = PhaseEvent {
            phase,
            input_count,
            output_count: result.as_ref().ok().map(|value| output_count(value)),
            duration,
            context: context.clone(),
        };
        for observer in &self.observers {
            observer.on_phase(&event);
        }

        for hook in self.hooks.iter().rev() {
            hook.after(phase, context).await;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::RecordingObserver;

    struct Named {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl PhaseHook for Named {
        async fn before(&self, phase: PhaseName, _context: &PhaseContext) {
            self.log.lock().unwrap().push(format!("before {} {}", self.name, phase));
        }

        async fn after(&self, phase: PhaseName, _context: &PhaseContext) {
            self.log.lock().unwrap().push(format!("after {} {}", self.name, phase));
        }
    }

    #[tokio::test]
    async fn test_hook_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = PhasePipeline::new()
            .with_hook(Arc::new(Named { name: "outer", log: log.clone() }))
            .with_hook(Arc::new(Named { name: "inner", log: log.clone() }));

        let op_log = log.clone();
        let result: Result<usize, ()> = pipeline
            .run(
                PhaseName::Store,
                1,
                &PhaseContext::default(),
                async move {
                    op_log.lock().unwrap().push("operation".to_string());
                    Ok(3)
                },
                |n: &usize| *n,
            )
            .await;

        assert_eq!(result, Ok(3));
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "before outer store",
                "before inner store",
                "operation",
                "after inner store",
                "after outer store",
            ]
        );
    }

    #[tokio::test]
    async fn test_observers_see_failures_once() {
        let observer = Arc::new(RecordingObserver::default());
        let pipeline = PhasePipeline::new().with_observer(observer.clone());
        let context = PhaseContext {
            storage: Some("store".to_string()),
            ..Default::default()
        };

        let ok: Result<Vec<u8>, String> = pipeline
            .run(PhaseName::Process, 1, &context, async { Ok(vec![1, 2]) }, Vec::len)
            .await;
        let err: Result<Vec<u8>, String> = pipeline
            .run(PhaseName::Delete, 4, &context, async { Err("boom".to_string()) }, Vec::len)
            .await;

        assert_eq!(ok, Ok(vec![1, 2]));
        assert_eq!(err, Err("boom".to_string()));

        let events = observer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].phase, PhaseName::Process);
        assert_eq!(events[0].output_count, Some(2));
        assert_eq!(events[1].phase, PhaseName::Delete);
        assert_eq!(events[1].input_count, 4);
        assert!(!events[1].succeeded());
        assert_eq!(events[1].context.storage.as_deref(), Some("store"));
    }
}
