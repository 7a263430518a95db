use crate::admission::{AdmissionQueue, QueueSnapshot};
use crate::config::SchedulerConfig;
use crate::debounce::Coalescer;
use crate::dispatch::TurnDispatcher;
use crate::event::InboundEvent;
use crate::traits::{Notifier, OutboundTransport, ReplyEngine};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    #[serde(flatten)]
    pub queue: QueueSnapshot,
    /// Conversation keys with an open debounce window.
    pub buffering: Vec<String>,
}

/// Coalescer -> admission queue -> turn dispatcher, wired together.
#[derive(Clone)]
pub struct Scheduler {
    config: Arc<SchedulerConfig>,
    coalescer: Coalescer,
    queue: AdmissionQueue,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        engine: Arc<dyn ReplyEngine>,
        transport: Arc<dyn OutboundTransport>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let config = Arc::new(config);
        let dispatcher = Arc::new(TurnDispatcher::new(config.clone(), engine, transport));
        let queue = AdmissionQueue::new(config.clone(), dispatcher, notifier);
        let coalescer = Coalescer::new(config.clone(), Arc::new(queue.clone()));
        tracing::info!(
            max_concurrent = config.max_concurrent,
            update_interval_ms = config.update_interval.as_millis() as u64,
            "scheduler ready"
        );
        Self {
            config,
            coalescer,
            queue,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn enqueue(&self, event: InboundEvent) {
        self.coalescer.enqueue(event);
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            queue: self.queue.snapshot(),
            buffering: self.coalescer.buffering_keys(),
        }
    }

    /// Closes every open debounce window now. Returns how many were flushed.
    pub fn flush_all(&self) -> usize {
        self.coalescer.flush_all()
    }

    pub async fn wait_idle(&self) {
        self.queue.wait_idle().await;
    }
}
