//! Admission queue: caps concurrently running turns and queues the rest in FIFO order.

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::event::CoalescedTurn;
use crate::traits::{Notifier, TurnHandler, TurnSink};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, oneshot};

/// Point-in-time view of the queue, served by the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub active: usize,
    pub pending: usize,
    pub max_concurrent: usize,
    pub peak_active: usize,
    pub completed: u64,
    pub failed: u64,
}

struct PendingTurn {
    turn: CoalescedTurn,
    /// Resolves once the queued notice has been sent (or has failed).
    notice_done: oneshot::Receiver<()>,
}

#[derive(Default)]
struct QueueState {
    active: usize,
    pending: VecDeque<PendingTurn>,
    peak_active: usize,
    completed: u64,
    failed: u64,
}

impl QueueState {
    fn occupy(&mut self) {
        self.active += 1;
        self.peak_active = self.peak_active.max(self.active);
    }
}

struct QueueInner {
    config: Arc<SchedulerConfig>,
    handler: Arc<dyn TurnHandler>,
    notifier: Arc<dyn Notifier>,
    state: Mutex<QueueState>,
    idle: Notify,
}

impl QueueInner {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn max_concurrent(&self) -> usize {
        self.config.max_concurrent.max(1)
    }

    /// Frees one slot and activates the oldest waiter, if any.
    fn release(self: &Arc<Self>, succeeded: bool) {
        let mut state = self.lock_state();
        state.active = state.active.saturating_sub(1);
        if succeeded {
            state.completed += 1;
        } else {
            state.failed += 1;
        }

        let mut activated = Vec::new();
        while state.active < self.max_concurrent() {
            let Some(next) = state.pending.pop_front() else {
                break;
            };
            state.occupy();
            activated.push(next);
        }
        let idle = state.active == 0 && state.pending.is_empty();
        let (active, pending) = (state.active, state.pending.len());
        drop(state);

        tracing::debug!(active, pending, succeeded, "turn slot released");
        for next in activated {
            self.activate(next.turn, Some(next.notice_done));
        }
        if idle {
            self.idle.notify_waiters();
        }
    }

    /// Starts the handler for a turn that already owns a slot.
    fn activate(self: &Arc<Self>, turn: CoalescedTurn, notice_done: Option<oneshot::Receiver<()>>) {
        let guard = SlotGuard {
            inner: Arc::clone(self),
            succeeded: false,
        };
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(
                    conversation_key = %turn.conversation_key,
                    %e,
                    "no runtime to run turn; dropping it"
                );
                drop(guard);
                return;
            }
        };
        handle.spawn(run_turn(Arc::clone(&self.handler), turn, notice_done, guard));
    }
}

/// Owns one admission slot. Dropping it releases the slot, including on error or panic.
struct SlotGuard {
    inner: Arc<QueueInner>,
    succeeded: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.inner.release(self.succeeded);
    }
}

async fn run_turn(
    handler: Arc<dyn TurnHandler>,
    turn: CoalescedTurn,
    notice_done: Option<oneshot::Receiver<()>>,
    mut guard: SlotGuard,
) {
    if let Some(notice_done) = notice_done {
        let _ = notice_done.await;
    }
    let key = turn.conversation_key.clone();
    tracing::debug!(conversation_key = %key, "turn active");
    match handler.handle(turn).await {
        Ok(()) => guard.succeeded = true,
        Err(e) => tracing::warn!(conversation_key = %key, %e, "turn dispatch failed"),
    }
}

/// Bounded-concurrency admission for coalesced turns.
#[derive(Clone)]
pub struct AdmissionQueue {
    inner: Arc<QueueInner>,
}

impl AdmissionQueue {
    pub fn new(
        config: Arc<SchedulerConfig>,
        handler: Arc<dyn TurnHandler>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                config,
                handler,
                notifier,
                state: Mutex::new(QueueState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.inner.lock_state();
        QueueSnapshot {
            active: state.active,
            pending: state.pending.len(),
            max_concurrent: self.inner.max_concurrent(),
            peak_active: state.peak_active,
            completed: state.completed,
            failed: state.failed,
        }
    }

    pub fn is_idle(&self) -> bool {
        let state = self.inner.lock_state();
        state.active == 0 && state.pending.is_empty()
    }

    /// Resolves once no turn is active or pending.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }
}

impl TurnSink for AdmissionQueue {
    fn submit(&self, turn: CoalescedTurn) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SchedError::Closed)?;
        let mut state = self.inner.lock_state();
        let max = self.inner.max_concurrent();

        if state.active < max {
            state.occupy();
            let active = state.active;
            drop(state);
            tracing::debug!(conversation_key = %turn.conversation_key, active, "turn admitted");
            self.inner.activate(turn, None);
            return Ok(());
        }

        let ahead = state.active;
        let key = turn.conversation_key.clone();
        let (notice_tx, notice_done) = oneshot::channel();
        state.pending.push_back(PendingTurn { turn, notice_done });
        let pending = state.pending.len();
        drop(state);

        tracing::info!(conversation_key = %key, ahead, pending, "turn queued");
        let notice = self.inner.config.render_queued_notice(ahead);
        let notifier = Arc::clone(&self.inner.notifier);
        runtime.spawn(async move {
            if let Err(e) = notifier.notify(&key, &notice).await {
                tracing::warn!(conversation_key = %key, %e, "queued notice failed");
            }
            let _ = notice_tx.send(());
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SchedError;
    use crate::test_support::{Delivery, RecordingTransport};
    use crate::traits::OutboundTransport;
    use async_trait::async_trait;
    use pv_channels::ConversationKey;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps per turn and logs start/end; fails on "bad", panics on "panic".
    struct SlowHandler {
        work: Duration,
        log: Arc<RecordingTransport>,
        starts: Mutex<Vec<String>>,
        running: AtomicUsize,
        max_running: AtomicUsize,
    }

    impl SlowHandler {
        fn new(work_ms: u64, log: Arc<RecordingTransport>) -> Self {
            Self {
                work: Duration::from_millis(work_ms),
                log,
                starts: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }
        }

        fn starts(&self) -> Vec<String> {
            self.starts.lock().expect("starts lock").clone()
        }
    }

    #[async_trait]
    impl TurnHandler for SlowHandler {
        async fn handle(&self, turn: CoalescedTurn) -> Result<()> {
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_running.fetch_max(running, Ordering::SeqCst);
            self.starts
                .lock()
                .expect("starts lock")
                .push(turn.merged_text.clone());
            // Marks activation in the shared delivery log so notice ordering is observable.
            self.log
                .send_direct(
                    &turn.conversation_key,
                    &format!("start {}", turn.merged_text),
                    None,
                )
                .await?;

            tokio::time::sleep(self.work).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            match turn.merged_text.as_str() {
                "bad" => Err(SchedError::engine("boom")),
                "panic" => panic!("handler blew up"),
                _ => Ok(()),
            }
        }
    }

    fn turn(chat: &str, text: &str) -> CoalescedTurn {
        CoalescedTurn {
            conversation_key: ConversationKey::new("wecom", "default", chat, chat)
                .expect("valid key"),
            merged_text: text.to_string(),
            anchor_message_id: format!("m-{text}").into(),
            constituent_count: 1,
            control_text: None,
        }
    }

    fn queue(max_concurrent: usize, handler: Arc<SlowHandler>) -> AdmissionQueue {
        let config = SchedulerConfig {
            max_concurrent,
            queued_notice: "queued behind {ahead}".to_string(),
            ..SchedulerConfig::default()
        };
        let notifier = handler.log.clone();
        AdmissionQueue::new(Arc::new(config), handler, notifier)
    }

    #[test]
    fn submit_without_runtime_is_rejected_and_leaves_no_state() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(10, log.clone()));
        let queue = queue(1, handler.clone());

        let err = queue.submit(turn("a", "A")).expect_err("no runtime");
        assert!(matches!(err, SchedError::Closed));
        let snap = queue.snapshot();
        assert_eq!((snap.active, snap.pending), (0, 0));
        assert!(queue.is_idle());
        assert!(log.deliveries().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn single_slot_queues_second_turn_with_one_notice() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(100, log.clone()));
        let queue = queue(1, handler.clone());

        queue.submit(turn("a", "A")).expect("submit A");
        queue.submit(turn("b", "B")).expect("submit B");
        let snap = queue.snapshot();
        assert_eq!((snap.active, snap.pending), (1, 1));

        queue.wait_idle().await;

        let deliveries = log.deliveries();
        let notices: Vec<&Delivery> = deliveries
            .iter()
            .filter(|d| matches!(d, Delivery::Notice { .. }))
            .collect();
        assert_eq!(
            notices,
            vec![&Delivery::Notice {
                chat: "b".to_string(),
                text: "queued behind 1".to_string(),
            }]
        );

        let position = |needle: &Delivery| deliveries.iter().position(|d| d == needle);
        let notice_at = position(notices[0]).expect("notice logged");
        let b_start = position(&Delivery::Direct {
            chat: "b".to_string(),
            text: "start B".to_string(),
            reply_to: None,
        })
        .expect("B started");
        assert!(notice_at < b_start, "notice precedes activation");
        assert_eq!(handler.starts(), vec!["A", "B"]);
        assert_eq!(queue.snapshot().completed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn active_count_never_exceeds_cap() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(50, log.clone()));
        let queue = queue(2, handler.clone());

        for i in 0..6 {
            queue.submit(turn(&format!("c{i}"), &format!("t{i}"))).expect("submit");
            assert!(queue.snapshot().active <= 2);
        }
        queue.wait_idle().await;

        assert!(handler.max_running.load(Ordering::SeqCst) <= 2);
        let snap = queue.snapshot();
        assert_eq!(snap.peak_active, 2);
        assert_eq!(snap.completed, 6);
        assert_eq!((snap.active, snap.pending), (0, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_activate_in_fifo_order() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(10, log.clone()));
        let queue = queue(1, handler.clone());

        for name in ["A", "B", "C", "D"] {
            queue.submit(turn(name, name)).expect("submit");
        }
        queue.wait_idle().await;
        assert_eq!(handler.starts(), vec!["A", "B", "C", "D"]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_turn_releases_slot() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(10, log.clone()));
        let queue = queue(1, handler.clone());

        queue.submit(turn("x", "bad")).expect("submit");
        queue.submit(turn("y", "good")).expect("submit");
        queue.wait_idle().await;

        let snap = queue.snapshot();
        assert_eq!((snap.completed, snap.failed), (1, 1));
        assert_eq!(handler.starts(), vec!["bad", "good"]);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_turn_releases_slot() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(10, log.clone()));
        let queue = queue(1, handler.clone());

        queue.submit(turn("x", "panic")).expect("submit");
        queue.submit(turn("y", "after")).expect("submit");
        queue.wait_idle().await;

        let snap = queue.snapshot();
        assert_eq!((snap.completed, snap.failed), (1, 1));
        assert_eq!(handler.starts(), vec!["panic", "after"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_queue_resolves_immediately() {
        let log = Arc::new(RecordingTransport::new(false));
        let handler = Arc::new(SlowHandler::new(10, log));
        let queue = queue(3, handler);
        queue.wait_idle().await;
        assert!(queue.is_idle());
    }
}
