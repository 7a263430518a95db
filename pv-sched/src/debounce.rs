//! Debounce coalescer: per-conversation sliding windows that merge bursts into one turn.
//!
//! Each key is either Idle (absent from the map) or Buffering (present, with a live timer).
//! Turns are emitted while the window lock is held, so flush order per key is submit order.

use crate::config::SchedulerConfig;
use crate::event::{CoalescedTurn, InboundEvent};
use crate::traits::TurnSink;
use pv_channels::ConversationKey;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    /// The sliding window elapsed without new events.
    WindowClosed,
    /// A control command or blank message forced the flush.
    Bypass,
    /// Shutdown drained every open window.
    Drain,
}

struct Window {
    events: Vec<InboundEvent>,
    timer: JoinHandle<()>,
    generation: u64,
}

#[derive(Default)]
struct WindowTable {
    windows: HashMap<ConversationKey, Window>,
    next_generation: u64,
}

impl WindowTable {
    fn bump_generation(&mut self) -> u64 {
        self.next_generation = self.next_generation.wrapping_add(1);
        self.next_generation
    }

    /// Buffering -> Idle. Returns the buffered events, oldest first.
    fn close(&mut self, key: &ConversationKey) -> Vec<InboundEvent> {
        match self.windows.remove(key) {
            Some(window) => {
                window.timer.abort();
                window.events
            }
            None => Vec::new(),
        }
    }

    /// Idle -> Buffering, or Buffering -> Buffering with a re-armed timer.
    fn buffer(&mut self, event: InboundEvent, timer: JoinHandle<()>, generation: u64) {
        match self.windows.entry(event.conversation_key.clone()) {
            Entry::Occupied(mut entry) => {
                let window = entry.get_mut();
                window.timer.abort();
                window.timer = timer;
                window.generation = generation;
                window.events.push(event);
            }
            Entry::Vacant(entry) => {
                entry.insert(Window {
                    events: vec![event],
                    timer,
                    generation,
                });
            }
        }
    }

    /// Closes the window only if `generation` is still the armed one.
    fn expire(&mut self, key: &ConversationKey, generation: u64) -> Option<Vec<InboundEvent>> {
        let current = self.windows.get(key)?.generation;
        if current != generation {
            return None;
        }
        self.windows.remove(key).map(|window| window.events)
    }
}

struct CoalescerInner {
    config: Arc<SchedulerConfig>,
    sink: Arc<dyn TurnSink>,
    table: Mutex<WindowTable>,
}

impl CoalescerInner {
    fn lock_table(&self) -> MutexGuard<'_, WindowTable> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, key: &ConversationKey, events: Vec<InboundEvent>, reason: FlushReason) {
        let Some(turn) = CoalescedTurn::from_events(events) else {
            return;
        };
        tracing::debug!(
            conversation_key = %key,
            constituent_count = turn.constituent_count,
            merged_chars = turn.merged_text.chars().count(),
            ?reason,
            "debounce window flushed"
        );
        if let Err(e) = self.sink.submit(turn) {
            tracing::warn!(conversation_key = %key, %e, ?reason, "coalesced turn submit failed");
        }
    }
}

/// Groups same-conversation events inside a sliding window and emits one turn per window.
#[derive(Clone)]
pub struct Coalescer {
    inner: Arc<CoalescerInner>,
}

impl Coalescer {
    pub fn new(config: Arc<SchedulerConfig>, sink: Arc<dyn TurnSink>) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                config,
                sink,
                table: Mutex::new(WindowTable::default()),
            }),
        }
    }

    /// Registers an event. Must be called from within a tokio runtime.
    pub fn enqueue(&self, event: InboundEvent) {
        let key = event.conversation_key.clone();
        let debounce = self.inner.config.debounce_for(&key);
        let mut table = self.inner.lock_table();

        if event.bypasses_debounce() || debounce.is_zero() {
            let mut events = table.close(&key);
            events.push(event);
            self.inner.emit(&key, events, FlushReason::Bypass);
            return;
        }

        let generation = table.bump_generation();
        let timer = self.arm_timer(key.clone(), generation, debounce);
        table.buffer(event, timer, generation);
        tracing::trace!(conversation_key = %key, ?debounce, "debounce window armed");
    }

    /// Flushes every open window immediately. Used on shutdown.
    pub fn flush_all(&self) -> usize {
        let mut table = self.inner.lock_table();
        let keys: Vec<ConversationKey> = table.windows.keys().cloned().collect();
        for key in &keys {
            let events = table.close(key);
            self.inner.emit(key, events, FlushReason::Drain);
        }
        keys.len()
    }

    /// Conversation keys that currently hold an open window.
    pub fn buffering_keys(&self) -> Vec<String> {
        let table = self.inner.lock_table();
        let mut keys: Vec<String> = table.windows.keys().map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    fn arm_timer(&self, key: ConversationKey, generation: u64, debounce: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            let mut table = inner.lock_table();
            if let Some(events) = table.expire(&key, generation) {
                inner.emit(&key, events, FlushReason::WindowClosed);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PerChannel;
    use crate::error::{Result, SchedError};
    use std::time::Duration;
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingSink {
        turns: Mutex<Vec<CoalescedTurn>>,
        reject_chat: Option<String>,
    }

    impl RecordingSink {
        fn turns(&self) -> Vec<CoalescedTurn> {
            self.turns.lock().expect("sink lock").clone()
        }
    }

    impl TurnSink for RecordingSink {
        fn submit(&self, turn: CoalescedTurn) -> Result<()> {
            if self.reject_chat.as_deref() == Some(turn.conversation_key.chat().as_str()) {
                return Err(SchedError::Closed);
            }
            self.turns.lock().expect("sink lock").push(turn);
            Ok(())
        }
    }

    fn key(chat: &str) -> ConversationKey {
        ConversationKey::new("feishu", "default", chat, "sender").expect("valid key")
    }

    fn coalescer(debounce_ms: u64, sink: Arc<RecordingSink>) -> Coalescer {
        let config = SchedulerConfig {
            debounce: PerChannel::new(Duration::from_millis(debounce_ms)),
            ..SchedulerConfig::default()
        };
        Coalescer::new(Arc::new(config), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn burst_within_window_becomes_one_turn() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("k"), "a", "m1"));
        sleep(Duration::from_millis(100)).await;
        coalescer.enqueue(InboundEvent::new(key("k"), "b", "m2"));
        sleep(Duration::from_millis(150)).await;
        coalescer.enqueue(InboundEvent::new(key("k"), "c", "m3"));

        // Window slides: 250 + 300 = 550ms.
        sleep(Duration::from_millis(250)).await;
        assert!(sink.turns().is_empty(), "window should still be open");

        sleep(Duration::from_millis(100)).await;
        let turns = sink.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].merged_text, "a\nb\nc");
        assert_eq!(turns[0].anchor_message_id.as_str(), "m3");
        assert_eq!(turns[0].constituent_count, 3);
        assert!(coalescer.buffering_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_gap_splits_windows() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("k"), "first", "m1"));
        sleep(Duration::from_millis(400)).await;
        coalescer.enqueue(InboundEvent::new(key("k"), "second", "m2"));
        sleep(Duration::from_millis(400)).await;

        let texts: Vec<String> = sink.turns().into_iter().map(|t| t.merged_text).collect();
        assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn control_command_flushes_buffer_with_itself() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("k"), "draft one", "m1"));
        coalescer.enqueue(InboundEvent::new(key("k"), "draft two", "m2"));
        coalescer.enqueue(InboundEvent::new(key("k"), "/new", "m3").control(true));

        let turns = sink.turns();
        assert_eq!(turns.len(), 1, "control command flushes immediately");
        assert_eq!(turns[0].merged_text, "draft one\ndraft two\n/new");
        assert_eq!(turns[0].anchor_message_id.as_str(), "m3");

        coalescer.enqueue(InboundEvent::new(key("k"), "after", "m4"));
        sleep(Duration::from_millis(400)).await;
        let turns = sink.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].merged_text, "after", "later text never joins the control turn");
    }

    #[tokio::test(start_paused = true)]
    async fn blank_message_is_not_debounced() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("k"), "  ", "m1"));
        let turns = sink.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].merged_text, "");
        assert_eq!(turns[0].constituent_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("a"), "from a", "m1"));
        coalescer.enqueue(InboundEvent::new(key("b"), "/status", "m2").control(true));
        assert_eq!(sink.turns().len(), 1);
        assert_eq!(coalescer.buffering_keys(), vec![key("a").to_string()]);

        sleep(Duration::from_millis(350)).await;
        let turns = sink.turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].merged_text, "from a");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submit_does_not_disturb_other_keys() {
        let sink = Arc::new(RecordingSink {
            reject_chat: Some("bad".to_string()),
            ..RecordingSink::default()
        });
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("bad"), "lost", "m1"));
        coalescer.enqueue(InboundEvent::new(key("good"), "kept", "m2"));
        sleep(Duration::from_millis(350)).await;

        let turns = sink.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].merged_text, "kept");
        assert!(coalescer.buffering_keys().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flush_all_drains_open_windows() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(300, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("a"), "one", "m1"));
        coalescer.enqueue(InboundEvent::new(key("b"), "two", "m2"));
        assert_eq!(coalescer.flush_all(), 2);
        assert_eq!(sink.turns().len(), 2);

        sleep(Duration::from_millis(350)).await;
        assert_eq!(sink.turns().len(), 2, "aborted timers must not flush again");
    }

    #[tokio::test(start_paused = true)]
    async fn zero_debounce_flushes_inline() {
        let sink = Arc::new(RecordingSink::default());
        let coalescer = coalescer(0, sink.clone());

        coalescer.enqueue(InboundEvent::new(key("k"), "now", "m1"));
        assert_eq!(sink.turns().len(), 1);
    }
}
