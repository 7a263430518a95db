use pv_channels::ConversationKey;
use std::collections::HashMap;
use std::time::Duration;

/// Upper bound on any debounce window, whatever the configuration says.
pub const MAX_DEBOUNCE: Duration = Duration::from_millis(5_000);
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(800);
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 2048;

pub const DEFAULT_QUEUED_NOTICE: &str =
    "⏳ Busy right now: {ahead} turn(s) ahead of you. Your message is queued.";
pub const DEFAULT_FAILURE_NOTICE: &str =
    "⚠️ Sorry, something went wrong while generating a reply. Please try again.";
pub const EMPTY_REPLY_TEXT: &str = "(no reply)";
pub const PLACEHOLDER_TEXT: &str = "⏳ Thinking...";

/// Per-channel value with a default fallback.
#[derive(Debug, Clone)]
pub struct PerChannel<T> {
    default: T,
    overrides: HashMap<String, T>,
}

impl<T: Clone> PerChannel<T> {
    pub fn new(default: T) -> Self {
        Self {
            default,
            overrides: HashMap::new(),
        }
    }

    pub fn with_override(mut self, channel_id: impl Into<String>, value: T) -> Self {
        self.overrides.insert(channel_id.into(), value);
        self
    }

    pub fn for_key(&self, key: &ConversationKey) -> T {
        self.overrides
            .get(key.channel().as_str())
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub debounce: PerChannel<Duration>,
    pub max_concurrent: usize,
    pub update_interval: Duration,
    pub text_chunk_limit: PerChannel<usize>,
    /// `{ahead}` is replaced with the active turn count at queue time.
    pub queued_notice: String,
    pub failure_notice: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: PerChannel::new(DEFAULT_DEBOUNCE),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            update_interval: DEFAULT_UPDATE_INTERVAL,
            text_chunk_limit: PerChannel::new(DEFAULT_TEXT_CHUNK_LIMIT),
            queued_notice: DEFAULT_QUEUED_NOTICE.to_string(),
            failure_notice: DEFAULT_FAILURE_NOTICE.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// Effective debounce window for a key, capped at [`MAX_DEBOUNCE`].
    pub fn debounce_for(&self, key: &ConversationKey) -> Duration {
        self.debounce.for_key(key).min(MAX_DEBOUNCE)
    }

    pub fn chunk_limit_for(&self, key: &ConversationKey) -> usize {
        self.text_chunk_limit.for_key(key).max(1)
    }

    pub fn render_queued_notice(&self, ahead: usize) -> String {
        self.queued_notice.replace("{ahead}", &ahead.to_string())
    }
}
