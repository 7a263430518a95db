//! Inbound turn scheduling: debounce, bounded admission, and streamed delivery.

pub mod admission;
pub mod chunk;
pub mod config;
pub mod debounce;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod scheduler;
pub mod throttle;
pub mod traits;

#[cfg(test)]
mod test_support;

pub use admission::{AdmissionQueue, QueueSnapshot};
pub use chunk::chunk_text;
pub use config::{
    DEFAULT_DEBOUNCE, DEFAULT_FAILURE_NOTICE, DEFAULT_MAX_CONCURRENT, DEFAULT_QUEUED_NOTICE,
    DEFAULT_TEXT_CHUNK_LIMIT, DEFAULT_UPDATE_INTERVAL, EMPTY_REPLY_TEXT, MAX_DEBOUNCE, PerChannel,
    PLACEHOLDER_TEXT, SchedulerConfig,
};
pub use debounce::Coalescer;
pub use dispatch::{DeliveryMode, TurnDispatcher};
pub use error::{Result, SchedError};
pub use event::{CoalescedTurn, InboundEvent};
pub use scheduler::{Scheduler, SchedulerSnapshot};
pub use throttle::StreamThrottle;
pub use traits::{
    Notifier, OutboundTransport, ReplyChunk, ReplyEngine, ReplyStream, TurnHandler, TurnSink,
};
