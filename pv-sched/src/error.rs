use thiserror::Error;

pub type Result<T> = std::result::Result<T, SchedError>;

#[derive(Debug, Error)]
pub enum SchedError {
    /// The reply engine failed to start or its stream ended with an error.
    #[error("reply engine error: {0}")]
    Engine(String),

    /// An outbound send/edit/notify call failed.
    #[error("delivery error: {0}")]
    Delivery(String),

    /// No async runtime is left to run turns on.
    #[error("scheduler closed: no async runtime")]
    Closed,
}

impl SchedError {
    pub fn engine(e: impl std::fmt::Display) -> Self {
        Self::Engine(e.to_string())
    }

    pub fn delivery(e: impl std::fmt::Display) -> Self {
        Self::Delivery(e.to_string())
    }
}
