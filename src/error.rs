use crate::model::Ms;
use crate::search::SearchStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryError {
    /// The configured ring depth reaches past the epoch — the device claims
    /// to retain more history than wall time allows.
    InvalidCacheDepth { depth_ms: u64, now_ms: Ms },
    Cancelled,
    Timeout,
    /// Too many consecutive device attempts produced nothing.
    AttemptsExhausted(u32),
    Device(SearchStatus),
}

impl std::fmt::Display for HistoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HistoryError::InvalidCacheDepth { depth_ms, now_ms } => {
                write!(f, "cache depth {depth_ms}ms exceeds current time {now_ms}ms")
            }
            HistoryError::Cancelled => write!(f, "operation cancelled"),
            HistoryError::Timeout => write!(f, "device did not answer within the timeout"),
            HistoryError::AttemptsExhausted(n) => {
                write!(f, "device search failed {n} times in a row, dropping request")
            }
            HistoryError::Device(status) => write!(f, "device search failed: {status:?}"),
        }
    }
}

impl std::error::Error for HistoryError {}
