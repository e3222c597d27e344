//! Progress reporting for long-running session work

use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// One progress tick: operation, current item, advisory percentage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressInfo {
    pub method: String,
    pub item: String,
    pub percent: u8,
}

impl ProgressInfo {
    pub fn new(method: impl Into<String>, item: impl Into<String>, percent: u8) -> Self {
        ProgressInfo {
            method: method.into(),
            item: item.into(),
            percent: percent.min(100),
        }
    }
}

impl fmt::Display for ProgressInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:>3}%] {} {}", self.percent, self.method, self.item)
    }
}

/// Single listener for progress ticks; must not block
pub type ProgressSink = Arc<dyn Fn(ProgressInfo) + Send + Sync>;

/// Optional sink wrapper used by the engine
#[derive(Clone, Default)]
pub(crate) struct Progress {
    sink: Option<ProgressSink>,
}

impl Progress {
    pub(crate) fn new(sink: Option<ProgressSink>) -> Self {
        Progress { sink }
    }

    /// Report item `done` of `total`
    pub(crate) fn report(&self, method: &str, item: impl fmt::Display, done: usize, total: usize) {
        if let Some(sink) = &self.sink {
            sink(ProgressInfo::new(method, item.to_string(), percent(done, total)));
        }
    }
}

impl fmt::Debug for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Progress")
            .field("sink", &self.sink.is_some())
            .finish()
    }
}

pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((done.min(total) * 100) / total) as u8
    }
}
