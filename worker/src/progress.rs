use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::error::SinkError;
use crate::options::RawOutputSpec;

// ffmpeg rewrites its status line in place, so only the last match is current.
static REGEX_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"time=\s*(\S+?)\s+bitrate").expect("valid progress regex"));

/// Elapsed media seconds from the most recent `time=... bitrate` marker, 0 if none.
pub fn parse_elapsed(diagnostics: &str) -> f64 {
    REGEX_TIME
        .captures_iter(diagnostics)
        .last()
        .and_then(|caps| caps.get(1))
        .map(|m| timestamp_to_seconds(m.as_str()))
        .unwrap_or(0.0)
}

/// `[[HH:]MM:]SS[.fraction]` to seconds. Negative or malformed values count as 0.
pub fn timestamp_to_seconds(value: &str) -> f64 {
    // ffmpeg prints a negative time (e.g. `-577014:32:22.77`) before the first frame.
    if value.trim_start().starts_with('-') {
        return 0.0;
    }
    let mut parts = value.rsplit(':');
    let Some(seconds) = parts
        .next()
        .and_then(|s| s.parse::<f64>().ok())
        .filter(|s| s.is_finite() && *s >= 0.0)
    else {
        return 0.0;
    };
    let mut total = seconds;
    for multiplier in [60u64, 3600] {
        match parts.next().map(str::parse::<u64>) {
            None => return total,
            Some(Ok(n)) => total += n.saturating_mul(multiplier) as f64,
            Some(Err(_)) => return 0.0,
        }
    }
    if parts.next().is_some() {
        return 0.0;
    }
    total
}

pub fn percent_of(elapsed: f64, duration: f64) -> u32 {
    if duration <= 0.0 || elapsed <= 0.0 {
        return 0;
    }
    ((elapsed / duration) * 100.0).round().min(100.0) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProgressState {
    pub elapsed: f64,
    pub duration: f64,
    pub percent: u32,
}

/// Per-invocation progress. Percent never goes backwards.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    duration: f64,
    percent: u32,
}

impl ProgressTracker {
    pub fn new(duration: f64) -> Self {
        ProgressTracker {
            duration: duration.max(0.0),
            percent: 0,
        }
    }

    pub fn observe(&mut self, diagnostics: &str) -> ProgressState {
        let elapsed = parse_elapsed(diagnostics);
        self.percent = self.percent.max(percent_of(elapsed, self.duration));
        ProgressState {
            elapsed,
            duration: self.duration,
            percent: self.percent,
        }
    }
}

/// Liveness/progress report sent to the coordinator.
#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat<'a> {
    pub output: &'a RawOutputSpec,
    pub duration: f64,
    pub done: f64,
    pub progress: u32,
}

impl<'a> Heartbeat<'a> {
    pub fn started(output: &'a RawOutputSpec, duration: f64) -> Self {
        Heartbeat {
            output,
            duration,
            done: 0.0,
            progress: 0,
        }
    }

    pub fn from_state(output: &'a RawOutputSpec, state: &ProgressState) -> Self {
        Heartbeat {
            output,
            duration: state.duration,
            done: state.elapsed,
            progress: state.percent,
        }
    }
}

/// Receives heartbeats. Returning an error aborts the running invocation.
pub trait ProgressSink: Send + Sync {
    fn heartbeat(&self, beat: &Heartbeat<'_>) -> Result<(), SinkError>;
}
