//! Progress events and the pure band-scaling helper pipeline stages use to
//! map their local 0-100 completion into the caller's global percentage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Stage {
    Audio,
    Transcribe,
    Translate,
    Review,
    Finalize,
    Render,
    Cancelled,
    Error,
}

impl Stage {
    pub fn tag(&self) -> &'static str {
        match self {
            Stage::Audio => "AUDIO",
            Stage::Transcribe => "TRANSCRIBE",
            Stage::Translate => "TRANSLATE",
            Stage::Review => "REVIEW",
            Stage::Finalize => "FINALIZE",
            Stage::Render => "RENDER",
            Stage::Cancelled => "CANCELLED",
            Stage::Error => "ERROR",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub op_id: String,
    pub percent: f64,
    pub stage: Stage,
    pub partial_srt: Option<String>,
    pub current: Option<u64>,
    pub total: Option<u64>,
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(op_id: impl Into<String>, percent: f64, stage: Stage) -> Self {
        Self {
            op_id: op_id.into(),
            percent: percent.clamp(0.0, 100.0),
            stage,
            partial_srt: None,
            current: None,
            total: None,
            error: None,
        }
    }

    pub fn with_progress(mut self, current: u64, total: u64) -> Self {
        self.current = Some(current);
        self.total = Some(total);
        self
    }

    pub fn with_partial_srt(mut self, srt: impl Into<String>) -> Self {
        self.partial_srt = Some(srt.into());
        self
    }

    pub fn terminal_cancelled(op_id: impl Into<String>) -> Self {
        Self::new(op_id, 100.0, Stage::Cancelled)
    }

    pub fn terminal_error(op_id: impl Into<String>, message: impl Into<String>) -> Self {
        let mut event = Self::new(op_id, 100.0, Stage::Error);
        event.error = Some(message.into());
        event
    }
}

/// A plain sink the core publishes `ProgressEvent`s into. Never a closure
/// capturing the operation it reports on - see the design notes on cyclic
/// callbacks.
pub trait ProgressSink: Send + Sync {
    fn publish(&self, event: ProgressEvent);
}

/// Sink that drops every event; used where the caller doesn't want progress.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _event: ProgressEvent) {}
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn publish(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Maps a component's local `0..=100` completion into the pipeline's global
/// band `[from, to]`. A pure function, never a mutable accumulator, so
/// concurrent components can compute their own slice of the bar without
/// coordinating.
pub fn scale(local_percent: f64, band: (f64, f64)) -> f64 {
    let (from, to) = band;
    let local = local_percent.clamp(0.0, 100.0) / 100.0;
    (from + local * (to - from)).clamp(0.0, 100.0)
}

pub mod bands {
    pub const AUDIO: (f64, f64) = (0.0, 10.0);
    pub const TRANSCRIBE: (f64, f64) = (10.0, 50.0);
    pub const TRANSLATE: (f64, f64) = (50.0, 75.0);
    pub const REVIEW: (f64, f64) = (75.0, 95.0);
    pub const FINAL: (f64, f64) = (95.0, 100.0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scale_maps_endpoints_exactly() {
        assert_eq!(scale(0.0, bands::TRANSCRIBE), 10.0);
        assert_eq!(scale(100.0, bands::TRANSCRIBE), 50.0);
    }

    #[test]
    fn scale_is_linear_at_midpoint() {
        assert_eq!(scale(50.0, (0.0, 10.0)), 5.0);
    }

    #[test]
    fn scale_clamps_out_of_range_input() {
        assert_eq!(scale(-10.0, bands::AUDIO), 0.0);
        assert_eq!(scale(150.0, bands::AUDIO), 10.0);
    }

    #[test]
    fn terminal_cancelled_event_is_always_100_percent() {
        let event = ProgressEvent::terminal_cancelled("op1");
        assert_eq!(event.percent, 100.0);
        assert_eq!(event.stage, Stage::Cancelled);
    }
}
