use crate::population::GenerationStats;
use std::fmt;

/// Correlation token tying one simulation run to its eventual score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeId(pub u64);

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound notification from a collaborator, delivered asynchronously.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// The scoring service answered its health check.
    ServerReady,
    /// The recorder finished capturing the episode's segment.
    SegmentCompleted { episode: EpisodeId, frames: usize },
    /// The scoring service returned a score (zero on any failure).
    ScoreReceived { episode: EpisodeId, score: f64 },
    /// Stop evaluating, return to idle and disable auto-run.
    Stop,
}

/// Outbound notification broadcast by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    EvaluationStarted {
        generation: usize,
        individual: usize,
        episode: EpisodeId,
    },
    GenerationCompleted(GenerationStats),
    EvaluationStopped,
    /// The last configured generation has been scored.
    Finished,
}
